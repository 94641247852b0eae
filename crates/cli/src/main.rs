//! CLI entrypoint for pingpath.
//!
//! Discovers the route to a target, then pings every responding hop for a
//! while and prints per-hop latency statistics as text or JSON.

use clap::Parser;
use pingpath_core::IpVersion;
use pingpath_engine::{PingEngineFactory, PingResultCode};
use pingpath_route::RouteEngine;
use serde::Serialize;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pingpath")]
#[command(about = "Ping path analyser", long_about = None)]
struct Args {
    #[arg(value_name = "target")]
    target: String,

    /// Probe with IPv6 instead of IPv4.
    #[arg(long = "ipv6", default_value_t = false)]
    ipv6: bool,

    /// Interval between ping rounds, in milliseconds.
    #[arg(short = 'i', long = "interval", default_value_t = 1000)]
    interval_ms: u64,

    /// Age after which a probe counts as lost, in milliseconds.
    #[arg(short = 't', long = "timeout", default_value_t = 3000)]
    timeout_ms: u64,

    /// Number of ping rounds to run before reporting.
    #[arg(short = 'c', long = "count", default_value_t = 10)]
    count: u32,

    /// Emit the report as JSON.
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,
}

#[derive(Debug, Default, Serialize)]
struct HopReport {
    ttl: u8,
    address: Option<String>,
    sent: u64,
    received: u64,
    loss_percentage: f64,
    rtt_min_ms: f64,
    rtt_avg_ms: f64,
    rtt_max_ms: f64,
}

#[derive(Debug, Serialize)]
struct PathReport {
    target: String,
    address: String,
    hops: Vec<HopReport>,
}

fn main() {
    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(
                "pingpath_engine=trace,pingpath_route=trace,pingpath_socket=trace",
            ))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    let version = if args.ipv6 {
        IpVersion::V6
    } else {
        IpVersion::V4
    };

    let route_engine = RouteEngine::new();
    let discovery = route_engine.discover(&args.target, version);
    let route = match discovery.recv() {
        Ok(result) => result,
        Err(_) => {
            eprintln!("Route discovery did not produce a result");
            process::exit(1);
        }
    };
    let Some(target_address) = route.target else {
        eprintln!("Failed to resolve {}", args.target);
        process::exit(1);
    };
    if route.route.is_empty() {
        eprintln!("Failed to discover the route to {}", args.target);
        process::exit(1);
    }

    let factory = PingEngineFactory::new();
    let engine = match factory.create(version) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("Failed to create ping engine: {err}");
            process::exit(1);
        }
    };
    engine.set_interval(Duration::from_millis(args.interval_ms));
    engine.set_timeout(Duration::from_millis(args.timeout_ms));

    let mut hops: Vec<HopReport> = Vec::with_capacity(route.route.len());
    for (index, hop) in route.route.iter().enumerate() {
        let ttl = (index + 1) as u8;
        if let Some(address) = hop {
            match engine.add_target_with_ttl(*address, ttl) {
                Ok(target) => target.set_user_data(Some(Box::new(index))),
                Err(err) => {
                    eprintln!("Failed to add hop {ttl} ({address}): {err}");
                    process::exit(1);
                }
            }
        }
        hops.push(HopReport {
            ttl,
            address: hop.map(|addr| addr.to_string()),
            rtt_min_ms: f64::MAX,
            ..HopReport::default()
        });
    }

    let results = engine.results();
    engine.start();

    let run_for = Duration::from_millis(args.interval_ms) * args.count
        + Duration::from_millis(args.timeout_ms);
    let deadline = std::time::Instant::now() + run_for;
    while let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) {
        if remaining.is_zero() {
            break;
        }
        let Ok(result) = results.recv_timeout(remaining) else {
            break;
        };
        let index = result
            .target
            .with_user_data(|data| data.and_then(|d| d.downcast_ref::<usize>().copied()))
            .unwrap_or_else(|| usize::from(result.target.ttl().saturating_sub(1)));
        let Some(hop) = hops.get_mut(index) else {
            continue;
        };
        hop.sent += 1;
        if result.code == PingResultCode::Ok {
            hop.received += 1;
            let rtt_ms = result.round_trip.as_secs_f64() * 1000.0;
            hop.rtt_min_ms = hop.rtt_min_ms.min(rtt_ms);
            hop.rtt_max_ms = hop.rtt_max_ms.max(rtt_ms);
            hop.rtt_avg_ms += rtt_ms;
        }
    }

    engine.stop();

    for hop in &mut hops {
        if hop.received > 0 {
            hop.rtt_avg_ms /= hop.received as f64;
        } else {
            hop.rtt_min_ms = 0.0;
        }
        if hop.sent > 0 {
            hop.loss_percentage = 100.0 * (hop.sent - hop.received) as f64 / hop.sent as f64;
        }
    }

    let report = PathReport {
        target: args.target,
        address: target_address.to_string(),
        hops,
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                eprintln!("Failed to encode report: {err}");
                process::exit(1);
            }
        }
    } else {
        print_text_report(&report);
    }
}

fn print_text_report(report: &PathReport) {
    println!("Route to {} ({})", report.target, report.address);
    println!(
        "{:>3}  {:<40} {:>5} {:>5} {:>7} {:>9} {:>9} {:>9}",
        "ttl", "address", "sent", "recv", "loss%", "min(ms)", "avg(ms)", "max(ms)"
    );
    for hop in &report.hops {
        let address = hop.address.as_deref().unwrap_or("*");
        println!(
            "{:>3}  {:<40} {:>5} {:>5} {:>6.1}% {:>9.3} {:>9.3} {:>9.3}",
            hop.ttl,
            address,
            hop.sent,
            hop.received,
            hop.loss_percentage,
            hop.rtt_min_ms,
            hop.rtt_avg_ms,
            hop.rtt_max_ms
        );
    }
}
