//! Route discovery.
//!
//! Discovers the IP-level path to a host by sending ICMP echo probes at
//! increasing TTLs until the destination answers, one worker thread per
//! discovery request. The resulting [`RouteList`](pingpath_core::RouteList)
//! preserves hop positions: unresponsive hops are `None`.

mod worker;

pub use worker::RouteResult;

use pingpath_core::IpVersion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

use pingpath_socket::{SocketProvider, SystemSocketProvider};
use worker::RouteWorker;

/// Spawns and cancels route discovery workers.
pub struct RouteEngine {
    sockets: Arc<dyn SocketProvider>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RouteEngine {
    pub fn new() -> Self {
        Self::with_provider(Arc::new(SystemSocketProvider))
    }

    /// Engine over a caller-supplied socket source; tests use this to
    /// discover routes through scripted paths.
    pub fn with_provider(sockets: Arc<dyn SocketProvider>) -> Self {
        Self {
            sockets,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts discovering the route to `host` on its own worker thread.
    /// The returned channel delivers exactly one [`RouteResult`].
    pub fn discover(&self, host: &str, version: IpVersion) -> mpsc::Receiver<RouteResult> {
        let (sender, receiver) = mpsc::channel();
        let worker = RouteWorker::new(
            host.to_string(),
            version,
            self.sockets.clone(),
            self.running.clone(),
        );
        let handle = thread::Builder::new()
            .name(format!("pingpath-route-{version}"))
            .spawn(move || worker.run(sender))
            .expect("failed to spawn route worker thread");
        self.workers.lock().expect("worker list mutex poisoned").push(handle);
        receiver
    }

    /// Cancels all in-flight discoveries. Workers notice at their next
    /// loop head and exit without emitting a result.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for RouteEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RouteEngine {
    fn drop(&mut self) {
        self.stop();
        let workers = std::mem::take(
            &mut *self.workers.lock().expect("worker list mutex poisoned"),
        );
        let deadline = Instant::now()
            + Duration::from_millis(pingpath_core::DEFAULT_TERMINATE_TIMEOUT_MS);
        for handle in workers {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("route worker failed to stop within the shutdown deadline");
            }
        }
    }
}
