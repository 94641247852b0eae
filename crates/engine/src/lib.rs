//! Continuous per-hop ICMP ping measurement.
//!
//! A [`PingEngine`] multiplexes any number of targets over one shared
//! receive path. Per engine, a transmitter thread sends one echo request
//! per target per interval and a timeout thread reaps probes that never
//! got an answer; a process-wide [`PacketRouter`] owns the read sockets
//! and fans received datagrams out to every engine. Every probe produces
//! exactly one [`PingResult`]: a reply, a time-exceeded from an
//! intermediate hop, or a timeout.
//!
//! Engines are built by a [`PingEngineFactory`], which also owns the
//! router so the receive threads have a deterministic shutdown point.

mod engine;
mod factory;
mod item;
mod receiver;
mod result;
mod target;
mod timeout;
mod transmitter;

pub use engine::PingEngine;
pub use factory::{Backend, PingEngineFactory};
pub use receiver::{PacketListener, PacketRouter};
pub use result::{PingResult, PingResultCode};
pub use target::PingTarget;
