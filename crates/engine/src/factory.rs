//! Engine construction.

use crate::engine::PingEngine;
use crate::receiver::PacketRouter;
use pingpath_core::{EngineError, EngineResult, IpVersion};
use pingpath_socket::{SocketProvider, SystemSocketProvider};
use std::sync::Arc;

/// Engine backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Direct ICMP sockets (raw, or datagram on macOS).
    #[default]
    IcmpRaw,
    /// The platform ICMP helper API (IcmpSendEcho and friends). Not
    /// wired up; creation reports it unavailable.
    IcmpApi,
}

/// Builds [`PingEngine`]s and owns the process-wide [`PacketRouter`],
/// giving the shared receive threads a deterministic shutdown point:
/// dropping the factory stops them.
pub struct PingEngineFactory {
    sockets: Arc<dyn SocketProvider>,
    router: Arc<PacketRouter>,
}

impl PingEngineFactory {
    /// Factory over real ICMP sockets.
    pub fn new() -> Self {
        Self::with_provider(Arc::new(SystemSocketProvider))
    }

    /// Factory over a caller-supplied socket source; tests use this to
    /// run engines without privileges or a network.
    pub fn with_provider(sockets: Arc<dyn SocketProvider>) -> Self {
        let router = PacketRouter::new(sockets.clone());
        Self { sockets, router }
    }

    /// Creates an engine with the default backend.
    pub fn create(&self, version: IpVersion) -> EngineResult<PingEngine> {
        self.create_with(Backend::IcmpRaw, version)
    }

    /// Creates an engine with an explicit backend.
    pub fn create_with(&self, backend: Backend, version: IpVersion) -> EngineResult<PingEngine> {
        match backend {
            Backend::IcmpRaw => PingEngine::new(version, self.sockets.clone(), &self.router),
            Backend::IcmpApi => Err(EngineError::BackendUnavailable("icmp-api")),
        }
    }
}

impl Default for PingEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PingEngineFactory {
    fn drop(&mut self) {
        self.router.shutdown();
    }
}
