//! Process-wide receive path.
//!
//! One [`PacketRouter`] serves every engine in the process so there is a
//! single read socket and poll loop per IP version rather than one per
//! engine. Each loop polls with a short timeout so it can observe the
//! shutdown flag, stamps the receive time, and fans the datagram out to
//! every registered listener of that version.

use pingpath_core::{EngineResult, IpVersion, RECEIVER_POLL_INTERVAL_MS};
use pingpath_socket::{ProbeSocket, SocketProvider, RECEIVE_BUFFER_SIZE};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Receives every datagram read by the router for its IP version.
///
/// Implementations look up their own request table and ignore packets
/// that belong to another engine.
pub trait PacketListener: Send + Sync {
    fn version(&self) -> IpVersion;
    fn packet_received(&self, receive_time: Instant, buffer: &[u8], source: IpAddr);
}

struct RouterState {
    listeners: Vec<Weak<dyn PacketListener>>,
    threads: HashMap<IpVersion, JoinHandle<()>>,
}

/// The shared receiver.
///
/// Constructed explicitly (the factory owns it) so shutdown is
/// deterministic rather than hanging off a lazily initialised global.
/// Read loops start on demand when the first listener of a version
/// registers.
pub struct PacketRouter {
    sockets: Arc<dyn SocketProvider>,
    state: Mutex<RouterState>,
    running: AtomicBool,
}

impl PacketRouter {
    pub fn new(sockets: Arc<dyn SocketProvider>) -> Arc<Self> {
        Arc::new(Self {
            sockets,
            state: Mutex::new(RouterState {
                listeners: Vec::new(),
                threads: HashMap::new(),
            }),
            running: AtomicBool::new(true),
        })
    }

    /// Registers a listener, opening the read socket and starting the
    /// read loop for its version if this is the first one. Socket
    /// creation failures (typically missing privileges) propagate to the
    /// caller.
    pub fn register(self: &Arc<Self>, listener: Weak<dyn PacketListener>) -> EngineResult<()> {
        let version = match listener.upgrade() {
            Some(listener) => listener.version(),
            None => return Ok(()),
        };

        let mut state = self.state.lock().expect("router state mutex poisoned");
        if !state.threads.contains_key(&version) {
            let socket = self.sockets.read_socket(version)?;
            let router = Arc::downgrade(self);
            let handle = thread::Builder::new()
                .name(format!("pingpath-recv-{version}"))
                .spawn(move || read_loop(router, socket))
                .expect("failed to spawn receiver thread");
            state.threads.insert(version, handle);
            debug!(%version, "started shared receive loop");
        }
        state.listeners.push(listener);
        Ok(())
    }

    /// Stops the read loops and joins them. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let threads = {
            let mut state = self.state.lock().expect("router state mutex poisoned");
            state.listeners.clear();
            std::mem::take(&mut state.threads)
        };
        for (version, handle) in threads {
            if handle.join().is_err() {
                warn!(%version, "receive loop panicked during shutdown");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Snapshots the live listeners for `version`, pruning the dead ones.
    /// Listeners are invoked on the snapshot, never under the lock.
    fn listeners_for(&self, version: IpVersion) -> Vec<Arc<dyn PacketListener>> {
        let mut state = self.state.lock().expect("router state mutex poisoned");
        state.listeners.retain(|weak| weak.strong_count() > 0);
        state
            .listeners
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|listener| listener.version() == version)
            .collect()
    }
}

impl Drop for PacketRouter {
    fn drop(&mut self) {
        // Threads hold only a Weak to the router, so reaching drop means
        // the loops are exiting on their own; just flag them down.
        self.running.store(false, Ordering::Release);
    }
}

fn read_loop(router: Weak<PacketRouter>, socket: Box<dyn ProbeSocket>) {
    let version = socket.version();
    let poll_timeout = Duration::from_millis(RECEIVER_POLL_INTERVAL_MS);
    let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        let Some(router) = router.upgrade() else {
            return;
        };
        if !router.is_running() {
            return;
        }

        match socket.recv_from(&mut buffer, poll_timeout) {
            Ok((length, source)) => {
                let receive_time = Instant::now();
                trace!(%version, %source, length, "datagram received");
                for listener in router.listeners_for(version) {
                    listener.packet_received(receive_time, &buffer[..length], source);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                // Persistent read errors must not spin the loop.
                warn!(%version, error = %err, "receive failed");
                thread::sleep(poll_timeout);
            }
        }
    }
}
