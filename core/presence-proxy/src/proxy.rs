//! Process-wide proxy state and its single-threaded event loop.
//!
//! One thread `poll`s the listener, a wake socket, and every client and
//! upstream socket. Nothing blocks: a socket that is not ready is skipped until
//! the next iteration, and partial frames wait as buffered bytes.

use std::collections::HashMap;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::connection::{Connection, ConnectionId, Flow, FrameContext};
use crate::error::Result;
use crate::hijack::{SocketPaths, Takeover};
use crate::presence::PresenceStore;

/// How long the listener sits out after a failed accept (fd exhaustion, say).
const ACCEPT_RETRY_MS: i32 = 100;

/// Creates the wake socket pair a proxy watches for shutdown requests.
///
/// Made before the proxy starts so signal handlers can be installed before
/// the socket takeover.
pub fn shutdown_channel() -> io::Result<(ShutdownHandle, ShutdownSignal)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((ShutdownHandle { stream: tx }, ShutdownSignal { stream: rx }))
}

/// Wakes a running proxy and makes it shut down.
#[derive(Debug)]
pub struct ShutdownHandle {
    stream: UnixStream,
}

impl ShutdownHandle {
    pub fn trigger(&self) -> io::Result<()> {
        match (&self.stream).write(&[1]) {
            Ok(_) => Ok(()),
            // A full wake socket already has a pending wakeup.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Routes SIGINT, SIGTERM and SIGHUP into this handle.
    pub fn register_signals(&self) -> io::Result<()> {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};

        for signal in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::low_level::pipe::register(signal, self.stream.try_clone()?)?;
        }
        Ok(())
    }
}

/// Receiving end of [`shutdown_channel`], owned by the proxy. The proxy also
/// stops once every [`ShutdownHandle`] is gone.
#[derive(Debug)]
pub struct ShutdownSignal {
    stream: UnixStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopControl {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Wake,
    Listener,
    Client(ConnectionId),
    Upstream(ConnectionId),
}

#[derive(Debug)]
pub struct ProxyState {
    takeover: Takeover,
    connections: HashMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    presence: PresenceStore,
    max_buffered_bytes: usize,
    wake: ShutdownSignal,
    /// Leave the listener out of the next poll.
    accept_paused: bool,
    shut_down: bool,
}

impl ProxyState {
    /// Takes over the configured socket path and starts listening.
    ///
    /// On failure the filesystem is already back the way it was.
    pub fn start(config: &ProxyConfig, wake: ShutdownSignal) -> Result<Self> {
        Self::start_at(
            SocketPaths::from_config(config),
            config.max_buffered_bytes,
            wake,
        )
    }

    pub fn start_at(
        paths: SocketPaths,
        max_buffered_bytes: usize,
        wake: ShutdownSignal,
    ) -> Result<Self> {
        let takeover = Takeover::establish(paths)?;

        info!(
            path = %takeover.paths().canonical.display(),
            upstream_active = takeover.upstream_active(),
            "Listening"
        );

        Ok(Self {
            takeover,
            connections: HashMap::new(),
            next_id: 1,
            presence: PresenceStore::new(),
            max_buffered_bytes,
            wake,
            accept_paused: false,
            shut_down: false,
        })
    }

    pub fn paths(&self) -> &SocketPaths {
        self.takeover.paths()
    }

    pub fn upstream_active(&self) -> bool {
        self.takeover.upstream_active()
    }

    /// A handle onto the presence table for readers on other threads.
    pub fn presence(&self) -> PresenceStore {
        self.presence.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serves until a shutdown is triggered or polling fails, then shuts down.
    pub fn run(&mut self) -> Result<()> {
        let result = loop {
            match self.poll_once(-1) {
                Ok(LoopControl::Continue) => continue,
                Ok(LoopControl::Stop) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.shutdown();
        result
    }

    /// Drops every connection, then restores the socket files. Runs once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let closed = self.connections.len();
        for (id, connection) in self.connections.drain() {
            debug!(conn = id, "Closing connection for shutdown");
            drop(connection);
        }
        info!(
            connections = closed,
            presence_entries = self.presence.len(),
            "Shutting down"
        );
        self.takeover.restore();
    }

    fn poll_once(&mut self, timeout_ms: i32) -> Result<LoopControl> {
        let Some(listener) = self.takeover.listener() else {
            return Ok(LoopControl::Stop);
        };

        let mut fds = Vec::with_capacity(2 + self.connections.len() * 2);
        let mut slots = Vec::with_capacity(fds.capacity());
        push_fd(&mut fds, &mut slots, self.wake.stream.as_raw_fd(), Slot::Wake);
        // A level-triggered listener that keeps failing would spin the loop.
        let timeout_ms = if self.accept_paused {
            if timeout_ms < 0 {
                ACCEPT_RETRY_MS
            } else {
                timeout_ms.min(ACCEPT_RETRY_MS)
            }
        } else {
            push_fd(&mut fds, &mut slots, listener.as_raw_fd(), Slot::Listener);
            timeout_ms
        };
        self.accept_paused = false;
        for (id, connection) in &self.connections {
            push_fd(
                &mut fds,
                &mut slots,
                connection.client().as_raw_fd(),
                Slot::Client(*id),
            );
            if let Some(upstream) = connection.upstream() {
                push_fd(&mut fds, &mut slots, upstream.as_raw_fd(), Slot::Upstream(*id));
            }
        }

        // SAFETY: `fds` is a live, correctly sized array of pollfd for the
        // duration of the call, and every fd in it is owned by `self`.
        let ready =
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(LoopControl::Continue);
            }
            return Err(err.into());
        }
        if ready == 0 {
            return Ok(LoopControl::Continue);
        }

        for (pollfd, slot) in fds.iter().zip(slots) {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }
            match slot {
                Slot::Wake => {
                    info!("Shutdown requested");
                    return Ok(LoopControl::Stop);
                }
                Slot::Listener => self.accept_pending(),
                Slot::Client(id) => self.service(id, revents, true),
                Slot::Upstream(id) => self.service(id, revents, false),
            }
        }
        Ok(LoopControl::Continue)
    }

    fn accept_pending(&mut self) {
        loop {
            let accepted = match self.takeover.listener() {
                Some(listener) => listener.accept(),
                None => return,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_ms = ACCEPT_RETRY_MS,
                        "Failed to accept connection; pausing accepts"
                    );
                    self.accept_paused = true;
                    return;
                }
            };

            let id = self.next_id;
            self.next_id += 1;
            let upstream_path = self
                .takeover
                .upstream_active()
                .then(|| self.takeover.paths().relocated.as_path());
            match Connection::open(id, stream, upstream_path) {
                Ok(connection) => {
                    debug!(
                        conn = id,
                        upstream = connection.has_upstream(),
                        "Accepted connection"
                    );
                    self.connections.insert(id, connection);
                }
                Err(err) => warn!(conn = id, error = %err, "Failed to set up connection"),
            }
        }
    }

    fn service(&mut self, id: ConnectionId, revents: libc::c_short, client_side: bool) {
        let ctx = FrameContext {
            passive: !self.takeover.upstream_active(),
            presence: &self.presence,
            max_buffered_bytes: self.max_buffered_bytes,
        };
        // Already destroyed earlier in this iteration.
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };

        let flow = if revents & libc::POLLIN != 0 {
            if client_side {
                connection.on_client_readable(&ctx)
            } else {
                connection.on_upstream_readable()
            }
        } else if revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
            Flow::Close
        } else {
            Flow::Continue
        };

        if flow == Flow::Close {
            self.destroy(id);
        }
    }

    /// Removes and drops a connection. Unknown ids are ignored.
    fn destroy(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            debug!(conn = id, remaining = self.connections.len(), "Connection closed");
        }
    }
}

impl Drop for ProxyState {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn push_fd(fds: &mut Vec<libc::pollfd>, slots: &mut Vec<Slot>, fd: RawFd, slot: Slot) {
    fds.push(libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    });
    slots.push(slot);
}
