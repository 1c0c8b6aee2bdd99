//! One proxied client and, when available, its upstream twin.
//!
//! Client bytes are buffered until a whole frame is present, inspected, and
//! then forwarded byte-for-byte. Upstream bytes are relayed as they arrive and
//! never parsed.
//!
//! Sends are a single best-effort write. A short or failed write is not
//! retried; the traffic is small control messages, so this stays simple.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::{debug, warn};

use presence_proxy_protocol::{decode_frame, extract_activity, ready_response, Opcode};

use crate::hijack::connect_nonblocking;
use crate::presence::PresenceStore;

const READ_CHUNK_SIZE: usize = 4096;

pub type ConnectionId = u64;

/// What the event loop should do with a connection after servicing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Settings shared by every connection, owned by the proxy state.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    /// No real service behind the proxy; handshakes are answered locally.
    pub passive: bool,
    pub presence: &'a PresenceStore,
    pub max_buffered_bytes: usize,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    client: UnixStream,
    upstream: Option<UnixStream>,
    client_buf: Vec<u8>,
    handshake_answered: bool,
}

impl Connection {
    /// Wraps an accepted client and dials `upstream_path` if given.
    ///
    /// A failed dial is logged and the connection carries on inspect-only. The
    /// dial never waits, so a real service that stopped accepting costs this
    /// client its upstream rather than stalling every other client.
    pub fn open(
        id: ConnectionId,
        client: UnixStream,
        upstream_path: Option<&Path>,
    ) -> io::Result<Self> {
        client.set_nonblocking(true)?;

        let upstream = match upstream_path {
            Some(path) => match connect_nonblocking(path) {
                Ok(stream) => Some(stream),
                Err(err) => {
                    warn!(
                        conn = id,
                        error = %err,
                        path = %path.display(),
                        "Failed to connect to upstream; inspecting only"
                    );
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            id,
            client,
            upstream,
            client_buf: Vec::new(),
            handshake_answered: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client(&self) -> &UnixStream {
        &self.client
    }

    pub fn upstream(&self) -> Option<&UnixStream> {
        self.upstream.as_ref()
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn handshake_answered(&self) -> bool {
        self.handshake_answered
    }

    /// Bytes received from the client that do not yet form a whole frame.
    pub fn pending_bytes(&self) -> usize {
        self.client_buf.len()
    }

    pub fn on_client_readable(&mut self, ctx: &FrameContext<'_>) -> Flow {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = match read_chunk(&mut self.client, &mut chunk) {
            ReadOutcome::Data(n) => n,
            ReadOutcome::NotReady => return Flow::Continue,
            ReadOutcome::Closed => {
                debug!(conn = self.id, "Client closed");
                return Flow::Close;
            }
            ReadOutcome::Failed(err) => {
                debug!(conn = self.id, error = %err, "Client read failed");
                return Flow::Close;
            }
        };

        self.receive_client_bytes(&chunk[..n], ctx)
    }

    /// Appends client bytes and handles every complete frame now buffered.
    pub fn receive_client_bytes(&mut self, bytes: &[u8], ctx: &FrameContext<'_>) -> Flow {
        self.client_buf.extend_from_slice(bytes);
        self.process_client_buffer(ctx);

        if self.client_buf.len() > ctx.max_buffered_bytes {
            warn!(
                conn = self.id,
                buffered = self.client_buf.len(),
                limit = ctx.max_buffered_bytes,
                "Client frame exceeds buffer limit; closing"
            );
            return Flow::Close;
        }
        Flow::Continue
    }

    pub fn on_upstream_readable(&mut self) -> Flow {
        let Some(upstream) = self.upstream.as_mut() else {
            return Flow::Continue;
        };

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        match read_chunk(upstream, &mut chunk) {
            ReadOutcome::Data(n) => {
                send_best_effort(&mut self.client, &chunk[..n], self.id, "client");
                Flow::Continue
            }
            ReadOutcome::NotReady => Flow::Continue,
            ReadOutcome::Closed => {
                debug!(conn = self.id, "Upstream closed");
                Flow::Close
            }
            ReadOutcome::Failed(err) => {
                debug!(conn = self.id, error = %err, "Upstream read failed");
                Flow::Close
            }
        }
    }

    fn process_client_buffer(&mut self, ctx: &FrameContext<'_>) {
        while let Some(frame) = decode_frame(&self.client_buf) {
            debug!(
                conn = self.id,
                opcode = ?frame.opcode,
                bytes = frame.consumed,
                "Client frame"
            );

            match frame.opcode {
                Opcode::Handshake if ctx.passive && !self.handshake_answered => {
                    send_best_effort(&mut self.client, &ready_response(), self.id, "client");
                    self.handshake_answered = true;
                }
                Opcode::Frame => {
                    match extract_activity(&frame.payload) {
                        Some(update) if update.has_pid() => {
                            debug!(
                                conn = self.id,
                                pid = update.pid,
                                state = ?update.state,
                                details = ?update.details,
                                "Activity update"
                            );
                            ctx.presence.put(update.pid, update.state, update.details);
                        }
                        Some(_) => debug!(conn = self.id, "Activity update without a pid; ignored"),
                        None => {}
                    }
                }
                _ => {}
            }

            if let Some(upstream) = self.upstream.as_mut() {
                send_best_effort(upstream, &self.client_buf[..frame.consumed], self.id, "upstream");
            }
            self.client_buf.drain(..frame.consumed);
        }
    }
}

enum ReadOutcome {
    Data(usize),
    NotReady,
    Closed,
    Failed(io::Error),
}

fn read_chunk(stream: &mut UnixStream, chunk: &mut [u8]) -> ReadOutcome {
    loop {
        match stream.read(chunk) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(n) => return ReadOutcome::Data(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::NotReady,
            Err(err) => return ReadOutcome::Failed(err),
        }
    }
}

fn send_best_effort(stream: &mut UnixStream, bytes: &[u8], conn: ConnectionId, peer: &str) {
    match stream.write(bytes) {
        Ok(n) if n == bytes.len() => {}
        Ok(n) => debug!(conn, peer, sent = n, len = bytes.len(), "Short write dropped"),
        Err(err) => debug!(conn, peer, error = %err, "Write failed"),
    }
}
