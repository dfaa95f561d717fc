//! Relay session: one decrypted client connection paired with one backend
//! connection.
//!
//! Each direction is copied by its own task. The session ends as soon as the
//! first direction finishes; the other task is then aborted, which drops the
//! stream halves it owns and closes both connections.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RelaySettings;

/// Size of the block each copy loop reads before writing it out.
pub const COPY_BUFFER_SIZE: usize = 512;

/// Direction of a copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The backend could not be dialed; the client was closed untouched.
    DialFailed,
    /// Both connections were closed after `first` finished copying.
    Completed { first: Direction },
    /// Both copy tasks died without reporting (panic or runtime shutdown).
    Aborted,
}

/// Owns a client stream for the lifetime of one relayed connection.
pub struct RelaySession<S> {
    client: S,
    settings: Arc<RelaySettings>,
    backend_port: u16,
}

impl<S> RelaySession<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(client: S, settings: Arc<RelaySettings>, backend_port: u16) -> Self {
        Self {
            client,
            settings,
            backend_port,
        }
    }

    /// Dial the backend and relay until either side finishes.
    ///
    /// Never fails: every error is logged and ends the session.
    pub async fn run(self) -> SessionOutcome {
        let target = self.settings.backend_addr(self.backend_port);

        let backend = match TcpStream::connect(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(backend = %target, error = %e, "Failed to connect to backend");
                return SessionOutcome::DialFailed;
            }
        };
        debug!(backend = %target, "Connected to backend");

        let debug = self.settings.debug;
        let (client_read, client_write) = tokio::io::split(self.client);
        let (backend_read, backend_write) = backend.into_split();

        // Room for both signals so the slower task never blocks on send.
        let (done_tx, mut done_rx) = mpsc::channel(2);

        let upstream = tokio::spawn(copy_stream(
            client_read,
            backend_write,
            Direction::ClientToBackend,
            debug,
            done_tx.clone(),
        ));
        let downstream = tokio::spawn(copy_stream(
            backend_read,
            client_write,
            Direction::BackendToClient,
            debug,
            done_tx,
        ));

        let first = done_rx.recv().await;

        // Dropping the remaining halves closes both sockets and unblocks the
        // other loop. Its completion is not awaited.
        upstream.abort();
        downstream.abort();

        match first {
            Some(direction) => {
                debug!(backend = %target, first = %direction, "Closed connection");
                SessionOutcome::Completed { first: direction }
            }
            None => SessionOutcome::Aborted,
        }
    }
}

/// Copy blocks from `reader` to `writer` until end of stream or an I/O error,
/// then report `direction` on `done`.
async fn copy_stream<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    debug: bool,
    done: mpsc::Sender<Direction>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                if debug {
                    warn!(direction = %direction, error = %e, "Read error");
                }
                break;
            }
        };

        // Flush so TLS records are not left sitting in the session buffer.
        let written = match writer.write_all(&buf[..n]).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if debug {
                warn!(direction = %direction, error = %e, "Write error");
            }
            break;
        }
    }

    let _ = done.send(direction).await;
}
