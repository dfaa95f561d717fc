//! TLS-terminating listener for a single port mapping.
//!
//! The listener accepts TCP connections, completes the TLS handshake in the
//! connection's own task and hands the decrypted stream to a
//! [`RelaySession`] targeting the mapping's backend port.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tlsrelay_portmap::PortMapping;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::session::{RelaySession, SessionOutcome};
use crate::config::RelaySettings;

/// Pause after a failed accept so persistent errors do not spin the loop.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listening socket for one port mapping.
pub struct PortListener {
    mapping: PortMapping,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    settings: Arc<RelaySettings>,
}

impl PortListener {
    /// Bind `listen_host` on the mapping's listen port.
    pub async fn bind(
        mapping: PortMapping,
        listen_host: IpAddr,
        acceptor: TlsAcceptor,
        settings: Arc<RelaySettings>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(listen_host, mapping.listen_port)).await?;
        Ok(Self {
            mapping,
            listener,
            acceptor,
            settings,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn mapping(&self) -> PortMapping {
        self.mapping
    }

    /// Accept connections forever.
    ///
    /// Accept errors are logged and the loop continues; nothing a single
    /// connection does can stop it.
    pub async fn run(self) {
        let listen_port = self
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.mapping.listen_port);
        info!(
            listen_port,
            backend = %self.settings.backend_addr(self.mapping.backend_port),
            "Listener started"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let acceptor = self.acceptor.clone();
                    let settings = Arc::clone(&self.settings);
                    let backend_port = self.mapping.backend_port;

                    tokio::spawn(
                        handle_connection(stream, acceptor, settings, backend_port).instrument(
                            tracing::info_span!("connection", peer = %peer_addr, listen_port),
                        ),
                    );
                }
                Err(e) => {
                    error!(listen_port, error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Terminate TLS on an accepted connection and relay it.
async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    settings: Arc<RelaySettings>,
    backend_port: u16,
) {
    if settings.debug {
        debug!("Handle new connection");
    }

    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            if settings.debug {
                warn!(error = %e, "TLS handshake failed");
            } else {
                debug!(error = %e, "TLS handshake failed");
            }
            return;
        }
    };

    match RelaySession::new(tls_stream, settings, backend_port).run().await {
        SessionOutcome::Completed { first } => debug!(first = %first, "Session finished"),
        SessionOutcome::DialFailed => debug!("Session ended without backend"),
        SessionOutcome::Aborted => warn!("Session copy tasks aborted"),
    }
}
