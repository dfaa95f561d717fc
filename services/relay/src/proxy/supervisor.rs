//! Proxy supervisor: one listener task per port mapping, then wait for a
//! termination signal.
//!
//! Listener tasks live in a [`ListenerGroup`] so they can be cancelled
//! together. Relay sessions are fire-and-forget and are not drained on
//! shutdown.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tlsrelay_portmap::{PortMapping, PortMappings};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use super::listener::PortListener;
use crate::config::{Config, RelaySettings};
use crate::tls::{CredentialError, TlsCredential};

/// Process-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::ShuttingDown => "shutting_down",
            ProxyState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Bind result reported by each listener task.
#[derive(Debug)]
pub enum ListenerEvent {
    Bound {
        mapping: PortMapping,
        local_addr: SocketAddr,
    },
    BindFailed {
        mapping: PortMapping,
        error: io::Error,
    },
}

/// Running listener tasks.
///
/// Dropping the group aborts every listener; sessions already spawned keep
/// running until their connections end or the process exits.
pub struct ListenerGroup {
    tasks: JoinSet<()>,
    events: mpsc::UnboundedReceiver<ListenerEvent>,
}

impl ListenerGroup {
    /// Next bind result, or `None` once every listener has reported.
    pub async fn next_event(&mut self) -> Option<ListenerEvent> {
        self.events.recv().await
    }

    /// Listener tasks still running (including ones not yet bound).
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort every listener and wait for the tasks to finish.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}

/// Owns the listener set for the process.
pub struct ProxySupervisor {
    settings: Arc<RelaySettings>,
    mappings: PortMappings,
    listen_host: IpAddr,
    acceptor: TlsAcceptor,
    state: ProxyState,
}

impl ProxySupervisor {
    pub fn new(
        settings: Arc<RelaySettings>,
        mappings: PortMappings,
        listen_host: IpAddr,
        acceptor: TlsAcceptor,
    ) -> Self {
        Self {
            settings,
            mappings,
            listen_host,
            acceptor,
            state: ProxyState::Starting,
        }
    }

    /// Load the TLS credential and build a supervisor.
    ///
    /// A credential error affects every listener identically and is fatal.
    pub fn from_config(config: &Config) -> Result<Self, CredentialError> {
        let credential = TlsCredential::load(&config.cert_file, &config.key_file)?;
        Ok(Self::new(
            config.relay_settings(),
            config.mappings.clone(),
            config.listen_host,
            credential.acceptor()?,
        ))
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    fn transition(&mut self, next: ProxyState) {
        info!(from = %self.state, to = %next, "Proxy state changed");
        self.state = next;
    }

    /// Spawn one listener task per mapping.
    ///
    /// Returns once every task is dispatched; binding happens asynchronously
    /// and a bind failure only ends its own task.
    pub fn start(&mut self) -> ListenerGroup {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for mapping in self.mappings.iter().copied() {
            let listen_host = self.listen_host;
            let acceptor = self.acceptor.clone();
            let settings = Arc::clone(&self.settings);
            let events_tx = events_tx.clone();

            tasks.spawn(async move {
                let listener =
                    match PortListener::bind(mapping, listen_host, acceptor, settings).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            error!(mapping = %mapping, error = %e, "Failed to bind listener");
                            let _ = events_tx.send(ListenerEvent::BindFailed { mapping, error: e });
                            return;
                        }
                    };

                match listener.local_addr() {
                    Ok(local_addr) => {
                        info!(mapping = %mapping, bind_addr = %local_addr, "Listener bound");
                        let _ = events_tx.send(ListenerEvent::Bound {
                            mapping,
                            local_addr,
                        });
                    }
                    Err(e) => {
                        error!(mapping = %mapping, error = %e, "Listener has no local address");
                        let _ = events_tx.send(ListenerEvent::BindFailed { mapping, error: e });
                        return;
                    }
                }
                drop(events_tx);

                listener.run().await;
            });
        }

        if self.state == ProxyState::Starting {
            self.transition(ProxyState::Running);
        }
        ListenerGroup { tasks, events }
    }

    /// Run until `shutdown` resolves, then return without draining sessions.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let group = self.start();
        info!(listeners = group.len(), "Proxy running");

        shutdown.await;

        self.transition(ProxyState::ShuttingDown);
        drop(group);
        self.transition(ProxyState::Terminated);
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> io::Result<()> {
        let signals = ShutdownSignals::register()?;
        self.run_until(async move {
            let signal = signals.recv().await;
            info!(signal, "Quit ({})", signal);
        })
        .await;
        Ok(())
    }
}

/// Termination signals the supervisor reacts to.
#[cfg(unix)]
struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> &'static str {
        let _ = tokio::signal::ctrl_c().await;
        "CTRL_C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn supervisor(mappings: Vec<PortMapping>) -> ProxySupervisor {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let credential = TlsCredential {
            cert_chain: vec![cert.cert.der().clone()],
            private_key: rustls::pki_types::PrivateKeyDer::Pkcs8(
                cert.key_pair.serialize_der().into(),
            ),
        };
        ProxySupervisor::new(
            Arc::new(RelaySettings::new("127.0.0.1", false)),
            PortMappings::from_mappings(mappings).unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            credential.acceptor().unwrap(),
        )
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProxyState::ShuttingDown.to_string(), "shutting_down");
    }

    #[tokio::test]
    async fn test_start_reports_each_listener() {
        let mut supervisor = supervisor(vec![PortMapping::new(0, 1), PortMapping::new(0, 2)]);
        assert_eq!(supervisor.state(), ProxyState::Starting);

        let mut group = supervisor.start();
        assert_eq!(supervisor.state(), ProxyState::Running);

        let mut bound = Vec::new();
        while let Some(event) = timeout(TEST_TIMEOUT, group.next_event()).await.unwrap() {
            match event {
                ListenerEvent::Bound { mapping, .. } => bound.push(mapping.backend_port),
                ListenerEvent::BindFailed { error, .. } => panic!("bind failed: {error}"),
            }
        }
        bound.sort_unstable();
        assert_eq!(bound, vec![1, 2]);
        assert_eq!(group.len(), 2);

        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_isolated() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut supervisor = supervisor(vec![PortMapping::same(port), PortMapping::new(0, 9)]);
        let mut group = supervisor.start();

        let mut failed = 0;
        let mut bound = 0;
        while let Some(event) = timeout(TEST_TIMEOUT, group.next_event()).await.unwrap() {
            match event {
                ListenerEvent::Bound { .. } => bound += 1,
                ListenerEvent::BindFailed { mapping, .. } => {
                    assert_eq!(mapping.listen_port, port);
                    failed += 1;
                }
            }
        }
        assert_eq!((bound, failed), (1, 1));

        // The failed task ends; the bound listener keeps running.
        timeout(TEST_TIMEOUT, async {
            while group.len() > 1 {
                if group.tasks.join_next().await.is_none() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(group.len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_terminates() {
        let (tx, rx) = oneshot::channel::<()>();
        let supervisor = supervisor(vec![PortMapping::new(0, 1)]);
        let run = tokio::spawn(supervisor.run_until(async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        timeout(TEST_TIMEOUT, run).await.unwrap().unwrap();
    }
}
