pub mod config;
pub mod proxy;
pub mod tls;

pub use config::{Config, ConfigError, RelaySettings};
pub use proxy::{
    Direction, ListenerEvent, ListenerGroup, PortListener, ProxyState, ProxySupervisor,
    RelaySession, SessionOutcome,
};
pub use tls::{CredentialError, TlsCredential};
pub use tlsrelay_portmap::{parse_port_spec, PortMapping, PortMappings, PortSpecError};
