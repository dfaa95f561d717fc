//! TLS-terminating TCP relay.
//!
//! ## Architecture
//!
//! ```text
//! Client --TLS--> PortListener --> RelaySession --TCP--> backend_host:backend_port
//!                      ^
//!            ProxySupervisor (one listener per port mapping)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let config = Config::from_env()?;
//! ProxySupervisor::from_config(&config)?.run().await?;
//! ```

mod listener;
mod session;
mod supervisor;

pub use listener::{PortListener, ACCEPT_ERROR_BACKOFF};
pub use session::{Direction, RelaySession, SessionOutcome, COPY_BUFFER_SIZE};
pub use supervisor::{ListenerEvent, ListenerGroup, ProxyState, ProxySupervisor};
