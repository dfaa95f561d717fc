//! Port mapping resolution for the relay.
//!
//! A port mapping spec is free-form text containing tokens of the form
//! `LISTEN[:BACKEND]`, for example `"443:8080, 8443 9000:9100"`. Every token
//! becomes one [`PortMapping`]; a token without a backend port maps to the
//! same port on the backend. Anything between tokens is ignored.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Grammar of a single mapping token.
static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+)(?::([0-9]+))?").expect("port token pattern is valid")
});

/// Errors produced while resolving a port mapping spec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortSpecError {
    /// The spec is empty or only whitespace.
    #[error("port mapping spec is empty")]
    Empty,

    /// The spec contains no `LISTEN[:BACKEND]` token.
    #[error("no port mappings found in '{spec}'")]
    NoMappings { spec: String },

    /// A number in a token does not fit in a TCP port.
    #[error("port '{value}' in '{token}' is out of range (0-65535)")]
    PortOutOfRange { token: String, value: String },

    /// The same listening port was declared twice.
    #[error("listen port {port} is declared more than once")]
    DuplicateListenPort { port: u16 },
}

/// A client-facing port paired with the backend port it relays to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// Port accepting TLS connections.
    pub listen_port: u16,
    /// Port dialed on the backend host.
    pub backend_port: u16,
}

impl PortMapping {
    pub fn new(listen_port: u16, backend_port: u16) -> Self {
        Self {
            listen_port,
            backend_port,
        }
    }

    /// A mapping that relays to the same port number on the backend.
    pub fn same(port: u16) -> Self {
        Self::new(port, port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.listen_port, self.backend_port)
    }
}

/// The resolved, ordered set of port mappings.
///
/// Listen ports are unique, except for `0` (ephemeral) which may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMappings {
    mappings: Vec<PortMapping>,
}

impl PortMappings {
    /// Build a set from already-resolved mappings, enforcing listen port uniqueness.
    pub fn from_mappings(
        mappings: impl IntoIterator<Item = PortMapping>,
    ) -> Result<Self, PortSpecError> {
        let mut set = Self::default();
        for mapping in mappings {
            set.push(mapping)?;
        }
        Ok(set)
    }

    fn push(&mut self, mapping: PortMapping) -> Result<(), PortSpecError> {
        if mapping.listen_port != 0
            && self
                .mappings
                .iter()
                .any(|m| m.listen_port == mapping.listen_port)
        {
            return Err(PortSpecError::DuplicateListenPort {
                port: mapping.listen_port,
            });
        }
        self.mappings.push(mapping);
        Ok(())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PortMapping> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl IntoIterator for PortMappings {
    type Item = PortMapping;
    type IntoIter = std::vec::IntoIter<PortMapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.mappings.into_iter()
    }
}

impl<'a> IntoIterator for &'a PortMappings {
    type Item = &'a PortMapping;
    type IntoIter = std::slice::Iter<'a, PortMapping>;

    fn into_iter(self) -> Self::IntoIter {
        self.mappings.iter()
    }
}

/// Resolve a textual port mapping spec.
///
/// Tokens are taken left to right without overlap; separators and any other
/// non-matching text are skipped.
pub fn parse_port_spec(spec: &str) -> Result<PortMappings, PortSpecError> {
    if spec.trim().is_empty() {
        return Err(PortSpecError::Empty);
    }

    let mut mappings = PortMappings::default();
    for caps in TOKEN.captures_iter(spec) {
        mappings.push(mapping_from_captures(&caps)?)?;
    }

    if mappings.is_empty() {
        return Err(PortSpecError::NoMappings {
            spec: spec.to_string(),
        });
    }
    Ok(mappings)
}

fn mapping_from_captures(caps: &regex::Captures<'_>) -> Result<PortMapping, PortSpecError> {
    let token = caps.get(0).map_or("", |m| m.as_str());
    let port = |value: &str| {
        value
            .parse::<u16>()
            .map_err(|_| PortSpecError::PortOutOfRange {
                token: token.to_string(),
                value: value.to_string(),
            })
    };

    let listen_port = port(&caps[1])?;
    let backend_port = match caps.get(2) {
        Some(backend) => port(backend.as_str())?,
        None => listen_port,
    };
    Ok(PortMapping::new(listen_port, backend_port))
}
