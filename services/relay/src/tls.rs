//! TLS credential loading.
//!
//! The certificate chain and private key are read from PEM files once at
//! startup and turned into a single [`TlsAcceptor`] shared by every listener.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Errors loading or validating the TLS credential. All of them are fatal.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to open {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse PEM in {}: {source}", .path.display())]
    InvalidPem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", .path.display())]
    NoCertificates { path: PathBuf },

    #[error("no private key found in {}", .path.display())]
    NoPrivateKey { path: PathBuf },

    /// The key is unusable or does not belong to the certificate.
    #[error("certificate and key rejected: {0}")]
    Rejected(#[from] rustls::Error),
}

/// Certificate chain and private key used on every listening port.
#[derive(Debug)]
pub struct TlsCredential {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
}

impl TlsCredential {
    /// Load a PEM certificate chain and private key.
    ///
    /// The key may be PKCS#8, PKCS#1 or SEC1; the first key in the file is used.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CredentialError> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;
        debug!(
            cert_path = %cert_path.display(),
            key_path = %key_path.display(),
            certificates = cert_chain.len(),
            "Loaded TLS credential"
        );
        Ok(Self {
            cert_chain,
            private_key,
        })
    }

    /// Build the server configuration. Fails if the key does not match the
    /// end-entity certificate.
    pub fn server_config(&self) -> Result<ServerConfig, CredentialError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.private_key.clone_key())?;
        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, CredentialError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CredentialError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CredentialError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::InvalidPem {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(CredentialError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CredentialError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| CredentialError::InvalidPem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CredentialError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}
