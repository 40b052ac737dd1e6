//! Purser - device enrollment and repository URL resolution for embedded OS images.
//!
//! This library lets a device identify itself against a central software
//! update service, obtain a client certificate and private key, refresh
//! per-scope repository credentials, and resolve abstract repository names
//! into fully substituted URLs for the package manager.
//!
//! The entry point is [`client::Purser`], which aggregates:
//!
//! - the layered configuration planes ([`config`]),
//! - the device identification heuristics ([`device`]),
//! - the repository URL template resolver ([`repourl`]),
//! - the HTTP/TLS transport ([`transport`]) and the update-service
//!   response protocol ([`protocol`]).

pub mod client;
pub mod config;
pub mod device;
pub mod protocol;
pub mod repourl;
pub mod transport;

pub use client::{ConfigPaths, Notifier, NullNotifier, Purser};
pub use config::ConfigStore;

/// Library-level error type for Purser operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration file error: {0}")]
    Config(String),

    #[error("required configuration key '{0}' is not set")]
    MissingConfigKey(&'static str),

    #[error("no valid UID available for this device; for phones: is the modem online?")]
    InvalidUid,

    #[error("device is not registered")]
    NotRegistered,

    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("unable to parse server response ({0})")]
    XmlParse(String),

    #[error("response has unsupported protocol version {server}, client requires version {client}")]
    ProtocolVersionMismatch { server: String, client: String },

    #[error("response to unknown action encountered: {0}")]
    UnknownAction(String),

    #[error("certificate is invalid")]
    InvalidCertificate,

    #[error("private key is invalid")]
    InvalidPrivateKey,

    #[error("credentials element incomplete: {0}")]
    MissingCredentialField(String),
}

/// Result type alias for Purser operations.
pub type Result<T> = std::result::Result<T, Error>;
