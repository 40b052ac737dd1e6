//! HTTP/TLS transport towards the software update service.
//!
//! Every exchange goes through an [`ureq::Agent`] built from
//! [`TlsOptions`]: trusted roots come from the configured CA certificate
//! file, peer verification can be switched off for test deployments, and
//! the credentials refresh presents the provisioned client certificate
//! for mutual TLS.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use ureq::Agent;
use ureq::tls::{Certificate, ClientCert, PemItem, RootCerts, TlsConfig};

use crate::protocol::PROTOCOL_VERSION;
use crate::{Error, Result};

/// User-Agent header sent on every request.
const USER_AGENT: &str = concat!("purser/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout covering connect and transfer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client certificate and key pair, PEM-encoded, for mutual TLS.
pub struct ClientIdentity {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// TLS parameters assembled from the user state plane.
pub struct TlsOptions {
    /// Path of the PEM file holding the trusted roots for the SU service.
    pub ca_certificate: PathBuf,
    /// Peer verification switch (`ssl-verify`, default on).
    pub verify: bool,
    /// Present a client certificate when set (credentials refresh).
    pub client_identity: Option<ClientIdentity>,
}

/// Build a blocking agent carrying the given TLS configuration.
pub fn build_agent(options: &TlsOptions) -> Result<Agent> {
    let pem = fs::read(&options.ca_certificate).map_err(|e| {
        Error::Transport(format!(
            "cannot read CA certificate {}: {}",
            options.ca_certificate.display(),
            e
        ))
    })?;

    let roots: Vec<Certificate<'static>> = ureq::tls::parse_pem(&pem)
        .filter_map(|item| match item {
            Ok(PemItem::Certificate(cert)) => Some(cert.to_owned()),
            _ => None,
        })
        .collect();
    if roots.is_empty() {
        return Err(Error::Transport(format!(
            "no certificates found in {}",
            options.ca_certificate.display()
        )));
    }

    let mut tls = TlsConfig::builder().root_certs(RootCerts::from(roots));

    if let Some(identity) = &options.client_identity {
        let cert = ureq::tls::parse_pem(identity.certificate_pem.as_bytes())
            .find_map(|item| match item {
                Ok(PemItem::Certificate(cert)) => Some(cert.to_owned()),
                _ => None,
            })
            .ok_or(Error::InvalidCertificate)?;
        let key = ureq::tls::parse_pem(identity.private_key_pem.as_bytes())
            .find_map(|item| match item {
                Ok(PemItem::PrivateKey(key)) => Some(key.to_owned()),
                _ => None,
            })
            .ok_or(Error::InvalidPrivateKey)?;
        tls = tls.client_cert(Some(ClientCert::new_with_certs(&[cert], key)));
    }

    if !options.verify {
        tls = tls.disable_verification(true);
    }

    let config = Agent::config_builder()
        .proxy(None)
        .user_agent(USER_AGENT)
        .timeout_global(Some(REQUEST_TIMEOUT))
        .tls_config(tls.build())
        .build();
    Ok(config.new_agent())
}

/// `Authorization` header value for HTTP Basic authentication.
pub(crate) fn basic_auth(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", username, password))
    )
}

/// POST the registration form and return the response body.
///
/// The request authenticates with HTTP Basic and carries the protocol
/// version and device model as an urlencoded form.
pub fn post_registration(
    agent: &Agent,
    url: &str,
    username: &str,
    password: &str,
    device_model: &str,
) -> Result<String> {
    debug!("sending registration request to {}", url);
    let body = format!(
        "protocolVersion={}&deviceModel={}",
        PROTOCOL_VERSION, device_model
    );
    let response = agent
        .post(url)
        .header("Authorization", &basic_auth(username, password))
        .content_type("application/x-www-form-urlencoded")
        .send(body)
        .map_err(transport_err)?;
    response
        .into_body()
        .read_to_string()
        .map_err(transport_err)
}

/// GET the credentials refresh endpoint and return the response body.
///
/// The agent is expected to carry the client identity for mutual TLS.
pub fn get_credentials(agent: &Agent, url: &str) -> Result<String> {
    let separator = if url.contains('?') { '&' } else { '?' };
    let full = format!("{}{}protocolVersion={}", url, separator, PROTOCOL_VERSION);
    debug!("sending credentials request to {}", full);
    let response = agent.get(&full).call().map_err(transport_err)?;
    response
        .into_body()
        .read_to_string()
        .map_err(transport_err)
}

/// GET an auxiliary URL (the user's authorized_keys material).
pub fn get_body(agent: &Agent, url: &str) -> Result<String> {
    debug!("sending request to {}", url);
    let response = agent.get(url).call().map_err(transport_err)?;
    response
        .into_body()
        .read_to_string()
        .map_err(transport_err)
}

fn transport_err(err: ureq::Error) -> Error {
    match err {
        ureq::Error::StatusCode(code) => {
            Error::Transport(format!("server returned HTTP {}", code))
        }
        other => Error::Transport(other.to_string()),
    }
}
