//! Parsing and verification of software update service responses.
//!
//! Responses are small XML documents with three mandatory elements
//! (`protocolVersion`, `deviceId`, `action`). Parsing is pure: the
//! facade applies the resulting [`Response`] to the user state, so a
//! response that fails validation leaves no partial state behind.

use roxmltree::Document;

use crate::{Error, Result};

/// Protocol version this client speaks; responses carrying any other
/// version are rejected.
pub const PROTOCOL_VERSION: &str = "1";

/// Credentials for one scope as delivered by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeCredentials {
    pub scope: String,
    pub username: String,
    pub password: String,
}

/// A verified service response, ready to be applied.
#[derive(Debug)]
pub enum Response {
    /// Device registration: the provisioned certificate/key pair, both
    /// already validated as parseable PEM, plus the informational owner.
    Register {
        certificate_pem: String,
        private_key_pem: String,
        user: Option<String>,
    },
    /// Credentials refresh: one entry per scope.
    Credentials(Vec<ScopeCredentials>),
}

/// Parse and verify a response body.
pub fn parse_response(body: &str) -> Result<Response> {
    let doc = Document::parse(body).map_err(|e| Error::XmlParse(e.to_string()))?;

    let text_of = |tag: &str| -> Option<String> {
        doc.descendants()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
    };

    let version = text_of("protocolVersion")
        .ok_or_else(|| Error::XmlParse("missing <protocolVersion>".to_string()))?;
    text_of("deviceId").ok_or_else(|| Error::XmlParse("missing <deviceId>".to_string()))?;
    let action =
        text_of("action").ok_or_else(|| Error::XmlParse("missing <action>".to_string()))?;

    if version != PROTOCOL_VERSION {
        return Err(Error::ProtocolVersionMismatch {
            server: version,
            client: PROTOCOL_VERSION.to_string(),
        });
    }

    match action.as_str() {
        "register" => parse_register(&doc),
        "credentials" => parse_credentials(&doc),
        other => Err(Error::UnknownAction(other.to_string())),
    }
}

fn parse_register(doc: &Document) -> Result<Response> {
    let text_of = |tag: &str| -> String {
        doc.descendants()
            .find(|n| n.has_tag_name(tag))
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
            .unwrap_or_default()
    };

    let certificate_pem = text_of("certificate");
    validate_certificate_pem(&certificate_pem)?;

    let private_key_pem = text_of("privateKey");
    validate_private_key_pem(&private_key_pem)?;

    let user = doc
        .descendants()
        .find(|n| n.has_tag_name("user"))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string());

    Ok(Response::Register {
        certificate_pem,
        private_key_pem,
        user,
    })
}

fn parse_credentials(doc: &Document) -> Result<Response> {
    let mut credentials = Vec::new();

    for node in doc
        .descendants()
        .filter(|n| n.is_element() && n.has_tag_name("credentials"))
    {
        let scope = node
            .attribute("scope")
            .ok_or_else(|| Error::MissingCredentialField("scope".to_string()))?
            .to_string();

        let child_text = |tag: &str| -> Option<String> {
            node.children()
                .find(|c| c.has_tag_name(tag))
                .and_then(|c| c.text())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        };

        let username = child_text("username");
        let password = child_text("password");
        let (Some(username), Some(password)) = (username, password) else {
            return Err(Error::MissingCredentialField(format!(
                "username and/or password not set for scope '{}'",
                scope
            )));
        };

        credentials.push(ScopeCredentials {
            scope,
            username,
            password,
        });
    }

    if credentials.is_empty() {
        return Err(Error::MissingCredentialField(
            "response carries no credentials".to_string(),
        ));
    }

    Ok(Response::Credentials(credentials))
}

/// Validate that `pem` carries a parseable X.509 certificate.
pub fn validate_certificate_pem(pem: &str) -> Result<()> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|_| Error::InvalidCertificate)?;
    parsed.parse_x509().map_err(|_| Error::InvalidCertificate)?;
    Ok(())
}

/// Validate that `pem` carries a parseable private key (PKCS#1, PKCS#8 or
/// SEC1).
pub fn validate_private_key_pem(pem: &str) -> Result<()> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => Ok(()),
        _ => Err(Error::InvalidPrivateKey),
    }
}
