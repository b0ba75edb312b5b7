//! TLS peer identity.
//!
//! A display proves ownership of its name by presenting a client
//! certificate whose subject alternative names contain `ws:<name>`. The
//! accept path extracts those names once per connection; the session
//! handler only ever compares strings.

use std::sync::Arc;

use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Prefix that marks a SAN entry as a websocket display identity.
const NAME_PREFIX: &str = "ws:";

/// Failure to extract names from a peer certificate.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The certificate DER could not be parsed.
    #[error("cannot parse client certificate: {0}")]
    Parse(String),
}

/// Names asserted by a peer's client certificate.
///
/// Cheap to clone; the accept path stores one per connection as a request
/// extension.
#[derive(Clone, Debug, Default)]
pub struct PeerIdentity {
    names: Arc<Vec<String>>,
}

impl PeerIdentity {
    /// Build an identity from a list of SAN strings. Used directly by tests;
    /// production identities come from [`PeerIdentity::from_certificate`].
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: Arc::new(names),
        }
    }

    /// Extract subject alternative names from an end-entity certificate.
    ///
    /// DNS, URI and email SAN entries are collected verbatim; other name
    /// forms cannot carry a `ws:` identity and are ignored.
    pub fn from_certificate(der: &[u8]) -> Result<Self, IdentityError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|err| IdentityError::Parse(err.to_string()))?;
        let mut names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                match general_name {
                    GeneralName::DNSName(name)
                    | GeneralName::URI(name)
                    | GeneralName::RFC822Name(name) => names.push((*name).to_owned()),
                    _ => {}
                }
            }
        }
        Ok(Self::new(names))
    }

    /// Whether this identity authorizes the given display name.
    pub fn allows(&self, display: &str) -> bool {
        self.names
            .iter()
            .any(|name| name.strip_prefix(NAME_PREFIX) == Some(display))
    }

    /// All SAN strings, for logging rejected connections.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}
