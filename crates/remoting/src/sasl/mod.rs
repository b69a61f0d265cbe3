//! SASL capability seams
//!
//! The multiplexing layer never interprets mechanism bytes. It drives
//! [`SaslServer`] instances on the responder side and [`SaslClient`] instances
//! on the initiator side, and always disposes them when an exchange ends.

mod anonymous;
mod credentials;
mod domain;
mod plain;

pub use anonymous::{AnonymousSaslClient, AnonymousSaslServer, ANONYMOUS};
pub use credentials::{AuthenticationConfiguration, Principal};
pub use domain::SimpleSecurityDomain;
pub use plain::{PlainSaslClient, PlainSaslServer, PLAIN};

use crate::error::{RemotingError, Result};
use tracing::warn;

/// Responder half of a mechanism exchange
pub trait SaslServer: Send {
    /// Mechanism name
    fn mechanism_name(&self) -> &str;

    /// Evaluate a client response and produce the next challenge
    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>>;

    /// Whether the exchange has finished successfully
    fn is_complete(&self) -> bool;

    /// Principal established by a completed exchange
    fn authorized_principal(&self) -> Option<Principal>;

    /// Mechanism specific negotiated property
    fn negotiated_property(&self, _name: &str) -> Option<String> {
        None
    }

    /// Release mechanism resources
    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds responder mechanisms by name
pub trait SaslServerFactory: Send + Sync {
    /// Mechanisms this factory offers, in preference order
    fn mechanism_names(&self) -> Vec<String>;

    /// Build a server for `mechanism`
    fn create_sasl_server(&self, mechanism: &str) -> Result<Box<dyn SaslServer>>;
}

/// Initiator half of a mechanism exchange
pub trait SaslClient: Send {
    /// Mechanism name
    fn mechanism_name(&self) -> &str;

    /// Whether the first frame carries a response
    fn has_initial_response(&self) -> bool;

    /// Evaluate a server challenge; an empty result means nothing to send
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Whether the client considers the exchange finished
    fn is_complete(&self) -> bool;

    /// Release mechanism resources
    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds initiator mechanisms for a credential
pub trait SaslClientFactory: Send + Sync {
    /// Build a client for `mechanism`, or `None` if this factory cannot
    /// authenticate `config` with it
    fn create_sasl_client(
        &self,
        mechanism: &str,
        config: &AuthenticationConfiguration,
    ) -> Result<Option<Box<dyn SaslClient>>>;
}

/// Client factory covering `PLAIN` and `ANONYMOUS`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSaslClientFactory;

impl SaslClientFactory for DefaultSaslClientFactory {
    fn create_sasl_client(
        &self,
        mechanism: &str,
        config: &AuthenticationConfiguration,
    ) -> Result<Option<Box<dyn SaslClient>>> {
        if !config.mechanism_allowed(mechanism) {
            return Ok(None);
        }
        match mechanism {
            PLAIN => match (config.principal(), config.password()) {
                (Principal::Named(name), Some(password)) => {
                    Ok(Some(Box::new(PlainSaslClient::new(name, password))))
                }
                _ => Ok(None),
            },
            ANONYMOUS if config.is_anonymous() => Ok(Some(Box::new(AnonymousSaslClient::new()))),
            _ => Ok(None),
        }
    }
}

/// Server that rejects every response; stands in for mechanisms that could
/// not be created
#[derive(Debug)]
pub struct RejectingSaslServer {
    mechanism: String,
    reason: RemotingError,
}

impl RejectingSaslServer {
    /// Placeholder for `mechanism`, failing with `reason`
    pub fn new(mechanism: impl Into<String>, reason: RemotingError) -> Self {
        Self {
            mechanism: mechanism.into(),
            reason,
        }
    }
}

impl SaslServer for RejectingSaslServer {
    fn mechanism_name(&self) -> &str {
        &self.mechanism
    }

    fn evaluate_response(&mut self, _response: &[u8]) -> Result<Vec<u8>> {
        Err(self.reason.clone())
    }

    fn is_complete(&self) -> bool {
        false
    }

    fn authorized_principal(&self) -> Option<Principal> {
        None
    }
}

/// Dispose a server mechanism, logging failures
pub fn dispose_server(server: &mut dyn SaslServer) {
    if let Err(err) = server.dispose() {
        warn!(mechanism = server.mechanism_name(), error = %err, "failed to dispose SASL server");
    }
}

/// Dispose a client mechanism, logging failures
pub fn dispose_client(client: &mut dyn SaslClient) {
    if let Err(err) = client.dispose() {
        warn!(mechanism = client.mechanism_name(), error = %err, "failed to dispose SASL client");
    }
}
