//! In-memory security domain

use super::{
    AnonymousSaslServer, PlainSaslServer, SaslServer, SaslServerFactory, ANONYMOUS, PLAIN,
};
use crate::error::{RemotingError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// User table plus the ordered list of mechanisms offered to peers
#[derive(Debug, Clone)]
pub struct SimpleSecurityDomain {
    users: Arc<HashMap<String, String>>,
    mechanisms: Vec<String>,
}

impl SimpleSecurityDomain {
    /// Domain offering `PLAIN` then `ANONYMOUS` with no users
    pub fn new() -> Self {
        Self {
            users: Arc::new(HashMap::new()),
            mechanisms: vec![PLAIN.to_string(), ANONYMOUS.to_string()],
        }
    }

    /// Add a user
    pub fn with_user(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.users).insert(name.into(), password.into());
        self
    }

    /// Replace the offered mechanism list
    pub fn with_mechanisms<I, S>(mut self, mechanisms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mechanisms = mechanisms.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for SimpleSecurityDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl SaslServerFactory for SimpleSecurityDomain {
    fn mechanism_names(&self) -> Vec<String> {
        self.mechanisms.clone()
    }

    fn create_sasl_server(&self, mechanism: &str) -> Result<Box<dyn SaslServer>> {
        if !self.mechanisms.iter().any(|m| m == mechanism) {
            return Err(RemotingError::sasl(format!(
                "mechanism {mechanism} is not offered"
            )));
        }
        match mechanism {
            PLAIN => Ok(Box::new(PlainSaslServer::new(Arc::clone(&self.users)))),
            ANONYMOUS => Ok(Box::new(AnonymousSaslServer::new())),
            other => Err(RemotingError::sasl(format!(
                "no server implementation for {other}"
            ))),
        }
    }
}
