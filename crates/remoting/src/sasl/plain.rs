//! `PLAIN` mechanism (RFC 4616)

use super::{Principal, SaslClient, SaslServer};
use crate::error::{RemotingError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Mechanism name
pub const PLAIN: &str = "PLAIN";

/// Client side: sends `authzid NUL authcid NUL passwd` as its initial response
pub struct PlainSaslClient {
    message: Vec<u8>,
    complete: bool,
}

impl PlainSaslClient {
    /// Client for `username` with `password`
    pub fn new(username: &str, password: &str) -> Self {
        let mut message = Vec::with_capacity(username.len() + password.len() + 2);
        message.push(0);
        message.extend_from_slice(username.as_bytes());
        message.push(0);
        message.extend_from_slice(password.as_bytes());
        Self {
            message,
            complete: false,
        }
    }
}

impl SaslClient for PlainSaslClient {
    fn mechanism_name(&self) -> &str {
        PLAIN
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        if self.complete {
            return Ok(Vec::new());
        }
        self.complete = true;
        Ok(std::mem::take(&mut self.message))
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn dispose(&mut self) -> Result<()> {
        self.message.fill(0);
        self.message.clear();
        Ok(())
    }
}

/// Server side: verifies the password against a user table
pub struct PlainSaslServer {
    users: Arc<HashMap<String, String>>,
    principal: Option<Principal>,
}

impl PlainSaslServer {
    /// Server checking against `users` (name → password)
    pub fn new(users: Arc<HashMap<String, String>>) -> Self {
        Self {
            users,
            principal: None,
        }
    }
}

impl SaslServer for PlainSaslServer {
    fn mechanism_name(&self) -> &str {
        PLAIN
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        if self.principal.is_some() {
            return Err(RemotingError::sasl("PLAIN exchange already complete"));
        }
        // No initial response: ask for one with an empty challenge.
        if response.is_empty() {
            return Ok(Vec::new());
        }
        let mut parts = response.split(|b| *b == 0);
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(RemotingError::sasl("malformed PLAIN response"));
        };
        let authcid = std::str::from_utf8(authcid)
            .map_err(|_| RemotingError::sasl("PLAIN user name is not UTF-8"))?;
        let authzid = std::str::from_utf8(authzid)
            .map_err(|_| RemotingError::sasl("PLAIN authorization name is not UTF-8"))?;
        if !authzid.is_empty() && authzid != authcid {
            return Err(RemotingError::sasl(format!(
                "{authcid} may not act as {authzid}"
            )));
        }
        match self.users.get(authcid) {
            Some(expected) if expected.as_bytes() == password => {
                self.principal = Some(Principal::Named(authcid.to_string()));
                Ok(Vec::new())
            }
            _ => Err(RemotingError::sasl(format!(
                "invalid credentials for {authcid}"
            ))),
        }
    }

    fn is_complete(&self) -> bool {
        self.principal.is_some()
    }

    fn authorized_principal(&self) -> Option<Principal> {
        self.principal.clone()
    }
}
