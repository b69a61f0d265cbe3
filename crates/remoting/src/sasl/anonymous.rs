//! `ANONYMOUS` mechanism (RFC 4505)

use super::{Principal, SaslClient, SaslServer};
use crate::error::{RemotingError, Result};

/// Mechanism name
pub const ANONYMOUS: &str = "ANONYMOUS";

const MAX_TRACE_LEN: usize = 255;

/// Client side: sends an empty trace token
#[derive(Debug, Default)]
pub struct AnonymousSaslClient {
    complete: bool,
}

impl AnonymousSaslClient {
    /// New client
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaslClient for AnonymousSaslClient {
    fn mechanism_name(&self) -> &str {
        ANONYMOUS
    }

    fn has_initial_response(&self) -> bool {
        true
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>> {
        self.complete = true;
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Server side: accepts any trace token up to 255 characters
#[derive(Debug, Default)]
pub struct AnonymousSaslServer {
    complete: bool,
}

impl AnonymousSaslServer {
    /// New server
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaslServer for AnonymousSaslServer {
    fn mechanism_name(&self) -> &str {
        ANONYMOUS
    }

    fn evaluate_response(&mut self, response: &[u8]) -> Result<Vec<u8>> {
        if self.complete {
            return Err(RemotingError::sasl("ANONYMOUS exchange already complete"));
        }
        if response.len() > MAX_TRACE_LEN {
            return Err(RemotingError::sasl("ANONYMOUS trace token too long"));
        }
        self.complete = true;
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn authorized_principal(&self) -> Option<Principal> {
        self.complete.then_some(Principal::Anonymous)
    }
}
