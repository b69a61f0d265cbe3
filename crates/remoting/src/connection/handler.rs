//! Transport seam
//!
//! A connection provider produces a [`ConnectionHandlerFactory`]; the endpoint
//! turns it into a [`ConnectionHandler`] bound to a fresh
//! [`ConnectionHandlerContext`] and wraps the handler in a
//! [`Connection`](super::Connection). The handler sends frames, the context
//! routes inbound frames back into the connection.

use super::Connection;
use crate::channel::Channel;
use crate::closeable::close_async;
use crate::config::ChannelOptions;
use crate::endpoint::{Endpoint, OpenListener};
use crate::error::Result;
use crate::future::{CancelHandle, FutureResult};
use crate::sasl::Principal;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

/// Transport half of a connection
pub trait ConnectionHandler: Send + Sync {
    /// Open a channel to `service_type` as the identity `identity_id`,
    /// completing `result`
    fn open(
        &self,
        service_type: &str,
        identity_id: u32,
        result: FutureResult<Arc<dyn Channel>>,
        options: &ChannelOptions,
    ) -> CancelHandle;

    /// Mechanisms the peer offers for identity switching
    fn offered_mechanisms(&self) -> Vec<String>;

    /// Whether several identities may be negotiated over this connection
    fn supports_remote_auth(&self) -> bool;

    /// Principal established when the connection was made
    fn connection_principal(&self) -> Principal;

    /// Name the peer endpoint reported
    fn remote_endpoint_name(&self) -> Option<String> {
        None
    }

    /// TLS session identifier, for transports that use TLS
    fn ssl_session_id(&self) -> Option<String> {
        None
    }

    /// Start an identity negotiation
    fn send_auth_request(&self, id: u32, mechanism: &str, initial_response: Option<&[u8]>)
        -> Result<()>;

    /// Continue a negotiation from the initiator side
    fn send_auth_response(&self, id: u32, response: &[u8]) -> Result<()>;

    /// Continue a negotiation from the responder side
    fn send_auth_challenge(&self, id: u32, challenge: &[u8]) -> Result<()>;

    /// Finish a negotiation successfully
    fn send_auth_success(&self, id: u32, challenge: Option<&[u8]>) -> Result<()>;

    /// Reject the current mechanism of a negotiation
    fn send_auth_reject(&self, id: u32) -> Result<()>;

    /// Abandon a negotiation or release an identity
    fn send_auth_delete(&self, id: u32) -> Result<()>;

    /// Acknowledge a delete
    fn send_auth_delete_ack(&self, id: u32) -> Result<()>;

    /// Close the transport without waiting
    fn close(&self);
}

/// Builds the handler for a newly established transport
pub trait ConnectionHandlerFactory: Send + Sync {
    /// Create the handler, bound to `context`
    fn create_handler(&self, context: Arc<ConnectionHandlerContext>) -> Arc<dyn ConnectionHandler>;
}

/// What a handler may reach on its endpoint and connection
pub struct ConnectionHandlerContext {
    endpoint: Weak<Endpoint>,
    executor: Handle,
    connection: OnceCell<Weak<Connection>>,
}

impl fmt::Debug for ConnectionHandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandlerContext")
            .field("bound", &self.connection.get().is_some())
            .finish()
    }
}

impl ConnectionHandlerContext {
    pub(crate) fn new(endpoint: Weak<Endpoint>, executor: Handle) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            executor,
            connection: OnceCell::new(),
        })
    }

    pub(crate) fn bind(&self, connection: &Arc<Connection>) {
        let _ = self.connection.set(Arc::downgrade(connection));
    }

    /// The connection this handler serves, once constructed and while alive
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.get().and_then(Weak::upgrade)
    }

    /// The owning endpoint while alive
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.upgrade()
    }

    /// Executor for handler work
    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    /// Look up a registered service on the owning endpoint
    pub fn service(&self, service_type: &str) -> Option<Arc<dyn OpenListener>> {
        self.endpoint()
            .and_then(|endpoint| endpoint.service_listener(service_type))
    }

    /// Report that the transport closed underneath the connection
    pub fn remote_connection_closed(&self) {
        if let Some(connection) = self.connection() {
            close_async(connection);
        }
    }
}
