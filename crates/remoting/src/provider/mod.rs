//! Connection providers
//!
//! A provider owns one URI scheme. The endpoint hands it a [`ConnectRequest`]
//! and a result sink; the provider eventually completes the sink exactly once
//! with a [`ConnectionHandlerFactory`], an error, or a cancellation. Inbound
//! connections are handed back to the endpoint through
//! [`ConnectionProviderContext::accept`].

pub mod local;

pub use local::{LocalConnectionProvider, LocalConnectionProviderFactory, LOCAL_SCHEME};

use crate::config::ConnectionOptions;
use crate::connection::{Connection, ConnectionHandlerFactory};
use crate::endpoint::Endpoint;
use crate::error::{RemotingError, Result};
use crate::future::{CancelHandle, FutureResult};
use crate::sasl::{AuthenticationConfiguration, SaslClientFactory, SaslServerFactory};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use url::Url;

/// Everything a provider needs to establish one outbound connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Destination URI; its scheme selected the provider
    pub destination: Url,
    /// Local address to bind, if any
    pub bind_address: Option<SocketAddr>,
    /// Connection options
    pub options: ConnectionOptions,
    /// Credential for the connection identity
    pub auth_config: AuthenticationConfiguration,
    /// Named TLS context, for providers that use TLS
    pub ssl_context: Option<String>,
}

/// Transport for one URI scheme
pub trait ConnectionProvider: Send + Sync {
    /// Start connecting. Must complete `result` exactly once; the returned
    /// handle cancels the attempt.
    fn connect(
        &self,
        request: &ConnectRequest,
        result: FutureResult<Arc<dyn ConnectionHandlerFactory>>,
    ) -> CancelHandle;

    /// Release provider resources. Called once when the provider is
    /// deregistered or the endpoint closes.
    fn close(&self) {}
}

/// Creates a provider instance for one endpoint
pub trait ConnectionProviderFactory: Send + Sync {
    /// Build the provider bound to `context`
    fn create_provider(&self, context: ConnectionProviderContext) -> Result<Arc<dyn ConnectionProvider>>;
}

/// Endpoint services available to a provider
#[derive(Clone)]
pub struct ConnectionProviderContext {
    endpoint: Weak<Endpoint>,
    scheme: String,
    executor: Handle,
}

impl fmt::Debug for ConnectionProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProviderContext")
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl ConnectionProviderContext {
    pub(crate) fn new(endpoint: Weak<Endpoint>, scheme: impl Into<String>, executor: Handle) -> Self {
        Self {
            endpoint,
            scheme: scheme.into(),
            executor,
        }
    }

    /// Scheme this provider serves
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Endpoint executor
    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    /// The owning endpoint while alive
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.upgrade()
    }

    fn live_endpoint(&self) -> Result<Arc<Endpoint>> {
        self.endpoint()
            .ok_or_else(|| RemotingError::not_open("endpoint is gone"))
    }

    /// Responder mechanisms of the endpoint
    pub fn security_domain(&self) -> Result<Arc<dyn SaslServerFactory>> {
        Ok(self.live_endpoint()?.security_domain())
    }

    /// Initiator mechanisms of the endpoint
    pub fn sasl_client_factory(&self) -> Result<Arc<dyn SaslClientFactory>> {
        Ok(self.live_endpoint()?.sasl_client_factory())
    }

    /// Register an inbound connection with the endpoint
    pub fn accept(&self, factory: &dyn ConnectionHandlerFactory) -> Result<Arc<Connection>> {
        self.live_endpoint()?.accept_connection(factory)
    }
}
