//! Process-wide default endpoint
//!
//! The host application may [`install_default`] its own endpoint at startup.
//! Otherwise [`default_endpoint`] builds one on first use from the TOML file
//! named by `REMOTING_CONFIG`, or from defaults, exactly once.

use super::{Endpoint, OpenListener, Registration};
use crate::closeable::HandleableCloseable;
use crate::config::{ChannelOptions, ConnectionOptions, EndpointConfig};
use crate::connection::{Connection, ConnectionPeerIdentity};
use crate::error::{RemotingError, Result};
use crate::future::IoFuture;
use crate::provider::ConnectionProviderFactory;
use crate::sasl::AuthenticationConfiguration;
use once_cell::sync::OnceCell;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

/// Environment variable naming the default endpoint's TOML configuration
pub const CONFIG_ENV: &str = "REMOTING_CONFIG";

static DEFAULT: OnceCell<UncloseableEndpoint> = OnceCell::new();

/// Endpoint handle whose close does nothing. Everything else forwards to
/// the wrapped endpoint.
#[derive(Debug, Clone)]
pub struct UncloseableEndpoint {
    inner: Arc<Endpoint>,
}

impl UncloseableEndpoint {
    /// Wrap `endpoint`
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self { inner: endpoint }
    }

    /// Endpoint name
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Whether the wrapped endpoint is open
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// See [`Endpoint::connect`]
    pub fn connect(
        &self,
        destination: &Url,
        config: &AuthenticationConfiguration,
        options: Option<ConnectionOptions>,
    ) -> IoFuture<Arc<Connection>> {
        self.inner.connect(destination, config, options)
    }

    /// See [`Endpoint::get_connected_identity`]
    pub fn get_connected_identity(
        &self,
        destination: &Url,
        ssl_context: Option<&str>,
        config: &AuthenticationConfiguration,
    ) -> IoFuture<ConnectionPeerIdentity> {
        self.inner.get_connected_identity(destination, ssl_context, config)
    }

    /// See [`Endpoint::get_connected_identity_if_connected`]
    pub fn get_connected_identity_if_connected(
        &self,
        destination: &Url,
        ssl_context: Option<&str>,
        config: &AuthenticationConfiguration,
    ) -> Option<IoFuture<ConnectionPeerIdentity>> {
        self.inner
            .get_connected_identity_if_connected(destination, ssl_context, config)
    }

    /// See [`Endpoint::register_service`]
    pub fn register_service(
        &self,
        service_type: &str,
        listener: Arc<dyn OpenListener>,
        options: Option<ChannelOptions>,
    ) -> Result<Arc<Registration>> {
        self.inner.register_service(service_type, listener, options)
    }

    /// See [`Endpoint::add_connection_provider`]
    pub fn add_connection_provider(
        &self,
        scheme: &str,
        factory: &dyn ConnectionProviderFactory,
    ) -> Result<Arc<Registration>> {
        self.inner.add_connection_provider(scheme, factory)
    }

    /// See [`Endpoint::execute`]
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.execute(task)
    }

    /// See [`Endpoint::connections`]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.connections()
    }

    /// Ignored: the process default endpoint lives as long as the process
    pub async fn close(&self) {
        debug!(endpoint = %self.inner.name(), "ignoring close of uncloseable endpoint");
    }
}

/// Install `endpoint` as the process default.
///
/// Fails with `IllegalState` if a default was already installed or built.
pub fn install_default(endpoint: Arc<Endpoint>) -> Result<&'static UncloseableEndpoint> {
    let name = endpoint.name().to_string();
    DEFAULT
        .set(UncloseableEndpoint::new(endpoint))
        .map_err(|_| RemotingError::illegal_state("a default endpoint is already installed"))?;
    info!(endpoint = %name, "default endpoint installed");
    DEFAULT
        .get()
        .ok_or_else(|| RemotingError::illegal_state("default endpoint vanished"))
}

/// The process default endpoint, built on first use
pub fn default_endpoint() -> Result<&'static UncloseableEndpoint> {
    DEFAULT.get_or_try_init(|| {
        let config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => EndpointConfig::load_from_file(Path::new(&path))?,
            None => EndpointConfig::default(),
        };
        build_default(config)
    })
}

fn build_default(mut config: EndpointConfig) -> Result<UncloseableEndpoint> {
    // First use may happen outside any runtime, so the default owns its pool.
    if config.worker_threads == 0 {
        config.worker_threads = 1;
    }
    let endpoint = Endpoint::builder().config(config).build()?;
    info!(endpoint = %endpoint.name(), "default endpoint built");
    Ok(UncloseableEndpoint::new(endpoint))
}
