//! Endpoint construction

use super::{Endpoint, EndpointParts};
use crate::config::EndpointConfig;
use crate::error::{RemotingError, Result};
use crate::provider::{ConnectionProviderFactory, LocalConnectionProviderFactory, LOCAL_SCHEME};
use crate::sasl::{DefaultSaslClientFactory, SaslClientFactory, SaslServerFactory, SimpleSecurityDomain};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::{Handle, Runtime};
use tracing::info;
use uuid::Uuid;

/// Builder for [`Endpoint`]
pub struct EndpointBuilder {
    endpoint_name: Option<String>,
    config: EndpointConfig,
    runtime_handle: Option<Handle>,
    security_domain: Option<Arc<dyn SaslServerFactory>>,
    sasl_client_factory: Option<Arc<dyn SaslClientFactory>>,
    providers: Vec<(String, Arc<dyn ConnectionProviderFactory>)>,
    local_provider: bool,
}

impl fmt::Debug for EndpointBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointBuilder")
            .field("endpoint_name", &self.endpoint_name)
            .field("config", &self.config)
            .field(
                "providers",
                &self.providers.iter().map(|(scheme, _)| scheme).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    /// Builder with default configuration and the `local` provider
    pub fn new() -> Self {
        Self {
            endpoint_name: None,
            config: EndpointConfig::default(),
            runtime_handle: None,
            security_domain: None,
            sasl_client_factory: None,
            providers: Vec::new(),
            local_provider: true,
        }
    }

    /// Name reported to peers; overrides the configured name
    pub fn endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.endpoint_name = Some(name.into());
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Run on a dedicated pool of `threads` workers
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Run on an existing runtime; takes precedence over `worker_threads`
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime_handle = Some(handle);
        self
    }

    /// Responder mechanisms; defaults to an empty [`SimpleSecurityDomain`]
    pub fn security_domain(mut self, domain: impl SaslServerFactory + 'static) -> Self {
        self.security_domain = Some(Arc::new(domain));
        self
    }

    /// Initiator mechanisms; defaults to [`DefaultSaslClientFactory`]
    pub fn sasl_client_factory(mut self, factory: impl SaslClientFactory + 'static) -> Self {
        self.sasl_client_factory = Some(Arc::new(factory));
        self
    }

    /// Install a provider for `scheme` when the endpoint is built
    pub fn add_provider(mut self, scheme: impl Into<String>, factory: impl ConnectionProviderFactory + 'static) -> Self {
        self.providers.push((scheme.into(), Arc::new(factory)));
        self
    }

    /// Do not install the built-in `local` provider
    pub fn without_local_provider(mut self) -> Self {
        self.local_provider = false;
        self
    }

    /// Build the endpoint.
    ///
    /// Fails with `Configuration` if the configuration is invalid or no
    /// runtime is available, and with the provider's error if one cannot be
    /// installed.
    pub fn build(self) -> Result<Arc<Endpoint>> {
        let mut config = self.config;
        if let Some(name) = self.endpoint_name {
            config.endpoint_name = Some(name);
        }
        config.validate()?;
        let name = config
            .endpoint_name
            .clone()
            .unwrap_or_else(|| format!("endpoint-{}", Uuid::new_v4().simple()));

        let (runtime, executor) = match self.runtime_handle {
            Some(handle) => (None, handle),
            None if config.worker_threads > 0 => {
                let runtime = worker_pool(&name, config.worker_threads)?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
            None => {
                let handle = Handle::try_current().map_err(|_| {
                    RemotingError::configuration(
                        "no Tokio runtime is running; set worker_threads or runtime_handle",
                    )
                })?;
                (None, handle)
            }
        };

        let endpoint = Endpoint::from_parts(EndpointParts {
            name,
            config,
            executor,
            runtime,
            security_domain: self
                .security_domain
                .unwrap_or_else(|| Arc::new(SimpleSecurityDomain::new())),
            client_factory: self
                .sasl_client_factory
                .unwrap_or_else(|| Arc::new(DefaultSaslClientFactory)),
        });

        let explicit_local = self
            .providers
            .iter()
            .any(|(scheme, _)| scheme.eq_ignore_ascii_case(LOCAL_SCHEME));
        if self.local_provider && !explicit_local {
            endpoint.add_connection_provider(LOCAL_SCHEME, &LocalConnectionProviderFactory)?;
        }
        for (scheme, factory) in &self.providers {
            endpoint.add_connection_provider(scheme, factory.as_ref())?;
        }
        info!(
            endpoint = %endpoint.name(),
            workers = endpoint.config().worker_threads,
            "endpoint started"
        );
        Ok(endpoint)
    }
}

fn worker_pool(name: &str, threads: usize) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name(format!("{name}-worker"))
        .enable_time()
        .build()
        .map_err(|e| RemotingError::configuration(format!("failed to start worker pool: {e}")))
}
