//! The endpoint: root of every connection, provider and service
//!
//! An [`Endpoint`] owns the connection providers (one per URI scheme), the
//! registered services, the live connections and the sharing cache. Its
//! close runs in two phases:
//!
//! 1. set the close flag, close every connection and registration;
//! 2. once the outstanding-resource count drains to zero, stop an owned
//!    worker pool and complete the close.
//!
//! Connections, providers and [`Endpoint::execute`] tasks each hold one
//! resource for their lifetime. Acquiring a resource fails with `NotOpen`
//! once the close flag is set.

mod builder;
pub mod global;
mod registration;

pub use builder::EndpointBuilder;
pub use global::UncloseableEndpoint;
pub use registration::{validate_service_name, OpenListener, Registration, MAX_SERVICE_NAME_LEN};

use crate::closeable::{close_async, CloseTracker, HandleableCloseable};
use crate::config::{ChannelOptions, ConnectionOptions, EndpointConfig};
use crate::connection::{
    Connection, ConnectionHandlerContext, ConnectionHandlerFactory, ConnectionParams,
    ConnectionPeerIdentity,
};
use crate::connection_info::{require, ConnectionInfo, ConnectionKey, Lookup, Sharing};
use crate::error::{RemotingError, Result};
use crate::future::{Cancellable, FutureResult, IoFuture, Status};
use crate::provider::{ConnectRequest, ConnectionProvider, ConnectionProviderContext, ConnectionProviderFactory};
use crate::sasl::{AuthenticationConfiguration, SaslClientFactory, SaslServerFactory};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use registration::ServiceEntry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};
use url::Url;

const CLOSE_FLAG: u32 = 1 << 31;

/// Root object of the remoting layer
pub struct Endpoint {
    name: String,
    this: Weak<Endpoint>,
    tracker: CloseTracker,
    config: EndpointConfig,
    executor: Handle,
    runtime: Mutex<Option<Runtime>>,
    resources: AtomicU32,
    security_domain: Arc<dyn SaslServerFactory>,
    client_factory: Arc<dyn SaslClientFactory>,
    providers: Mutex<HashMap<String, Arc<dyn ConnectionProvider>>>,
    services: Mutex<HashMap<String, ServiceEntry>>,
    registrations: Mutex<IndexMap<u64, Arc<Registration>>>,
    next_registration: AtomicU64,
    connection_infos: Mutex<HashMap<ConnectionKey, Arc<ConnectionInfo>>>,
    connections: Mutex<IndexMap<u64, Arc<Connection>>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("resources", &self.outstanding_resources())
            .field("closing", &self.is_closing())
            .finish()
    }
}

pub(crate) struct EndpointParts {
    pub name: String,
    pub config: EndpointConfig,
    pub executor: Handle,
    pub runtime: Option<Runtime>,
    pub security_domain: Arc<dyn SaslServerFactory>,
    pub client_factory: Arc<dyn SaslClientFactory>,
}

/// Holds one endpoint resource for the life of a spawned task
struct ResourceGuard(Weak<Endpoint>);

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Some(endpoint) = self.0.upgrade() {
            endpoint.resource_untick();
        }
    }
}

impl Endpoint {
    /// Start building an endpoint
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    pub(crate) fn from_parts(parts: EndpointParts) -> Arc<Self> {
        let EndpointParts {
            name,
            config,
            executor,
            runtime,
            security_domain,
            client_factory,
        } = parts;
        Arc::new_cyclic(|this| Self {
            tracker: CloseTracker::new(format!("endpoint {name}"), executor.clone()),
            name,
            this: this.clone(),
            config,
            executor,
            runtime: Mutex::new(runtime),
            resources: AtomicU32::new(0),
            security_domain,
            client_factory,
            providers: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            registrations: Mutex::new(IndexMap::new()),
            next_registration: AtomicU64::new(0),
            connection_infos: Mutex::new(HashMap::new()),
            connections: Mutex::new(IndexMap::new()),
        })
    }

    /// Endpoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the endpoint was built with
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Executor all endpoint work runs on
    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    /// Responder mechanisms for inbound identity negotiation
    pub fn security_domain(&self) -> Arc<dyn SaslServerFactory> {
        Arc::clone(&self.security_domain)
    }

    /// Initiator mechanisms for outbound identity negotiation
    pub fn sasl_client_factory(&self) -> Arc<dyn SaslClientFactory> {
        Arc::clone(&self.client_factory)
    }

    /// Outstanding resources, not counting the close flag
    pub fn outstanding_resources(&self) -> u32 {
        self.resources.load(Ordering::Acquire) & !CLOSE_FLAG
    }

    fn is_closing(&self) -> bool {
        self.resources.load(Ordering::Acquire) & CLOSE_FLAG != 0
    }

    fn resource_tick(&self) -> Result<()> {
        let mut current = self.resources.load(Ordering::Acquire);
        loop {
            if current & CLOSE_FLAG != 0 {
                return Err(RemotingError::not_open(format!("endpoint {} is closing", self.name)));
            }
            match self.resources.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn resource_untick(&self) {
        let previous = self.resources.fetch_sub(1, Ordering::AcqRel);
        if previous == CLOSE_FLAG | 1 {
            self.close_phase_two();
        }
    }

    fn close_phase_two(&self) {
        let runtime = self.runtime.lock().take();
        info!(endpoint = %self.name, "endpoint closed");
        self.tracker.close_complete(None);
        if let Some(runtime) = runtime {
            release_runtime(runtime);
        }
    }

    /// Run `task` on the endpoint executor, counted as an endpoint resource
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.resource_tick()?;
        let guard = ResourceGuard(self.this.clone());
        self.executor.spawn(async move {
            let _guard = guard;
            task.await;
        });
        Ok(())
    }

    fn add_registration(
        &self,
        kind: &'static str,
        name: &str,
        release: impl FnOnce() + Send + 'static,
    ) -> Arc<Registration> {
        let key = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let endpoint = self.this.clone();
        let registration = Registration::new(kind, name, self.executor.clone(), move || {
            release();
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.registrations.lock().shift_remove(&key);
            }
        });
        self.registrations
            .lock()
            .insert(key, Arc::clone(&registration));
        registration
    }

    /// Register `listener` for channels opened to `service_type`
    pub fn register_service(
        &self,
        service_type: &str,
        listener: Arc<dyn OpenListener>,
        options: Option<ChannelOptions>,
    ) -> Result<Arc<Registration>> {
        self.tracker.check_open()?;
        validate_service_name(service_type)?;
        if let Some(options) = &options {
            options.validate()?;
        }
        {
            let mut services = self.services.lock();
            if services.contains_key(service_type) {
                return Err(RemotingError::DuplicateRegistration {
                    name: service_type.to_string(),
                });
            }
            services.insert(service_type.to_string(), ServiceEntry { listener, options });
        }
        info!(endpoint = %self.name, service = service_type, "service registered");

        let endpoint = self.this.clone();
        let name = service_type.to_string();
        Ok(self.add_registration("service", service_type, move || {
            let Some(endpoint) = endpoint.upgrade() else {
                return;
            };
            let removed = endpoint.services.lock().remove(&name);
            if let Some(entry) = removed {
                entry.listener.registration_terminated();
            }
        }))
    }

    /// Listener registered for `service_type`
    pub fn service_listener(&self, service_type: &str) -> Option<Arc<dyn OpenListener>> {
        self.services
            .lock()
            .get(service_type)
            .map(|entry| Arc::clone(&entry.listener))
    }

    /// Channel options registered with `service_type`
    pub fn service_options(&self, service_type: &str) -> Option<ChannelOptions> {
        self.services
            .lock()
            .get(service_type)
            .and_then(|entry| entry.options.clone())
    }

    /// Install the provider built by `factory` for `scheme`
    pub fn add_connection_provider(
        &self,
        scheme: &str,
        factory: &dyn ConnectionProviderFactory,
    ) -> Result<Arc<Registration>> {
        let valid = scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid {
            return Err(RemotingError::configuration(format!(
                "invalid URI scheme \"{scheme}\""
            )));
        }
        let scheme = scheme.to_ascii_lowercase();
        self.resource_tick()?;
        let context = ConnectionProviderContext::new(self.this.clone(), &scheme, self.executor.clone());
        let provider = match factory.create_provider(context) {
            Ok(provider) => provider,
            Err(err) => {
                self.resource_untick();
                return Err(err);
            }
        };
        {
            let mut providers = self.providers.lock();
            if providers.contains_key(&scheme) {
                drop(providers);
                self.resource_untick();
                return Err(RemotingError::DuplicateRegistration { name: scheme });
            }
            providers.insert(scheme.clone(), Arc::clone(&provider));
        }
        info!(endpoint = %self.name, scheme = %scheme, "connection provider registered");

        let endpoint = self.this.clone();
        let key = scheme.clone();
        Ok(self.add_registration("provider", &scheme, move || {
            let Some(endpoint) = endpoint.upgrade() else {
                provider.close();
                return;
            };
            {
                let mut providers = endpoint.providers.lock();
                if providers
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &provider))
                {
                    providers.remove(&key);
                }
            }
            provider.close();
            endpoint.resource_untick();
        }))
    }

    /// Open a new, unshared connection authenticated as `config`
    pub fn connect(
        &self,
        destination: &Url,
        config: &AuthenticationConfiguration,
        options: Option<ConnectionOptions>,
    ) -> IoFuture<Arc<Connection>> {
        self.connect_unshared(destination, config, None, options)
    }

    pub(crate) fn connect_unshared(
        &self,
        destination: &Url,
        config: &AuthenticationConfiguration,
        ssl_context: Option<String>,
        options: Option<ConnectionOptions>,
    ) -> IoFuture<Arc<Connection>> {
        if let Err(err) = self.resource_tick() {
            return IoFuture::failed(err);
        }
        let scheme = destination.scheme().to_ascii_lowercase();
        let provider = self.providers.lock().get(&scheme).cloned();
        let Some(provider) = provider else {
            self.resource_untick();
            return IoFuture::failed(RemotingError::UnknownScheme { scheme });
        };
        let options = options.unwrap_or_else(|| self.config.connection.clone());
        let request = ConnectRequest {
            destination: destination.clone(),
            bind_address: options.bind_address,
            options,
            auth_config: config.clone(),
            ssl_context,
        };
        debug!(endpoint = %self.name, destination = %destination, principal = %config.principal(), "connecting");

        let handler = FutureResult::<Arc<dyn ConnectionHandlerFactory>>::new();
        let cancel = provider.connect(&request, handler.clone());
        let result = FutureResult::new();
        result.add_cancel_handler(move || cancel.cancel());

        let endpoint = self.this.clone();
        let producer = result.clone();
        handler.future().add_notifier(move |status| {
            let Some(endpoint) = endpoint.upgrade() else {
                producer.set_exception(RemotingError::not_open("endpoint is gone"));
                return;
            };
            match status {
                Status::Waiting => {}
                Status::Done(factory) => {
                    let connection = endpoint.create_connection(
                        factory.as_ref(),
                        ConnectionParams {
                            destination: Some(request.destination.clone()),
                            auth_config: Some(request.auth_config.clone()),
                            sasl_server_factory: Some(endpoint.security_domain()),
                            sasl_client_factory: endpoint.sasl_client_factory(),
                            config: endpoint.config.clone(),
                        },
                    );
                    if !producer.set_result(Arc::clone(&connection)) {
                        close_async(connection);
                    }
                }
                Status::Failed(err) => {
                    endpoint.resource_untick();
                    producer.set_exception(err.clone());
                }
                Status::Cancelled => {
                    endpoint.resource_untick();
                    producer.set_cancelled();
                }
            }
        });
        result.future()
    }

    /// Register an inbound connection built by `factory`
    pub(crate) fn accept_connection(&self, factory: &dyn ConnectionHandlerFactory) -> Result<Arc<Connection>> {
        self.resource_tick()?;
        Ok(self.create_connection(
            factory,
            ConnectionParams {
                destination: None,
                auth_config: None,
                sasl_server_factory: Some(self.security_domain()),
                sasl_client_factory: self.sasl_client_factory(),
                config: self.config.clone(),
            },
        ))
    }

    /// Wrap a new handler in a connection. The caller holds a resource for it.
    fn create_connection(&self, factory: &dyn ConnectionHandlerFactory, params: ConnectionParams) -> Arc<Connection> {
        let context = ConnectionHandlerContext::new(self.this.clone(), self.executor.clone());
        let connection = Connection::new(factory, context, params);
        let serial = connection.serial();
        self.connections
            .lock()
            .insert(serial, Arc::clone(&connection));
        let endpoint = self.this.clone();
        connection.close_tracker().add_close_handler(move |_| {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.connections.lock().shift_remove(&serial);
                endpoint.resource_untick();
            }
        });
        if self.is_closing() {
            close_async(Arc::clone(&connection));
        }
        connection
    }

    /// Snapshot of the live connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    fn connection_info(&self, destination: &Url, ssl_context: Option<&str>) -> Arc<ConnectionInfo> {
        let key = ConnectionKey::new(destination, ssl_context);
        Arc::clone(
            self.connection_infos
                .lock()
                .entry(key.clone())
                .or_insert_with(|| ConnectionInfo::new(key, destination.clone(), self.this.clone())),
        )
    }

    /// Sharing cache entry for a destination, if one exists
    pub fn connection_info_for(&self, destination: &Url, ssl_context: Option<&str>) -> Option<Arc<ConnectionInfo>> {
        let key = ConnectionKey::new(destination, ssl_context);
        self.connection_infos.lock().get(&key).cloned()
    }

    /// Sharing state for a destination; `None` when nothing is cached
    pub fn sharing(&self, destination: &Url, ssl_context: Option<&str>) -> Sharing {
        self.connection_info_for(destination, ssl_context)
            .map_or(Sharing::None, |info| info.sharing())
    }

    /// Number of destinations with a live sharing cache entry
    pub fn cached_destinations(&self) -> usize {
        self.connection_infos.lock().len()
    }

    /// Drop `info` from the table if it is still the entry for its key and idle
    pub(crate) fn retire_connection_info(&self, info: &Arc<ConnectionInfo>) {
        let mut infos = self.connection_infos.lock();
        let current = infos.get(info.key()).is_some_and(|cached| Arc::ptr_eq(cached, info));
        if current && info.retire() {
            infos.remove(info.key());
        }
    }

    /// Connection future for `config` through the sharing cache, looking the
    /// entry up again whenever the one found was retired concurrently
    pub(crate) fn connection_future(
        &self,
        destination: &Url,
        ssl_context: Option<&str>,
        config: &AuthenticationConfiguration,
        do_connect: bool,
    ) -> Option<IoFuture<Arc<Connection>>> {
        loop {
            let info = if do_connect {
                self.connection_info(destination, ssl_context)
            } else {
                self.connection_info_for(destination, ssl_context)?
            };
            match info.get_connection(config, do_connect) {
                Lookup::Found(future) => return Some(future),
                Lookup::Absent => return None,
                Lookup::Retired => continue,
            }
        }
    }

    /// Identity for `config` at `destination`, connecting or sharing a
    /// connection as the sharing cache decides
    pub fn get_connected_identity(
        &self,
        destination: &Url,
        ssl_context: Option<&str>,
        config: &AuthenticationConfiguration,
    ) -> IoFuture<ConnectionPeerIdentity> {
        if let Err(err) = self.tracker.check_open() {
            return IoFuture::failed(err);
        }
        match require(self.connection_future(destination, ssl_context, config, true)) {
            Ok(connection) => identity_over(connection, config.clone()),
            Err(err) => IoFuture::failed(err),
        }
    }

    /// Like [`get_connected_identity`](Self::get_connected_identity), but
    /// never starts a connection; `None` if nothing exists for `config`
    pub fn get_connected_identity_if_connected(
        &self,
        destination: &Url,
        ssl_context: Option<&str>,
        config: &AuthenticationConfiguration,
    ) -> Option<IoFuture<ConnectionPeerIdentity>> {
        self.connection_future(destination, ssl_context, config, false)
            .map(|connection| identity_over(connection, config.clone()))
    }
}

fn identity_over(
    connection: IoFuture<Arc<Connection>>,
    config: AuthenticationConfiguration,
) -> IoFuture<ConnectionPeerIdentity> {
    let result = FutureResult::new();
    let producer = result.clone();
    connection.add_notifier(move |status| match status {
        Status::Waiting => {}
        Status::Done(connection) => {
            if producer.is_cancel_requested() {
                producer.set_cancelled();
                return;
            }
            // Other callers may share the negotiation; cancelling this
            // identity does not abort it.
            producer.follow(&connection.peer_identity_context().authenticate_async(&config));
        }
        Status::Failed(err) => {
            producer.set_exception(err.clone());
        }
        Status::Cancelled => {
            producer.set_cancelled();
        }
    });
    let canceller = result.clone();
    result.add_cancel_handler(move || {
        canceller.set_cancelled();
        connection.cancel();
    });
    result.future()
}

#[async_trait]
impl HandleableCloseable for Endpoint {
    fn close_tracker(&self) -> &CloseTracker {
        &self.tracker
    }

    async fn close_action(&self) -> Result<()> {
        let previous = self.resources.fetch_or(CLOSE_FLAG, Ordering::AcqRel);
        info!(endpoint = %self.name, resources = previous & !CLOSE_FLAG, "closing endpoint");
        for connection in self.connections() {
            close_async(connection);
        }
        let registrations: Vec<_> = self
            .registrations
            .lock()
            .drain(..)
            .map(|(_, registration)| registration)
            .collect();
        for registration in registrations {
            registration.close().await;
        }
        if previous & !CLOSE_FLAG == 0 {
            self.close_phase_two();
        }
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            release_runtime(runtime);
        }
    }
}

/// Shut an owned pool down off its own worker threads, where dropping it is
/// not allowed.
fn release_runtime(runtime: Runtime) {
    if Handle::try_current().is_ok() {
        std::thread::spawn(move || runtime.shutdown_background());
    } else {
        runtime.shutdown_background();
    }
}
