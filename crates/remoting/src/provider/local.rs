//! In-process connection provider (`local:` URIs)
//!
//! Connecting runs the connection-identity SASL exchange directly against the
//! endpoint's security domain, then creates two linked handlers: the client
//! half becomes the outbound [`Connection`], the server half is accepted by
//! the same endpoint. Auth frames cross the link by calling straight into the
//! peer connection, which queues them on its serial task. Channel opens look
//! the service up on the peer side and hand it one end of a [`LocalChannel`]
//! pair.

use super::{ConnectRequest, ConnectionProvider, ConnectionProviderContext, ConnectionProviderFactory};
use crate::channel::{Channel, LocalChannel};
use crate::closeable::{close_async, HandleableCloseable};
use crate::config::ChannelOptions;
use crate::connection::{Connection, ConnectionHandler, ConnectionHandlerContext, ConnectionHandlerFactory};
use crate::error::{AuthFailureKind, RemotingError, Result};
use crate::future::{CancelHandle, FutureResult};
use crate::sasl::{
    dispose_client, dispose_server, AuthenticationConfiguration, Principal, SaslClient,
    SaslClientFactory, SaslServer, SaslServerFactory,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// URI scheme served by [`LocalConnectionProvider`]
pub const LOCAL_SCHEME: &str = "local";

const MAX_EXCHANGE_ROUNDS: usize = 16;

/// Factory registered for the `local` scheme by default
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalConnectionProviderFactory;

impl ConnectionProviderFactory for LocalConnectionProviderFactory {
    fn create_provider(&self, context: ConnectionProviderContext) -> Result<Arc<dyn ConnectionProvider>> {
        Ok(Arc::new(LocalConnectionProvider { context }))
    }
}

/// Connects an endpoint to itself
#[derive(Debug)]
pub struct LocalConnectionProvider {
    context: ConnectionProviderContext,
}

impl ConnectionProvider for LocalConnectionProvider {
    fn connect(
        &self,
        request: &ConnectRequest,
        result: FutureResult<Arc<dyn ConnectionHandlerFactory>>,
    ) -> CancelHandle {
        let context = self.context.clone();
        let request = request.clone();
        let producer = result.clone();
        let task = self.context.executor().spawn(async move {
            match establish(&context, &request) {
                Ok((factory, server)) => {
                    if !producer.set_result(factory) {
                        // Nobody will build the client half.
                        close_async(server);
                    }
                }
                Err(err) => {
                    debug!(destination = %request.destination, error = %err, "local connect failed");
                    producer.set_exception(err);
                }
            }
        });
        CancelHandle::new(move || {
            task.abort();
            result.set_cancelled();
        })
    }
}

fn establish(
    context: &ConnectionProviderContext,
    request: &ConnectRequest,
) -> Result<(Arc<dyn ConnectionHandlerFactory>, Arc<Connection>)> {
    let domain = context.security_domain()?;
    let clients = context.sasl_client_factory()?;
    let principal = handshake(domain.as_ref(), clients.as_ref(), &request.auth_config)?;
    debug!(destination = %request.destination, %principal, "local connection authenticated");

    let settings = Arc::new(LinkSettings {
        principal,
        remote_auth: request.options.remote_auth,
        mechanisms: domain.mechanism_names(),
        max_outbound_channels: request.options.max_outbound_channels,
        endpoint_name: context.endpoint().map(|endpoint| endpoint.name().to_string()),
    });
    let link = Arc::new(LocalLink::default());
    let server = context.accept(&LocalHandlerFactory {
        role: Role::Server,
        link: Arc::clone(&link),
        settings: Arc::clone(&settings),
    })?;
    let client: Arc<dyn ConnectionHandlerFactory> = Arc::new(LocalHandlerFactory {
        role: Role::Client,
        link,
        settings,
    });
    Ok((client, server))
}

/// Run the connection-identity exchange in memory, trying the domain's
/// mechanisms in order
pub(crate) fn handshake(
    domain: &dyn SaslServerFactory,
    clients: &dyn SaslClientFactory,
    config: &AuthenticationConfiguration,
) -> Result<Principal> {
    let mut failures = Vec::new();
    for mechanism in domain.mechanism_names() {
        if !config.mechanism_allowed(&mechanism) {
            continue;
        }
        let client = match clients.create_sasl_client(&mechanism, config) {
            Ok(Some(client)) => client,
            Ok(None) => continue,
            Err(err) => {
                failures.push((mechanism, err));
                continue;
            }
        };
        match exchange(domain, &mechanism, client) {
            Ok(principal) => return Ok(principal),
            Err(err) => failures.push((mechanism, err)),
        }
    }
    if failures.is_empty() {
        return Err(RemotingError::authentication_failed(
            AuthFailureKind::NoSaslClient,
            format!("no mechanism available for {}", config.principal()),
        ));
    }
    Err(RemotingError::mechanisms_exhausted(
        failures.iter().map(|(mechanism, err)| (mechanism.as_str(), err)),
    ))
}

fn exchange(domain: &dyn SaslServerFactory, mechanism: &str, mut client: Box<dyn SaslClient>) -> Result<Principal> {
    let mut server = match domain.create_sasl_server(mechanism) {
        Ok(server) => server,
        Err(err) => {
            dispose_client(client.as_mut());
            return Err(err);
        }
    };
    let outcome = run_exchange(server.as_mut(), client.as_mut());
    dispose_server(server.as_mut());
    dispose_client(client.as_mut());
    outcome
}

fn run_exchange(server: &mut dyn SaslServer, client: &mut dyn SaslClient) -> Result<Principal> {
    let mut response = if client.has_initial_response() {
        client.evaluate_challenge(&[])?
    } else {
        Vec::new()
    };
    for _ in 0..MAX_EXCHANGE_ROUNDS {
        let challenge = server.evaluate_response(&response)?;
        if server.is_complete() {
            if !client.is_complete() && !client.evaluate_challenge(&challenge)?.is_empty() {
                return Err(RemotingError::authentication_failed(
                    AuthFailureKind::ExtraResponse,
                    format!("{} produced a response after the server finished", client.mechanism_name()),
                ));
            }
            return server
                .authorized_principal()
                .ok_or_else(|| RemotingError::sasl("mechanism completed without a principal"));
        }
        response = client.evaluate_challenge(&challenge)?;
    }
    Err(RemotingError::sasl(format!(
        "{} did not complete",
        server.mechanism_name()
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

impl Role {
    fn other(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

#[derive(Debug)]
struct LinkSettings {
    principal: Principal,
    remote_auth: bool,
    mechanisms: Vec<String>,
    max_outbound_channels: u32,
    endpoint_name: Option<String>,
}

/// The two handler contexts of one local connection
#[derive(Debug, Default)]
struct LocalLink {
    client: OnceCell<Arc<ConnectionHandlerContext>>,
    server: OnceCell<Arc<ConnectionHandlerContext>>,
}

impl LocalLink {
    fn cell(&self, role: Role) -> &OnceCell<Arc<ConnectionHandlerContext>> {
        match role {
            Role::Client => &self.client,
            Role::Server => &self.server,
        }
    }

    fn context(&self, role: Role) -> Option<&Arc<ConnectionHandlerContext>> {
        self.cell(role).get()
    }
}

struct LocalHandlerFactory {
    role: Role,
    link: Arc<LocalLink>,
    settings: Arc<LinkSettings>,
}

impl ConnectionHandlerFactory for LocalHandlerFactory {
    fn create_handler(&self, context: Arc<ConnectionHandlerContext>) -> Arc<dyn ConnectionHandler> {
        let _ = self.link.cell(self.role).set(Arc::clone(&context));
        Arc::new(LocalConnectionHandler {
            role: self.role,
            link: Arc::clone(&self.link),
            settings: Arc::clone(&self.settings),
            context,
            closed: AtomicBool::new(false),
            outbound: Arc::new(AtomicU32::new(0)),
            channels: Mutex::new(Vec::new()),
        })
    }
}

struct LocalConnectionHandler {
    role: Role,
    link: Arc<LocalLink>,
    settings: Arc<LinkSettings>,
    context: Arc<ConnectionHandlerContext>,
    closed: AtomicBool,
    outbound: Arc<AtomicU32>,
    channels: Mutex<Vec<Weak<LocalChannel>>>,
}

impl LocalConnectionHandler {
    fn peer(&self) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemotingError::not_open("local connection closed"));
        }
        self.link
            .context(self.role.other())
            .and_then(|context| context.connection())
            .ok_or_else(|| RemotingError::not_open("peer connection is gone"))
    }

    fn open_channel(
        &self,
        service_type: &str,
        identity_id: u32,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn Channel>> {
        let peer = self.peer()?;
        let listener = peer
            .handler_context()
            .service(service_type)
            .ok_or_else(|| RemotingError::ServiceNotFound {
                service: service_type.to_string(),
            })?;
        let principal = peer.authorized_principal(identity_id).ok_or_else(|| {
            RemotingError::protocol(format!("unknown identity {identity_id}"))
        })?;

        let open = self.outbound.fetch_add(1, Ordering::AcqRel);
        if open >= self.settings.max_outbound_channels {
            self.outbound.fetch_sub(1, Ordering::AcqRel);
            return Err(RemotingError::protocol("too many channels open"));
        }
        let executor = self.context.executor().clone();
        let (ours, theirs) = LocalChannel::pair(options.clone(), executor.clone(), None, Some(principal));
        let outbound = Arc::clone(&self.outbound);
        ours.close_tracker().add_close_handler(move |_| {
            outbound.fetch_sub(1, Ordering::AcqRel);
        });
        {
            let mut channels = self.channels.lock();
            channels.retain(|channel| channel.strong_count() > 0);
            channels.push(Arc::downgrade(&ours));
        }
        debug!(service = service_type, identity = identity_id, "local channel opened");

        let accepted: Arc<dyn Channel> = theirs;
        executor.spawn(async move {
            listener.channel_opened(accepted);
        });
        Ok(ours)
    }
}

impl ConnectionHandler for LocalConnectionHandler {
    fn open(
        &self,
        service_type: &str,
        identity_id: u32,
        result: FutureResult<Arc<dyn Channel>>,
        options: &ChannelOptions,
    ) -> CancelHandle {
        result.complete(self.open_channel(service_type, identity_id, options));
        CancelHandle::noop()
    }

    fn offered_mechanisms(&self) -> Vec<String> {
        self.settings.mechanisms.clone()
    }

    fn supports_remote_auth(&self) -> bool {
        self.settings.remote_auth
    }

    fn connection_principal(&self) -> Principal {
        self.settings.principal.clone()
    }

    fn remote_endpoint_name(&self) -> Option<String> {
        self.settings.endpoint_name.clone()
    }

    fn send_auth_request(&self, id: u32, mechanism: &str, initial_response: Option<&[u8]>) -> Result<()> {
        trace!(id, mechanism, "auth request");
        self.peer()?.receive_auth_request(id, mechanism, initial_response);
        Ok(())
    }

    fn send_auth_response(&self, id: u32, response: &[u8]) -> Result<()> {
        self.peer()?.receive_auth_response(id, response);
        Ok(())
    }

    fn send_auth_challenge(&self, id: u32, challenge: &[u8]) -> Result<()> {
        self.peer()?.peer_identity_context().receive_challenge(id, challenge);
        Ok(())
    }

    fn send_auth_success(&self, id: u32, challenge: Option<&[u8]>) -> Result<()> {
        self.peer()?.peer_identity_context().receive_success(id, challenge);
        Ok(())
    }

    fn send_auth_reject(&self, id: u32) -> Result<()> {
        self.peer()?.peer_identity_context().receive_reject(id);
        Ok(())
    }

    fn send_auth_delete(&self, id: u32) -> Result<()> {
        self.peer()?.receive_auth_delete(id);
        Ok(())
    }

    fn send_auth_delete_ack(&self, id: u32) -> Result<()> {
        self.peer()?.peer_identity_context().receive_delete_ack(id);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels.iter().filter_map(Weak::upgrade) {
            close_async(channel);
        }
        if let Some(peer) = self.link.context(self.role.other()) {
            peer.remote_connection_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::{DefaultSaslClientFactory, SimpleSecurityDomain, ANONYMOUS, PLAIN};
    use assert_matches::assert_matches;

    #[test]
    fn test_handshake_with_password() {
        let domain = SimpleSecurityDomain::new().with_user("alice", "secret");
        let config = AuthenticationConfiguration::for_user("alice").with_password("secret");
        let principal = handshake(&domain, &DefaultSaslClientFactory, &config).unwrap();
        assert_eq!(principal, Principal::Named("alice".to_string()));
    }

    #[test]
    fn test_handshake_anonymous() {
        let domain = SimpleSecurityDomain::new();
        let principal = handshake(
            &domain,
            &DefaultSaslClientFactory,
            &AuthenticationConfiguration::anonymous(),
        )
        .unwrap();
        assert_eq!(principal, Principal::Anonymous);
    }

    #[test]
    fn test_handshake_wrong_password_lists_mechanism() {
        let domain = SimpleSecurityDomain::new().with_user("alice", "secret");
        let config = AuthenticationConfiguration::for_user("alice").with_password("wrong");
        let err = handshake(&domain, &DefaultSaslClientFactory, &config).unwrap_err();
        assert_matches!(
            &err,
            RemotingError::AuthenticationFailed {
                kind: AuthFailureKind::MechanismsExhausted,
                ..
            }
        );
        assert!(err.to_string().contains(PLAIN));
    }

    #[test]
    fn test_handshake_without_usable_mechanism() {
        let domain = SimpleSecurityDomain::new().with_mechanisms([ANONYMOUS]);
        let config = AuthenticationConfiguration::for_user("alice").with_password("secret");
        assert_matches!(
            handshake(&domain, &DefaultSaslClientFactory, &config),
            Err(RemotingError::AuthenticationFailed {
                kind: AuthFailureKind::NoSaslClient,
                ..
            })
        );
    }
}
