//! Initiator-side identity negotiation
//!
//! Each [`AuthenticationConfiguration`] negotiated over a connection becomes a
//! [`ConnectionPeerIdentity`] with its own 31-bit ID. Concurrent requests for
//! the same configuration share one negotiation. Completed identities are
//! cached; the cache is bounded, and only identities nobody else holds are
//! evicted (their ID is released on the peer with an auth-delete).

use super::{Connection, ConnectionHandler, ANONYMOUS_IDENTITY_ID, CONNECTION_IDENTITY_ID};
use crate::channel::Channel;
use crate::config::ChannelOptions;
use crate::error::{AuthFailureKind, RemotingError, Result};
use crate::future::{FutureResult, IoFuture, Status};
use crate::sasl::{dispose_client, AuthenticationConfiguration, Principal, SaslClient, SaslClientFactory};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

const MAX_AUTH_ID: u32 = 0x7fff_ffff;

struct IdentityInner {
    id: u32,
    principal: Principal,
    connection: Weak<Connection>,
}

/// An identity established over a connection
#[derive(Clone)]
pub struct ConnectionPeerIdentity {
    inner: Arc<IdentityInner>,
}

impl ConnectionPeerIdentity {
    fn new(id: u32, principal: Principal, connection: Weak<Connection>) -> Self {
        Self {
            inner: Arc::new(IdentityInner {
                id,
                principal,
                connection,
            }),
        }
    }

    /// Identity ID on the connection
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Principal this identity acts as
    pub fn principal(&self) -> &Principal {
        &self.inner.principal
    }

    /// The connection the identity lives on, while it is alive
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.upgrade()
    }

    /// Open a channel to `service_type` acting as this identity
    pub fn open_channel(
        &self,
        service_type: &str,
        options: Option<ChannelOptions>,
    ) -> IoFuture<Arc<dyn Channel>> {
        match self.connection() {
            Some(connection) => connection.open_channel_as(self.id(), service_type, options),
            None => IoFuture::failed(RemotingError::not_open("connection is gone")),
        }
    }

    fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl PartialEq for ConnectionPeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && Weak::ptr_eq(&self.inner.connection, &other.inner.connection)
    }
}

impl Eq for ConnectionPeerIdentity {}

impl fmt::Debug for ConnectionPeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPeerIdentity")
            .field("id", &self.inner.id)
            .field("principal", &self.inner.principal)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthStatus {
    Waiting,
    Challenge(Vec<u8>),
    Success(Option<Vec<u8>>),
    Reject,
    Delete,
    Closed,
}

/// One in-flight negotiation. `Closed` is sticky.
struct Authentication {
    id: u32,
    status: watch::Sender<AuthStatus>,
}

impl Authentication {
    fn new(id: u32) -> Self {
        let (status, _) = watch::channel(AuthStatus::Waiting);
        Self { id, status }
    }

    fn deposit(&self, next: AuthStatus) {
        self.status.send_if_modified(|current| {
            if *current == AuthStatus::Closed {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn next(&self) -> AuthStatus {
        let mut status = self.status.subscribe();
        let seen = match status.wait_for(|s| *s != AuthStatus::Waiting).await {
            Ok(current) => current.clone(),
            Err(_) => AuthStatus::Closed,
        };
        if seen != AuthStatus::Closed {
            self.status.send_if_modified(|current| {
                if *current == seen {
                    *current = AuthStatus::Waiting;
                }
                false
            });
        }
        seen
    }
}

struct State {
    closed: bool,
    authentications: HashMap<u32, Arc<Authentication>>,
    identity_ids: HashSet<u32>,
    future_auths: IndexMap<AuthenticationConfiguration, IoFuture<ConnectionPeerIdentity>>,
}

/// Per-connection negotiation state and identity cache
pub struct ConnectionPeerIdentityContext {
    connection: Weak<Connection>,
    handler: Arc<dyn ConnectionHandler>,
    client_factory: Arc<dyn SaslClientFactory>,
    default_config: Option<AuthenticationConfiguration>,
    connection_identity: ConnectionPeerIdentity,
    anonymous_identity: ConnectionPeerIdentity,
    state: Mutex<State>,
    executor: Handle,
    id_retries: u32,
    max_cached: usize,
}

impl fmt::Debug for ConnectionPeerIdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPeerIdentityContext")
            .field("closed", &state.closed)
            .field("negotiating", &state.authentications.len())
            .field("cached", &state.future_auths.len())
            .finish()
    }
}

/// Client mechanism that is disposed however the exchange ends
struct ClientGuard(Box<dyn SaslClient>);

impl Deref for ClientGuard {
    type Target = dyn SaslClient;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl DerefMut for ClientGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        dispose_client(self.0.as_mut());
    }
}

/// Releases a negotiation ID when the negotiation ends, including on abort
struct AuthGuard {
    context: Arc<ConnectionPeerIdentityContext>,
    auth: Arc<Authentication>,
    succeeded: bool,
}

impl Drop for AuthGuard {
    fn drop(&mut self) {
        let id = self.auth.id;
        let notify_peer = {
            let mut state = self.context.state.lock();
            state.authentications.remove(&id);
            if self.succeeded {
                state.identity_ids.insert(id);
            }
            !self.succeeded && !state.closed
        };
        if notify_peer {
            if let Err(err) = self.context.handler.send_auth_delete(id) {
                debug!(id, error = %err, "failed to send auth delete");
            }
        }
    }
}

enum MechanismOutcome {
    Authenticated,
    Failed(RemotingError),
}

/// Pick a random negotiable ID that `taken` rejects, giving up after `retries` draws
fn allocate_id<R: Rng>(rng: &mut R, retries: u32, taken: impl Fn(u32) -> bool) -> Option<u32> {
    (0..retries)
        .map(|_| rng.gen_range(ANONYMOUS_IDENTITY_ID + 1..=MAX_AUTH_ID))
        .find(|id| !taken(*id))
}

fn connection_closed() -> RemotingError {
    RemotingError::authentication_failed(
        AuthFailureKind::ConnectionClosed,
        "connection closed during authentication",
    )
}

impl ConnectionPeerIdentityContext {
    pub(crate) fn new(
        connection: Weak<Connection>,
        handler: Arc<dyn ConnectionHandler>,
        client_factory: Arc<dyn SaslClientFactory>,
        default_config: Option<AuthenticationConfiguration>,
        executor: Handle,
        id_retries: u32,
        max_cached: usize,
    ) -> Arc<Self> {
        let connection_identity = ConnectionPeerIdentity::new(
            CONNECTION_IDENTITY_ID,
            handler.connection_principal(),
            connection.clone(),
        );
        let anonymous_identity =
            ConnectionPeerIdentity::new(ANONYMOUS_IDENTITY_ID, Principal::Anonymous, connection.clone());
        Arc::new(Self {
            connection,
            handler,
            client_factory,
            default_config,
            connection_identity,
            anonymous_identity,
            state: Mutex::new(State {
                closed: false,
                authentications: HashMap::new(),
                identity_ids: HashSet::new(),
                future_auths: IndexMap::new(),
            }),
            executor,
            id_retries: id_retries.max(1),
            max_cached: max_cached.max(1),
        })
    }

    /// Identity established at connect time (ID 0)
    pub fn connection_identity(&self) -> &ConnectionPeerIdentity {
        &self.connection_identity
    }

    /// The anonymous identity (ID 1)
    pub fn anonymous_identity(&self) -> &ConnectionPeerIdentity {
        &self.anonymous_identity
    }

    /// Negotiations currently in flight
    pub fn active_authentications(&self) -> usize {
        self.state.lock().authentications.len()
    }

    /// Cached identity results, pending ones included
    pub fn cached_identities(&self) -> usize {
        self.state.lock().future_auths.len()
    }

    /// Negotiate `config` and wait for the identity
    pub async fn authenticate(
        self: &Arc<Self>,
        config: &AuthenticationConfiguration,
    ) -> Result<ConnectionPeerIdentity> {
        self.authenticate_async(config).get().await
    }

    /// Negotiate `config` in the background.
    ///
    /// The connection's own credential resolves to the connection identity
    /// and an anonymous credential to the anonymous identity without any
    /// exchange. Other credentials share one negotiation per configuration.
    pub fn authenticate_async(
        self: &Arc<Self>,
        config: &AuthenticationConfiguration,
    ) -> IoFuture<ConnectionPeerIdentity> {
        if self.default_config.as_ref() == Some(config) {
            return IoFuture::done(self.connection_identity.clone());
        }
        if config.is_anonymous() {
            return IoFuture::done(self.anonymous_identity.clone());
        }

        let result = FutureResult::new();
        let future = result.future();
        {
            let mut state = self.state.lock();
            if state.closed {
                return IoFuture::failed(connection_closed());
            }
            if let Some(existing) = state.future_auths.get(config) {
                return existing.clone();
            }
            state.future_auths.insert(config.clone(), future.clone());
            self.evict_unused(&mut state);
        }

        let context = Arc::clone(self);
        let task_config = config.clone();
        let producer = result.clone();
        let task = self.executor.spawn(async move {
            let outcome = context.negotiate(&task_config).await;
            producer.complete(outcome);
        });
        let canceller = result.clone();
        result.add_cancel_handler(move || {
            task.abort();
            canceller.set_cancelled();
        });

        let context = Arc::downgrade(self);
        let key = config.clone();
        let watched = future.clone();
        future.add_notifier(move |status| {
            if matches!(status, Status::Done(_)) {
                return;
            }
            if let Some(context) = context.upgrade() {
                let mut state = context.state.lock();
                if state
                    .future_auths
                    .get(&key)
                    .is_some_and(|cached| cached.ptr_eq(&watched))
                {
                    state.future_auths.shift_remove(&key);
                }
            }
        });
        future
    }

    fn evict_unused(&self, state: &mut State) {
        while state.future_auths.len() > self.max_cached {
            let victim = state.future_auths.iter().position(|(_, cached)| {
                cached.is_sole_handle()
                    && matches!(cached.status(), Status::Done(identity) if identity.holders() <= 2)
            });
            let Some(index) = victim else {
                break;
            };
            let Some((_, evicted)) = state.future_auths.shift_remove_index(index) else {
                break;
            };
            if let Status::Done(identity) = evicted.status() {
                state.identity_ids.remove(&identity.id());
                debug!(id = identity.id(), "evicting cached identity");
                if let Err(err) = self.handler.send_auth_delete(identity.id()) {
                    debug!(id = identity.id(), error = %err, "failed to release evicted identity");
                }
            }
        }
    }

    fn register_authentication(self: &Arc<Self>) -> Result<AuthGuard> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(connection_closed());
        }
        let id = allocate_id(&mut rand::thread_rng(), self.id_retries, |id| {
            state.authentications.contains_key(&id) || state.identity_ids.contains(&id)
        })
        .ok_or_else(|| RemotingError::channel_busy("no free authentication ID"))?;
        let auth = Arc::new(Authentication::new(id));
        state.authentications.insert(id, Arc::clone(&auth));
        Ok(AuthGuard {
            context: Arc::clone(self),
            auth,
            succeeded: false,
        })
    }

    async fn negotiate(self: &Arc<Self>, config: &AuthenticationConfiguration) -> Result<ConnectionPeerIdentity> {
        let mut guard = self.register_authentication()?;
        let id = guard.auth.id;
        let mut offered = self.handler.offered_mechanisms();
        let mut seen = HashSet::new();
        offered.retain(|mechanism| seen.insert(mechanism.clone()));

        let mut failures: Vec<(String, RemotingError)> = Vec::new();
        for mechanism in offered.iter().filter(|m| config.mechanism_allowed(m)) {
            let client = match self.client_factory.create_sasl_client(mechanism, config) {
                Ok(Some(client)) => ClientGuard(client),
                Ok(None) => {
                    failures.push((
                        mechanism.clone(),
                        RemotingError::authentication_failed(
                            AuthFailureKind::NoSaslClient,
                            "no client for this credential",
                        ),
                    ));
                    continue;
                }
                Err(err) => {
                    failures.push((mechanism.clone(), err));
                    continue;
                }
            };
            debug!(id, mechanism = %mechanism, principal = %config.principal(), "trying mechanism");
            match self.run_mechanism(&guard.auth, mechanism, client).await? {
                MechanismOutcome::Authenticated => {
                    guard.succeeded = true;
                    debug!(id, mechanism = %mechanism, "identity established");
                    return Ok(ConnectionPeerIdentity::new(
                        id,
                        config.principal().clone(),
                        self.connection.clone(),
                    ));
                }
                MechanismOutcome::Failed(reason) => {
                    debug!(id, mechanism = %mechanism, error = %reason, "mechanism failed");
                    failures.push((mechanism.clone(), reason));
                }
            }
        }

        let no_client = failures.iter().all(|(_, err)| {
            matches!(
                err,
                RemotingError::AuthenticationFailed {
                    kind: AuthFailureKind::NoSaslClient,
                    ..
                }
            )
        });
        if failures.is_empty() || no_client {
            return Err(RemotingError::authentication_failed(
                AuthFailureKind::NoSaslClient,
                format!("no SASL client available for {}", config.principal()),
            ));
        }
        Err(RemotingError::mechanisms_exhausted(
            failures.iter().map(|(mechanism, err)| (mechanism.as_str(), err)),
        ))
    }

    async fn run_mechanism(
        &self,
        auth: &Authentication,
        mechanism: &str,
        mut client: ClientGuard,
    ) -> Result<MechanismOutcome> {
        let id = auth.id;
        let initial = if client.has_initial_response() {
            match client.evaluate_challenge(&[]) {
                Ok(bytes) => Some(bytes),
                Err(err) => return Ok(MechanismOutcome::Failed(err)),
            }
        } else {
            None
        };
        auth.deposit(AuthStatus::Waiting);
        self.handler.send_auth_request(id, mechanism, initial.as_deref())?;

        loop {
            match auth.next().await {
                AuthStatus::Waiting => continue,
                AuthStatus::Challenge(challenge) => match client.evaluate_challenge(&challenge) {
                    Ok(response) => self.handler.send_auth_response(id, &response)?,
                    Err(err) => return Ok(MechanismOutcome::Failed(err)),
                },
                AuthStatus::Success(challenge) => {
                    if !client.is_complete() {
                        let response = match client.evaluate_challenge(challenge.as_deref().unwrap_or_default()) {
                            Ok(response) => response,
                            Err(err) => return Ok(MechanismOutcome::Failed(err)),
                        };
                        if !response.is_empty() {
                            return Err(RemotingError::authentication_failed(
                                AuthFailureKind::ExtraResponse,
                                format!("{mechanism} produced a response after the server finished"),
                            ));
                        }
                    }
                    return Ok(MechanismOutcome::Authenticated);
                }
                AuthStatus::Reject => {
                    return Ok(MechanismOutcome::Failed(RemotingError::authentication_failed(
                        AuthFailureKind::ServerRejected,
                        format!("server rejected {mechanism}"),
                    )));
                }
                AuthStatus::Delete => {
                    return Err(RemotingError::authentication_failed(
                        AuthFailureKind::ServerRejected,
                        "server deleted the authentication",
                    ));
                }
                AuthStatus::Closed => return Err(connection_closed()),
            }
        }
    }

    fn active(&self, id: u32) -> Option<Arc<Authentication>> {
        let auth = self.state.lock().authentications.get(&id).cloned();
        if auth.is_none() {
            debug!(id, "auth frame for unknown id");
        }
        auth
    }

    /// Inbound challenge from the responder
    pub fn receive_challenge(&self, id: u32, challenge: &[u8]) {
        if let Some(auth) = self.active(id) {
            auth.deposit(AuthStatus::Challenge(challenge.to_vec()));
        }
    }

    /// Inbound success from the responder
    pub fn receive_success(&self, id: u32, challenge: Option<&[u8]>) {
        if let Some(auth) = self.active(id) {
            auth.deposit(AuthStatus::Success(challenge.map(<[u8]>::to_vec)));
        }
    }

    /// Inbound reject of the current mechanism
    pub fn receive_reject(&self, id: u32) {
        if let Some(auth) = self.active(id) {
            auth.deposit(AuthStatus::Reject);
        }
    }

    /// Inbound delete from the responder
    pub fn receive_delete_ack(&self, id: u32) {
        if let Some(auth) = self.active(id) {
            auth.deposit(AuthStatus::Delete);
        }
    }

    /// Fail every in-flight negotiation; later requests fail immediately
    pub(crate) fn connection_closed(&self) {
        let pending: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.authentications.values().cloned().collect()
        };
        if !pending.is_empty() {
            warn!(negotiations = pending.len(), "connection closed during authentication");
        }
        for auth in pending {
            auth.deposit(AuthStatus::Closed);
        }
    }
}
