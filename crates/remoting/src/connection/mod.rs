//! Live physical connections
//!
//! A [`Connection`] owns its transport [`ConnectionHandler`], answers the
//! peer's identity negotiations (responder role) on a per-connection serial
//! task, and exposes the initiator side through its
//! [`ConnectionPeerIdentityContext`].
//!
//! ## Responder protocol
//!
//! | inbound frame | action |
//! |---------------|--------|
//! | request       | build mechanism, evaluate initial response |
//! | response      | evaluate against the live mechanism for the ID |
//! | delete        | dispose the mechanism, forget the identity, ack |
//!
//! Evaluation answers with a challenge, a success, or a reject. IDs 0 and 1
//! name the connection and anonymous identities and are never negotiated.

mod handler;
mod identity;

pub use handler::{ConnectionHandler, ConnectionHandlerContext, ConnectionHandlerFactory};
pub use identity::{ConnectionPeerIdentity, ConnectionPeerIdentityContext};

use crate::attachments::Attachments;
use crate::channel::Channel;
use crate::closeable::{CloseTracker, HandleableCloseable};
use crate::config::{ChannelOptions, EndpointConfig};
use crate::error::{RemotingError, Result};
use crate::future::{Cancellable, FutureResult, IoFuture};
use crate::sasl::{
    dispose_server, AuthenticationConfiguration, Principal, RejectingSaslServer, SaslClientFactory,
    SaslServer, SaslServerFactory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

/// Identity established when the connection was made
pub const CONNECTION_IDENTITY_ID: u32 = 0;
/// The anonymous identity
pub const ANONYMOUS_IDENTITY_ID: u32 = 1;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Whether `id` is one of the two reserved identity IDs
pub fn is_reserved_identity_id(id: u32) -> bool {
    id == CONNECTION_IDENTITY_ID || id == ANONYMOUS_IDENTITY_ID
}

#[derive(Debug)]
enum AuthFrame {
    Request {
        id: u32,
        mechanism: String,
        initial_response: Option<Vec<u8>>,
    },
    Response {
        id: u32,
        response: Vec<u8>,
    },
    Delete {
        id: u32,
    },
}

/// How a connection was created
pub(crate) struct ConnectionParams {
    pub destination: Option<Url>,
    pub auth_config: Option<AuthenticationConfiguration>,
    pub sasl_server_factory: Option<Arc<dyn SaslServerFactory>>,
    pub sasl_client_factory: Arc<dyn SaslClientFactory>,
    pub config: EndpointConfig,
}

/// One physical connection to a peer
pub struct Connection {
    serial: u64,
    tracker: CloseTracker,
    handler: Arc<dyn ConnectionHandler>,
    context: Arc<ConnectionHandlerContext>,
    destination: Option<Url>,
    auth_config: Option<AuthenticationConfiguration>,
    sasl_server_factory: Option<Arc<dyn SaslServerFactory>>,
    server_auths: Mutex<HashMap<u32, Box<dyn SaslServer>>>,
    authorized: Mutex<HashMap<u32, Principal>>,
    peer_identities: Arc<ConnectionPeerIdentityContext>,
    attachments: Attachments,
    frames: mpsc::UnboundedSender<AuthFrame>,
    channel_options: ChannelOptions,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.serial)
            .field("destination", &self.destination.as_ref().map(Url::as_str))
            .field("open", &self.tracker.is_open())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        factory: &dyn ConnectionHandlerFactory,
        context: Arc<ConnectionHandlerContext>,
        params: ConnectionParams,
    ) -> Arc<Self> {
        let serial = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let executor = context.executor().clone();
        let handler = factory.create_handler(Arc::clone(&context));
        let (frames, inbox) = mpsc::unbounded_channel();
        let ConnectionParams {
            destination,
            auth_config,
            sasl_server_factory,
            sasl_client_factory,
            config,
        } = params;

        let connection = Arc::new_cyclic(|this: &Weak<Connection>| {
            let peer_identities = ConnectionPeerIdentityContext::new(
                this.clone(),
                Arc::clone(&handler),
                sasl_client_factory,
                auth_config.clone(),
                executor.clone(),
                config.auth_id_retries,
                config.max_cached_identities,
            );
            Connection {
                serial,
                tracker: CloseTracker::new(format!("connection {serial}"), executor.clone()),
                handler,
                context: Arc::clone(&context),
                destination,
                auth_config,
                sasl_server_factory,
                server_auths: Mutex::new(HashMap::new()),
                authorized: Mutex::new(HashMap::new()),
                peer_identities,
                attachments: Attachments::new(),
                frames,
                channel_options: config.channel,
            }
        });
        context.bind(&connection);
        executor.spawn(run_serial(Arc::downgrade(&connection), inbox));
        debug!(
            connection = serial,
            destination = ?connection.destination.as_ref().map(Url::as_str),
            remote_auth = connection.handler.supports_remote_auth(),
            "connection established"
        );
        connection
    }

    /// Process-unique connection number, used in logs
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Destination URI for outbound connections
    pub fn destination(&self) -> Option<&Url> {
        self.destination.as_ref()
    }

    /// Credential the connection was established with, for outbound connections
    pub fn auth_config(&self) -> Option<&AuthenticationConfiguration> {
        self.auth_config.as_ref()
    }

    /// Whether several identities may share this connection
    pub fn supports_remote_auth(&self) -> bool {
        self.handler.supports_remote_auth()
    }

    /// Name the peer endpoint reported
    pub fn remote_endpoint_name(&self) -> Option<String> {
        self.handler.remote_endpoint_name()
    }

    /// TLS session of the transport, if any
    pub fn ssl_session_id(&self) -> Option<String> {
        self.handler.ssl_session_id()
    }

    /// Principal established at connect time
    pub fn principal(&self) -> Principal {
        self.handler.connection_principal()
    }

    /// Initiator-side identity cache
    pub fn peer_identity_context(&self) -> &Arc<ConnectionPeerIdentityContext> {
        &self.peer_identities
    }

    /// Transport handler
    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    /// Handler context
    pub fn handler_context(&self) -> &Arc<ConnectionHandlerContext> {
        &self.context
    }

    /// Extension state for protocol providers
    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    /// Default options for channels opened on this connection
    pub fn default_channel_options(&self) -> &ChannelOptions {
        &self.channel_options
    }

    /// Open a channel to `service_type` as the connection identity
    pub fn open_channel(
        &self,
        service_type: &str,
        options: Option<ChannelOptions>,
    ) -> IoFuture<Arc<dyn Channel>> {
        self.open_channel_as(CONNECTION_IDENTITY_ID, service_type, options)
    }

    pub(crate) fn open_channel_as(
        &self,
        identity_id: u32,
        service_type: &str,
        options: Option<ChannelOptions>,
    ) -> IoFuture<Arc<dyn Channel>> {
        if let Err(err) = self.tracker.check_open() {
            return IoFuture::failed(err);
        }
        let options = options.unwrap_or_else(|| self.channel_options.clone());
        if let Err(err) = options.validate() {
            return IoFuture::failed(err);
        }
        let result = FutureResult::new();
        let cancel = self
            .handler
            .open(service_type, identity_id, result.clone(), &options);
        result.add_cancel_handler(move || cancel.cancel());
        result.future()
    }

    /// Principal the peer holds under `identity_id` on this (responder) side
    pub fn authorized_principal(&self, identity_id: u32) -> Option<Principal> {
        match identity_id {
            CONNECTION_IDENTITY_ID => Some(self.handler.connection_principal()),
            ANONYMOUS_IDENTITY_ID => Some(Principal::Anonymous),
            id => self.authorized.lock().get(&id).cloned(),
        }
    }

    /// Number of responder negotiations currently holding a mechanism
    pub fn live_server_auths(&self) -> usize {
        self.server_auths.lock().len()
    }

    /// Inbound auth-request frame. Processed on the connection's serial task.
    pub fn receive_auth_request(&self, id: u32, mechanism: &str, initial_response: Option<&[u8]>) {
        self.enqueue(AuthFrame::Request {
            id,
            mechanism: mechanism.to_string(),
            initial_response: initial_response.map(<[u8]>::to_vec),
        });
    }

    /// Inbound auth-response frame. Processed on the connection's serial task.
    pub fn receive_auth_response(&self, id: u32, response: &[u8]) {
        self.enqueue(AuthFrame::Response {
            id,
            response: response.to_vec(),
        });
    }

    /// Inbound auth-delete frame. Processed on the connection's serial task.
    pub fn receive_auth_delete(&self, id: u32) {
        self.enqueue(AuthFrame::Delete { id });
    }

    fn enqueue(&self, frame: AuthFrame) {
        if self.frames.send(frame).is_err() {
            debug!(connection = self.serial, "auth frame after serial task ended");
        }
    }

    fn handle_frame(&self, frame: AuthFrame) {
        if !self.tracker.is_open() {
            return;
        }
        match frame {
            AuthFrame::Request {
                id,
                mechanism,
                initial_response,
            } => self.handle_auth_request(id, &mechanism, initial_response.as_deref()),
            AuthFrame::Response { id, response } => self.handle_auth_response(id, &response),
            AuthFrame::Delete { id } => self.handle_auth_delete(id),
        }
    }

    fn handle_auth_request(&self, id: u32, mechanism: &str, initial_response: Option<&[u8]>) {
        if is_reserved_identity_id(id) {
            debug!(connection = self.serial, id, "ignoring auth request for reserved id");
            return;
        }
        debug!(connection = self.serial, id, mechanism, "auth request");
        // A new request for a live ID restarts the negotiation.
        if let Some(mut previous) = self.server_auths.lock().remove(&id) {
            dispose_server(previous.as_mut());
        }
        let server = self
            .sasl_server_factory
            .as_ref()
            .ok_or_else(|| RemotingError::sasl("no security domain on this side"))
            .and_then(|factory| factory.create_sasl_server(mechanism));
        match server {
            Ok(server) => self.evaluate(id, server, initial_response.unwrap_or_default()),
            Err(err) => {
                debug!(connection = self.serial, id, mechanism, error = %err, "mechanism unavailable");
                self.install_rejecting(id, mechanism, err);
            }
        }
    }

    fn handle_auth_response(&self, id: u32, response: &[u8]) {
        if is_reserved_identity_id(id) {
            return;
        }
        let live = self.server_auths.lock().remove(&id);
        match live {
            Some(server) => self.evaluate(id, server, response),
            None => {
                debug!(connection = self.serial, id, "auth response for unknown id");
                self.install_rejecting(
                    id,
                    "unknown",
                    RemotingError::sasl("no negotiation in progress"),
                );
            }
        }
    }

    fn handle_auth_delete(&self, id: u32) {
        if let Some(mut server) = self.server_auths.lock().remove(&id) {
            dispose_server(server.as_mut());
        }
        self.authorized.lock().remove(&id);
        if let Err(err) = self.handler.send_auth_delete_ack(id) {
            debug!(connection = self.serial, id, error = %err, "failed to acknowledge auth delete");
        }
    }

    fn install_rejecting(&self, id: u32, mechanism: &str, reason: RemotingError) {
        self.server_auths.lock().insert(
            id,
            Box::new(RejectingSaslServer::new(mechanism, reason)),
        );
        if let Err(err) = self.handler.send_auth_reject(id) {
            warn!(connection = self.serial, id, error = %err, "failed to send auth reject");
            self.evict(id);
        }
    }

    fn evict(&self, id: u32) {
        if let Some(mut server) = self.server_auths.lock().remove(&id) {
            dispose_server(server.as_mut());
        }
    }

    fn evaluate(&self, id: u32, mut server: Box<dyn SaslServer>, response: &[u8]) {
        match server.evaluate_response(response) {
            Err(err) => {
                debug!(connection = self.serial, id, mechanism = server.mechanism_name(), error = %err, "auth rejected");
                self.server_auths.lock().insert(id, server);
                if let Err(err) = self.handler.send_auth_reject(id) {
                    warn!(connection = self.serial, id, error = %err, "failed to send auth reject");
                    self.evict(id);
                }
            }
            Ok(challenge) if server.is_complete() => {
                let principal = server.authorized_principal().unwrap_or(Principal::Anonymous);
                debug!(connection = self.serial, id, mechanism = server.mechanism_name(), %principal, "auth complete");
                dispose_server(server.as_mut());
                let final_challenge = (!challenge.is_empty()).then_some(challenge.as_slice());
                // Recorded first: the initiator may open a channel as soon as it sees success.
                self.authorized.lock().insert(id, principal);
                if let Err(err) = self.handler.send_auth_success(id, final_challenge) {
                    warn!(connection = self.serial, id, error = %err, "failed to send auth success");
                    self.authorized.lock().remove(&id);
                }
            }
            Ok(challenge) => {
                self.server_auths.lock().insert(id, server);
                if let Err(err) = self.handler.send_auth_challenge(id, &challenge) {
                    warn!(connection = self.serial, id, error = %err, "failed to send auth challenge");
                    self.evict(id);
                }
            }
        }
    }
}

async fn run_serial(connection: Weak<Connection>, mut inbox: mpsc::UnboundedReceiver<AuthFrame>) {
    while let Some(frame) = inbox.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        connection.handle_frame(frame);
    }
}

#[async_trait]
impl HandleableCloseable for Connection {
    fn close_tracker(&self) -> &CloseTracker {
        &self.tracker
    }

    async fn close_action(&self) -> Result<()> {
        self.handler.close();
        let live: Vec<_> = self.server_auths.lock().drain().collect();
        for (_, mut server) in live {
            dispose_server(server.as_mut());
        }
        self.authorized.lock().clear();
        self.peer_identities.connection_closed();
        debug!(connection = self.serial, "connection closed");
        self.tracker.close_complete(None);
        Ok(())
    }
}
