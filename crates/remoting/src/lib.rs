//! Remoting: multiplexed peer-to-peer transport
//!
//! An [`Endpoint`] owns connection providers, registered services and the
//! physical connections it has made or accepted. A [`Connection`] carries
//! many message-oriented [`Channel`]s and, when the peer allows it, many
//! independently authenticated identities negotiated over SASL.
//!
//! Requests for the same destination share one connection attempt; whether
//! later credentials reuse that connection depends on whether it supports
//! identity switching ([`connection_info::Sharing`]).
//!
//! ```no_run
//! # async fn demo() -> remoting::Result<()> {
//! use remoting::{AuthenticationConfiguration, Endpoint};
//!
//! let endpoint = Endpoint::builder().endpoint_name("client").build()?;
//! let destination = url::Url::parse("local:")
//!     .map_err(|e| remoting::RemotingError::invalid_uri(e.to_string()))?;
//! let identity = endpoint
//!     .get_connected_identity(&destination, None, &AuthenticationConfiguration::anonymous())
//!     .get()
//!     .await?;
//! let _channel = identity.open_channel("echo", None).get().await?;
//! # Ok(())
//! # }
//! ```

pub mod attachments;
pub mod channel;
pub mod closeable;
pub mod config;
pub mod connection;
pub mod connection_info;
pub mod endpoint;
pub mod error;
pub mod future;
pub mod provider;
pub mod sasl;

pub use attachments::{AttachmentKey, Attachments};
pub use channel::{Channel, LocalChannel, MessageInputStream, MessageOutputStream, Receiver};
pub use closeable::{close_async, CloseTracker, HandleableCloseable};
pub use config::{ChannelOptions, ConnectionOptions, EndpointConfig};
pub use connection::{
    Connection, ConnectionHandler, ConnectionHandlerContext, ConnectionHandlerFactory,
    ConnectionPeerIdentity, ConnectionPeerIdentityContext,
};
pub use endpoint::global::{default_endpoint, install_default};
pub use endpoint::{Endpoint, EndpointBuilder, OpenListener, Registration, UncloseableEndpoint};
pub use error::{AuthFailureKind, RemotingError, Result};
pub use future::{CancelHandle, Cancellable, FutureResult, IoFuture, Status};
pub use provider::{ConnectRequest, ConnectionProvider, ConnectionProviderContext, ConnectionProviderFactory};
pub use sasl::{AuthenticationConfiguration, Principal, SaslClientFactory, SaslServerFactory, SimpleSecurityDomain};
