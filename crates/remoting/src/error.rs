//! Unified error type for remoting operations
//!
//! Every failure surfaced by an endpoint, connection, channel or identity
//! negotiation is a [`RemotingError`]. The type is `Clone` so that a single
//! failed [`IoFuture`](crate::future::IoFuture) can hand the same error to
//! every waiter.

use std::fmt;
use std::io;

/// Reason an identity negotiation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthFailureKind {
    /// No SASL client could be built for any offered mechanism
    NoSaslClient,
    /// The server finished while the client still had a response to send
    ExtraResponse,
    /// The server deleted the negotiation
    ServerRejected,
    /// The connection closed while the negotiation was in flight
    ConnectionClosed,
    /// Every candidate mechanism was tried and rejected
    MechanismsExhausted,
}

impl fmt::Display for AuthFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoSaslClient => "no SASL client available",
            Self::ExtraResponse => "extra response from client",
            Self::ServerRejected => "server rejected authentication",
            Self::ConnectionClosed => "connection closed during authentication",
            Self::MechanismsExhausted => "all mechanisms exhausted",
        };
        f.write_str(text)
    }
}

/// Unified error type for all remoting operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemotingError {
    /// The resource is closed or closing
    #[error("Not open: {message}")]
    NotOpen {
        /// What was not open
        message: String,
    },

    /// Transient exhaustion; the operation may be retried
    #[error("Channel busy: {message}")]
    ChannelBusy {
        /// Which resource was exhausted
        message: String,
    },

    /// The sender aborted the message
    #[error("Message cancelled")]
    MessageCancelled,

    /// Identity negotiation failed
    #[error("Authentication failed ({kind}): {message}")]
    AuthenticationFailed {
        /// Failure category
        kind: AuthFailureKind,
        /// Details, one line per mechanism for exhausted negotiations
        message: String,
    },

    /// Peer violated the protocol or a protocol limit was hit
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error details
        message: String,
    },

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The call is not valid in the current state
    #[error("Illegal state: {message}")]
    IllegalState {
        /// Error details
        message: String,
    },

    /// No service registered under the requested name
    #[error("Service not found: {service}")]
    ServiceNotFound {
        /// Requested service name
        service: String,
    },

    /// A service or provider is already registered under this name
    #[error("Duplicate registration: {name}")]
    DuplicateRegistration {
        /// Conflicting name
        name: String,
    },

    /// Service names are restricted to `[A-Za-z0-9_.:-]`
    #[error("Invalid service name: {name}")]
    InvalidServiceName {
        /// The rejected name
        name: String,
    },

    /// No connection provider for the URI scheme
    #[error("No connection provider for scheme \"{scheme}\"")]
    UnknownScheme {
        /// URI scheme
        scheme: String,
    },

    /// The destination URI could not be used
    #[error("Invalid URI: {message}")]
    InvalidUri {
        /// Error details
        message: String,
    },

    /// A SASL mechanism failed locally
    #[error("SASL error: {message}")]
    Sasl {
        /// Error details
        message: String,
    },

    /// Transport level I/O failure
    #[error("I/O error: {message}")]
    Io {
        /// Error details
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error details
        message: String,
    },
}

impl RemotingError {
    /// Create a not-open error
    pub fn not_open(message: impl Into<String>) -> Self {
        Self::NotOpen {
            message: message.into(),
        }
    }

    /// Create a channel-busy error
    pub fn channel_busy(message: impl Into<String>) -> Self {
        Self::ChannelBusy {
            message: message.into(),
        }
    }

    /// Create an authentication failure
    pub fn authentication_failed(kind: AuthFailureKind, message: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            kind,
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a SASL error
    pub fn sasl(message: impl Into<String>) -> Self {
        Self::Sasl {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid URI error
    pub fn invalid_uri(message: impl Into<String>) -> Self {
        Self::InvalidUri {
            message: message.into(),
        }
    }

    /// Build the aggregate failure for a negotiation that ran out of mechanisms.
    ///
    /// Each `(mechanism, reason)` pair becomes one line of the message.
    pub fn mechanisms_exhausted<'a, I>(failures: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a RemotingError)>,
    {
        let mut message = String::from("Authentication failed: all available authentication mechanisms failed:");
        for (mechanism, reason) in failures {
            message.push_str(&format!("\n   {mechanism}: {reason}"));
        }
        Self::authentication_failed(AuthFailureKind::MechanismsExhausted, message)
    }

    /// Recover the remoting error carried inside an I/O error, if any
    pub fn from_io(err: &io::Error) -> Option<&RemotingError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<RemotingError>())
    }

    /// Whether this error is retryable resource exhaustion
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::ChannelBusy { .. })
    }
}

/// Whether an I/O error reports a cancelled message
pub fn is_message_cancelled(err: &io::Error) -> bool {
    matches!(
        RemotingError::from_io(err),
        Some(RemotingError::MessageCancelled)
    )
}

impl From<RemotingError> for io::Error {
    fn from(err: RemotingError) -> Self {
        let kind = match &err {
            RemotingError::NotOpen { .. } => io::ErrorKind::NotConnected,
            RemotingError::MessageCancelled | RemotingError::Cancelled => {
                io::ErrorKind::Interrupted
            }
            RemotingError::ChannelBusy { .. } => io::ErrorKind::WouldBlock,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

impl From<io::Error> for RemotingError {
    fn from(err: io::Error) -> Self {
        if let Some(inner) = RemotingError::from_io(&err) {
            return inner.clone();
        }
        Self::io(err.to_string())
    }
}

/// Standard Result type for remoting operations
pub type Result<T> = std::result::Result<T, RemotingError>;
