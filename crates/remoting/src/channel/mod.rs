//! Message-oriented channels
//!
//! A [`Channel`] is a full-duplex pipe of discrete messages. Each message is
//! an ordered byte stream that can be cancelled on its own; messages in
//! flight at the same time carry no ordering relative to each other.

mod local;
mod message;
mod window;

pub use local::LocalChannel;
pub use message::{message_pipe, MessageInputStream, MessageOutputStream, DEFAULT_PIPE_BUFFER};
pub use window::{MessagePermit, MessageWindow, MAX_MESSAGE_ID};

use crate::attachments::Attachments;
use crate::closeable::HandleableCloseable;
use crate::config::ChannelOptions;
use crate::error::{RemotingError, Result};
use crate::sasl::Principal;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Callback for one `receive_message` registration.
///
/// Exactly one method runs per registration, on an executor task.
pub trait Receiver: Send {
    /// A new inbound message is ready to read
    fn handle_message(self: Box<Self>, channel: Arc<dyn Channel>, message: MessageInputStream);

    /// The channel failed
    fn handle_error(self: Box<Self>, channel: Arc<dyn Channel>, error: RemotingError);

    /// The peer shut down writing or the channel closed
    fn handle_end(self: Box<Self>, channel: Arc<dyn Channel>);
}

/// A message-multiplexing pipe to a peer
#[async_trait]
pub trait Channel: HandleableCloseable {
    /// Start a new outbound message.
    ///
    /// Waits while the outbound window or the peer's queue is full. Fails
    /// with `NotOpen` after a write shutdown on either side and with
    /// `ChannelBusy` if no message ID could be allocated.
    async fn write_message(&self) -> Result<MessageOutputStream>;

    /// Send no more messages. Receiving continues. Idempotent.
    fn write_shutdown(&self) -> Result<()>;

    /// Register the receiver for the next inbound event.
    ///
    /// Fails with `IllegalState` while a previous registration is pending.
    fn receive_message(&self, receiver: Box<dyn Receiver>) -> Result<()>;

    /// Extension state for protocol providers
    fn attachments(&self) -> &Attachments;

    /// Options this channel was opened with
    fn options(&self) -> &ChannelOptions;

    /// Principal the peer opened or accepted this channel as, when known
    fn peer_principal(&self) -> Option<Principal>;

    /// Wait for the next inbound message; `None` once the peer is done
    async fn next_message(&self) -> Result<Option<MessageInputStream>> {
        let (tx, rx) = oneshot::channel();
        self.receive_message(Box::new(OneshotReceiver(tx)))?;
        rx.await
            .map_err(|_| RemotingError::not_open("channel dropped the receiver"))?
    }
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

struct OneshotReceiver(oneshot::Sender<Result<Option<MessageInputStream>>>);

impl Receiver for OneshotReceiver {
    fn handle_message(self: Box<Self>, _channel: Arc<dyn Channel>, message: MessageInputStream) {
        let _ = self.0.send(Ok(Some(message)));
    }

    fn handle_error(self: Box<Self>, _channel: Arc<dyn Channel>, error: RemotingError) {
        let _ = self.0.send(Err(error));
    }

    fn handle_end(self: Box<Self>, _channel: Arc<dyn Channel>) {
        let _ = self.0.send(Ok(None));
    }
}
