//! In-process channel pair
//!
//! Writing on one side enqueues into the peer's bounded queue, or hands the
//! message straight to the peer's idle receiver when one is waiting. A full
//! queue parks the writer until the peer takes a message or either side
//! shuts down.

use super::message::{message_pipe, MessageInputStream, MessageOutputStream, DEFAULT_PIPE_BUFFER};
use super::window::MessageWindow;
use super::{Channel, Receiver};
use crate::attachments::Attachments;
use crate::closeable::{close_async, CloseTracker, HandleableCloseable};
use crate::config::ChannelOptions;
use crate::error::{RemotingError, Result};
use crate::sasl::Principal;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::trace;

enum Delivery {
    Message(Box<dyn Receiver>, MessageInputStream),
    End(Box<dyn Receiver>),
}

struct Inbound {
    queue: VecDeque<MessageInputStream>,
    capacity: usize,
    receiver: Option<Box<dyn Receiver>>,
    /// Peer will send no more messages
    shutdown: bool,
    /// This side is closed
    closed: bool,
}

/// Receive side of one channel, shared with the writing peer
struct Side {
    inbound: Mutex<Inbound>,
    space: Notify,
    owner: OnceCell<Weak<LocalChannel>>,
}

impl Side {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(Inbound {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                receiver: None,
                shutdown: false,
                closed: false,
            }),
            space: Notify::new(),
            owner: OnceCell::new(),
        })
    }

    fn owner(&self) -> Option<Arc<LocalChannel>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    fn deliver(&self, delivery: Delivery) {
        let Some(channel) = self.owner() else {
            return;
        };
        let executor = channel.tracker.executor().clone();
        let channel: Arc<dyn Channel> = channel;
        executor.spawn(async move {
            match delivery {
                Delivery::Message(receiver, message) => receiver.handle_message(channel, message),
                Delivery::End(receiver) => receiver.handle_end(channel),
            }
        });
    }
}

/// One end of an in-process channel
pub struct LocalChannel {
    tracker: CloseTracker,
    attachments: Attachments,
    options: ChannelOptions,
    own: Arc<Side>,
    peer: Arc<Side>,
    window: MessageWindow,
    write_shut: AtomicBool,
    peer_principal: Option<Principal>,
}

impl LocalChannel {
    /// Create two connected channels.
    ///
    /// `first_peer` is the principal the first channel reports for its peer,
    /// `second_peer` likewise for the second channel.
    pub fn pair(
        options: ChannelOptions,
        executor: Handle,
        first_peer: Option<Principal>,
        second_peer: Option<Principal>,
    ) -> (Arc<Self>, Arc<Self>) {
        let first_side = Side::new(options.local_queue_capacity);
        let second_side = Side::new(options.local_queue_capacity);
        let first = Self::new(
            &options,
            executor.clone(),
            Arc::clone(&first_side),
            Arc::clone(&second_side),
            first_peer,
        );
        let second = Self::new(&options, executor, second_side, first_side, second_peer);
        (first, second)
    }

    fn new(
        options: &ChannelOptions,
        executor: Handle,
        own: Arc<Side>,
        peer: Arc<Side>,
        peer_principal: Option<Principal>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            tracker: CloseTracker::new("local channel", executor),
            attachments: Attachments::new(),
            options: options.clone(),
            window: MessageWindow::new(options.outbound_window, options.message_id_retries),
            own,
            peer,
            write_shut: AtomicBool::new(false),
            peer_principal,
        });
        let _ = channel.own.owner.set(Arc::downgrade(&channel));
        channel
    }

    /// Number of messages waiting in this side's queue
    pub fn queued_messages(&self) -> usize {
        self.own.inbound.lock().queue.len()
    }

    fn new_message(&self) -> (MessageOutputStream, MessageInputStream) {
        let (out, input) = message_pipe(DEFAULT_PIPE_BUFFER);
        (out.with_max_size(self.options.max_outbound_message_size), input)
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn write_message(&self) -> Result<MessageOutputStream> {
        self.tracker.check_open()?;
        if self.write_shut.load(Ordering::Acquire) {
            return Err(RemotingError::not_open("channel write side is shut down"));
        }
        let permit = self.window.acquire().await?;
        loop {
            let notified = self.peer.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivery = {
                let mut inbound = self.peer.inbound.lock();
                if inbound.closed || inbound.shutdown || !self.tracker.is_open() {
                    return Err(RemotingError::not_open("channel closed for writing"));
                }
                if let Some(receiver) = inbound.receiver.take() {
                    // An idle receiver implies an empty queue; hand off directly.
                    let (out, input) = self.new_message();
                    Some((receiver, out, input))
                } else if inbound.queue.len() < inbound.capacity {
                    let (out, input) = self.new_message();
                    inbound.queue.push_back(input);
                    trace!(queued = inbound.queue.len(), "message queued");
                    return Ok(out.with_permit(permit));
                } else {
                    None
                }
            };
            if let Some((receiver, out, input)) = delivery {
                self.peer.deliver(Delivery::Message(receiver, input));
                return Ok(out.with_permit(permit));
            }
            notified.await;
        }
    }

    fn write_shutdown(&self) -> Result<()> {
        if self.write_shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let idle = {
            let mut inbound = self.peer.inbound.lock();
            inbound.shutdown = true;
            if inbound.queue.is_empty() {
                inbound.receiver.take()
            } else {
                None
            }
        };
        if let Some(receiver) = idle {
            self.peer.deliver(Delivery::End(receiver));
        }
        self.peer.space.notify_waiters();
        Ok(())
    }

    fn receive_message(&self, receiver: Box<dyn Receiver>) -> Result<()> {
        let delivery = {
            let mut inbound = self.own.inbound.lock();
            if inbound.receiver.is_some() {
                return Err(RemotingError::illegal_state(
                    "a receiver is already registered",
                ));
            }
            if let Some(message) = inbound.queue.pop_front() {
                Delivery::Message(receiver, message)
            } else if inbound.shutdown || inbound.closed {
                Delivery::End(receiver)
            } else {
                inbound.receiver = Some(receiver);
                return Ok(());
            }
        };
        if matches!(delivery, Delivery::Message(..)) {
            self.own.space.notify_waiters();
        }
        self.own.deliver(delivery);
        Ok(())
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    fn options(&self) -> &ChannelOptions {
        &self.options
    }

    fn peer_principal(&self) -> Option<Principal> {
        self.peer_principal.clone()
    }
}

#[async_trait]
impl HandleableCloseable for LocalChannel {
    fn close_tracker(&self) -> &CloseTracker {
        &self.tracker
    }

    async fn close_action(&self) -> Result<()> {
        self.write_shutdown()?;
        let (dropped, idle) = {
            let mut inbound = self.own.inbound.lock();
            inbound.closed = true;
            (
                std::mem::take(&mut inbound.queue),
                inbound.receiver.take(),
            )
        };
        drop(dropped);
        if let Some(receiver) = idle {
            self.own.deliver(Delivery::End(receiver));
        }
        self.own.space.notify_waiters();
        self.window.close();
        self.tracker.close_complete(None);
        if let Some(peer) = self.peer.owner() {
            close_async(peer);
        }
        Ok(())
    }
}
