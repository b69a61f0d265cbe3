//! Outbound message window
//!
//! Limits the number of concurrently open outbound messages on a channel and
//! hands each one a random message ID that is unique among the open ones.

use crate::error::{RemotingError, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Largest message ID; IDs occupy 15 bits
pub const MAX_MESSAGE_ID: u16 = 0x7fff;

/// Counting window plus message-ID allocator
#[derive(Debug)]
pub struct MessageWindow {
    permits: Arc<Semaphore>,
    ids: Arc<Mutex<HashSet<u16>>>,
    max_id: u16,
    retries: u32,
}

/// One slot of the window; releases its ID and slot on drop
pub struct MessagePermit {
    id: u16,
    ids: Arc<Mutex<HashSet<u16>>>,
    _slot: OwnedSemaphorePermit,
}

impl MessagePermit {
    /// Allocated message ID
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl fmt::Debug for MessagePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePermit").field("id", &self.id).finish()
    }
}

impl Drop for MessagePermit {
    fn drop(&mut self) {
        self.ids.lock().remove(&self.id);
    }
}

impl MessageWindow {
    /// Window admitting `size` open messages, trying `retries` random IDs
    pub fn new(size: u32, retries: u32) -> Self {
        Self::with_id_space(size, retries, MAX_MESSAGE_ID)
    }

    /// Window drawing IDs from `0..=max_id`
    pub fn with_id_space(size: u32, retries: u32, max_id: u16) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size as usize)),
            ids: Arc::new(Mutex::new(HashSet::new())),
            max_id,
            retries: retries.max(1),
        }
    }

    /// Wait for a free slot and allocate an ID.
    ///
    /// Fails with `NotOpen` once the window is closed and with `ChannelBusy`
    /// if no free ID turns up within the retry budget.
    pub async fn acquire(&self) -> Result<MessagePermit> {
        let slot = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RemotingError::not_open("channel closed for writing"))?;
        let id = self.allocate_id()?;
        Ok(MessagePermit {
            id,
            ids: Arc::clone(&self.ids),
            _slot: slot,
        })
    }

    fn allocate_id(&self) -> Result<u16> {
        let mut rng = rand::thread_rng();
        let mut ids = self.ids.lock();
        for _ in 0..self.retries {
            let candidate = rng.gen_range(0..=self.max_id);
            if ids.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(RemotingError::channel_busy("no free message ID"))
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Number of messages currently holding an ID
    pub fn open_messages(&self) -> usize {
        self.ids.lock().len()
    }

    /// Fail all current and future waiters with `NotOpen`
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_window_limits_open_messages() {
        let window = Arc::new(MessageWindow::new(2, 16));
        let first = window.acquire().await.unwrap();
        let second = window.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(window.available(), 0);

        let waiting = Arc::clone(&window);
        let third = tokio::spawn(async move { waiting.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        drop(first);
        let third = third.await.unwrap().unwrap();
        assert_eq!(window.open_messages(), 2);
        drop(third);
        drop(second);
        assert_eq!(window.open_messages(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_id_space_is_busy() {
        let window = MessageWindow::with_id_space(4, 8, 0);
        let _only = window.acquire().await.unwrap();
        let err = window.acquire().await.unwrap_err();
        assert!(err.is_busy());
        // The failed attempt must not leak its slot.
        assert_eq!(window.available(), 3);
    }

    #[tokio::test]
    async fn test_closed_window_rejects_waiters() {
        let window = MessageWindow::new(1, 4);
        let _held = window.acquire().await.unwrap();
        window.close();
        assert!(matches!(
            window.acquire().await,
            Err(RemotingError::NotOpen { .. })
        ));
    }
}
