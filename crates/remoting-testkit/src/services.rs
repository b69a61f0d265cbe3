//! Service listeners

use parking_lot::Mutex;
use remoting::{Channel, OpenListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Hands every accepted channel to the test
pub struct ChannelCollector {
    tx: mpsc::UnboundedSender<Arc<dyn Channel>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn Channel>>>,
    terminated: AtomicBool,
}

impl ChannelCollector {
    /// Empty collector
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            terminated: AtomicBool::new(false),
        })
    }

    /// Next accepted channel; panics after five seconds
    pub async fn next(&self) -> Arc<dyn Channel> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an inbound channel")
            .expect("collector closed")
    }

    /// Whether the registration was closed
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl OpenListener for ChannelCollector {
    fn channel_opened(&self, channel: Arc<dyn Channel>) {
        let _ = self.tx.send(channel);
    }

    fn registration_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Writes every inbound message straight back as a new message
#[derive(Default)]
pub struct EchoService {
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl EchoService {
    /// New echo service
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Drop for EchoService {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl OpenListener for EchoService {
    fn channel_opened(&self, channel: Arc<dyn Channel>) {
        let task = tokio::spawn(async move {
            while let Ok(Some(mut message)) = channel.next_message().await {
                let mut body = Vec::new();
                if message.read_to_end(&mut body).await.is_err() {
                    break;
                }
                let Ok(mut reply) = channel.write_message().await else {
                    break;
                };
                if reply.write_all(&body).await.is_err() || reply.shutdown().await.is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().push(task);
    }
}
