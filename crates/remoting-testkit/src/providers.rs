//! Connection providers for tests

use parking_lot::Mutex;
use remoting::provider::LocalConnectionProviderFactory;
use remoting::{
    CancelHandle, Cancellable, Channel, ChannelOptions, ConnectRequest, ConnectionHandler,
    ConnectionHandlerContext, ConnectionHandlerFactory, ConnectionProvider, ConnectionProviderContext,
    ConnectionProviderFactory, FutureResult, Principal, RemotingError, Result,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

struct Counting {
    connects: AtomicUsize,
    cancels: AtomicUsize,
    gate: watch::Sender<bool>,
}

/// Local provider that counts connects and can hold them until released
#[derive(Clone)]
pub struct CountingProviderFactory {
    shared: Arc<Counting>,
}

impl CountingProviderFactory {
    /// Connects proceed immediately
    pub fn new() -> Self {
        Self::with_gate(true)
    }

    /// Connects wait for [`release`](Self::release)
    pub fn gated() -> Self {
        Self::with_gate(false)
    }

    fn with_gate(open: bool) -> Self {
        let (gate, _) = watch::channel(open);
        Self {
            shared: Arc::new(Counting {
                connects: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                gate,
            }),
        }
    }

    /// Let held and future connects proceed
    pub fn release(&self) {
        self.shared.gate.send_replace(true);
    }

    /// Connects requested so far
    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Connects whose cancel handle has run
    pub fn cancels(&self) -> usize {
        self.shared.cancels.load(Ordering::SeqCst)
    }
}

impl Default for CountingProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionProviderFactory for CountingProviderFactory {
    fn create_provider(&self, context: ConnectionProviderContext) -> Result<Arc<dyn ConnectionProvider>> {
        let executor = context.executor().clone();
        let inner = LocalConnectionProviderFactory.create_provider(context)?;
        Ok(Arc::new(CountingProvider {
            inner,
            shared: Arc::clone(&self.shared),
            executor,
        }))
    }
}

struct CountingProvider {
    inner: Arc<dyn ConnectionProvider>,
    shared: Arc<Counting>,
    executor: Handle,
}

impl ConnectionProvider for CountingProvider {
    fn connect(
        &self,
        request: &ConnectRequest,
        result: FutureResult<Arc<dyn ConnectionHandlerFactory>>,
    ) -> CancelHandle {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.shared.gate.subscribe();
        let inner = Arc::clone(&self.inner);
        let request = request.clone();
        let producer = result.clone();
        let started: Arc<Mutex<Option<CancelHandle>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&started);
        let shared = Arc::clone(&self.shared);
        let task = self.executor.spawn(async move {
            let _ = gate.wait_for(|open| *open).await;
            let cancel = inner.connect(&request, producer);
            *slot.lock() = Some(cancel);
        });
        CancelHandle::new(move || {
            shared.cancels.fetch_add(1, Ordering::SeqCst);
            task.abort();
            if let Some(cancel) = started.lock().as_ref() {
                cancel.cancel();
            }
            result.set_cancelled();
        })
    }

    fn close(&self) {
        self.inner.close();
    }
}

/// A frame sent by a recording connection handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Auth request
    Request {
        /// Negotiation ID
        id: u32,
        /// Mechanism name
        mechanism: String,
        /// Initial response
        initial: Option<Vec<u8>>,
    },
    /// Auth response
    Response {
        /// Negotiation ID
        id: u32,
        /// Response bytes
        response: Vec<u8>,
    },
    /// Auth challenge
    Challenge {
        /// Negotiation ID
        id: u32,
        /// Challenge bytes
        challenge: Vec<u8>,
    },
    /// Auth success
    Success {
        /// Negotiation ID
        id: u32,
        /// Final challenge
        challenge: Option<Vec<u8>>,
    },
    /// Auth reject
    Reject {
        /// Negotiation ID
        id: u32,
    },
    /// Auth delete
    Delete {
        /// Negotiation ID
        id: u32,
    },
    /// Auth delete acknowledgement
    DeleteAck {
        /// Negotiation ID
        id: u32,
    },
    /// Channel open request
    Open {
        /// Service name
        service: String,
        /// Identity the channel was opened as
        identity: u32,
    },
    /// Handler closed
    Closed,
}

/// Frames sent by recording handlers, in order
pub struct Recorder {
    tx: mpsc::UnboundedSender<Frame>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn record(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    /// Next frame; panics after five seconds
    pub async fn next_frame(&self) -> Frame {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("recorder closed")
    }

    /// Next frame if one arrives within `wait`
    pub async fn try_next_frame(&self, wait: Duration) -> Option<Frame> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(wait, rx.recv()).await.ok().flatten()
    }
}

struct Settings {
    mechanisms: Vec<String>,
    remote_auth: bool,
}

/// Provider whose connections send nothing anywhere and record every frame
#[derive(Clone)]
pub struct RecordingProviderFactory {
    recorder: Arc<Recorder>,
    settings: Arc<Settings>,
}

impl RecordingProviderFactory {
    /// Peers offering `mechanisms` for identity switching
    pub fn new<I, S>(mechanisms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            recorder: Recorder::new(),
            settings: Arc::new(Settings {
                mechanisms: mechanisms.into_iter().map(Into::into).collect(),
                remote_auth: true,
            }),
        }
    }

    /// Frames recorded by every connection of this provider
    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }
}

impl ConnectionProviderFactory for RecordingProviderFactory {
    fn create_provider(&self, _context: ConnectionProviderContext) -> Result<Arc<dyn ConnectionProvider>> {
        Ok(Arc::new(self.clone()))
    }
}

impl ConnectionProvider for RecordingProviderFactory {
    fn connect(
        &self,
        _request: &ConnectRequest,
        result: FutureResult<Arc<dyn ConnectionHandlerFactory>>,
    ) -> CancelHandle {
        result.set_result(Arc::new(self.clone()));
        CancelHandle::noop()
    }
}

impl ConnectionHandlerFactory for RecordingProviderFactory {
    fn create_handler(&self, _context: Arc<ConnectionHandlerContext>) -> Arc<dyn ConnectionHandler> {
        Arc::new(RecordingHandler {
            recorder: Arc::clone(&self.recorder),
            settings: Arc::clone(&self.settings),
        })
    }
}

struct RecordingHandler {
    recorder: Arc<Recorder>,
    settings: Arc<Settings>,
}

impl ConnectionHandler for RecordingHandler {
    fn open(
        &self,
        service_type: &str,
        identity_id: u32,
        result: FutureResult<Arc<dyn Channel>>,
        _options: &ChannelOptions,
    ) -> CancelHandle {
        self.recorder.record(Frame::Open {
            service: service_type.to_string(),
            identity: identity_id,
        });
        result.set_exception(RemotingError::ServiceNotFound {
            service: service_type.to_string(),
        });
        CancelHandle::noop()
    }

    fn offered_mechanisms(&self) -> Vec<String> {
        self.settings.mechanisms.clone()
    }

    fn supports_remote_auth(&self) -> bool {
        self.settings.remote_auth
    }

    fn connection_principal(&self) -> Principal {
        Principal::Anonymous
    }

    fn send_auth_request(&self, id: u32, mechanism: &str, initial_response: Option<&[u8]>) -> Result<()> {
        self.recorder.record(Frame::Request {
            id,
            mechanism: mechanism.to_string(),
            initial: initial_response.map(<[u8]>::to_vec),
        });
        Ok(())
    }

    fn send_auth_response(&self, id: u32, response: &[u8]) -> Result<()> {
        self.recorder.record(Frame::Response {
            id,
            response: response.to_vec(),
        });
        Ok(())
    }

    fn send_auth_challenge(&self, id: u32, challenge: &[u8]) -> Result<()> {
        self.recorder.record(Frame::Challenge {
            id,
            challenge: challenge.to_vec(),
        });
        Ok(())
    }

    fn send_auth_success(&self, id: u32, challenge: Option<&[u8]>) -> Result<()> {
        self.recorder.record(Frame::Success {
            id,
            challenge: challenge.map(<[u8]>::to_vec),
        });
        Ok(())
    }

    fn send_auth_reject(&self, id: u32) -> Result<()> {
        self.recorder.record(Frame::Reject { id });
        Ok(())
    }

    fn send_auth_delete(&self, id: u32) -> Result<()> {
        self.recorder.record(Frame::Delete { id });
        Ok(())
    }

    fn send_auth_delete_ack(&self, id: u32) -> Result<()> {
        self.recorder.record(Frame::DeleteAck { id });
        Ok(())
    }

    fn close(&self) {
        self.recorder.record(Frame::Closed);
    }
}
