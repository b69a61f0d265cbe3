//! Message streams
//!
//! A message is a bounded in-memory pipe with exactly one writer and at most
//! one reader. Bytes arrive in order. A writer that cancels (or is dropped
//! before closing) leaves every byte already written readable and then fails
//! the reader with [`RemotingError::MessageCancelled`] instead of reporting
//! end-of-message.

use super::window::MessagePermit;
use crate::error::RemotingError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default per-message buffer for in-process pipes
pub const DEFAULT_PIPE_BUFFER: usize = 8192;

#[derive(Debug)]
struct PipeState {
    buffer: VecDeque<u8>,
    capacity: usize,
    eof: bool,
    cancelled: bool,
    reader_closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl PipeState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Create a connected message pipe buffering at most `capacity` bytes
pub fn message_pipe(capacity: usize) -> (MessageOutputStream, MessageInputStream) {
    let state = Arc::new(Mutex::new(PipeState {
        buffer: VecDeque::with_capacity(capacity.min(DEFAULT_PIPE_BUFFER)),
        capacity: capacity.max(1),
        eof: false,
        cancelled: false,
        reader_closed: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        MessageOutputStream {
            state: Arc::clone(&state),
            finished: false,
            permit: None,
            max_size: None,
            written: 0,
        },
        MessageInputStream {
            state,
            closed: false,
        },
    )
}

/// Writing half of a message
#[derive(Debug)]
pub struct MessageOutputStream {
    state: Arc<Mutex<PipeState>>,
    finished: bool,
    permit: Option<MessagePermit>,
    max_size: Option<u64>,
    written: u64,
}

impl MessageOutputStream {
    /// Hold `permit` until the message finishes
    pub(crate) fn with_permit(mut self, permit: MessagePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    /// Fail writes that would exceed `max_size` bytes
    pub(crate) fn with_max_size(mut self, max_size: Option<u64>) -> Self {
        self.max_size = max_size;
        self
    }

    /// ID allocated from the channel's message window, if any
    pub fn message_id(&self) -> Option<u16> {
        self.permit.as_ref().map(MessagePermit::id)
    }

    /// Abort the message. The reader sees the bytes written so far and then
    /// a cancellation error. No-op once the message is closed or cancelled.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.permit = None;
        let mut state = self.state.lock();
        state.cancelled = true;
        state.wake_reader();
    }

    /// Finish the message. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.permit = None;
        let mut state = self.state.lock();
        state.eof = true;
        state.wake_reader();
    }
}

impl AsyncWrite for MessageOutputStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.finished {
            return Poll::Ready(Err(RemotingError::not_open("message already finished").into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if let Some(max) = self.max_size {
            if self.written + buf.len() as u64 > max {
                self.cancel();
                return Poll::Ready(Err(RemotingError::protocol(format!(
                    "message exceeds maximum size of {max} bytes"
                ))
                .into()));
            }
        }
        let accepted = {
            let mut state = self.state.lock();
            if state.reader_closed {
                // Nobody will read the rest; discard it.
                buf.len()
            } else {
                let space = state.capacity - state.buffer.len();
                if space == 0 {
                    state.write_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                let n = space.min(buf.len());
                state.buffer.extend(&buf[..n]);
                state.wake_reader();
                n
            }
        };
        self.written += accepted as u64;
        Poll::Ready(Ok(accepted))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.finish();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MessageOutputStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Reading half of a message
#[derive(Debug)]
pub struct MessageInputStream {
    state: Arc<Mutex<PipeState>>,
    closed: bool,
}

impl MessageInputStream {
    /// Stop reading and discard unread bytes. Reports a cancellation the
    /// first time if the writer cancelled; later calls succeed.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.state.lock();
        state.reader_closed = true;
        state.buffer.clear();
        state.wake_writer();
        if state.cancelled && !state.eof {
            return Err(RemotingError::MessageCancelled.into());
        }
        Ok(())
    }
}

impl AsyncRead for MessageInputStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(RemotingError::not_open("message stream closed").into()));
        }
        let mut state = self.state.lock();
        if !state.buffer.is_empty() {
            let n = buf.remaining().min(state.buffer.len());
            let (front, back) = state.buffer.as_slices();
            let from_front = n.min(front.len());
            buf.put_slice(&front[..from_front]);
            if n > from_front {
                buf.put_slice(&back[..n - from_front]);
            }
            state.buffer.drain(..n);
            state.wake_writer();
            return Poll::Ready(Ok(()));
        }
        if state.cancelled {
            return Poll::Ready(Err(RemotingError::MessageCancelled.into()));
        }
        if state.eof {
            return Poll::Ready(Ok(()));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for MessageInputStream {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.reader_closed = true;
        state.buffer.clear();
        state.wake_writer();
    }
}
