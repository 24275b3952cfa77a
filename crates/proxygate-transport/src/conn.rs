//! Throttled connection wrapper and the control-message chain.

use crate::metrics::ThrottleMetrics;
use crate::ratelimit::{RateLimiter, ThrottleConfig};
use crate::throttle::{ThrottleControl, ThrottleHandle, ThrottleState, THROTTLE_KIND};
use pin_project_lite::pin_project;
use serde_json::Value;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Lifecycle of a served connection, as reported by the server loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Accepted, no bytes read yet.
    New,
    /// A request is being read or served.
    Active,
    /// Between requests.
    Idle,
    /// Taken over by a handler that owns the raw stream from now on.
    Hijacked,
    /// Closed.
    Closed,
}

/// Out-of-band signalling for layered connection wrappers.
///
/// Each layer handles the messages it understands and forwards every message
/// to the layer it wraps, so independent consumers can be stacked on one
/// physical connection. The defaults ignore everything, which is the right
/// behaviour for a raw stream at the bottom of the stack.
pub trait ConnControl {
    /// Delivers a control message of `kind` with an arbitrary payload.
    fn control_message(&self, kind: &str, payload: &Value) {
        let _ = (kind, payload);
    }

    /// Notifies a lifecycle transition.
    fn on_state(&self, state: ConnState) {
        let _ = state;
    }
}

impl ConnControl for TcpStream {}

impl ConnControl for DuplexStream {}

impl<T: ConnControl + ?Sized> ConnControl for Box<T> {
    fn control_message(&self, kind: &str, payload: &Value) {
        (**self).control_message(kind, payload)
    }

    fn on_state(&self, state: ConnState) {
        (**self).on_state(state)
    }
}

pin_project! {
    /// A connection that moves bytes at a capped rate while its throttle is `On`.
    ///
    /// Reads and writes go straight to the wrapped stream in every other state;
    /// the choice is a single atomic load per call.
    pub struct ThrottledConn<S> {
        #[pin]
        inner: S,
        control: Arc<ThrottleControl>,
        reader: RateLimiter,
        writer: RateLimiter,
    }
}

impl<S> std::fmt::Debug for ThrottledConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledConn")
            .field("state", &self.control.state())
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

impl<S> ThrottledConn<S> {
    /// Wraps `inner` in state `Off`, with one limiter per direction.
    ///
    /// `config` is expected to be validated; a zero rate is treated as one
    /// byte per second.
    pub fn new(inner: S, config: &ThrottleConfig, metrics: Arc<ThrottleMetrics>) -> Self {
        Self {
            inner,
            control: Arc::new(ThrottleControl::new(metrics)),
            reader: RateLimiter::new(config),
            writer: RateLimiter::new(config),
        }
    }

    /// Handle for signalling this connection from other tasks.
    pub fn throttle_handle(&self) -> ThrottleHandle {
        ThrottleHandle::new(Arc::clone(&self.control))
    }

    /// Current throttle state.
    pub fn throttle_state(&self) -> ThrottleState {
        self.control.state()
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// The wrapped stream, mutably.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwraps the stream, dropping the throttle.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ConnControl> ConnControl for ThrottledConn<S> {
    fn control_message(&self, kind: &str, payload: &Value) {
        if kind == THROTTLE_KIND {
            self.control.handle_payload(payload);
        }
        self.inner.control_message(kind, payload);
    }

    fn on_state(&self, state: ConnState) {
        self.inner.on_state(state);
    }
}

impl<S: AsyncRead> AsyncRead for ThrottledConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.control.is_throttled() || buf.remaining() == 0 {
            return this.inner.poll_read(cx, buf);
        }

        let allowed = ready!(this.reader.poll_allowance(cx, buf.remaining()));
        let n = {
            let unfilled = buf.initialize_unfilled_to(allowed);
            let mut limited = ReadBuf::new(unfilled);
            ready!(this.inner.poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        buf.advance(n);
        this.reader.consume(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite> AsyncWrite for ThrottledConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if !this.control.is_throttled() || buf.is_empty() {
            return this.inner.poll_write(cx, buf);
        }

        let allowed = ready!(this.writer.poll_allowance(cx, buf.len()));
        let n = ready!(this.inner.poll_write(cx, &buf[..allowed]))?;
        this.writer.consume(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
