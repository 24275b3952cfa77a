//! Listener that hands out throttled connections.

use crate::conn::ThrottledConn;
use crate::error::Result;
use crate::metrics::ThrottleMetrics;
use crate::ratelimit::ThrottleConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

/// Wraps every accepted stream in a [`ThrottledConn`] sharing one rate ceiling.
#[derive(Debug)]
pub struct ThrottledListener {
    inner: TcpListener,
    config: ThrottleConfig,
    metrics: Arc<ThrottleMetrics>,
}

impl ThrottledListener {
    /// Wraps an already bound listener.
    pub fn new(inner: TcpListener, config: ThrottleConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            metrics: Arc::new(ThrottleMetrics::new()),
        })
    }

    /// Binds a new listener on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs, config: ThrottleConfig) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Self::new(inner, config)
    }

    /// Accepts the next connection, unthrottled until told otherwise.
    pub async fn accept(&self) -> io::Result<(ThrottledConn<TcpStream>, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;
        debug!(%peer, "accepted connection");
        Ok((self.wrap(stream), peer))
    }

    /// Accepts connections until `admit` approves one.
    ///
    /// Refused streams are dropped, and so closed, before anything is read
    /// from them or a throttle is allocated.
    pub async fn accept_filtered<F>(&self, mut admit: F) -> io::Result<(ThrottledConn<TcpStream>, SocketAddr)>
    where
        F: FnMut(&SocketAddr) -> bool,
    {
        loop {
            let (stream, peer) = self.inner.accept().await?;
            if admit(&peer) {
                debug!(%peer, "accepted connection");
                return Ok((self.wrap(stream), peer));
            }
            debug!(%peer, "refused connection");
            drop(stream);
        }
    }

    /// Wraps a stream accepted elsewhere with this listener's settings.
    pub fn wrap<S>(&self, stream: S) -> ThrottledConn<S> {
        ThrottledConn::new(stream, &self.config, Arc::clone(&self.metrics))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Throttle counters aggregated over every connection of this listener.
    pub fn metrics(&self) -> &Arc<ThrottleMetrics> {
        &self.metrics
    }

    /// Rate settings applied to accepted connections.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }
}
