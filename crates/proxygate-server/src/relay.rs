//! TCP relay driving the admission and throttling core end to end.

use crate::config::ServerConfig;
use crate::listener::AdmissionListener;
use proxygate_admission::Blacklist;
use proxygate_transport::{
    BandwidthEstimator, ConnControl, ConnState, ThrottleMetrics, ThrottledListener, THROTTLE_KIND,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const FIRST_EXCHANGE_BUF: usize = 16 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct RelayContext {
    upstream_addr: String,
    throttle_on_accept: bool,
    first_read_timeout: Duration,
    blacklist: Blacklist,
    bandwidth: Mutex<BandwidthEstimator>,
}

/// Accepts admitted connections and relays each to the upstream.
pub struct Server {
    listener: AdmissionListener,
    ctx: Arc<RelayContext>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("upstream_addr", &self.ctx.upstream_addr)
            .finish()
    }
}

impl Server {
    /// Validates `config`, starts the blacklist and binds the listener.
    pub async fn bind(config: &ServerConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let blacklist = Blacklist::start(config.blacklist.clone())?;
        let listener = ThrottledListener::bind(config.listen_addr, config.throttle.clone()).await?;
        let bandwidth = BandwidthEstimator::new(&config.estimator)?;

        Ok(Self {
            listener: AdmissionListener::new(listener, blacklist.clone()),
            ctx: Arc::new(RelayContext {
                upstream_addr: config.upstream_addr.clone(),
                throttle_on_accept: config.throttle_on_accept,
                first_read_timeout: config.blacklist.max_idle_time(),
                blacklist,
                bandwidth: Mutex::new(bandwidth),
            }),
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The admission blacklist.
    pub fn blacklist(&self) -> &Blacklist {
        &self.ctx.blacklist
    }

    /// Throttle counters across all connections.
    pub fn throttle_metrics(&self) -> Arc<ThrottleMetrics> {
        Arc::clone(self.listener.throttle_metrics())
    }

    /// Smoothed relay throughput in bytes per second, 0 before any sample.
    pub fn bandwidth_estimate(&self) -> f64 {
        self.ctx.estimate()
    }

    /// Serves connections until the listener fails permanently.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            listen_addr = %self.local_addr()?,
            upstream_addr = %self.ctx.upstream_addr,
            "relay listening"
        );
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Err(e) = ctx.relay(conn, peer).await {
                    debug!(%peer, error = %e, "relay ended with error");
                }
            });
        }
    }
}

impl RelayContext {
    async fn relay<S>(&self, mut conn: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + ConnControl + Unpin,
    {
        if self.throttle_on_accept {
            conn.control_message(THROTTLE_KIND, &Value::from("enable"));
        }
        conn.on_state(ConnState::New);
        let result = self.exchange(&mut conn, peer).await;
        conn.on_state(ConnState::Closed);
        result
    }

    async fn exchange<S>(&self, conn: &mut S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + ConnControl + Unpin,
    {
        let started = Instant::now();

        // No upstream connection until the client has sent something. A
        // client silent past the idle limit stays a failure candidate for the
        // idle sweep.
        let mut buf = vec![0u8; FIRST_EXCHANGE_BUF];
        let sent = match tokio::time::timeout(self.first_read_timeout, conn.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                debug!(%peer, "no data before idle timeout, closing");
                return Ok(());
            }
        };
        if sent == 0 {
            return Ok(());
        }
        conn.on_state(ConnState::Active);

        let mut upstream = TcpStream::connect(&self.upstream_addr).await?;
        upstream.write_all(&buf[..sent]).await?;

        // The peer counts as legitimate once the upstream has answered its
        // first bytes.
        let received = upstream.read(&mut buf).await?;
        if received == 0 {
            return Ok(());
        }
        conn.write_all(&buf[..received]).await?;
        self.blacklist.succeed(peer.ip());

        let (up, down) = tokio::io::copy_bidirectional(conn, &mut upstream).await?;

        let total = (sent as u64 + up + received as u64 + down) as f64;
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.record_bandwidth(total, total / elapsed);
        }
        debug!(%peer, bytes_up = sent as u64 + up, bytes_down = received as u64 + down, "relay finished");
        Ok(())
    }

    fn record_bandwidth(&self, bytes: f64, bytes_per_sec: f64) {
        let mut bandwidth = self.bandwidth.lock().unwrap_or_else(PoisonError::into_inner);
        bandwidth.update(bytes, bytes_per_sec);
        debug!(estimate_bytes_per_sec = bandwidth.estimate(), "bandwidth estimate updated");
    }

    fn estimate(&self) -> f64 {
        self.bandwidth.lock().unwrap_or_else(PoisonError::into_inner).estimate()
    }
}
