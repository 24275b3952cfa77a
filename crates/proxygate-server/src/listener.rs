//! Accept loop front end: blacklist check first, throttle wrapper second.

use proxygate_admission::Blacklist;
use proxygate_transport::{ThrottleMetrics, ThrottledConn, ThrottledListener};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// A listener that only hands out connections from admitted IPs.
///
/// Connections from blacklisted IPs are closed as soon as they are accepted,
/// before any byte is read from them.
#[derive(Debug)]
pub struct AdmissionListener {
    listener: ThrottledListener,
    blacklist: Blacklist,
}

impl AdmissionListener {
    /// Combines a throttled listener with a running blacklist.
    pub fn new(listener: ThrottledListener, blacklist: Blacklist) -> Self {
        Self { listener, blacklist }
    }

    /// Waits for the next admitted connection.
    pub async fn accept(&self) -> io::Result<(ThrottledConn<TcpStream>, SocketAddr)> {
        let blacklist = &self.blacklist;
        self.listener
            .accept_filtered(|peer| blacklist.on_connect(peer.ip()))
            .await
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The blacklist consulted for every connection.
    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    /// Throttle counters of every connection handed out.
    pub fn throttle_metrics(&self) -> &Arc<ThrottleMetrics> {
        self.listener.metrics()
    }
}
