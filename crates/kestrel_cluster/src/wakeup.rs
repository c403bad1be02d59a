//! UDP wakeup channel: a best-effort "run your reconciler now" hint that
//! cuts median convergence latency below the 1 s tick.
//!
//! Correctness never depends on delivery. Packets are tiny JSON datagrams;
//! the listener validates the cluster name and drops self-sent packets;
//! the in-process signal is a one-slot channel where an already-pending
//! wakeup absorbs new ones.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use kestrel_common::error::KestrelError;

/// Largest datagram we accept or send.
pub const MAX_DATAGRAM: usize = 1024;

const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// On-wire wakeup packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupPacket {
    pub cluster_name: String,
    pub sender_node: String,
}

/// Sends and receives wakeup packets for one daemon. Clones share the
/// same signal channel, so both reconciler loops can broadcast.
#[derive(Clone)]
pub struct WakeupManager {
    port: u16,
    cluster_name: String,
    node_name: String,
    tx: mpsc::Sender<()>,
}

/// A running listener task plus the address it actually bound (the
/// configured port may be 0 in tests).
pub struct WakeupListener {
    pub local_addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

impl WakeupManager {
    /// Create the manager and the receiver half of the wakeup signal. The
    /// channel holds one pending wakeup; further signals are dropped until
    /// the reconciler drains it.
    pub fn new(
        port: u16,
        cluster_name: impl Into<String>,
        node_name: impl Into<String>,
    ) -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                port,
                cluster_name: cluster_name.into(),
                node_name: node_name.into(),
                tx,
            },
            rx,
        )
    }

    /// Bind the UDP socket and spawn the listener task. A bind failure is
    /// fatal to the daemon; everything after that is best-effort.
    pub async fn start_listener(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WakeupListener, KestrelError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| {
                KestrelError::Internal(format!("failed to bind wakeup UDP port {}: {e}", self.port))
            })?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| KestrelError::Internal(format!("wakeup socket address: {e}")))?;
        tracing::info!(%local_addr, "Wakeup listener started");

        let cluster_name = self.cluster_name.clone();
        let node_name = self.node_name.clone();
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let (len, from) = match result {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::warn!(%err, "Error reading wakeup packet");
                                continue;
                            }
                        };
                        handle_packet(&buf[..len], from, &cluster_name, &node_name, &tx);
                    }
                    changed = shutdown.changed() => {
                        // A dropped sender also means the daemon is gone.
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Wakeup listener shutting down");
                            return;
                        }
                    }
                }
            }
        });

        Ok(WakeupListener { local_addr, handle })
    }

    /// Fire a wakeup packet at every peer, each on its own task with a 1 s
    /// deadline. Failures are logged and ignored.
    pub fn broadcast(&self, peer_hostnames: Vec<String>) {
        let packet = WakeupPacket {
            cluster_name: self.cluster_name.clone(),
            sender_node: self.node_name.clone(),
        };
        let payload = match serde_json::to_vec(&packet) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, "Failed to encode wakeup packet");
                return;
            }
        };

        for host in peer_hostnames {
            if host.is_empty() {
                continue;
            }
            let payload = payload.clone();
            let target = format!("{host}:{}", self.port);
            tokio::spawn(async move {
                match tokio::time::timeout(SEND_TIMEOUT, send_to(&target, &payload)).await {
                    Ok(Ok(())) => {
                        kestrel_observability::record_wakeup_sent();
                        tracing::debug!(peer = %target, "Sent wakeup");
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(peer = %target, %err, "Failed to send wakeup");
                    }
                    Err(_) => {
                        tracing::debug!(peer = %target, "Wakeup send timed out");
                    }
                }
            });
        }
    }
}

fn handle_packet(
    raw: &[u8],
    from: SocketAddr,
    cluster_name: &str,
    node_name: &str,
    tx: &mpsc::Sender<()>,
) {
    let packet: WakeupPacket = match serde_json::from_slice(raw) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::warn!(%from, %err, "Failed to decode wakeup packet");
            return;
        }
    };
    if packet.cluster_name != cluster_name {
        tracing::warn!(
            %from,
            sender = %packet.sender_node,
            cluster = %packet.cluster_name,
            "Ignoring wakeup packet for a different cluster"
        );
        return;
    }
    if packet.sender_node == node_name {
        tracing::warn!(%from, "Ignoring wakeup packet from ourselves");
        return;
    }
    // A full slot means a wakeup is already pending; dropping is correct.
    if tx.try_send(()).is_ok() {
        kestrel_observability::record_wakeup_received();
        tracing::debug!(sender = %packet.sender_node, "Wakeup received");
    }
}

async fn send_to(target: &str, payload: &[u8]) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.send_to(payload, target).await?;
    Ok(())
}
