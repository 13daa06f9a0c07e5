//! LAN discovery: UDP multicast announcements out, validated observations in.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::wire::MAX_DATAGRAM_LEN;
use lanchat_core::{Announcer, Identity, Millis, PacketFilter};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::now_millis;

/// Announcer and listener sharing one multicast socket.
pub struct DiscoveryEngine {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryEngine {
    /// Bind the discovery port and join the multicast group (TTL 1: this subnet only).
    pub async fn bind(config: &Config) -> std::io::Result<Self> {
        let socket = make_multicast_socket(config.discovery_port, config.multicast_group).await?;
        info!(
            group = %config.multicast_group,
            port = config.discovery_port,
            "Discovery socket bound"
        );
        Ok(Self::with_socket(
            socket,
            SocketAddr::V4(SocketAddrV4::new(config.multicast_group, config.discovery_port)),
            Duration::from_millis(config.announce_interval_ms.max(1)),
        ))
    }

    /// Engine over an already bound socket, announcing to `group`.
    fn with_socket(socket: UdpSocket, group: SocketAddr, interval: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            group,
            interval,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Send one announcement now and then every interval.
    pub fn start_announcing(&mut self, mut announcer: Announcer) {
        let socket = self.socket.clone();
        let group = self.group;
        let mut interval = tokio::time::interval(self.interval);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let bytes = match announcer.next_datagram(now_millis()) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(error = %e, "Cannot encode announcement");
                                continue;
                            }
                        };
                        match socket.send_to(&bytes, group).await {
                            Ok(n) => trace!(bytes = n, "Announcement sent"),
                            Err(e) => warn!(error = %e, "Failed to send announcement"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Announcer shutting down");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Call `on_observed` for every valid, non-duplicate announcement from another instance.
    pub fn start_listening<F>(&mut self, mut filter: PacketFilter, on_observed: F)
    where
        F: Fn(Identity, Millis) + Send + Sync + 'static,
    {
        let socket = self.socket.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN + 1];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((n, from)) => match filter.accept(&buf[..n]) {
                                Ok(Some(identity)) => on_observed(identity, now_millis()),
                                Ok(None) => {}
                                Err(e) => debug!(source = %from, error = %e, "Dropping discovery packet"),
                            },
                            Err(e) => {
                                warn!(error = %e, "Error receiving discovery packet");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Discovery listener shutting down");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// End both loops and release the socket.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Discovery stopped");
    }
}

async fn make_multicast_socket(port: u16, group: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// IPv4 address of the interface holding the default route, if any. No packet is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}
