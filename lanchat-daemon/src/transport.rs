//! Stream transport: TCP listener (inbound), lazily opened outbound links, hello handshake
//! and length-prefixed frames.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::core::{hello_frame, parse_hello};
use lanchat_core::wire::{frame_len, header_len};
use lanchat_core::{ChatCore, ConnectionId, Link};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::ActionSender;
use crate::now_millis;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

struct LinkHandle {
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Owns every stream connection of one session.
pub struct Transport {
    local: SocketAddr,
    core: Arc<Mutex<ChatCore>>,
    actions: ActionSender,
    next_conn: AtomicU64,
    /// Outgoing connections, one per link.
    links: Mutex<HashMap<Link, LinkHandle>>,
    /// Inbound connections, for replies.
    inbound: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Bind the transport listener on all interfaces. Port 0 picks a free port.
pub async fn bind_listener(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
}

impl Transport {
    pub fn new(local: SocketAddr, core: Arc<Mutex<ChatCore>>, actions: ActionSender) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            local,
            core,
            actions,
            next_conn: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    fn next_conn(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Accept inbound connections until shutdown.
    pub fn start_accepting(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let transport = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let transport = transport.clone();
                            tokio::spawn(async move { transport.run_inbound(stream, remote).await });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Transport listener shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Queue `bytes` on `link`, connecting first if the link is not open.
    pub async fn send(self: &Arc<Self>, link: Link, bytes: Vec<u8>) {
        let mut links = self.links.lock().await;
        let bytes = match links.get(&link) {
            Some(handle) => match handle.tx.send(bytes) {
                Ok(()) => return,
                Err(mpsc::error::SendError(bytes)) => {
                    links.remove(&link);
                    bytes
                }
            },
            None => bytes,
        };
        let conn = self.next_conn();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(bytes);
        links.insert(link, LinkHandle { conn, tx });
        drop(links);

        let transport = self.clone();
        tokio::spawn(async move { transport.run_outbound(link, conn, rx).await });
    }

    /// Queue `bytes` on an inbound connection.
    pub async fn reply(&self, conn: ConnectionId, bytes: Vec<u8>) {
        match self.inbound.lock().await.get(&conn) {
            Some(tx) => {
                let _ = tx.send(bytes);
            }
            None => debug!(conn = conn.0, "Reply for closed connection dropped"),
        }
    }

    /// Flush and close an outgoing link.
    pub async fn close(&self, link: Link) {
        if self.links.lock().await.remove(&link).is_some() {
            debug!(peer = %link.peer, lane = ?link.lane, "Closing link");
        }
    }

    /// Stop accepting and close every connection after its queued frames are written.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.links.lock().await.clear();
        self.inbound.lock().await.clear();
        info!(address = %self.local, "Transport shut down");
    }

    async fn run_outbound(self: Arc<Self>, link: Link, conn: ConnectionId, rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let stream = match self.connect(link.peer).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %link.peer, lane = ?link.lane, error = %e, "Connection failed");
                self.link_lost(link, conn).await;
                return;
            }
        };
        debug!(peer = %link.peer, lane = ?link.lane, conn = conn.0, "Link open");
        let (reader, writer) = stream.into_split();
        tokio::spawn(write_loop(writer, rx));
        self.read_loop(reader, conn, link.peer).await;
        self.link_lost(link, conn).await;
    }

    async fn connect(&self, peer: SocketAddr) -> io::Result<TcpStream> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        let hello = hello_frame(self.local).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stream.write_all(&hello).await?;
        Ok(stream)
    }

    async fn run_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let (mut reader, writer) = stream.into_split();
        let peer = match tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut reader)).await {
            Ok(Ok(Some(frame))) => match parse_hello(&frame) {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(remote = %remote, error = %e, "Rejecting connection");
                    return;
                }
            },
            _ => {
                debug!(remote = %remote, "Connection closed before hello");
                return;
            }
        };
        let conn = self.next_conn();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound.lock().await.insert(conn, tx);
        debug!(peer = %peer, remote = %remote, conn = conn.0, "Inbound connection");
        tokio::spawn(write_loop(writer, rx));

        self.read_loop(reader, conn, peer).await;

        self.inbound.lock().await.remove(&conn);
        self.core.lock().await.on_connection_closed(conn);
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, conn: ConnectionId, peer: SocketAddr) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, conn = conn.0, error = %e, "Read failed");
                    break;
                }
            };
            let result = self.core.lock().await.on_frame(conn, peer, &frame, now_millis());
            match result {
                Ok(actions) => self.actions.dispatch(actions),
                Err(e) => debug!(peer = %peer, error = %e, "Dropping frame"),
            }
        }
    }

    async fn link_lost(&self, link: Link, conn: ConnectionId) {
        {
            let mut links = self.links.lock().await;
            if links.get(&link).is_some_and(|h| h.conn == conn) {
                links.remove(&link);
            }
        }
        let actions = self.core.lock().await.on_link_lost(link, now_millis());
        self.actions.dispatch(actions);
    }
}

/// Read one whole frame (length prefix included). Ok(None) on clean EOF.
async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Option<Vec<u8>>> {
    let mut frame = vec![0u8; header_len()];
    match reader.read_exact(&mut frame).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = frame_len(&frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    frame.resize(header_len() + len, 0);
    reader.read_exact(&mut frame[header_len()..]).await?;
    Ok(Some(frame))
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "Write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
