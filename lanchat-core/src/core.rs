//! Host-driven API: ChatCore receives observations, frames, ticks and file I/O
//! completions from the host and returns actions.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::chunk::ChunkRange;
use crate::channel::{Message, MessageChannel};
use crate::config::CoreConfig;
use crate::error::{Error, NetworkError, ProtocolError, ResourceError};
use crate::event::Event;
use crate::identity::{Identity, SessionSummary};
use crate::protocol::{Frame, TransferId, PROTOCOL_VERSION};
use crate::registry::{PeerRecord, SessionRegistry};
use crate::transfer::{FileTransfer, TransferEngine};
use crate::wire;
use crate::Millis;

/// Host-assigned id of one stream connection, inbound or outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Which traffic an outgoing connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Messages,
    Transfer(TransferId),
}

/// One outgoing connection: a peer and a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub peer: SocketAddr,
    pub lane: Lane,
}

impl Link {
    pub fn messages(peer: SocketAddr) -> Self {
        Self {
            peer,
            lane: Lane::Messages,
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Write an encoded frame on the link, connecting (and sending hello) first if needed.
    Send(Link, Vec<u8>),
    /// Write an encoded frame back on the connection a frame arrived on.
    Reply(ConnectionId, Vec<u8>),
    /// Close the link once queued frames are flushed.
    Close(Link),
    /// Read `range` of the transfer's source file, then call `on_chunk_read`.
    ReadChunk { transfer_id: TransferId, range: ChunkRange },
    /// Create the destination for an incoming transfer, then call `on_sink_ready`.
    OpenSink {
        transfer_id: TransferId,
        file_name: String,
        total_bytes: u64,
    },
    /// Store a verified chunk, then call `on_chunk_written`.
    WriteChunk {
        transfer_id: TransferId,
        range: ChunkRange,
        payload: Vec<u8>,
    },
    /// All chunks stored: move the destination into place, then call `on_sink_finished`.
    FinishSink { transfer_id: TransferId },
    /// Incoming transfer ended without completing: remove the partial destination.
    DiscardSink { transfer_id: TransferId },
    /// Publish an event to subscribers.
    Emit(Event),
}

/// Encode `frame` for `link`. Encode failures are logged and produce no action.
pub fn send_frame(link: Link, frame: &Frame) -> Option<OutboundAction> {
    match wire::encode_frame(frame) {
        Ok(bytes) => Some(OutboundAction::Send(link, bytes)),
        Err(e) => {
            warn!(peer = %link.peer, error = %e, "Failed to encode frame");
            None
        }
    }
}

/// Encode `frame` as a reply on `conn`.
pub fn reply_frame(conn: ConnectionId, frame: &Frame) -> Option<OutboundAction> {
    match wire::encode_frame(frame) {
        Ok(bytes) => Some(OutboundAction::Reply(conn, bytes)),
        Err(e) => {
            warn!(conn = conn.0, error = %e, "Failed to encode reply");
            None
        }
    }
}

/// First frame on every connection: names the connector's listen address.
pub fn hello_frame(address: SocketAddr) -> Result<Vec<u8>, ProtocolError> {
    Ok(wire::encode_frame(&Frame::Hello {
        protocol_version: PROTOCOL_VERSION,
        address,
    })?)
}

/// Validate the first frame of an inbound connection and return the peer's address.
pub fn parse_hello(bytes: &[u8]) -> Result<SocketAddr, ProtocolError> {
    match wire::decode_frame(bytes)?.0 {
        Frame::Hello {
            protocol_version,
            address,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(ProtocolError::Version(protocol_version));
            }
            if address.ip().is_unspecified() || address.port() == 0 {
                return Err(ProtocolError::InvalidAddress(address));
            }
            Ok(address)
        }
        _ => Err(ProtocolError::MissingHello),
    }
}

/// Main coordinator. Host passes events; core returns actions.
pub struct ChatCore {
    identity: Identity,
    registry: SessionRegistry,
    channel: MessageChannel,
    transfers: TransferEngine,
    ended: bool,
}

impl ChatCore {
    pub fn new(identity: Identity, config: CoreConfig) -> Self {
        info!(
            name = %identity.display_name,
            device = %identity.device_label,
            address = %identity.address,
            "Session started"
        );
        Self {
            registry: SessionRegistry::new(config.liveness),
            channel: MessageChannel::new(identity.address, config.messages),
            transfers: TransferEngine::new(
                config.chunk_size,
                config.chunk_ack_timeout,
                config.chunk_retries,
            ),
            identity,
            ended: false,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// A validated discovery announcement arrived.
    pub fn observe(&mut self, identity: Identity, observed_at: Millis) -> Vec<OutboundAction> {
        if self.ended || identity.address == self.identity.address {
            return vec![];
        }
        let peer = identity.address;
        let mut actions: Vec<OutboundAction> = self
            .registry
            .observe(identity, observed_at)
            .into_iter()
            .map(OutboundAction::Emit)
            .collect();
        actions.extend(self.transfers.on_peer_seen(peer, observed_at));
        actions
    }

    /// Known peers, oldest first, excluding ourselves.
    pub fn peer_list(&self) -> Vec<PeerRecord> {
        self.registry.list_peers(self.identity.address)
    }

    pub fn send_message(
        &mut self,
        target: SocketAddr,
        body: &str,
        now: Millis,
    ) -> Result<(Message, Vec<OutboundAction>), Error> {
        if self.ended {
            return Err(Error::SessionEnded);
        }
        Ok(self.channel.send(target, body, now)?)
    }

    /// Start sending a file the host has already opened and sized.
    pub fn start_transfer(
        &mut self,
        target: SocketAddr,
        file_name: &str,
        total_bytes: u64,
        now: Millis,
    ) -> Result<(FileTransfer, Vec<OutboundAction>), Error> {
        if self.ended {
            return Err(Error::SessionEnded);
        }
        Ok(self.transfers.start(target, file_name, total_bytes, now)?)
    }

    pub fn pause_transfer(&mut self, id: TransferId) -> Result<FileTransfer, Error> {
        self.transfers.pause(id)
    }

    pub fn resume_transfer(
        &mut self,
        id: TransferId,
        now: Millis,
    ) -> Result<(FileTransfer, Vec<OutboundAction>), Error> {
        if self.ended {
            return Err(Error::SessionEnded);
        }
        self.transfers.resume(id, now)
    }

    pub fn cancel_transfer(&mut self, id: TransferId) -> Result<(FileTransfer, Vec<OutboundAction>), Error> {
        self.transfers.cancel(id)
    }

    pub fn transfer(&self, id: &TransferId) -> Option<FileTransfer> {
        self.transfers.get(id)
    }

    pub fn transfers(&self) -> Vec<FileTransfer> {
        self.transfers.snapshot()
    }

    /// Messages not yet Delivered or Failed.
    pub fn pending_messages(&self) -> usize {
        self.channel.pending()
    }

    /// Process one frame received from `from` on `conn`.
    pub fn on_frame(
        &mut self,
        conn: ConnectionId,
        from: SocketAddr,
        bytes: &[u8],
        now: Millis,
    ) -> Result<Vec<OutboundAction>, ProtocolError> {
        let (frame, _consumed) = wire::decode_frame(bytes)?;
        if self.ended {
            debug!(peer = %from, "Session ended, dropping frame");
            return Ok(vec![]);
        }
        let actions = match frame {
            Frame::Hello { .. } => {
                debug!(peer = %from, "Ignoring repeated hello");
                vec![]
            }
            Frame::Text {
                message_id,
                body,
                sent_at,
            } => self.channel.on_text(conn, from, message_id, body, sent_at),
            Frame::TextAck { message_id } => self.channel.on_ack(from, message_id, now),
            Frame::TransferOffer {
                transfer_id,
                file_name,
                total_bytes,
                chunk_size,
            } => self
                .transfers
                .on_offer(conn, from, transfer_id, &file_name, total_bytes, chunk_size),
            Frame::TransferAccept {
                transfer_id,
                next_sequence,
            } => self.transfers.on_accept(from, transfer_id, next_sequence),
            Frame::ChunkData {
                transfer_id,
                sequence,
                checksum,
                payload,
            } => self
                .transfers
                .on_chunk_data(conn, from, transfer_id, sequence, checksum, payload),
            Frame::ChunkAck {
                transfer_id,
                sequence,
            } => self.transfers.on_chunk_ack(from, transfer_id, sequence),
            Frame::ChunkNack {
                transfer_id,
                sequence,
            } => self.transfers.on_chunk_nack(from, transfer_id, sequence, now),
            Frame::TransferCancel {
                transfer_id,
                reason,
            } => self.transfers.on_cancel(from, transfer_id, &reason),
        };
        Ok(actions)
    }

    /// An outgoing link could not be established or dropped.
    pub fn on_link_lost(&mut self, link: Link, now: Millis) -> Vec<OutboundAction> {
        match link.lane {
            Lane::Messages => self.channel.on_link_lost(link.peer, now),
            Lane::Transfer(id) => self.transfers.on_link_lost(id, now),
        }
    }

    /// An inbound connection closed.
    pub fn on_connection_closed(&mut self, conn: ConnectionId) {
        self.transfers.on_connection_closed(conn);
    }

    pub fn on_chunk_read(
        &mut self,
        id: TransferId,
        sequence: u64,
        payload: Vec<u8>,
        now: Millis,
    ) -> Vec<OutboundAction> {
        self.transfers.on_chunk_read(id, sequence, payload, now)
    }

    pub fn on_chunk_read_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        self.transfers.on_chunk_read_failed(id, error)
    }

    pub fn on_sink_ready(&mut self, id: TransferId) -> Vec<OutboundAction> {
        self.transfers.on_sink_ready(id)
    }

    pub fn on_sink_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        self.transfers.on_sink_failed(id, error)
    }

    pub fn on_chunk_written(&mut self, id: TransferId, sequence: u64) -> Vec<OutboundAction> {
        self.transfers.on_chunk_written(id, sequence)
    }

    pub fn on_chunk_write_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        self.transfers.on_chunk_write_failed(id, error)
    }

    pub fn on_sink_finished(&mut self, id: TransferId) -> Vec<OutboundAction> {
        self.transfers.on_sink_finished(id)
    }

    pub fn on_sink_finish_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        self.transfers.on_sink_finish_failed(id, error)
    }

    /// Periodic tick: peer liveness, message retries, chunk retries.
    pub fn tick(&mut self, now: Millis) -> Vec<OutboundAction> {
        if self.ended {
            return vec![];
        }
        let mut actions = Vec::new();
        for event in self.registry.tick(now) {
            if let Event::PeerLeft(record) = &event {
                let evicted = record.address();
                actions.push(OutboundAction::Emit(event));
                actions.extend(self.transfers.on_peer_evicted(evicted));
            } else {
                actions.push(OutboundAction::Emit(event));
            }
        }
        actions.extend(self.channel.tick(now));
        actions.extend(self.transfers.tick(now));
        actions
    }

    /// End the session: pending messages fail, running transfers are cancelled.
    /// Later calls return the same summary shape and no actions.
    pub fn logout(&mut self, now: Millis) -> (SessionSummary, Vec<OutboundAction>) {
        let summary = self.identity.summary(now);
        if self.ended {
            return (summary, vec![]);
        }
        self.ended = true;
        let mut actions = self.channel.fail_all(NetworkError::SessionEnded);
        actions.extend(self.transfers.shutdown());
        info!(
            name = %summary.user,
            duration_ms = summary.duration_ms,
            "Session ended"
        );
        (summary, actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DeliveryState;
    use crate::registry::PeerStatus;
    use crate::transfer::TransferState;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Side {
        A,
        B,
    }

    fn identity(name: &str, addr: &str) -> Identity {
        Identity::login(name, "Laptop", "My Device", addr.parse().unwrap(), "linux-x86_64", 0).unwrap()
    }

    fn config() -> CoreConfig {
        CoreConfig {
            chunk_size: 16,
            ..CoreConfig::default()
        }
    }

    /// Two cores wired back to back with an in-memory file on each end.
    struct Net {
        a: ChatCore,
        b: ChatCore,
        source: Vec<u8>,
        sink: Vec<u8>,
        events: Vec<(Side, Event)>,
        /// Drop frames A sends while set.
        partition: bool,
    }

    impl Net {
        fn new(source: Vec<u8>) -> Self {
            Self {
                a: ChatCore::new(identity("Alice", "192.168.1.10:45681"), config()),
                b: ChatCore::new(identity("Bob", "192.168.1.11:45681"), config()),
                source,
                sink: Vec::new(),
                events: Vec::new(),
                partition: false,
            }
        }

        fn run(&mut self, side: Side, actions: Vec<OutboundAction>, now: Millis) {
            let mut queue: VecDeque<(Side, OutboundAction)> =
                actions.into_iter().map(|a| (side, a)).collect();
            while let Some((side, action)) = queue.pop_front() {
                let (here, there, other) = match side {
                    Side::A => (&mut self.a, &mut self.b, Side::B),
                    Side::B => (&mut self.b, &mut self.a, Side::A),
                };
                let (next, more) = match action {
                    OutboundAction::Send(_, bytes) | OutboundAction::Reply(_, bytes) => {
                        if self.partition && side == Side::A {
                            continue;
                        }
                        let from = here.identity().address;
                        (other, there.on_frame(ConnectionId(1), from, &bytes, now).unwrap())
                    }
                    OutboundAction::ReadChunk { transfer_id, range } => {
                        let start = range.offset as usize;
                        let data = self.source[start..start + range.len as usize].to_vec();
                        (side, here.on_chunk_read(transfer_id, range.sequence, data, now))
                    }
                    OutboundAction::OpenSink { transfer_id, total_bytes, .. } => {
                        self.sink = vec![0; total_bytes as usize];
                        (side, here.on_sink_ready(transfer_id))
                    }
                    OutboundAction::WriteChunk {
                        transfer_id,
                        range,
                        payload,
                    } => {
                        let start = range.offset as usize;
                        self.sink[start..start + payload.len()].copy_from_slice(&payload);
                        (side, here.on_chunk_written(transfer_id, range.sequence))
                    }
                    OutboundAction::Emit(event) => {
                        self.events.push((side, event));
                        continue;
                    }
                    OutboundAction::FinishSink { transfer_id } => (side, here.on_sink_finished(transfer_id)),
                    OutboundAction::Close(_) | OutboundAction::DiscardSink { .. } => continue,
                };
                queue.extend(more.into_iter().map(|a| (next, a)));
            }
        }

        fn events_on(&self, side: Side) -> Vec<&Event> {
            self.events
                .iter()
                .filter(|(s, _)| *s == side)
                .map(|(_, e)| e)
                .collect()
        }
    }

    fn bob_addr() -> SocketAddr {
        "192.168.1.11:45681".parse().unwrap()
    }

    #[test]
    fn hello_round_trip_and_validation() {
        let addr: SocketAddr = "192.168.1.10:45681".parse().unwrap();
        assert_eq!(parse_hello(&hello_frame(addr).unwrap()).unwrap(), addr);

        let text = wire::encode_frame(&Frame::TextAck {
            message_id: crate::protocol::MessageId::new(),
        })
        .unwrap();
        assert!(matches!(parse_hello(&text), Err(ProtocolError::MissingHello)));

        let old = wire::encode_frame(&Frame::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            address: addr,
        })
        .unwrap();
        assert!(matches!(parse_hello(&old), Err(ProtocolError::Version(_))));
    }

    #[test]
    fn message_delivered_end_to_end() {
        let mut net = Net::new(vec![]);
        let (msg, actions) = net.a.send_message(bob_addr(), "hello bob", 1_000).unwrap();
        assert_eq!(msg.delivery_state, DeliveryState::Pending);
        net.run(Side::A, actions, 1_000);

        match &net.events_on(Side::B)[..] {
            [Event::MessageReceived(m)] => {
                assert_eq!(m.body, "hello bob");
                assert_eq!(m.id, msg.id);
                assert_eq!(m.sender_address, net.a.identity().address);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            net.events_on(Side::A)[..],
            [Event::MessageDelivered { message_id }] if *message_id == msg.id
        ));
        assert_eq!(net.a.pending_messages(), 0);
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let mut net = Net::new(vec![]);
        let mut actions = Vec::new();
        for body in ["one", "two", "three"] {
            actions.extend(net.a.send_message(bob_addr(), body, 0).unwrap().1);
        }
        net.run(Side::A, actions, 0);
        let bodies: Vec<&str> = net
            .events_on(Side::B)
            .into_iter()
            .filter_map(|e| match e {
                Event::MessageReceived(m) => Some(m.body.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[test]
    fn file_transfer_end_to_end() {
        use rand::RngCore;
        let mut source = vec![0u8; 100];
        rand::thread_rng().fill_bytes(&mut source);
        let mut net = Net::new(source.clone());
        let (t, actions) = net.a.start_transfer(bob_addr(), "data.bin", 100, 0).unwrap();
        assert_eq!(t.chunk_size, 16);
        net.run(Side::A, actions, 0);

        assert_eq!(net.sink, source);
        let sent = net.a.transfer(&t.id).unwrap();
        assert_eq!(sent.state, TransferState::Completed);
        assert_eq!(sent.bytes_transferred, 100);
        let received = net.b.transfer(&t.id).unwrap();
        assert_eq!(received.state, TransferState::Completed);
        assert_eq!(received.file_name, "data.bin");

        let progress: Vec<u64> = net
            .events_on(Side::A)
            .into_iter()
            .filter_map(|e| match e {
                Event::TransferProgress { bytes_transferred, .. } => Some(*bytes_transferred),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![16, 32, 48, 64, 80, 96, 100]);
        assert!(net
            .events_on(Side::B)
            .iter()
            .any(|e| matches!(e, Event::TransferOffered(_))));
    }

    #[test]
    fn interrupted_transfer_resumes_when_peer_returns() {
        let source: Vec<u8> = (0..64u8).collect();
        let mut net = Net::new(source.clone());
        let (t, actions) = net.a.start_transfer(bob_addr(), "data.bin", 64, 0).unwrap();

        // Offer lost; the dedicated connection then drops.
        net.partition = true;
        net.run(Side::A, actions, 0);
        let link = Link {
            peer: bob_addr(),
            lane: Lane::Transfer(t.id),
        };
        net.a.on_link_lost(link, 100);
        assert_eq!(net.a.transfer(&t.id).unwrap().state, TransferState::Paused);

        net.partition = false;
        let bob = net.b.identity().clone();
        let actions = net.a.observe(bob, 5_000);
        net.run(Side::A, actions, 5_000);
        assert_eq!(net.a.transfer(&t.id).unwrap().state, TransferState::Completed);
        assert_eq!(net.sink, source);
    }

    #[test]
    fn eviction_fails_paused_transfer() {
        let mut net = Net::new(vec![1; 40]);
        let bob = net.b.identity().clone();
        net.a.observe(bob, 0);
        let (t, actions) = net.a.start_transfer(bob_addr(), "data.bin", 40, 0).unwrap();
        net.partition = true;
        net.run(Side::A, actions, 0);
        net.a.pause_transfer(t.id).unwrap();

        let actions = net.a.tick(100_001);
        let kinds: Vec<&str> = actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Emit(Event::PeerUpdated(_)) => Some("updated"),
                OutboundAction::Emit(Event::PeerLeft(_)) => Some("left"),
                OutboundAction::Emit(Event::TransferFailed { .. }) => Some("failed"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["updated", "updated", "left", "failed"]);
        assert_eq!(net.a.transfer(&t.id).unwrap().state, TransferState::Failed);
    }

    #[test]
    fn observe_tracks_peers_but_not_self() {
        let mut net = Net::new(vec![]);
        let me = net.a.identity().clone();
        assert!(net.a.observe(me, 0).is_empty());
        let bob = net.b.identity().clone();
        let actions = net.a.observe(bob, 0);
        assert!(matches!(actions[..], [OutboundAction::Emit(Event::PeerJoined(_))]));
        let peers = net.a.peer_list();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].status, PeerStatus::Online);
    }

    #[test]
    fn logout_fails_pending_and_blocks_new_work() {
        let mut net = Net::new(vec![]);
        let (m1, _) = net.a.send_message(bob_addr(), "first", 0).unwrap();
        let (m2, _) = net.a.send_message(bob_addr(), "second", 0).unwrap();
        let (summary, actions) = net.a.logout(60_000);
        assert_eq!(summary.user, "Alice");
        assert_eq!(summary.duration_ms, 60_000);
        let failed: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Emit(Event::MessageFailed { message_id, .. }) => Some(*message_id),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![m1.id, m2.id]);
        assert!(matches!(
            net.a.send_message(bob_addr(), "late", 61_000),
            Err(Error::SessionEnded)
        ));
        assert!(net.a.logout(62_000).1.is_empty());
    }

    #[test]
    fn garbage_frame_is_protocol_error() {
        let mut net = Net::new(vec![]);
        let from = net.b.identity().address;
        assert!(net.a.on_frame(ConnectionId(3), from, &[9, 0, 0, 0, 1], 0).is_err());
    }
}
