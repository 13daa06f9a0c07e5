//! File transfer engine: chunked, acknowledged, resumable transfers in both directions.
//!
//! The sender runs stop-and-wait over a dedicated connection: one chunk in flight,
//! `bytes_transferred` advanced only by the receiver's ack. Resuming re-offers the
//! transfer and continues from the sequence number the receiver asks for. File bytes
//! never pass through here directly; the host reads and writes them and reports back.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunk::{chunk_data_frame, ChunkLayout, ChunkRange};
use crate::core::{reply_frame, send_frame, ConnectionId, Lane, Link, OutboundAction};
use crate::error::{Error, NetworkError, ProtocolError, ResourceError, ValidationError};
use crate::event::Event;
use crate::integrity;
use crate::protocol::{Frame, TransferId};
use crate::Millis;

/// Largest chunk size a receiver accepts.
pub const MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// How long a finished transfer stays visible in snapshots before it is dropped.
pub const FINISHED_RETENTION: Millis = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferState {
    Initiating,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Snapshot of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileTransfer {
    pub id: TransferId,
    pub direction: Direction,
    pub file_name: String,
    pub total_bytes: u64,
    pub chunk_size: u64,
    /// Target for outgoing transfers, sender for incoming ones.
    pub peer_address: SocketAddr,
    pub bytes_transferred: u64,
    pub state: TransferState,
}

#[derive(Debug)]
struct InFlightChunk {
    sequence: u64,
    payload: Vec<u8>,
    deadline: Millis,
    attempts: u32,
}

#[derive(Debug)]
struct Outgoing {
    info: FileTransfer,
    layout: ChunkLayout,
    /// First sequence not yet acknowledged.
    next_sequence: u64,
    in_flight: Option<InFlightChunk>,
    /// Sequence of a read requested from the host and not yet returned.
    reading: Option<u64>,
    offer_deadline: Option<Millis>,
    offer_attempts: u32,
    /// Paused by a lost connection rather than by the user.
    interrupted: bool,
    /// Connection losses since the last acknowledged chunk or user resume.
    link_failures: u32,
    /// When an interrupted transfer retries on its own if the peer is not seen first.
    reconnect_at: Option<Millis>,
    ended_at: Option<Millis>,
}

impl Outgoing {
    fn link(&self) -> Link {
        Link {
            peer: self.info.peer_address,
            lane: Lane::Transfer(self.info.id),
        }
    }
}

#[derive(Debug)]
struct Incoming {
    info: FileTransfer,
    layout: ChunkLayout,
    conn: Option<ConnectionId>,
    next_sequence: u64,
    sink_ready: bool,
    writing: Option<u64>,
    /// Last chunk stored; waiting for the host to move the file into place.
    finishing: bool,
    ended_at: Option<Millis>,
}

/// Owner of every FileTransfer.
pub struct TransferEngine {
    chunk_size: u64,
    ack_timeout: Millis,
    max_retries: u32,
    outgoing: HashMap<TransferId, Outgoing>,
    incoming: HashMap<TransferId, Incoming>,
}

impl TransferEngine {
    pub fn new(chunk_size: u64, ack_timeout: Millis, max_retries: u32) -> Self {
        Self {
            chunk_size,
            ack_timeout,
            max_retries,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn get(&self, id: &TransferId) -> Option<FileTransfer> {
        self.outgoing
            .get(id)
            .map(|t| t.info.clone())
            .or_else(|| self.incoming.get(id).map(|t| t.info.clone()))
    }

    /// All transfers, outgoing first.
    pub fn snapshot(&self) -> Vec<FileTransfer> {
        self.outgoing
            .values()
            .map(|t| t.info.clone())
            .chain(self.incoming.values().map(|t| t.info.clone()))
            .collect()
    }

    // ---- sender side ----

    /// Begin sending `file_name` (`total_bytes` long) to `target`. Returns the transfer in
    /// Initiating state; the offer goes out on a dedicated connection.
    pub fn start(
        &mut self,
        target: SocketAddr,
        file_name: &str,
        total_bytes: u64,
        now: Millis,
    ) -> Result<(FileTransfer, Vec<OutboundAction>), ValidationError> {
        let file_name = sanitize_file_name(file_name).ok_or(ValidationError::FileNameMissing)?;
        if total_bytes == 0 {
            return Err(ValidationError::EmptyFile);
        }
        let layout = ChunkLayout::new(total_bytes, self.chunk_size);
        let info = FileTransfer {
            id: TransferId::new(),
            direction: Direction::Outgoing,
            file_name,
            total_bytes,
            chunk_size: layout.chunk_size(),
            peer_address: target,
            bytes_transferred: 0,
            state: TransferState::Initiating,
        };
        info!(
            transfer = %info.id,
            peer = %target,
            file = %info.file_name,
            bytes = total_bytes,
            chunks = layout.chunk_count(),
            "Starting transfer"
        );
        let id = info.id;
        self.outgoing.insert(
            id,
            Outgoing {
                info: info.clone(),
                layout,
                next_sequence: 0,
                in_flight: None,
                reading: None,
                offer_deadline: None,
                offer_attempts: 0,
                interrupted: false,
                link_failures: 0,
                reconnect_at: None,
                ended_at: None,
            },
        );
        let actions = self.send_offer(id, now);
        Ok((info, actions))
    }

    pub fn pause(&mut self, id: TransferId) -> Result<FileTransfer, Error> {
        let t = self.outgoing.get_mut(&id).ok_or(Error::UnknownTransfer)?;
        match t.info.state {
            TransferState::Initiating | TransferState::InProgress => {
                t.info.state = TransferState::Paused;
                t.offer_deadline = None;
                t.interrupted = false;
                t.reconnect_at = None;
                info!(transfer = %id, bytes = t.info.bytes_transferred, "Transfer paused");
                Ok(t.info.clone())
            }
            TransferState::Paused => {
                t.interrupted = false;
                t.reconnect_at = None;
                Ok(t.info.clone())
            }
            state => Err(Error::InvalidTransferState(state, "paused")),
        }
    }

    /// User resume. Starts a fresh connection retry budget.
    pub fn resume(&mut self, id: TransferId, now: Millis) -> Result<(FileTransfer, Vec<OutboundAction>), Error> {
        let ack_timeout = self.ack_timeout;
        let t = self.outgoing.get_mut(&id).ok_or(Error::UnknownTransfer)?;
        match t.info.state {
            TransferState::Paused => {}
            TransferState::Initiating | TransferState::InProgress => return Ok((t.info.clone(), vec![])),
            state => return Err(Error::InvalidTransferState(state, "resumed")),
        }
        t.link_failures = 0;
        let actions = restart(t, now, ack_timeout);
        Ok((t.info.clone(), actions))
    }

    /// Abort a transfer in either direction. Late acks, reads and writes for it become no-ops.
    pub fn cancel(&mut self, id: TransferId) -> Result<(FileTransfer, Vec<OutboundAction>), Error> {
        let cancel = Frame::TransferCancel {
            transfer_id: id,
            reason: "cancelled by sender".into(),
        };
        if let Some(t) = self.outgoing.get_mut(&id) {
            if t.info.state.is_terminal() {
                return Err(Error::InvalidTransferState(t.info.state, "cancelled"));
            }
            t.info.state = TransferState::Cancelled;
            t.in_flight = None;
            t.reading = None;
            info!(transfer = %id, "Transfer cancelled");
            let link = t.link();
            let mut actions: Vec<OutboundAction> = send_frame(link, &cancel).into_iter().collect();
            actions.push(OutboundAction::Close(link));
            return Ok((t.info.clone(), actions));
        }
        let t = self.incoming.get_mut(&id).ok_or(Error::UnknownTransfer)?;
        if t.info.state.is_terminal() {
            return Err(Error::InvalidTransferState(t.info.state, "cancelled"));
        }
        t.info.state = TransferState::Cancelled;
        t.writing = None;
        info!(transfer = %id, "Incoming transfer cancelled");
        let cancel = Frame::TransferCancel {
            transfer_id: id,
            reason: "cancelled by receiver".into(),
        };
        let mut actions: Vec<OutboundAction> = t
            .conn
            .and_then(|conn| reply_frame(conn, &cancel))
            .into_iter()
            .collect();
        actions.push(OutboundAction::DiscardSink { transfer_id: id });
        Ok((t.info.clone(), actions))
    }

    /// Receiver accepted (or re-accepted after a resume) and asks for `next_sequence`.
    pub fn on_accept(&mut self, from: SocketAddr, id: TransferId, next_sequence: u64) -> Vec<OutboundAction> {
        let Some(t) = self.outgoing.get_mut(&id) else {
            debug!(transfer = %id, "Accept for unknown transfer");
            return vec![];
        };
        if t.info.peer_address != from || t.info.state != TransferState::Initiating {
            debug!(transfer = %id, state = ?t.info.state, "Ignoring accept");
            return vec![];
        }
        let count = t.layout.chunk_count();
        t.next_sequence = next_sequence.min(count);
        t.in_flight = None;
        t.offer_deadline = None;
        t.info.state = TransferState::InProgress;
        debug!(transfer = %id, next_sequence = t.next_sequence, "Transfer accepted");
        let mut actions = Vec::new();
        let bytes = t.layout.bytes_before(t.next_sequence);
        if bytes > t.info.bytes_transferred {
            t.info.bytes_transferred = bytes;
            actions.push(progress(&t.info));
        }
        if t.next_sequence == count {
            actions.extend(complete_outgoing(t));
            return actions;
        }
        actions.extend(request_read(t));
        actions
    }

    /// The host finished reading chunk `sequence` from disk.
    pub fn on_chunk_read(&mut self, id: TransferId, sequence: u64, payload: Vec<u8>, now: Millis) -> Vec<OutboundAction> {
        let ack_timeout = self.ack_timeout;
        let Some(t) = self.outgoing.get_mut(&id) else {
            return vec![];
        };
        if t.reading == Some(sequence) {
            t.reading = None;
        }
        if t.info.state != TransferState::InProgress || t.in_flight.is_some() {
            return vec![];
        }
        if sequence != t.next_sequence {
            return request_read(t);
        }
        let expected = t.layout.range(sequence).map(|r| r.len).unwrap_or(0);
        if payload.len() as u64 != expected {
            let reason = ResourceError::Read(format!(
                "chunk {sequence} is {} bytes, expected {expected}; file changed",
                payload.len()
            ));
            return fail_outgoing(t, reason.to_string(), true);
        }
        let frame = chunk_data_frame(id, sequence, payload.clone());
        t.in_flight = Some(InFlightChunk {
            sequence,
            payload,
            deadline: now + ack_timeout,
            attempts: 0,
        });
        send_frame(t.link(), &frame).into_iter().collect()
    }

    pub fn on_chunk_read_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        match self.outgoing.get_mut(&id) {
            Some(t) if !t.info.state.is_terminal() => fail_outgoing(t, error.to_string(), true),
            _ => vec![],
        }
    }

    pub fn on_chunk_ack(&mut self, from: SocketAddr, id: TransferId, sequence: u64) -> Vec<OutboundAction> {
        let Some(t) = self.outgoing.get_mut(&id) else {
            return vec![];
        };
        if t.info.state.is_terminal() || t.info.peer_address != from {
            debug!(transfer = %id, sequence, "Ignoring late chunk ack");
            return vec![];
        }
        if t.in_flight.as_ref().map(|c| c.sequence) != Some(sequence) {
            debug!(transfer = %id, sequence, "Ignoring ack for chunk not in flight");
            return vec![];
        }
        t.in_flight = None;
        t.link_failures = 0;
        t.next_sequence = sequence + 1;
        t.info.bytes_transferred = t
            .info
            .bytes_transferred
            .max(t.layout.bytes_before(t.next_sequence));
        let mut actions = vec![progress(&t.info)];
        if t.next_sequence == t.layout.chunk_count() {
            actions.extend(complete_outgoing(t));
        } else {
            actions.extend(request_read(t));
        }
        actions
    }

    pub fn on_chunk_nack(&mut self, from: SocketAddr, id: TransferId, sequence: u64, now: Millis) -> Vec<OutboundAction> {
        let (ack_timeout, max_retries) = (self.ack_timeout, self.max_retries);
        match self.outgoing.get_mut(&id) {
            Some(t)
                if t.info.state == TransferState::InProgress
                    && t.info.peer_address == from
                    && t.in_flight.as_ref().map(|c| c.sequence) == Some(sequence) =>
            {
                warn!(transfer = %id, sequence, "Chunk rejected by receiver");
                retry_chunk(t, now, ack_timeout, max_retries)
            }
            _ => vec![],
        }
    }

    /// The dedicated connection of an outgoing transfer dropped or could not be opened.
    /// The transfer pauses and retries when the peer is seen again or after the ack
    /// timeout, whichever comes first. Each loss without an acknowledged chunk in
    /// between counts against the retry budget.
    pub fn on_link_lost(&mut self, id: TransferId, now: Millis) -> Vec<OutboundAction> {
        let (ack_timeout, max_retries) = (self.ack_timeout, self.max_retries);
        let Some(t) = self.outgoing.get_mut(&id) else {
            return vec![];
        };
        if !matches!(t.info.state, TransferState::Initiating | TransferState::InProgress) {
            return vec![];
        }
        t.link_failures += 1;
        if t.link_failures > max_retries {
            let err = NetworkError::RetriesExhausted {
                attempts: t.link_failures,
                last: Box::new(NetworkError::ConnectionFailed(t.info.peer_address)),
            };
            return fail_outgoing(t, err.to_string(), false);
        }
        t.info.state = TransferState::Paused;
        t.interrupted = true;
        t.offer_deadline = None;
        t.reconnect_at = Some(now + ack_timeout);
        warn!(
            transfer = %id,
            peer = %t.info.peer_address,
            failures = t.link_failures,
            "Transfer connection lost, paused"
        );
        vec![]
    }

    /// A peer announced itself: resume transfers its disconnect interrupted.
    pub fn on_peer_seen(&mut self, peer: SocketAddr, now: Millis) -> Vec<OutboundAction> {
        let ack_timeout = self.ack_timeout;
        let mut actions = Vec::new();
        for t in self.outgoing.values_mut() {
            if t.interrupted && t.info.state == TransferState::Paused && t.info.peer_address == peer {
                actions.extend(restart(t, now, ack_timeout));
            }
        }
        actions
    }

    /// A peer was evicted from the registry: paused transfers to it and incoming
    /// transfers from it fail.
    pub fn on_peer_evicted(&mut self, peer: SocketAddr) -> Vec<OutboundAction> {
        let reason = NetworkError::PeerEvicted(peer).to_string();
        let mut actions = Vec::new();
        for t in self.outgoing.values_mut() {
            if t.info.peer_address == peer && t.info.state == TransferState::Paused {
                actions.extend(fail_outgoing(t, reason.clone(), false));
            }
        }
        for t in self.incoming.values_mut() {
            if t.info.peer_address == peer && !t.info.state.is_terminal() {
                actions.extend(fail_incoming(t, reason.clone()));
            }
        }
        actions
    }

    // ---- receiver side ----

    /// A peer offers (or re-offers) a file.
    #[allow(clippy::too_many_arguments)]
    pub fn on_offer(
        &mut self,
        conn: ConnectionId,
        from: SocketAddr,
        id: TransferId,
        file_name: &str,
        total_bytes: u64,
        chunk_size: u64,
    ) -> Vec<OutboundAction> {
        if let Some(t) = self.incoming.get_mut(&id) {
            if t.info.peer_address != from {
                warn!(transfer = %id, peer = %from, "Offer for a transfer owned by another peer");
                return vec![];
            }
            t.conn = Some(conn);
            return match t.info.state {
                TransferState::Completed => accept_frame(conn, id, t.layout.chunk_count()),
                TransferState::Failed | TransferState::Cancelled => reply_frame(
                    conn,
                    &Frame::TransferCancel {
                        transfer_id: id,
                        reason: "transfer already ended".into(),
                    },
                )
                .into_iter()
                .collect(),
                _ => {
                    debug!(transfer = %id, next_sequence = t.next_sequence, "Transfer re-offered");
                    if t.sink_ready {
                        t.info.state = TransferState::InProgress;
                        accept_frame(conn, id, t.next_sequence)
                    } else {
                        vec![]
                    }
                }
            };
        }

        let refuse = |reason: &str| -> Vec<OutboundAction> {
            warn!(transfer = %id, peer = %from, reason, "Refusing transfer offer");
            reply_frame(
                conn,
                &Frame::TransferCancel {
                    transfer_id: id,
                    reason: reason.to_string(),
                },
            )
            .into_iter()
            .collect()
        };
        let Some(file_name) = sanitize_file_name(file_name) else {
            return refuse("invalid file name");
        };
        if total_bytes == 0 || chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return refuse("invalid size");
        }

        let layout = ChunkLayout::new(total_bytes, chunk_size);
        let info = FileTransfer {
            id,
            direction: Direction::Incoming,
            file_name: file_name.clone(),
            total_bytes,
            chunk_size,
            peer_address: from,
            bytes_transferred: 0,
            state: TransferState::Initiating,
        };
        info!(transfer = %id, peer = %from, file = %file_name, bytes = total_bytes, "Incoming transfer");
        self.incoming.insert(
            id,
            Incoming {
                info: info.clone(),
                layout,
                conn: Some(conn),
                next_sequence: 0,
                sink_ready: false,
                writing: None,
                finishing: false,
                ended_at: None,
            },
        );
        vec![
            OutboundAction::Emit(Event::TransferOffered(info)),
            OutboundAction::OpenSink {
                transfer_id: id,
                file_name,
                total_bytes,
            },
        ]
    }

    /// The host prepared the destination file.
    pub fn on_sink_ready(&mut self, id: TransferId) -> Vec<OutboundAction> {
        let Some(t) = self.incoming.get_mut(&id) else {
            return vec![];
        };
        if t.info.state.is_terminal() {
            return vec![OutboundAction::DiscardSink { transfer_id: id }];
        }
        t.sink_ready = true;
        t.info.state = TransferState::InProgress;
        match t.conn {
            Some(conn) => accept_frame(conn, id, t.next_sequence),
            None => vec![],
        }
    }

    /// The destination file could not be opened or written.
    pub fn on_sink_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        match self.incoming.get_mut(&id) {
            Some(t) if !t.info.state.is_terminal() => fail_incoming(t, error.to_string()),
            _ => vec![],
        }
    }

    pub fn on_chunk_data(
        &mut self,
        conn: ConnectionId,
        from: SocketAddr,
        id: TransferId,
        sequence: u64,
        checksum: [u8; 32],
        payload: Vec<u8>,
    ) -> Vec<OutboundAction> {
        let Some(t) = self.incoming.get_mut(&id) else {
            debug!(transfer = %id, sequence, "Chunk for unknown transfer dropped");
            return vec![];
        };
        if t.info.peer_address != from {
            return vec![];
        }
        t.conn = Some(conn);
        let ack = |sequence| {
            reply_frame(conn, &Frame::ChunkAck { transfer_id: id, sequence })
                .into_iter()
                .collect::<Vec<_>>()
        };
        match t.info.state {
            TransferState::Completed => return ack(sequence.min(t.layout.chunk_count().saturating_sub(1))),
            TransferState::Failed | TransferState::Cancelled => {
                return reply_frame(
                    conn,
                    &Frame::TransferCancel {
                        transfer_id: id,
                        reason: "transfer already ended".into(),
                    },
                )
                .into_iter()
                .collect();
            }
            _ => {}
        }
        if sequence < t.next_sequence {
            debug!(transfer = %id, sequence, "Duplicate chunk re-acknowledged");
            return ack(sequence);
        }
        if t.writing == Some(sequence) || t.finishing || !t.sink_ready {
            return vec![];
        }
        if sequence > t.next_sequence {
            let err = ProtocolError::UnexpectedSequence {
                expected: t.next_sequence,
                got: sequence,
            };
            debug!(transfer = %id, error = %err, "Out-of-order chunk dropped");
            return vec![];
        }
        let Some(range) = t.layout.range(sequence) else {
            return vec![];
        };
        let verified = if payload.len() as u64 != range.len {
            Err(ProtocolError::ChunkLength {
                expected: range.len,
                got: payload.len() as u64,
            })
        } else {
            integrity::verify(&payload, &checksum)
        };
        if let Err(err) = verified {
            warn!(transfer = %id, sequence, error = %err, "Rejecting chunk");
            return reply_frame(conn, &Frame::ChunkNack { transfer_id: id, sequence })
                .into_iter()
                .collect();
        }
        t.info.state = TransferState::InProgress;
        t.writing = Some(sequence);
        vec![OutboundAction::WriteChunk {
            transfer_id: id,
            range,
            payload,
        }]
    }

    /// The host stored chunk `sequence`. The last chunk is acknowledged only once the
    /// file is in place.
    pub fn on_chunk_written(&mut self, id: TransferId, sequence: u64) -> Vec<OutboundAction> {
        let Some(t) = self.incoming.get_mut(&id) else {
            return vec![];
        };
        if t.writing == Some(sequence) {
            t.writing = None;
        }
        if t.info.state.is_terminal() || sequence != t.next_sequence {
            return vec![];
        }
        if sequence + 1 == t.layout.chunk_count() {
            t.finishing = true;
            return vec![OutboundAction::FinishSink { transfer_id: id }];
        }
        t.next_sequence += 1;
        t.info.bytes_transferred = t.layout.bytes_before(t.next_sequence);
        let mut actions: Vec<OutboundAction> = t
            .conn
            .and_then(|conn| reply_frame(conn, &Frame::ChunkAck { transfer_id: id, sequence }))
            .into_iter()
            .collect();
        actions.push(progress(&t.info));
        actions
    }

    /// The host moved the received file to its final name.
    pub fn on_sink_finished(&mut self, id: TransferId) -> Vec<OutboundAction> {
        let Some(t) = self.incoming.get_mut(&id) else {
            return vec![];
        };
        if t.info.state.is_terminal() || !t.finishing {
            return vec![];
        }
        t.finishing = false;
        let sequence = t.next_sequence;
        t.next_sequence += 1;
        t.info.bytes_transferred = t.info.total_bytes;
        t.info.state = TransferState::Completed;
        info!(transfer = %id, file = %t.info.file_name, bytes = t.info.total_bytes, "Incoming transfer complete");
        let mut actions: Vec<OutboundAction> = t
            .conn
            .and_then(|conn| reply_frame(conn, &Frame::ChunkAck { transfer_id: id, sequence }))
            .into_iter()
            .collect();
        actions.push(progress(&t.info));
        actions.push(OutboundAction::Emit(Event::TransferCompleted(t.info.clone())));
        actions
    }

    /// The received file could not be moved into place.
    pub fn on_sink_finish_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        match self.incoming.get_mut(&id) {
            Some(t) if t.finishing && !t.info.state.is_terminal() => {
                t.finishing = false;
                fail_incoming(t, error.to_string())
            }
            _ => vec![],
        }
    }

    pub fn on_chunk_write_failed(&mut self, id: TransferId, error: ResourceError) -> Vec<OutboundAction> {
        self.on_sink_failed(id, error)
    }

    /// The connection an incoming transfer arrived on closed.
    pub fn on_connection_closed(&mut self, conn: ConnectionId) {
        for t in self.incoming.values_mut() {
            if t.conn == Some(conn) {
                t.conn = None;
                if t.info.state == TransferState::InProgress {
                    t.info.state = TransferState::Paused;
                    debug!(transfer = %t.info.id, "Incoming transfer paused, sender disconnected");
                }
            }
        }
    }

    /// The other side abandoned a transfer.
    pub fn on_cancel(&mut self, from: SocketAddr, id: TransferId, reason: &str) -> Vec<OutboundAction> {
        if let Some(t) = self.outgoing.get_mut(&id) {
            if t.info.peer_address == from && !t.info.state.is_terminal() {
                return fail_outgoing(t, format!("rejected by peer: {reason}"), false);
            }
            return vec![];
        }
        match self.incoming.get_mut(&id) {
            Some(t) if t.info.peer_address == from && !t.info.state.is_terminal() => {
                t.info.state = TransferState::Cancelled;
                t.writing = None;
                info!(transfer = %id, reason, "Sender cancelled transfer");
                vec![
                    OutboundAction::DiscardSink { transfer_id: id },
                    OutboundAction::Emit(Event::TransferCancelled { transfer_id: id }),
                ]
            }
            _ => vec![],
        }
    }

    /// Offer and chunk ack timeouts.
    pub fn tick(&mut self, now: Millis) -> Vec<OutboundAction> {
        let (ack_timeout, max_retries) = (self.ack_timeout, self.max_retries);
        let mut actions = Vec::new();
        for t in self.outgoing.values_mut() {
            match t.info.state {
                TransferState::Initiating => {
                    if t.offer_deadline.is_some_and(|d| now >= d) {
                        t.offer_attempts += 1;
                        if t.offer_attempts > max_retries {
                            let err = NetworkError::RetriesExhausted {
                                attempts: t.offer_attempts,
                                last: Box::new(NetworkError::AckTimeout),
                            };
                            actions.extend(fail_outgoing(t, err.to_string(), false));
                        } else {
                            debug!(transfer = %t.info.id, attempt = t.offer_attempts, "Re-sending offer");
                            actions.extend(offer(t, now, ack_timeout));
                        }
                    }
                }
                TransferState::InProgress => {
                    if t.in_flight.as_ref().is_some_and(|c| now >= c.deadline) {
                        actions.extend(retry_chunk(t, now, ack_timeout, max_retries));
                    }
                }
                TransferState::Paused => {
                    if t.interrupted && t.reconnect_at.is_some_and(|at| now >= at) {
                        debug!(transfer = %t.info.id, failures = t.link_failures, "Reconnecting");
                        actions.extend(restart(t, now, ack_timeout));
                    }
                }
                _ => {}
            }
        }
        self.prune_finished(now);
        actions
    }

    /// Forget transfers that ended more than FINISHED_RETENTION ago.
    fn prune_finished(&mut self, now: Millis) {
        let expired = |state: TransferState, ended_at: &mut Option<Millis>| {
            if !state.is_terminal() {
                return false;
            }
            let at = *ended_at.get_or_insert(now);
            now.saturating_sub(at) >= FINISHED_RETENTION
        };
        self.outgoing.retain(|_, t| !expired(t.info.state, &mut t.ended_at));
        self.incoming.retain(|_, t| !expired(t.info.state, &mut t.ended_at));
    }

    /// Cancel everything still running (logout).
    pub fn shutdown(&mut self) -> Vec<OutboundAction> {
        let ids: Vec<TransferId> = self
            .outgoing
            .values()
            .map(|t| &t.info)
            .chain(self.incoming.values().map(|t| &t.info))
            .filter(|info| !info.state.is_terminal())
            .map(|info| info.id)
            .collect();
        let mut actions = Vec::new();
        for id in ids {
            if let Ok((_, more)) = self.cancel(id) {
                actions.extend(more);
            }
        }
        actions
    }

    fn send_offer(&mut self, id: TransferId, now: Millis) -> Vec<OutboundAction> {
        let ack_timeout = self.ack_timeout;
        match self.outgoing.get_mut(&id) {
            Some(t) => offer(t, now, ack_timeout),
            None => vec![],
        }
    }
}

fn offer(t: &mut Outgoing, now: Millis, ack_timeout: Millis) -> Vec<OutboundAction> {
    t.offer_deadline = Some(now + ack_timeout);
    let frame = Frame::TransferOffer {
        transfer_id: t.info.id,
        file_name: t.info.file_name.clone(),
        total_bytes: t.info.total_bytes,
        chunk_size: t.info.chunk_size,
    };
    send_frame(t.link(), &frame).into_iter().collect()
}

fn restart(t: &mut Outgoing, now: Millis, ack_timeout: Millis) -> Vec<OutboundAction> {
    t.info.state = TransferState::Initiating;
    t.interrupted = false;
    t.reconnect_at = None;
    t.in_flight = None;
    t.offer_attempts = 0;
    info!(transfer = %t.info.id, next_sequence = t.next_sequence, "Resuming transfer");
    offer(t, now, ack_timeout)
}

fn request_read(t: &mut Outgoing) -> Vec<OutboundAction> {
    if t.info.state != TransferState::InProgress || t.in_flight.is_some() || t.reading.is_some() {
        return vec![];
    }
    let Some(range) = t.layout.range(t.next_sequence) else {
        return vec![];
    };
    t.reading = Some(range.sequence);
    vec![OutboundAction::ReadChunk {
        transfer_id: t.info.id,
        range,
    }]
}

fn retry_chunk(t: &mut Outgoing, now: Millis, ack_timeout: Millis, max_retries: u32) -> Vec<OutboundAction> {
    let link = t.link();
    let id = t.info.id;
    let Some(chunk) = t.in_flight.as_mut() else {
        return vec![];
    };
    chunk.attempts += 1;
    if chunk.attempts > max_retries {
        let err = NetworkError::RetriesExhausted {
            attempts: chunk.attempts,
            last: Box::new(NetworkError::AckTimeout),
        };
        return fail_outgoing(t, err.to_string(), true);
    }
    chunk.deadline = now + ack_timeout;
    debug!(transfer = %id, sequence = chunk.sequence, attempt = chunk.attempts, "Resending chunk");
    let frame = chunk_data_frame(id, chunk.sequence, chunk.payload.clone());
    send_frame(link, &frame).into_iter().collect()
}

fn complete_outgoing(t: &mut Outgoing) -> Vec<OutboundAction> {
    t.info.state = TransferState::Completed;
    t.info.bytes_transferred = t.info.total_bytes;
    info!(transfer = %t.info.id, file = %t.info.file_name, bytes = t.info.total_bytes, "Transfer complete");
    vec![
        OutboundAction::Emit(Event::TransferCompleted(t.info.clone())),
        OutboundAction::Close(t.link()),
    ]
}

/// Mark an outgoing transfer Failed; optionally tell the receiver.
fn fail_outgoing(t: &mut Outgoing, reason: String, notify_peer: bool) -> Vec<OutboundAction> {
    t.info.state = TransferState::Failed;
    t.in_flight = None;
    t.reading = None;
    t.offer_deadline = None;
    warn!(transfer = %t.info.id, peer = %t.info.peer_address, reason = %reason, "Transfer failed");
    let link = t.link();
    let mut actions = Vec::new();
    if notify_peer {
        let cancel = Frame::TransferCancel {
            transfer_id: t.info.id,
            reason: reason.clone(),
        };
        actions.extend(send_frame(link, &cancel));
    }
    actions.push(OutboundAction::Close(link));
    actions.push(OutboundAction::Emit(Event::TransferFailed {
        transfer_id: t.info.id,
        reason,
    }));
    actions
}

fn fail_incoming(t: &mut Incoming, reason: String) -> Vec<OutboundAction> {
    t.info.state = TransferState::Failed;
    t.writing = None;
    warn!(transfer = %t.info.id, peer = %t.info.peer_address, reason = %reason, "Incoming transfer failed");
    let mut actions: Vec<OutboundAction> = t
        .conn
        .and_then(|conn| {
            reply_frame(
                conn,
                &Frame::TransferCancel {
                    transfer_id: t.info.id,
                    reason: reason.clone(),
                },
            )
        })
        .into_iter()
        .collect();
    actions.push(OutboundAction::DiscardSink {
        transfer_id: t.info.id,
    });
    actions.push(OutboundAction::Emit(Event::TransferFailed {
        transfer_id: t.info.id,
        reason,
    }));
    actions
}

fn accept_frame(conn: ConnectionId, id: TransferId, next_sequence: u64) -> Vec<OutboundAction> {
    reply_frame(
        conn,
        &Frame::TransferAccept {
            transfer_id: id,
            next_sequence,
        },
    )
    .into_iter()
    .collect()
}

fn progress(info: &FileTransfer) -> OutboundAction {
    OutboundAction::Emit(Event::TransferProgress {
        transfer_id: info.id,
        bytes_transferred: info.bytes_transferred,
        total_bytes: info.total_bytes,
    })
}

/// Reduce a peer-supplied file name to its last path component. None if nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}
