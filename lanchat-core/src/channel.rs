//! Message channel: per-target FIFO delivery of text messages with acknowledgment,
//! retry with backoff, and de-duplication of inbound messages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::core::{reply_frame, send_frame, ConnectionId, Lane, Link, OutboundAction};
use crate::error::{NetworkError, ValidationError};
use crate::event::Event;
use crate::protocol::{Frame, MessageId};
use crate::Millis;

/// Largest accepted message body, in bytes.
pub const MAX_BODY_LEN: usize = 64 * 1024;

/// Inbound ids remembered for de-duplication.
pub const DEDUP_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

/// A text message, outgoing or received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_address: SocketAddr,
    pub target_address: SocketAddr,
    pub body: String,
    pub sent_at: Millis,
    pub delivery_state: DeliveryState,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    AwaitingAck { deadline: Millis },
    Backoff { until: Millis },
}

#[derive(Debug)]
struct InFlight {
    message_id: MessageId,
    retries: u32,
    phase: Phase,
}

/// Messages queued for one target. Only the head is ever on the wire.
#[derive(Debug, Default)]
struct Outbox {
    queue: VecDeque<MessageId>,
    in_flight: Option<InFlight>,
}

pub struct MessageChannel {
    local: SocketAddr,
    policy: RetryPolicy,
    pending: HashMap<MessageId, Message>,
    outboxes: HashMap<SocketAddr, Outbox>,
    seen: HashSet<(SocketAddr, MessageId)>,
    seen_order: VecDeque<(SocketAddr, MessageId)>,
}

impl MessageChannel {
    pub fn new(local: SocketAddr, policy: RetryPolicy) -> Self {
        Self {
            local,
            policy,
            pending: HashMap::new(),
            outboxes: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Queue a message for `target`. Returns it in Pending state; delivery proceeds via
    /// the returned actions and later acks/ticks.
    pub fn send(
        &mut self,
        target: SocketAddr,
        body: &str,
        now: Millis,
    ) -> Result<(Message, Vec<OutboundAction>), ValidationError> {
        if body.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if body.len() > MAX_BODY_LEN {
            return Err(ValidationError::MessageTooLarge { max: MAX_BODY_LEN });
        }
        let message = Message {
            id: MessageId::new(),
            sender_address: self.local,
            target_address: target,
            body: body.to_string(),
            sent_at: now,
            delivery_state: DeliveryState::Pending,
        };
        self.pending.insert(message.id, message.clone());
        self.outboxes
            .entry(target)
            .or_default()
            .queue
            .push_back(message.id);
        let actions = self.pump(target, now);
        Ok((message, actions))
    }

    /// Acknowledgment from `from`. Only the message currently in flight to that peer
    /// can be acknowledged; anything else is late and ignored.
    pub fn on_ack(&mut self, from: SocketAddr, message_id: MessageId, now: Millis) -> Vec<OutboundAction> {
        let matches = self
            .outboxes
            .get(&from)
            .and_then(|o| o.in_flight.as_ref())
            .is_some_and(|f| f.message_id == message_id);
        if !matches {
            debug!(peer = %from, message = %message_id, "Ignoring late acknowledgment");
            return vec![];
        }
        let mut actions = self.finish(from, DeliveryState::Delivered, None);
        actions.extend(self.pump(from, now));
        actions
    }

    /// Inbound text. Always acknowledged; surfaced once per (sender, id).
    pub fn on_text(
        &mut self,
        conn: ConnectionId,
        from: SocketAddr,
        message_id: MessageId,
        body: String,
        sent_at: Millis,
    ) -> Vec<OutboundAction> {
        let mut actions: Vec<OutboundAction> =
            reply_frame(conn, &Frame::TextAck { message_id }).into_iter().collect();
        let key = (from, message_id);
        if !self.seen.insert(key) {
            debug!(peer = %from, message = %message_id, "Duplicate message re-acknowledged");
            return actions;
        }
        self.seen_order.push_back(key);
        while self.seen_order.len() > DEDUP_CAPACITY {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
        actions.push(OutboundAction::Emit(Event::MessageReceived(Message {
            id: message_id,
            sender_address: from,
            target_address: self.local,
            body,
            sent_at,
            delivery_state: DeliveryState::Delivered,
        })));
        actions
    }

    /// The message connection to `peer` failed or dropped.
    pub fn on_link_lost(&mut self, peer: SocketAddr, now: Millis) -> Vec<OutboundAction> {
        let awaiting = self
            .outboxes
            .get(&peer)
            .and_then(|o| o.in_flight.as_ref())
            .is_some_and(|f| matches!(f.phase, Phase::AwaitingAck { .. }));
        if !awaiting {
            return vec![];
        }
        self.attempt_failed(peer, NetworkError::ConnectionFailed(peer), now)
    }

    /// Expire ack deadlines and fire due retries.
    pub fn tick(&mut self, now: Millis) -> Vec<OutboundAction> {
        let mut timed_out = Vec::new();
        let mut due = Vec::new();
        for (peer, outbox) in &self.outboxes {
            match outbox.in_flight.as_ref().map(|f| f.phase) {
                Some(Phase::AwaitingAck { deadline }) if now >= deadline => timed_out.push(*peer),
                Some(Phase::Backoff { until }) if now >= until => due.push(*peer),
                _ => {}
            }
        }
        let mut actions = Vec::new();
        for peer in timed_out {
            actions.extend(self.attempt_failed(peer, NetworkError::AckTimeout, now));
        }
        for peer in due {
            actions.extend(self.retransmit(peer, now));
        }
        actions
    }

    /// Fail everything still pending (logout).
    pub fn fail_all(&mut self, reason: NetworkError) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let mut outboxes: Vec<(SocketAddr, Outbox)> = self.outboxes.drain().collect();
        outboxes.sort_by_key(|(peer, _)| *peer);
        for (_, outbox) in outboxes {
            let ids = outbox
                .in_flight
                .map(|f| f.message_id)
                .into_iter()
                .chain(outbox.queue);
            for id in ids {
                if self.pending.remove(&id).is_some() {
                    actions.push(OutboundAction::Emit(Event::MessageFailed {
                        message_id: id,
                        reason: reason.to_string(),
                    }));
                }
            }
        }
        actions
    }

    /// Messages not yet Delivered or Failed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Start the next queued message for `target` if nothing is in flight.
    fn pump(&mut self, target: SocketAddr, now: Millis) -> Vec<OutboundAction> {
        let Some(outbox) = self.outboxes.get_mut(&target) else {
            return vec![];
        };
        if outbox.in_flight.is_some() {
            return vec![];
        }
        let Some(message_id) = outbox.queue.pop_front() else {
            self.outboxes.remove(&target);
            return vec![];
        };
        outbox.in_flight = Some(InFlight {
            message_id,
            retries: 0,
            phase: Phase::AwaitingAck {
                deadline: now + self.policy.ack_timeout,
            },
        });
        self.transmit(target, message_id)
    }

    fn transmit(&self, target: SocketAddr, message_id: MessageId) -> Vec<OutboundAction> {
        let Some(message) = self.pending.get(&message_id) else {
            return vec![];
        };
        let frame = Frame::Text {
            message_id,
            body: message.body.clone(),
            sent_at: message.sent_at,
        };
        let link = Link {
            peer: target,
            lane: Lane::Messages,
        };
        send_frame(link, &frame).into_iter().collect()
    }

    fn retransmit(&mut self, peer: SocketAddr, now: Millis) -> Vec<OutboundAction> {
        let ack_timeout = self.policy.ack_timeout;
        let Some(flight) = self.outboxes.get_mut(&peer).and_then(|o| o.in_flight.as_mut()) else {
            return vec![];
        };
        flight.phase = Phase::AwaitingAck {
            deadline: now + ack_timeout,
        };
        let message_id = flight.message_id;
        debug!(peer = %peer, message = %message_id, retry = flight.retries, "Retrying message");
        self.transmit(peer, message_id)
    }

    fn attempt_failed(&mut self, peer: SocketAddr, reason: NetworkError, now: Millis) -> Vec<OutboundAction> {
        let Some(flight) = self.outboxes.get_mut(&peer).and_then(|o| o.in_flight.as_mut()) else {
            return vec![];
        };
        if let Some(delay) = self.policy.delay_before(flight.retries) {
            flight.retries += 1;
            flight.phase = Phase::Backoff { until: now + delay };
            debug!(
                peer = %peer,
                message = %flight.message_id,
                error = %reason,
                delay_ms = delay,
                "Message attempt failed, backing off"
            );
            return vec![];
        }
        let attempts = flight.retries + 1;
        let failure = NetworkError::RetriesExhausted {
            attempts,
            last: Box::new(reason),
        };
        let mut actions = self.finish(peer, DeliveryState::Failed, Some(failure));
        actions.extend(self.pump(peer, now));
        actions
    }

    /// Move the in-flight message for `peer` to a terminal state.
    fn finish(
        &mut self,
        peer: SocketAddr,
        state: DeliveryState,
        failure: Option<NetworkError>,
    ) -> Vec<OutboundAction> {
        let Some(flight) = self.outboxes.get_mut(&peer).and_then(|o| o.in_flight.take()) else {
            return vec![];
        };
        let Some(mut message) = self.pending.remove(&flight.message_id) else {
            return vec![];
        };
        message.delivery_state = state;
        let event = match failure {
            None => {
                info!(peer = %peer, message = %message.id, "Message delivered");
                Event::MessageDelivered {
                    message_id: message.id,
                }
            }
            Some(err) => {
                warn!(peer = %peer, message = %message.id, error = %err, "Message failed");
                Event::MessageFailed {
                    message_id: message.id,
                    reason: err.to_string(),
                }
            }
        };
        vec![OutboundAction::Emit(event)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_frame;

    fn local() -> SocketAddr {
        "192.168.1.10:45681".parse().unwrap()
    }

    fn bob() -> SocketAddr {
        "192.168.1.11:45681".parse().unwrap()
    }

    fn carol() -> SocketAddr {
        "192.168.1.12:45681".parse().unwrap()
    }

    fn channel() -> MessageChannel {
        MessageChannel::new(local(), RetryPolicy::default())
    }

    /// Ids of Text frames sent by `actions`, with their destination.
    fn sent_texts(actions: &[OutboundAction]) -> Vec<(SocketAddr, MessageId)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send(link, bytes) => match decode_frame(bytes).unwrap().0 {
                    Frame::Text { message_id, .. } => Some((link.peer, message_id)),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn emitted(actions: &[OutboundAction]) -> Vec<Event> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Emit(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn send_returns_pending_and_transmits() {
        let mut ch = channel();
        let (msg, actions) = ch.send(bob(), "hi Bob", 0).unwrap();
        assert_eq!(msg.delivery_state, DeliveryState::Pending);
        assert_eq!(msg.target_address, bob());
        assert_eq!(sent_texts(&actions), vec![(bob(), msg.id)]);
    }

    #[test]
    fn blank_or_oversized_body_rejected() {
        let mut ch = channel();
        assert_eq!(ch.send(bob(), "  \n", 0).unwrap_err(), ValidationError::EmptyMessage);
        let big = "x".repeat(MAX_BODY_LEN + 1);
        assert!(matches!(
            ch.send(bob(), &big, 0).unwrap_err(),
            ValidationError::MessageTooLarge { .. }
        ));
    }

    #[test]
    fn per_target_fifo() {
        let mut ch = channel();
        let (a, act_a) = ch.send(bob(), "A", 0).unwrap();
        let (b, act_b) = ch.send(bob(), "B", 1).unwrap();
        let (c, act_c) = ch.send(bob(), "C", 2).unwrap();
        assert_eq!(sent_texts(&act_a), vec![(bob(), a.id)]);
        assert!(sent_texts(&act_b).is_empty());
        assert!(sent_texts(&act_c).is_empty());

        let after_a = ch.on_ack(bob(), a.id, 10);
        assert_eq!(
            emitted(&after_a),
            vec![Event::MessageDelivered { message_id: a.id }]
        );
        assert_eq!(sent_texts(&after_a), vec![(bob(), b.id)]);

        let after_b = ch.on_ack(bob(), b.id, 20);
        assert_eq!(sent_texts(&after_b), vec![(bob(), c.id)]);
        let after_c = ch.on_ack(bob(), c.id, 30);
        assert_eq!(
            emitted(&after_c),
            vec![Event::MessageDelivered { message_id: c.id }]
        );
        assert_eq!(ch.pending(), 0);
    }

    #[test]
    fn targets_are_independent() {
        let mut ch = channel();
        let (a, act_a) = ch.send(bob(), "A", 0).unwrap();
        let (b, act_b) = ch.send(carol(), "B", 0).unwrap();
        assert_eq!(sent_texts(&act_a), vec![(bob(), a.id)]);
        assert_eq!(sent_texts(&act_b), vec![(carol(), b.id)]);
    }

    #[test]
    fn ack_from_wrong_peer_or_unknown_id_ignored() {
        let mut ch = channel();
        let (a, _) = ch.send(bob(), "A", 0).unwrap();
        assert!(ch.on_ack(carol(), a.id, 1).is_empty());
        assert!(ch.on_ack(bob(), MessageId::new(), 1).is_empty());
        assert_eq!(ch.pending(), 1);
    }

    #[test]
    fn retries_with_backoff_then_fails() {
        let mut ch = channel();
        let (a, _) = ch.send(bob(), "A", 0).unwrap();
        let (b, _) = ch.send(bob(), "B", 0).unwrap();

        // Ack timeout at 5s, retry after 500ms.
        assert!(ch.tick(4_999).is_empty());
        assert!(sent_texts(&ch.tick(5_000)).is_empty());
        assert_eq!(sent_texts(&ch.tick(5_500)), vec![(bob(), a.id)]);
        // Second timeout, retry after 1s.
        ch.tick(10_500);
        assert!(sent_texts(&ch.tick(11_499)).is_empty());
        assert_eq!(sent_texts(&ch.tick(11_500)), vec![(bob(), a.id)]);
        // Third timeout, retry after 2s.
        ch.tick(16_500);
        assert_eq!(sent_texts(&ch.tick(18_500)), vec![(bob(), a.id)]);
        // Budget exhausted: A fails, B starts.
        let actions = ch.tick(23_500);
        match &emitted(&actions)[..] {
            [Event::MessageFailed { message_id, .. }] => assert_eq!(*message_id, a.id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sent_texts(&actions), vec![(bob(), b.id)]);
        // A late ack for the failed message changes nothing.
        assert!(emitted(&ch.on_ack(bob(), a.id, 23_600)).is_empty());
    }

    #[test]
    fn connection_failure_counts_as_attempt() {
        let mut ch = channel();
        let (a, _) = ch.send(bob(), "A", 0).unwrap();
        assert!(ch.on_link_lost(bob(), 100).is_empty());
        // Lost again while backing off: no double counting.
        assert!(ch.on_link_lost(bob(), 200).is_empty());
        assert_eq!(sent_texts(&ch.tick(600)), vec![(bob(), a.id)]);
        let delivered = ch.on_ack(bob(), a.id, 700);
        assert_eq!(
            emitted(&delivered),
            vec![Event::MessageDelivered { message_id: a.id }]
        );
    }

    #[test]
    fn inbound_deduplicated_but_always_acked() {
        let mut ch = channel();
        let id = MessageId::new();
        let first = ch.on_text(ConnectionId(7), bob(), id, "hey".into(), 5);
        let second = ch.on_text(ConnectionId(7), bob(), id, "hey".into(), 5);
        for actions in [&first, &second] {
            assert!(actions.iter().any(|a| matches!(
                a,
                OutboundAction::Reply(ConnectionId(7), bytes)
                    if matches!(decode_frame(bytes).unwrap().0, Frame::TextAck { message_id } if message_id == id)
            )));
        }
        assert_eq!(emitted(&first).len(), 1);
        match &emitted(&first)[0] {
            Event::MessageReceived(m) => {
                assert_eq!(m.sender_address, bob());
                assert_eq!(m.body, "hey");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(emitted(&second).is_empty());
        // Same id from a different sender is a different message.
        assert_eq!(emitted(&ch.on_text(ConnectionId(8), carol(), id, "yo".into(), 5)).len(), 1);
    }

    #[test]
    fn fail_all_reports_every_pending_message() {
        let mut ch = channel();
        ch.send(bob(), "A", 0).unwrap();
        ch.send(bob(), "B", 0).unwrap();
        ch.send(carol(), "C", 0).unwrap();
        let events = emitted(&ch.fail_all(NetworkError::SessionEnded));
        assert_eq!(events.len(), 3);
        assert_eq!(ch.pending(), 0);
    }
}
