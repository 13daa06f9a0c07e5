//! Discovery packets: the sequenced announcer and the validating, de-duplicating filter.
//! Socket handling lives in the host.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::error::ProtocolError;
use crate::identity::{validate_display_name, Identity};
use crate::protocol::{Announcement, PROTOCOL_VERSION};
use crate::wire;
use crate::Millis;

/// Builds announcements for the local identity with a strictly increasing sequence number.
#[derive(Debug, Clone)]
pub struct Announcer {
    identity: Identity,
    next_sequence: u64,
}

impl Announcer {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            next_sequence: 0,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn next_packet(&mut self, now: Millis) -> Announcement {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        Announcement {
            protocol_version: PROTOCOL_VERSION,
            display_name: self.identity.display_name.clone(),
            device_label: self.identity.device_label.clone(),
            address: self.identity.address,
            platform_tag: self.identity.platform_tag.clone(),
            session_start: self.identity.session_start,
            sequence_number,
            sent_at: now,
        }
    }

    /// Next announcement, encoded as a datagram.
    pub fn next_datagram(&mut self, now: Millis) -> Result<Vec<u8>, ProtocolError> {
        let packet = self.next_packet(now);
        Ok(wire::encode_datagram(&packet)?)
    }
}

/// Last sequence accepted from one announcing address.
#[derive(Debug, Clone, Copy)]
struct SeenSequence {
    session_start: Millis,
    sequence_number: u64,
}

/// Validates incoming datagrams and drops duplicates.
#[derive(Debug, Default)]
pub struct PacketFilter {
    local_address: Option<SocketAddr>,
    seen: HashMap<SocketAddr, SeenSequence>,
}

impl PacketFilter {
    /// Filter that also ignores announcements for `local_address` (our own, looped back).
    pub fn new(local_address: SocketAddr) -> Self {
        Self {
            local_address: Some(local_address),
            seen: HashMap::new(),
        }
    }

    /// Decode and validate one datagram. Returns Ok(None) for our own packets and for
    /// duplicate or stale sequence numbers; Err for malformed packets.
    pub fn accept(&mut self, bytes: &[u8]) -> Result<Option<Identity>, ProtocolError> {
        let packet = wire::decode_datagram(bytes).map_err(|e| match e {
            wire::FrameDecodeError::BadMagic => ProtocolError::BadMagic,
            other => ProtocolError::Frame(other),
        })?;
        if packet.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(packet.protocol_version));
        }
        if packet.address.ip().is_unspecified()
            || packet.address.ip().is_multicast()
            || packet.address.port() == 0
        {
            return Err(ProtocolError::InvalidAddress(packet.address));
        }
        let display_name =
            validate_display_name(&packet.display_name).map_err(ProtocolError::InvalidName)?;
        if Some(packet.address) == self.local_address {
            return Ok(None);
        }

        match self.seen.get(&packet.address) {
            Some(prev)
                if prev.session_start == packet.session_start
                    && packet.sequence_number <= prev.sequence_number =>
            {
                debug!(
                    peer = %packet.address,
                    sequence = packet.sequence_number,
                    last = prev.sequence_number,
                    "Ignoring duplicate announcement"
                );
                return Ok(None);
            }
            _ => {}
        }
        self.seen.insert(
            packet.address,
            SeenSequence {
                session_start: packet.session_start,
                sequence_number: packet.sequence_number,
            },
        );

        Ok(Some(Identity {
            display_name,
            device_label: packet.device_label.trim().to_string(),
            address: packet.address,
            platform_tag: packet.platform_tag,
            session_start: packet.session_start,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, addr: &str, session_start: Millis) -> Identity {
        Identity {
            display_name: name.into(),
            device_label: "Laptop".into(),
            address: addr.parse().unwrap(),
            platform_tag: "linux-x86_64".into(),
            session_start,
        }
    }

    fn local() -> SocketAddr {
        "192.168.1.10:45681".parse().unwrap()
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut a = Announcer::new(identity("Bob", "192.168.1.11:45681", 5));
        let p0 = a.next_packet(100);
        let p1 = a.next_packet(200);
        assert_eq!(p0.sequence_number, 0);
        assert_eq!(p1.sequence_number, 1);
        assert_eq!(p1.sent_at, 200);
        assert_eq!(p1.display_name, "Bob");
    }

    #[test]
    fn valid_packet_yields_identity() {
        let bob = identity("Bob", "192.168.1.11:45681", 5);
        let mut a = Announcer::new(bob.clone());
        let mut f = PacketFilter::new(local());
        let got = f.accept(&a.next_datagram(100).unwrap()).unwrap();
        assert_eq!(got, Some(bob));
    }

    #[test]
    fn duplicate_and_stale_sequences_ignored() {
        let mut a = Announcer::new(identity("Bob", "192.168.1.11:45681", 5));
        let mut f = PacketFilter::new(local());
        let first = a.next_datagram(100).unwrap();
        let second = a.next_datagram(200).unwrap();
        assert!(f.accept(&first).unwrap().is_some());
        assert!(f.accept(&first).unwrap().is_none());
        assert!(f.accept(&second).unwrap().is_some());
        assert!(f.accept(&first).unwrap().is_none());
        assert!(f.accept(&second).unwrap().is_none());
    }

    #[test]
    fn restarted_peer_resets_sequence() {
        let mut old = Announcer::new(identity("Bob", "192.168.1.11:45681", 5));
        let mut f = PacketFilter::new(local());
        for t in 0..3 {
            assert!(f.accept(&old.next_datagram(t).unwrap()).unwrap().is_some());
        }
        let mut restarted = Announcer::new(identity("Bob", "192.168.1.11:45681", 9_000));
        assert!(f
            .accept(&restarted.next_datagram(9_001).unwrap())
            .unwrap()
            .is_some());
    }

    #[test]
    fn own_packets_ignored() {
        let mut me = Announcer::new(identity("Alice", "192.168.1.10:45681", 5));
        let mut f = PacketFilter::new(local());
        assert!(f.accept(&me.next_datagram(1).unwrap()).unwrap().is_none());
    }

    #[test]
    fn malformed_packets_rejected() {
        let mut f = PacketFilter::new(local());
        assert!(matches!(
            f.accept(b"garbage"),
            Err(ProtocolError::BadMagic)
        ));
        assert!(matches!(
            f.accept(b"LNCH\x01\x02"),
            Err(ProtocolError::Frame(_))
        ));

        let mut bad_name = Announcer::new(identity("B<b>", "192.168.1.11:45681", 5));
        assert!(matches!(
            f.accept(&bad_name.next_datagram(1).unwrap()),
            Err(ProtocolError::InvalidName(_))
        ));

        let mut bad_addr = Announcer::new(identity("Bob", "0.0.0.0:45681", 5));
        assert!(matches!(
            f.accept(&bad_addr.next_datagram(1).unwrap()),
            Err(ProtocolError::InvalidAddress(_))
        ));

        let mut no_port = Announcer::new(identity("Bob", "192.168.1.11:0", 5));
        assert!(matches!(
            f.accept(&no_port.next_datagram(1).unwrap()),
            Err(ProtocolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut a = Announcer::new(identity("Bob", "192.168.1.11:45681", 5));
        let mut packet = a.next_packet(1);
        packet.protocol_version = PROTOCOL_VERSION + 1;
        let bytes = wire::encode_datagram(&packet).unwrap();
        let mut f = PacketFilter::new(local());
        assert!(matches!(f.accept(&bytes), Err(ProtocolError::Version(_))));
    }
}
