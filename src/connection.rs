use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use constant_time_eq::constant_time_eq;
use slog::Logger;

use crate::crypto::{packet_mac, KeyPair, PacketCipher, MAC_SIZE, SYMMETRIC_KEY_SIZE};
use crate::packet::{DataHeader, PacketKind, DATA_HEADER_SIZE, MAX_PACKET_PAYLOAD};
use crate::socket::{OpError, SocketEvent};
use crate::{ConnectionId, Role, MAX_DATAGRAM_SIZE, PACKET_WINDOW_SIZE};

/// Where a connection stands in its lifecycle. Terminal outcomes (rejected,
/// timed out, disconnected) are not states: posting the terminal event tears
/// the record down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Introduced connection waiting for the introducer to name the peer.
    AwaitingIntroduction,
    /// Spraying punch packets at the candidate addresses of an introduced peer.
    SendingPunchPackets,
    AwaitingChallengeResponse,
    /// Challenge surfaced to the application; waiting for `accept_challenge`.
    AwaitingLocalChallengeAccept,
    ComputingPuzzleSolution,
    AwaitingConnectResponse,
    /// Introduced host waiting for the punched initiator's connect request.
    AwaitingConnectRequest,
    /// Connect request surfaced to the application; waiting for
    /// `accept_connection` or `close_connection`.
    AwaitingLocalAccept,
    Connected,
}

/// Outcome of placing a received sequence in the 31-wide receive window.
enum Placement {
    /// Newer than anything seen; advances the window base by the distance.
    Ahead(u32),
    /// Fills a hole behind the base at the given bitmap offset.
    Fill(u32),
}

pub struct Connection {
    pub log: Logger,
    pub handle: ConnectionId,
    pub role: Role,
    pub state: State,
    pub remote: SocketAddr,

    pub initiator_nonce: u64,
    pub host_nonce: u64,
    /// Identity token the host side minted for the initiator.
    pub client_identity: u32,
    pub puzzle_difficulty: u32,
    pub puzzle_solution: u32,
    /// Job index while the solver is working this connection's puzzle.
    pub puzzle_request_index: Option<u32>,
    /// Set after the one transparent retry a puzzle rejection is granted.
    pub puzzle_retried: bool,

    pub local_key: Option<Arc<KeyPair>>,
    pub remote_public_key: Vec<u8>,
    pub shared_secret: Option<[u8; 32]>,
    pub symmetric_key: [u8; SYMMETRIC_KEY_SIZE],
    pub init_vector: [u8; SYMMETRIC_KEY_SIZE],
    cipher: Option<PacketCipher>,

    /// Initiator's opaque connect payload; resent with every connect request.
    pub connect_data: Vec<u8>,
    /// Host's opaque accept payload, kept for idempotent accept resends.
    pub accept_data: Vec<u8>,

    pub initial_send_sequence: u32,
    next_send_sequence: u32,
    /// Most recent sent sequence whose fate has been reported (or skipped, for
    /// internal packets). Everything between it and `next_send_sequence` is in
    /// flight.
    last_notified_sequence: u32,
    /// Whether each in-flight sequence, oldest first, is an application packet
    /// owed a `PacketNotify`.
    sent_notify: VecDeque<bool>,
    highest_recv_sequence: u32,
    recv_bits: u32,

    pub last_send_time: u64,
    pub last_recv_time: u64,
    pub ack_pending: bool,
    /// When `ack_pending` last went from false to true; the delayed-ack clock
    /// runs from here, not from our last transmission.
    pub ack_pending_since: u64,
    /// Retry/timeout clock for the current pending state.
    pub state_last_send: u64,
    pub state_retry_interval: u64,
    pub state_retries_remaining: u32,

    pub introducer: Option<ConnectionId>,
    pub introduction_token: u32,
    /// Client identity of the peer we asked the introducer for.
    pub introduction_target: u32,
    /// Possible addresses of an introduced peer; bounded to 5 entries.
    pub candidate_addresses: Vec<SocketAddr>,
    /// Introduction requests this established peer has filed with us, as
    /// (target identity, token) pairs awaiting `introduce_connection`.
    pub introduction_requests: Vec<(u32, u32)>,
}

/// Cap on remembered introduction requests per established connection.
const MAX_INTRODUCTION_REQUESTS: usize = 4;
/// Cap on candidate addresses for an introduced peer.
pub const MAX_CANDIDATE_ADDRESSES: usize = 5;

impl Connection {
    pub fn new(
        log: Logger,
        handle: ConnectionId,
        role: Role,
        state: State,
        remote: SocketAddr,
        initiator_nonce: u64,
        initial_send_sequence: u32,
        now: u64,
    ) -> Self {
        Self {
            log,
            handle,
            role,
            state,
            remote,
            initiator_nonce,
            host_nonce: 0,
            client_identity: 0,
            puzzle_difficulty: 0,
            puzzle_solution: 0,
            puzzle_request_index: None,
            puzzle_retried: false,
            local_key: None,
            remote_public_key: Vec::new(),
            shared_secret: None,
            symmetric_key: [0; SYMMETRIC_KEY_SIZE],
            init_vector: [0; SYMMETRIC_KEY_SIZE],
            cipher: None,
            connect_data: Vec::new(),
            accept_data: Vec::new(),
            initial_send_sequence,
            next_send_sequence: initial_send_sequence,
            last_notified_sequence: initial_send_sequence.wrapping_sub(1),
            sent_notify: VecDeque::new(),
            highest_recv_sequence: 0,
            recv_bits: 0,
            last_send_time: now,
            last_recv_time: now,
            ack_pending: false,
            ack_pending_since: now,
            state_last_send: now,
            state_retry_interval: 0,
            state_retries_remaining: 0,
            introducer: None,
            introduction_token: 0,
            introduction_target: 0,
            candidate_addresses: Vec::new(),
            introduction_requests: Vec::new(),
        }
    }

    /// Arms the pending-state scheduler: `retries` further sends at
    /// `interval`, then a timeout one interval after the last.
    pub fn arm_state_timer(&mut self, now: u64, retries: u32, interval: u64) {
        self.state_last_send = now;
        self.state_retries_remaining = retries;
        self.state_retry_interval = interval;
    }

    /// Seeds the receive window from the peer's initial send sequence.
    pub fn set_initial_recv_sequence(&mut self, sequence: u32) {
        self.highest_recv_sequence = sequence.wrapping_sub(1);
        // Everything "before" the first packet counts as received so stale
        // offsets never read as losses.
        self.recv_bits = 0x7fff_ffff;
    }

    /// Builds the symmetric cipher once both key halves are known.
    pub fn install_cipher(&mut self) {
        self.cipher = Some(PacketCipher::new(&self.symmetric_key, &self.init_vector));
    }

    /// Returns false if an identical request was already on file.
    pub fn record_introduction_request(&mut self, identity: u32, token: u32) -> bool {
        if self.introduction_requests.contains(&(identity, token)) {
            return false;
        }
        if self.introduction_requests.len() == MAX_INTRODUCTION_REQUESTS {
            self.introduction_requests.remove(0);
        }
        self.introduction_requests.push((identity, token));
        true
    }

    pub fn take_introduction_request(&mut self, identity: u32, token: u32) -> bool {
        let before = self.introduction_requests.len();
        self.introduction_requests
            .retain(|&(i, t)| (i, t) != (identity, token));
        self.introduction_requests.len() != before
    }

    pub fn add_candidate_address(&mut self, addr: SocketAddr) {
        if self.candidate_addresses.contains(&addr) {
            return;
        }
        if self.candidate_addresses.len() < MAX_CANDIDATE_ADDRESSES {
            self.candidate_addresses.push(addr);
        }
    }

    /// Whether a punch from `addr` plausibly belongs to this connection's
    /// peer: an exact candidate match, or the same host behind a different
    /// port (a NAT rewriting the source port).
    pub fn matches_candidate(&self, addr: &SocketAddr) -> bool {
        self.candidate_addresses
            .iter()
            .any(|candidate| candidate == addr || candidate.ip() == addr.ip())
    }

    fn in_flight(&self) -> u32 {
        self.next_send_sequence
            .wrapping_sub(1)
            .wrapping_sub(self.last_notified_sequence)
    }

    pub fn send_window_full(&self) -> bool {
        self.in_flight() >= PACKET_WINDOW_SIZE
    }

    /// Frames, encrypts, and signs one connected-protocol packet, consuming
    /// the next send sequence. Every packet carries the current receive
    /// window as its acknowledgement fields.
    pub fn write_packet(
        &mut self,
        now: u64,
        kind: PacketKind,
        payload: &[u8],
    ) -> Result<(u32, Vec<u8>), OpError> {
        if payload.len() > MAX_PACKET_PAYLOAD {
            return Err(OpError::DataTooLarge);
        }
        if self.send_window_full() {
            return Err(OpError::WindowFull);
        }
        let secret = match self.shared_secret {
            Some(secret) if self.cipher.is_some() => secret,
            _ => {
                return Err(OpError::InvalidState);
            }
        };
        let sequence = self.next_send_sequence;
        self.next_send_sequence = sequence.wrapping_add(1);
        self.sent_notify.push_back(kind == PacketKind::Data);

        let header = DataHeader {
            kind,
            sequence,
            ack_base: self.highest_recv_sequence,
            ack_bits: self.recv_bits,
        };
        let mut packet = Vec::with_capacity(DATA_HEADER_SIZE + MAC_SIZE + payload.len());
        header.encode(&mut packet);
        packet.extend_from_slice(&[0; MAC_SIZE]);
        packet.extend_from_slice(payload);
        let body = DATA_HEADER_SIZE + MAC_SIZE;
        self.cipher
            .as_mut()
            .unwrap()
            .apply(sequence, self.role.is_initiator(), &mut packet[body..]);
        let mac = packet_mac(&secret, &[&packet[..DATA_HEADER_SIZE], &packet[body..]]);
        packet[DATA_HEADER_SIZE..body].copy_from_slice(&mac);

        self.last_send_time = now;
        self.ack_pending = false;
        Ok((sequence, packet))
    }

    /// The receive path for connected-protocol packets: sequence recovery,
    /// window and replay checks, signature verification, decryption, ack
    /// processing, and event emission. Anything invalid is dropped silently.
    pub fn handle_connected_packet(
        &mut self,
        now: u64,
        packet: &[u8],
        events: &mut VecDeque<SocketEvent>,
    ) {
        if packet.len() < DATA_HEADER_SIZE + MAC_SIZE || packet.len() > MAX_DATAGRAM_SIZE {
            return;
        }
        if self.state != State::Connected {
            trace!(self.log, "dropping data packet outside connected state");
            return;
        }
        let expected = self.highest_recv_sequence.wrapping_add(1);
        let header = match DataHeader::decode(&mut &packet[..], expected) {
            Ok(header) => header,
            Err(_) => {
                return;
            }
        };

        let placement = {
            let forward = header.sequence.wrapping_sub(self.highest_recv_sequence);
            if forward == 0 {
                trace!(self.log, "duplicate packet"; "sequence" => header.sequence);
                return;
            } else if forward <= PACKET_WINDOW_SIZE {
                Placement::Ahead(forward)
            } else if forward <= 0x8000_0000 {
                trace!(self.log, "packet beyond receive window"; "sequence" => header.sequence);
                return;
            } else {
                let offset = self
                    .highest_recv_sequence
                    .wrapping_sub(header.sequence)
                    .wrapping_sub(1);
                if offset >= PACKET_WINDOW_SIZE {
                    trace!(self.log, "packet too old"; "sequence" => header.sequence);
                    return;
                }
                if self.recv_bits >> offset & 1 == 1 {
                    trace!(self.log, "replayed packet"; "sequence" => header.sequence);
                    return;
                }
                Placement::Fill(offset)
            }
        };

        let secret = match self.shared_secret {
            Some(secret) => secret,
            None => {
                return;
            }
        };
        let body = DATA_HEADER_SIZE + MAC_SIZE;
        let mac = packet_mac(&secret, &[&packet[..DATA_HEADER_SIZE], &packet[body..]]);
        if !constant_time_eq(&mac, &packet[DATA_HEADER_SIZE..body]) {
            trace!(self.log, "bad packet signature"; "sequence" => header.sequence);
            return;
        }

        let mut payload = packet[body..].to_vec();
        match self.cipher.as_mut() {
            Some(cipher) => {
                cipher.apply(header.sequence, !self.role.is_initiator(), &mut payload);
            }
            None => {
                return;
            }
        }

        self.process_acks(header.ack_base, header.ack_bits, events);

        match placement {
            Placement::Ahead(forward) => {
                self.recv_bits = (self.recv_bits << forward | 1 << (forward - 1)) & 0x7fff_ffff;
                self.highest_recv_sequence = header.sequence;
            }
            Placement::Fill(offset) => {
                self.recv_bits |= 1 << offset;
            }
        }

        self.last_recv_time = now;
        if header.kind != PacketKind::Ack {
            if !self.ack_pending {
                self.ack_pending_since = now;
            }
            self.ack_pending = true;
        }
        if header.kind == PacketKind::Data {
            events.push_back(SocketEvent::Packet {
                connection: self.handle,
                sequence: header.sequence,
                payload,
            });
        }
    }

    /// Walks the send window forward to the peer's acknowledged base, posting
    /// one `PacketNotify` per application packet whose fate became known, in
    /// increasing sequence order.
    fn process_acks(&mut self, ack_base: u32, ack_bits: u32, events: &mut VecDeque<SocketEvent>) {
        let forward = ack_base.wrapping_sub(self.last_notified_sequence);
        if forward == 0 || forward > self.in_flight() {
            return;
        }
        for i in 1..=forward {
            let sequence = self.last_notified_sequence.wrapping_add(i);
            let delivered = if sequence == ack_base {
                true
            } else {
                let offset = ack_base.wrapping_sub(sequence).wrapping_sub(1);
                offset < PACKET_WINDOW_SIZE && ack_bits >> offset & 1 == 1
            };
            if self.sent_notify.pop_front().unwrap_or(false) {
                events.push_back(SocketEvent::PacketNotify {
                    connection: self.handle,
                    sequence,
                    delivered,
                });
            }
        }
        self.last_notified_sequence = ack_base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn pair() -> (Connection, Connection) {
        let log = Logger::root(slog::Discard, o!());
        let addr_a = "127.0.0.1:1001".parse().unwrap();
        let addr_b = "127.0.0.1:1002".parse().unwrap();
        let mut a = Connection::new(
            log.clone(),
            ConnectionId(1),
            Role::Initiator,
            State::Connected,
            addr_b,
            7,
            1000,
            0,
        );
        let mut b = Connection::new(
            log,
            ConnectionId(2),
            Role::Host,
            State::Connected,
            addr_a,
            7,
            0xffff_fff0,
            0,
        );
        let secret = [9; 32];
        a.shared_secret = Some(secret);
        b.shared_secret = Some(secret);
        a.symmetric_key = [1; 16];
        b.symmetric_key = [1; 16];
        a.init_vector = [2; 16];
        b.init_vector = [2; 16];
        a.set_initial_recv_sequence(b.initial_send_sequence);
        b.set_initial_recv_sequence(a.initial_send_sequence);
        a.install_cipher();
        b.install_cipher();
        (a, b)
    }

    fn deliver(from: &mut Connection, to: &mut Connection, payload: &[u8]) -> Vec<SocketEvent> {
        let (_, packet) = from.write_packet(0, PacketKind::Data, payload).unwrap();
        let mut events = VecDeque::new();
        to.handle_connected_packet(0, &packet, &mut events);
        events.into_iter().collect()
    }

    #[test]
    fn payload_round_trip() {
        let (mut a, mut b) = pair();
        let events = deliver(&mut a, &mut b, b"hello");
        match &events[..] {
            [SocketEvent::Packet {
                sequence, payload, ..
            }] => {
                assert_eq!(*sequence, 1000);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn replayed_packet_dropped() {
        let (mut a, mut b) = pair();
        let (_, packet) = a.write_packet(0, PacketKind::Data, b"x").unwrap();
        let mut events = VecDeque::new();
        b.handle_connected_packet(0, &packet, &mut events);
        assert_eq!(events.len(), 1);
        b.handle_connected_packet(0, &packet, &mut events);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn corrupt_packet_dropped() {
        let (mut a, mut b) = pair();
        let (_, mut packet) = a.write_packet(0, PacketKind::Data, b"x").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 1;
        let mut events = VecDeque::new();
        b.handle_connected_packet(0, &packet, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn acks_drive_notifies_in_order() {
        let (mut a, mut b) = pair();
        let (seq0, p0) = a.write_packet(0, PacketKind::Data, b"0").unwrap();
        let (seq1, p1) = a.write_packet(0, PacketKind::Data, b"1").unwrap();
        let (seq2, p2) = a.write_packet(0, PacketKind::Data, b"2").unwrap();
        let mut events = VecDeque::new();
        // Packet 1 is lost; 0 and 2 arrive.
        b.handle_connected_packet(0, &p0, &mut events);
        b.handle_connected_packet(0, &p2, &mut events);
        drop(p1);
        // B's next packet carries the ack window back to A.
        let (_, ack) = b.write_packet(0, PacketKind::Ack, &[]).unwrap();
        let mut notifies = VecDeque::new();
        a.handle_connected_packet(0, &ack, &mut notifies);
        let notifies: Vec<_> = notifies.into_iter().collect();
        match &notifies[..] {
            [SocketEvent::PacketNotify {
                sequence: s0,
                delivered: true,
                ..
            }, SocketEvent::PacketNotify {
                sequence: s1,
                delivered: false,
                ..
            }, SocketEvent::PacketNotify {
                sequence: s2,
                delivered: true,
                ..
            }] => {
                assert_eq!((*s0, *s1, *s2), (seq0, seq1, seq2));
            }
            other => panic!("unexpected notifies: {:?}", other),
        }
    }

    #[test]
    fn internal_packets_produce_no_notifies() {
        let (mut a, mut b) = pair();
        let (_, ping) = a.write_packet(0, PacketKind::Ping, &[]).unwrap();
        let mut events = VecDeque::new();
        b.handle_connected_packet(0, &ping, &mut events);
        assert!(events.is_empty());
        let (_, ack) = b.write_packet(0, PacketKind::Ack, &[]).unwrap();
        a.handle_connected_packet(0, &ack, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn window_boundaries() {
        let (mut a, mut b) = pair();
        let mut packets = Vec::new();
        for i in 0..PACKET_WINDOW_SIZE {
            packets.push(a.write_packet(0, PacketKind::Data, &[i as u8]).unwrap().1);
        }
        // 31 packets in flight fills the send window.
        assert_matches!(
            a.write_packet(0, PacketKind::Data, b"x"),
            Err(OpError::WindowFull)
        );
        let mut events = VecDeque::new();
        // Deliver only the newest: base jumps by 31, the limit of the window.
        b.handle_connected_packet(0, packets.last().unwrap(), &mut events);
        assert_eq!(events.len(), 1);
        // The oldest is now exactly the edge of the receive window.
        b.handle_connected_packet(0, &packets[0], &mut events);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn oversized_payload_rejected() {
        let (mut a, _) = pair();
        let payload = vec![0; MAX_PACKET_PAYLOAD];
        assert!(a.write_packet(0, PacketKind::Data, &payload).is_ok());
        let payload = vec![0; MAX_PACKET_PAYLOAD + 1];
        assert_matches!(
            a.write_packet(0, PacketKind::Data, &payload),
            Err(OpError::DataTooLarge)
        );
    }

    #[test]
    fn sequence_rollover() {
        let (mut a, mut b) = pair();
        // B's initial send sequence sits 16 below the 32-bit boundary, so the
        // sequence space wraps mid-run.
        for i in 0..PACKET_WINDOW_SIZE {
            let events = deliver(&mut b, &mut a, &[i as u8]);
            assert_eq!(events.len(), 1, "packet {} lost across rollover", i);
        }
    }
}
