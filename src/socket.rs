use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Buf;
use fnv::FnvHashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::digest;
use slab::Slab;
use slog::Logger;

use crate::coding::{self, address_bytes, BufExt, BufMutExt};
use crate::connection::{Connection, State};
use crate::crypto::{open_handshake, seal_handshake, KeyPair, SYMMETRIC_KEY_SIZE};
use crate::packet::{HandshakeType, PacketKind, CONNECTED_PACKET_BIT, FIRST_INFO_PACKET_BYTE};
use crate::puzzle::{PuzzleJob, PuzzleManager, PuzzleSolver, SolutionCheck};
use crate::transport::{BindError, Transport, UdpTransport};
use crate::{ConnectionId, Role, MAX_DATAGRAM_SIZE, MAX_PUBLIC_KEY_SIZE, MAX_STATUS_SIZE};

/// Reason sent when a local connect displaces an established connection to
/// the same address.
pub const REASON_RECONNECTING: &[u8] = b"RECONNECTING";
/// Reason sent when a fresh valid connect request displaces an established
/// connection on the host side.
pub const REASON_NEW_CONNECTION: &[u8] = b"NEW_CONNECTION";
/// Reason sent to every established peer when the socket shuts down.
pub const REASON_SHUTDOWN: &[u8] = b"SHUTDOWN";
/// Reason carried by every timeout event.
pub const REASON_TIMEDOUT: &[u8] = b"TIMEDOUT";
/// Reason carried by a connect reject when the puzzle solution fails; the
/// initiator retries once with a fresh nonce on seeing it.
pub const REASON_FAILED_PUZZLE: &[u8] = b"Puzzle";

/// Parameters governing handshake retries, timeouts, keep-alive traffic, and
/// puzzle issue.
pub struct Config {
    /// Total connect-challenge-request sends before giving up.
    pub challenge_retry_count: u32,
    pub challenge_retry_interval: u64,
    /// Total connect-request sends before giving up.
    pub connect_retry_count: u32,
    pub connect_retry_interval: u64,
    /// Total punch volleys before giving up on an introduced peer.
    pub punch_retry_count: u32,
    pub punch_retry_interval: u64,
    /// How long an introduced host waits for the punched initiator's connect
    /// request.
    pub introduced_connect_timeout: u64,
    /// How long the background solver may spend on one puzzle.
    pub puzzle_solution_timeout: u64,
    /// Granularity of established-connection idle checks.
    pub timeout_check_interval: u64,
    /// Established connections with no authenticated traffic for this long
    /// are timed out.
    pub idle_timeout: u64,
    /// How long a received packet's acknowledgement may wait for a piggyback
    /// before a bare ack packet is sent.
    pub ack_delay: u64,
    /// Keep-alive interval for established connections with nothing to send.
    pub ping_interval: u64,
    pub initial_puzzle_difficulty: u32,
    pub max_puzzle_difficulty: u32,
    /// How often the server puzzle nonce rotates.
    pub puzzle_refresh_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            challenge_retry_count: 4,
            challenge_retry_interval: 2_500,
            connect_retry_count: 4,
            connect_retry_interval: 2_500,
            punch_retry_count: 6,
            punch_retry_interval: 2_500,
            introduced_connect_timeout: 45_000,
            puzzle_solution_timeout: 30_000,
            timeout_check_interval: 1_500,
            idle_timeout: 30_000,
            ack_delay: 100,
            ping_interval: 5_000,
            initial_puzzle_difficulty: 17,
            max_puzzle_difficulty: 26,
            puzzle_refresh_interval: 30_000,
        }
    }
}

/// Why a socket operation was refused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum OpError {
    /// The connection id does not name a live connection.
    #[fail(display = "unknown connection")]
    UnknownConnection,
    /// The connection is not in a state that permits the operation.
    #[fail(display = "operation invalid in current connection state")]
    InvalidState,
    /// A payload or status blob exceeds its wire limit.
    #[fail(display = "payload too large")]
    DataTooLarge,
    /// The send window already holds 31 unacknowledged packets.
    #[fail(display = "send window full")]
    WindowFull,
    /// A private key blob is not a valid 32-byte X25519 secret.
    #[fail(display = "malformed key")]
    InvalidKey,
    /// An info packet's first byte is outside 32..128.
    #[fail(display = "info packets must begin with a byte in 32..128")]
    InvalidInfoPacket,
}

/// Everything the socket tells the application, pulled FIFO from
/// [`Socket::get_next_event`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SocketEvent {
    /// The host answered our challenge; call `accept_challenge` to continue.
    ChallengeResponse {
        connection: ConnectionId,
        public_key: Vec<u8>,
        data: Vec<u8>,
    },
    /// A remote peer passed the handshake checks and wants to connect; call
    /// `accept_connection` or `close_connection`.
    ConnectionRequested {
        connection: ConnectionId,
        public_key: Vec<u8>,
        data: Vec<u8>,
    },
    /// An established peer asked to be introduced to another of our peers;
    /// answer with `introduce_connection`.
    IntroducedConnectionRequest {
        connection: ConnectionId,
        client_identity: u32,
        token: u32,
    },
    /// The host accepted our connect request.
    Accepted {
        connection: ConnectionId,
        data: Vec<u8>,
    },
    /// The host rejected our connect request. Terminal.
    Rejected {
        connection: ConnectionId,
        reason: Vec<u8>,
    },
    /// A handshake or established connection ran out of time. Terminal.
    TimedOut {
        connection: ConnectionId,
        reason: Vec<u8>,
    },
    /// The connection ended, remotely or locally. Terminal.
    Disconnected {
        connection: ConnectionId,
        reason: Vec<u8>,
    },
    /// The connection is live; data packets may now flow.
    Established { connection: ConnectionId },
    /// An application payload arrived on an established connection.
    Packet {
        connection: ConnectionId,
        sequence: u32,
        payload: Vec<u8>,
    },
    /// The fate of a sent packet became known; exactly one per
    /// `send_to_connection`, in increasing sequence order.
    PacketNotify {
        connection: ConnectionId,
        sequence: u32,
        delivered: bool,
    },
    /// A raw info packet (first byte 32..128) arrived.
    InfoPacket {
        source: SocketAddr,
        data: Vec<u8>,
    },
}

struct DelayedSend {
    send_time: u64,
    remote: SocketAddr,
    packet: Vec<u8>,
}

/// A bound datagram endpoint multiplexing any number of peer connections.
///
/// The socket performs no blocking I/O and spawns no threads besides the
/// puzzle solver. All protocol work happens inside `get_next_event`, which
/// the application is expected to call regularly.
pub struct Socket {
    log: Logger,
    config: Config,
    transport: Box<dyn Transport>,
    rng: OsRng,
    private_key: Arc<KeyPair>,
    challenge_response: Vec<u8>,
    allow_connections: bool,
    /// Secret mixed into client-identity tokens so they cannot be forged.
    random_hash_secret: [u8; 12],
    connections: Slab<Connection>,
    connection_ids: FnvHashMap<ConnectionId, usize>,
    established_remotes: FnvHashMap<SocketAddr, usize>,
    pending: Vec<usize>,
    puzzle_manager: PuzzleManager,
    puzzle_solver: PuzzleSolver,
    next_puzzle_index: u32,
    events: VecDeque<SocketEvent>,
    delayed_sends: Vec<DelayedSend>,
    now: u64,
    epoch: Instant,
    last_idle_check: u64,
}

impl Socket {
    /// Binds a non-blocking UDP endpoint and wraps it in a socket.
    pub fn bind(log: Logger, config: Config, addr: SocketAddr) -> Result<Self, BindError> {
        let transport = UdpTransport::bind(addr)?;
        Ok(Self::new(log, config, Box::new(transport)))
    }

    /// Builds a socket over an already-bound transport.
    pub fn new(log: Logger, config: Config, transport: Box<dyn Transport>) -> Self {
        let mut rng = OsRng;
        let private_key = Arc::new(KeyPair::generate(&mut rng));
        let mut random_hash_secret = [0; 12];
        rng.fill_bytes(&mut random_hash_secret);
        let puzzle_manager = PuzzleManager::new(
            &mut rng,
            config.initial_puzzle_difficulty,
            config.max_puzzle_difficulty,
            config.puzzle_refresh_interval,
        );
        Self {
            log,
            config,
            transport,
            rng,
            private_key,
            challenge_response: Vec::new(),
            allow_connections: true,
            random_hash_secret,
            connections: Slab::new(),
            connection_ids: FnvHashMap::default(),
            established_remotes: FnvHashMap::default(),
            pending: Vec::new(),
            puzzle_manager,
            puzzle_solver: PuzzleSolver::new(),
            next_puzzle_index: 0,
            events: VecDeque::new(),
            delayed_sends: Vec::new(),
            now: 0,
            epoch: Instant::now(),
            last_idle_check: 0,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Installs the 32-byte X25519 secret used for key exchange. Takes effect
    /// for subsequent handshakes only.
    pub fn set_private_key(&mut self, key: &[u8]) -> Result<(), OpError> {
        if key.len() != 32 {
            return Err(OpError::InvalidKey);
        }
        let mut bytes = [0; 32];
        bytes.copy_from_slice(key);
        self.private_key = Arc::new(KeyPair::from_bytes(bytes));
        Ok(())
    }

    /// The public half of the current key, as peers will see it.
    pub fn public_key(&self) -> [u8; 32] {
        self.private_key.public_bytes()
    }

    /// Opaque bytes returned in every outgoing challenge response.
    pub fn set_challenge_response(&mut self, data: &[u8]) -> Result<(), OpError> {
        if data.len() > MAX_STATUS_SIZE {
            return Err(OpError::DataTooLarge);
        }
        self.challenge_response = data.to_vec();
        Ok(())
    }

    /// When false, anonymous challenge and connect requests are silently
    /// ignored; introduced connections still complete.
    pub fn allow_incoming_connections(&mut self, allow: bool) {
        self.allow_connections = allow;
    }

    /// Adjusts the issued puzzle difficulty, clamped to the configured
    /// maximum.
    pub fn set_puzzle_difficulty(&mut self, difficulty: u32) {
        self.puzzle_manager.set_difficulty(difficulty);
    }

    /// The identity token associated with a live connection, usable as an
    /// introduction target by the peers of a mutual introducer.
    pub fn client_identity(&self, connection: ConnectionId) -> Option<u32> {
        let &index = self.connection_ids.get(&connection)?;
        Some(self.connections[index].client_identity)
    }

    /// Starts a connection to `remote`. An established connection to the same
    /// address is displaced with reason `RECONNECTING`.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        connect_data: &[u8],
    ) -> Result<ConnectionId, OpError> {
        if connect_data.len() > MAX_STATUS_SIZE {
            return Err(OpError::DataTooLarge);
        }
        let now = self.now;
        if let Some(index) = self.find_pending_by_addr(&remote) {
            self.post_terminal_disconnect(index, REASON_RECONNECTING.to_vec());
        }
        if let Some(&index) = self.established_remotes.get(&remote) {
            self.disconnect_established(index, REASON_RECONNECTING);
        }
        let handle = self.new_connection_id();
        let initiator_nonce = self.rng.next_u64();
        let initial_send_sequence = self.rng.next_u32();
        let mut conn = Connection::new(
            self.log.new(o!("connection" => handle.0)),
            handle,
            Role::Initiator,
            State::AwaitingChallengeResponse,
            remote,
            initiator_nonce,
            initial_send_sequence,
            now,
        );
        conn.connect_data = connect_data.to_vec();
        conn.arm_state_timer(
            now,
            self.config.challenge_retry_count.saturating_sub(1),
            self.config.challenge_retry_interval,
        );
        let index = self.add_pending(conn);
        info!(self.log, "connecting"; "remote" => %remote, "connection" => handle);
        self.send_challenge_request(index);
        Ok(handle)
    }

    /// Starts an introduced connection to the peer of `introducer` whose
    /// client identity on the introducer is `remote_identity`.
    pub fn connect_introduced(
        &mut self,
        introducer: ConnectionId,
        remote_identity: u32,
        token: u32,
        connect_data: &[u8],
    ) -> Result<ConnectionId, OpError> {
        if connect_data.len() > MAX_STATUS_SIZE {
            return Err(OpError::DataTooLarge);
        }
        let introducer_index = *self
            .connection_ids
            .get(&introducer)
            .ok_or(OpError::UnknownConnection)?;
        if self.connections[introducer_index].state != State::Connected {
            return Err(OpError::InvalidState);
        }
        let introducer_remote = self.connections[introducer_index].remote;
        let now = self.now;
        let handle = self.new_connection_id();
        let initiator_nonce = self.rng.next_u64();
        let initial_send_sequence = self.rng.next_u32();
        let mut conn = Connection::new(
            self.log.new(o!("connection" => handle.0)),
            handle,
            Role::IntroducedInitiator,
            State::AwaitingIntroduction,
            introducer_remote,
            initiator_nonce,
            initial_send_sequence,
            now,
        );
        conn.connect_data = connect_data.to_vec();
        conn.introducer = Some(introducer);
        conn.introduction_token = token;
        conn.introduction_target = remote_identity;
        conn.arm_state_timer(
            now,
            self.config.challenge_retry_count.saturating_sub(1),
            self.config.challenge_retry_interval,
        );
        let index = self.add_pending(conn);
        info!(self.log, "requesting introduction";
              "introducer" => introducer, "identity" => remote_identity, "connection" => handle);
        self.send_introduction_request(index);
        Ok(handle)
    }

    /// On the introducer: brokers a rendezvous between two established peers
    /// that have both filed introduction requests with `token`. The first
    /// connection is assigned the initiator role.
    pub fn introduce_connection(
        &mut self,
        connection_a: ConnectionId,
        connection_b: ConnectionId,
        token: u32,
    ) -> Result<(), OpError> {
        let index_a = *self
            .connection_ids
            .get(&connection_a)
            .ok_or(OpError::UnknownConnection)?;
        let index_b = *self
            .connection_ids
            .get(&connection_b)
            .ok_or(OpError::UnknownConnection)?;
        if self.connections[index_a].state != State::Connected
            || self.connections[index_b].state != State::Connected
        {
            return Err(OpError::InvalidState);
        }
        let identity_a = self.connections[index_a].client_identity;
        let identity_b = self.connections[index_b].client_identity;
        let matched_a = self.connections[index_a]
            .introduction_requests
            .contains(&(identity_b, token));
        let matched_b = self.connections[index_b]
            .introduction_requests
            .contains(&(identity_a, token));
        if !matched_a || !matched_b {
            return Err(OpError::InvalidState);
        }
        self.connections[index_a].take_introduction_request(identity_b, token);
        self.connections[index_b].take_introduction_request(identity_a, token);
        let addr_a = self.connections[index_a].remote;
        let addr_b = self.connections[index_b].remote;
        info!(self.log, "introducing peers";
              "initiator" => %addr_a, "host" => %addr_b, "token" => token);
        self.send_send_punch(&addr_a, &addr_b, true, token);
        self.send_send_punch(&addr_b, &addr_a, false, token);
        Ok(())
    }

    /// Consents to a received challenge; queues the puzzle for the background
    /// solver, after which the connect request goes out.
    pub fn accept_challenge(&mut self, connection: ConnectionId) -> Result<(), OpError> {
        let index = *self
            .connection_ids
            .get(&connection)
            .ok_or(OpError::UnknownConnection)?;
        if self.connections[index].state != State::AwaitingLocalChallengeAccept {
            return Err(OpError::InvalidState);
        }
        let job_index = self.next_puzzle_index;
        self.next_puzzle_index = self.next_puzzle_index.wrapping_add(1);
        let now = self.now;
        let timeout = self.config.puzzle_solution_timeout;
        let conn = &mut self.connections[index];
        conn.state = State::ComputingPuzzleSolution;
        conn.puzzle_request_index = Some(job_index);
        conn.arm_state_timer(now, 0, timeout);
        let job = PuzzleJob {
            index: job_index,
            initiator_nonce: conn.initiator_nonce,
            server_nonce: conn.host_nonce,
            difficulty: conn.puzzle_difficulty,
            client_identity: conn.client_identity,
        };
        debug!(conn.log, "solving puzzle"; "difficulty" => conn.puzzle_difficulty);
        self.puzzle_solver.post(job);
        Ok(())
    }

    /// Completes a pending incoming connection; the peer receives a sealed
    /// connect accept carrying `accept_data`.
    pub fn accept_connection(
        &mut self,
        connection: ConnectionId,
        accept_data: &[u8],
    ) -> Result<(), OpError> {
        if accept_data.len() > MAX_STATUS_SIZE {
            return Err(OpError::DataTooLarge);
        }
        let index = *self
            .connection_ids
            .get(&connection)
            .ok_or(OpError::UnknownConnection)?;
        if self.connections[index].state != State::AwaitingLocalAccept {
            return Err(OpError::InvalidState);
        }
        let now = self.now;
        {
            let conn = &mut self.connections[index];
            conn.accept_data = accept_data.to_vec();
            conn.install_cipher();
            conn.state = State::Connected;
            conn.last_recv_time = now;
            conn.last_send_time = now;
            info!(conn.log, "connection established"; "remote" => %conn.remote);
        }
        self.promote_to_established(index);
        self.send_connect_accept(index);
        self.events.push_back(SocketEvent::Established { connection });
        Ok(())
    }

    /// Gracefully ends a connection: rejects it if still pending on the host
    /// side, or sends a sealed disconnect if established. Always posts a
    /// terminal `Disconnected` event locally.
    pub fn close_connection(
        &mut self,
        connection: ConnectionId,
        reason: &[u8],
    ) -> Result<(), OpError> {
        if reason.len() > MAX_STATUS_SIZE {
            return Err(OpError::DataTooLarge);
        }
        let index = *self
            .connection_ids
            .get(&connection)
            .ok_or(OpError::UnknownConnection)?;
        match self.connections[index].state {
            State::Connected => {
                self.disconnect_established(index, reason);
            }
            State::AwaitingLocalAccept => {
                let (initiator_nonce, host_nonce, remote) = {
                    let conn = &self.connections[index];
                    (conn.initiator_nonce, conn.host_nonce, conn.remote)
                };
                self.send_connect_reject(initiator_nonce, host_nonce, &remote, reason);
                self.post_terminal_disconnect(index, reason.to_vec());
            }
            _ => {
                self.post_terminal_disconnect(index, reason.to_vec());
            }
        }
        Ok(())
    }

    /// Sends one datagram payload on an established connection, returning the
    /// sequence number that its eventual `PacketNotify` will carry.
    pub fn send_to_connection(
        &mut self,
        connection: ConnectionId,
        payload: &[u8],
    ) -> Result<u32, OpError> {
        let index = *self
            .connection_ids
            .get(&connection)
            .ok_or(OpError::UnknownConnection)?;
        if self.connections[index].state != State::Connected {
            return Err(OpError::InvalidState);
        }
        let now = self.now;
        let (sequence, packet) =
            self.connections[index].write_packet(now, PacketKind::Data, payload)?;
        let remote = self.connections[index].remote;
        self.send_packet(&remote, &packet);
        Ok(sequence)
    }

    /// Sends a raw info packet; the peer socket surfaces it as an
    /// `InfoPacket` event without any connection state.
    pub fn send_to(&mut self, remote: SocketAddr, data: &[u8]) -> Result<(), OpError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(OpError::DataTooLarge);
        }
        if data.is_empty()
            || data[0] < FIRST_INFO_PACKET_BYTE
            || data[0] & CONNECTED_PACKET_BIT != 0
        {
            return Err(OpError::InvalidInfoPacket);
        }
        self.send_packet(&remote, data);
        Ok(())
    }

    /// Queues a datagram for transmission after `delay` milliseconds; used to
    /// simulate latency on a LAN or a single machine.
    pub fn send_to_delayed(&mut self, remote: SocketAddr, data: &[u8], delay: u64) {
        let send_time = self.now + delay;
        let at = self
            .delayed_sends
            .iter()
            .position(|d| d.send_time > send_time)
            .unwrap_or_else(|| self.delayed_sends.len());
        self.delayed_sends.insert(
            at,
            DelayedSend {
                send_time,
                remote,
                packet: data.to_vec(),
            },
        );
    }

    /// Pulls the next event, stamping time from the socket's own monotonic
    /// clock. Also drives retries, timeouts, puzzle solving, and datagram
    /// intake.
    pub fn get_next_event(&mut self) -> Option<SocketEvent> {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.get_next_event_at(now)
    }

    /// `get_next_event` for callers that manage their own millisecond clock;
    /// `now` must not move backwards.
    pub fn get_next_event_at(&mut self, now: u64) -> Option<SocketEvent> {
        self.service(now);
        if self.events.is_empty() {
            self.drain_transport(now);
        }
        self.events.pop_front()
    }

    //
    // Scheduling
    //

    fn service(&mut self, now: u64) {
        self.now = now;
        self.puzzle_manager.tick(now, &mut self.rng);

        while let Some(at) = self
            .delayed_sends
            .iter()
            .position(|d| d.send_time <= now)
        {
            let delayed = self.delayed_sends.remove(at);
            self.send_packet(&delayed.remote, &delayed.packet);
        }

        self.check_pending_connections(now);
        self.check_established_connections(now);
        self.collect_puzzle_solutions(now);
    }

    fn check_pending_connections(&mut self, now: u64) {
        let pending = self.pending.clone();
        for index in pending {
            if !self.connections.contains(index) {
                continue;
            }
            let (state, due, retries_left) = {
                let conn = &self.connections[index];
                (
                    conn.state,
                    conn.state_retry_interval > 0
                        && now >= conn.state_last_send + conn.state_retry_interval,
                    conn.state_retries_remaining,
                )
            };
            if !due {
                continue;
            }
            if retries_left == 0 {
                let handle = self.connections[index].handle;
                debug!(self.connections[index].log, "pending connection timed out";
                       "state" => ?state);
                self.cancel_puzzle_job(index);
                self.events.push_back(SocketEvent::TimedOut {
                    connection: handle,
                    reason: REASON_TIMEDOUT.to_vec(),
                });
                self.remove_connection(index);
                continue;
            }
            {
                let conn = &mut self.connections[index];
                conn.state_retries_remaining -= 1;
                conn.state_last_send = now;
            }
            match state {
                State::AwaitingChallengeResponse => self.send_challenge_request(index),
                State::AwaitingConnectResponse => self.send_connect_request(index),
                State::SendingPunchPackets => self.send_punch_packets(index),
                State::AwaitingIntroduction => self.send_introduction_request(index),
                _ => {}
            }
        }
    }

    fn check_established_connections(&mut self, now: u64) {
        let idle_check = now >= self.last_idle_check + self.config.timeout_check_interval;
        if idle_check {
            self.last_idle_check = now;
        }
        let established: Vec<usize> = self.established_remotes.values().cloned().collect();
        for index in established {
            if !self.connections.contains(index) {
                continue;
            }
            let (idle, ack_due, ping_due, remote, handle) = {
                let conn = &self.connections[index];
                (
                    now >= conn.last_recv_time + self.config.idle_timeout,
                    conn.ack_pending && now >= conn.ack_pending_since + self.config.ack_delay,
                    now >= conn.last_send_time + self.config.ping_interval,
                    conn.remote,
                    conn.handle,
                )
            };
            if idle_check && idle {
                debug!(self.connections[index].log, "established connection timed out");
                self.events.push_back(SocketEvent::TimedOut {
                    connection: handle,
                    reason: REASON_TIMEDOUT.to_vec(),
                });
                self.remove_connection(index);
                continue;
            }
            if ack_due || ping_due {
                let kind = if ack_due { PacketKind::Ack } else { PacketKind::Ping };
                if let Ok((_, packet)) = self.connections[index].write_packet(now, kind, &[]) {
                    self.send_packet(&remote, &packet);
                }
            }
        }
    }

    fn collect_puzzle_solutions(&mut self, now: u64) {
        while let Some((job_index, solution)) = self.puzzle_solver.next_result() {
            let found = self.pending.iter().cloned().find(|&index| {
                let conn = &self.connections[index];
                conn.state == State::ComputingPuzzleSolution
                    && conn.puzzle_request_index == Some(job_index)
            });
            let index = match found {
                Some(index) => index,
                None => continue,
            };
            {
                let conn = &mut self.connections[index];
                conn.puzzle_solution = solution;
                conn.puzzle_request_index = None;
                conn.state = State::AwaitingConnectResponse;
                debug!(conn.log, "puzzle solved"; "solution" => solution);
            }
            let retries = self.config.connect_retry_count.saturating_sub(1);
            let interval = self.config.connect_retry_interval;
            self.connections[index].arm_state_timer(now, retries, interval);
            self.send_connect_request(index);
        }
    }

    fn drain_transport(&mut self, now: u64) {
        let mut buf = [0; 2048];
        loop {
            match self.transport.recv_from(&mut buf) {
                Ok(Some((len, addr))) => {
                    self.process_packet(now, addr, &buf[..len]);
                    if !self.events.is_empty() {
                        return;
                    }
                }
                Ok(None) => {
                    return;
                }
                Err(e) => {
                    debug!(self.log, "transport receive error"; "error" => %e);
                    return;
                }
            }
        }
    }

    //
    // Dispatch
    //

    fn process_packet(&mut self, now: u64, addr: SocketAddr, data: &[u8]) {
        if data.is_empty() || data.len() > MAX_DATAGRAM_SIZE {
            return;
        }
        let first = data[0];
        if first & CONNECTED_PACKET_BIT != 0 {
            if let Some(&index) = self.established_remotes.get(&addr) {
                let Socket {
                    ref mut connections,
                    ref mut events,
                    ..
                } = *self;
                connections[index].handle_connected_packet(now, data, events);
            } else {
                trace!(self.log, "data packet from unknown address"; "remote" => %addr);
            }
            return;
        }
        if first >= FIRST_INFO_PACKET_BYTE {
            self.events.push_back(SocketEvent::InfoPacket {
                source: addr,
                data: data.to_vec(),
            });
            return;
        }
        let result = match HandshakeType::from_byte(first) {
            Some(HandshakeType::ConnectChallengeRequest) => {
                self.handle_challenge_request(now, addr, data)
            }
            Some(HandshakeType::ConnectChallengeResponse) => {
                self.handle_challenge_response(now, addr, data)
            }
            Some(HandshakeType::ConnectRequest) => self.handle_connect_request(now, addr, data),
            Some(HandshakeType::ConnectReject) => self.handle_connect_reject(now, addr, data),
            Some(HandshakeType::ConnectAccept) => self.handle_connect_accept(now, addr, data),
            Some(HandshakeType::Disconnect) => self.handle_disconnect(now, addr, data),
            Some(HandshakeType::Punch) => self.handle_punch(now, addr, data),
            Some(HandshakeType::IntroductionRequest) => {
                self.handle_introduction_request(now, addr, data)
            }
            Some(HandshakeType::SendPunchPacket) => self.handle_send_punch(now, addr, data),
            // The dormant arranged-connect path is not part of the protocol.
            Some(HandshakeType::ArrangedConnectRequest) | None => Ok(()),
        };
        if result.is_err() {
            trace!(self.log, "malformed handshake packet";
                   "remote" => %addr, "type" => first);
        }
    }

    //
    // Handshake: challenge
    //

    fn send_challenge_request(&mut self, index: usize) {
        let (remote, packet) = {
            let conn = &self.connections[index];
            let mut packet = Vec::with_capacity(9);
            packet.write(HandshakeType::ConnectChallengeRequest as u8);
            packet.write(conn.initiator_nonce);
            debug!(conn.log, "sending challenge request"; "remote" => %conn.remote);
            (conn.remote, packet)
        };
        self.send_packet(&remote, &packet);
    }

    fn handle_challenge_request(
        &mut self,
        now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let mut introduced = false;
        if let Some(index) = self.find_pending_for_handshake(&addr) {
            let timeout = self.config.introduced_connect_timeout;
            let conn = &mut self.connections[index];
            match conn.state {
                State::SendingPunchPackets if !conn.role.is_initiator() => {
                    debug!(conn.log, "punched peer opened handshake"; "remote" => %addr);
                    conn.initiator_nonce = initiator_nonce;
                    conn.remote = addr;
                    conn.state = State::AwaitingConnectRequest;
                    conn.arm_state_timer(now, 0, timeout);
                    introduced = true;
                }
                State::AwaitingConnectRequest => {
                    if conn.initiator_nonce != initiator_nonce {
                        return Ok(());
                    }
                    introduced = true;
                }
                _ => {
                    if conn.initiator_nonce != initiator_nonce {
                        return Ok(());
                    }
                }
            }
        }
        if !self.allow_connections && !introduced {
            return Ok(());
        }
        debug!(self.log, "answering challenge request"; "remote" => %addr);
        self.send_challenge_response(&addr, initiator_nonce);
        Ok(())
    }

    /// Stateless: everything the response carries is recomputable, so a flood
    /// of challenge requests allocates nothing.
    fn send_challenge_response(&mut self, addr: &SocketAddr, initiator_nonce: u64) {
        let identity = self.compute_client_identity(addr, initiator_nonce);
        let mut packet = Vec::with_capacity(64 + self.challenge_response.len());
        packet.write(HandshakeType::ConnectChallengeResponse as u8);
        packet.write(initiator_nonce);
        packet.write(identity);
        packet.write(self.puzzle_manager.current_nonce());
        packet.write(self.puzzle_manager.difficulty());
        packet.put_buffer(&self.private_key.public_bytes());
        packet.put_buffer(&self.challenge_response);
        self.send_packet(addr, &packet);
    }

    fn handle_challenge_response(
        &mut self,
        now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let index = match self.find_pending_by_addr(&addr) {
            Some(index) => index,
            None => {
                return Ok(());
            }
        };
        {
            let conn = &self.connections[index];
            if conn.state != State::AwaitingChallengeResponse
                || conn.initiator_nonce != initiator_nonce
            {
                return Ok(());
            }
        }
        let client_identity = BufExt::get::<u32>(&mut r)?;
        let host_nonce = BufExt::get::<u64>(&mut r)?;
        let difficulty = BufExt::get::<u32>(&mut r)?;
        if difficulty > self.config.max_puzzle_difficulty {
            return Ok(());
        }
        let public_key = r.get_buffer(MAX_PUBLIC_KEY_SIZE)?;
        let response_data = r.get_buffer(MAX_STATUS_SIZE)?;
        let local_key = self.private_key.clone();
        let shared_secret = match local_key.shared_secret(&public_key) {
            Some(secret) => secret,
            None => {
                debug!(self.log, "challenge response carried an invalid key"; "remote" => %addr);
                return Ok(());
            }
        };
        let mut symmetric_key = [0; SYMMETRIC_KEY_SIZE];
        self.rng.fill_bytes(&mut symmetric_key);
        let (handle, public_key) = {
            let conn = &mut self.connections[index];
            conn.client_identity = client_identity;
            conn.host_nonce = host_nonce;
            conn.puzzle_difficulty = difficulty;
            conn.remote_public_key = public_key;
            conn.local_key = Some(local_key);
            conn.shared_secret = Some(shared_secret);
            conn.symmetric_key = symmetric_key;
            conn.state = State::AwaitingLocalChallengeAccept;
            conn.arm_state_timer(now, 0, 0);
            debug!(conn.log, "got challenge response"; "identity" => client_identity);
            (conn.handle, conn.remote_public_key.clone())
        };
        self.events.push_back(SocketEvent::ChallengeResponse {
            connection: handle,
            public_key,
            data: response_data,
        });
        Ok(())
    }

    //
    // Handshake: connect request / accept / reject
    //

    fn send_connect_request(&mut self, index: usize) {
        let (remote, packet) = {
            let conn = &self.connections[index];
            let (local_key, shared_secret) = match (&conn.local_key, conn.shared_secret) {
                (Some(key), Some(secret)) => (key, secret),
                _ => {
                    return;
                }
            };
            let mut packet = Vec::with_capacity(128 + conn.connect_data.len());
            packet.write(HandshakeType::ConnectRequest as u8);
            packet.write(conn.initiator_nonce);
            packet.write(conn.host_nonce);
            packet.write(conn.client_identity);
            packet.write(conn.puzzle_difficulty);
            packet.write(conn.puzzle_solution);
            packet.put_buffer(&local_key.public_bytes());
            let secret_from = packet.len();
            packet.extend_from_slice(&conn.symmetric_key);
            packet.write(conn.initial_send_sequence);
            packet.put_buffer(&conn.connect_data);
            seal_handshake(&mut packet, secret_from, &shared_secret);
            debug!(conn.log, "sending connect request");
            (conn.remote, packet)
        };
        self.send_packet(&remote, &packet);
    }

    fn handle_connect_request(
        &mut self,
        now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let host_nonce = BufExt::get::<u64>(&mut r)?;

        // A duplicate request for a connection we already accepted gets the
        // same accept again; the initiator's accept packet was lost.
        if let Some(&index) = self.established_remotes.get(&addr) {
            let conn = &self.connections[index];
            if conn.initiator_nonce == initiator_nonce && conn.host_nonce == host_nonce {
                debug!(conn.log, "duplicate connect request; resending accept");
                self.send_connect_accept(index);
                return Ok(());
            }
        }

        let pending_index = self.find_pending_by_addr(&addr);
        let introduced = pending_index
            .map(|index| self.connections[index].state == State::AwaitingConnectRequest)
            .unwrap_or(false);
        if !self.allow_connections && !introduced {
            return Ok(());
        }
        if let Some(index) = pending_index {
            let conn = &self.connections[index];
            match conn.state {
                State::AwaitingConnectRequest => {
                    if conn.initiator_nonce != initiator_nonce {
                        return Ok(());
                    }
                }
                // Already surfaced to the application; drop duplicates until
                // it decides.
                _ => {
                    return Ok(());
                }
            }
        }

        let client_identity = BufExt::get::<u32>(&mut r)?;
        let expected_identity = self.compute_client_identity(&addr, initiator_nonce);
        if client_identity != expected_identity {
            debug!(self.log, "client identity disagreement";
                   "remote" => %addr, "got" => client_identity, "want" => expected_identity);
            return Ok(());
        }
        let difficulty = BufExt::get::<u32>(&mut r)?;
        let solution = BufExt::get::<u32>(&mut r)?;
        let check = self.puzzle_manager.check_solution(
            solution,
            initiator_nonce,
            host_nonce,
            difficulty,
            client_identity,
        );
        if check != SolutionCheck::Success {
            debug!(self.log, "puzzle check failed"; "remote" => %addr, "result" => ?check);
            self.send_connect_reject(initiator_nonce, host_nonce, &addr, REASON_FAILED_PUZZLE);
            return Ok(());
        }

        let public_key = r.get_buffer(MAX_PUBLIC_KEY_SIZE)?;
        let secret_from = data.len() - r.remaining();
        let shared_secret = match self.private_key.shared_secret(&public_key) {
            Some(secret) => secret,
            None => {
                debug!(self.log, "connect request carried an invalid key"; "remote" => %addr);
                return Ok(());
            }
        };
        let mut packet = data.to_vec();
        if !open_handshake(&mut packet, secret_from, &shared_secret) {
            debug!(self.log, "connect request failed authentication"; "remote" => %addr);
            return Ok(());
        }
        let mut r = &packet[secret_from..];
        let key_bytes = r.get_bytes(SYMMETRIC_KEY_SIZE)?;
        let initial_recv_sequence = BufExt::get::<u32>(&mut r)?;
        let connect_data = r.get_buffer(MAX_STATUS_SIZE)?;

        // A fresh valid request from an address we consider connected
        // replaces the old connection.
        if let Some(&old) = self.established_remotes.get(&addr) {
            self.disconnect_established(old, REASON_NEW_CONNECTION);
        }

        let index = match pending_index {
            Some(index) => index,
            None => self.create_host_pending(addr, now),
        };
        let mut init_vector = [0; SYMMETRIC_KEY_SIZE];
        self.rng.fill_bytes(&mut init_vector);
        let (handle, public_key) = {
            let conn = &mut self.connections[index];
            conn.initiator_nonce = initiator_nonce;
            conn.host_nonce = host_nonce;
            conn.client_identity = client_identity;
            conn.remote_public_key = public_key;
            conn.shared_secret = Some(shared_secret);
            conn.symmetric_key.copy_from_slice(&key_bytes);
            conn.init_vector = init_vector;
            conn.set_initial_recv_sequence(initial_recv_sequence);
            conn.state = State::AwaitingLocalAccept;
            conn.arm_state_timer(now, 0, 0);
            info!(conn.log, "connection requested";
                  "remote" => %addr, "identity" => client_identity);
            (conn.handle, conn.remote_public_key.clone())
        };
        self.events.push_back(SocketEvent::ConnectionRequested {
            connection: handle,
            public_key,
            data: connect_data,
        });
        Ok(())
    }

    fn send_connect_accept(&mut self, index: usize) {
        let (remote, packet) = {
            let conn = &self.connections[index];
            let shared_secret = match conn.shared_secret {
                Some(secret) => secret,
                None => {
                    return;
                }
            };
            let mut packet = Vec::with_capacity(64 + conn.accept_data.len());
            packet.write(HandshakeType::ConnectAccept as u8);
            packet.write(conn.initiator_nonce);
            packet.write(conn.host_nonce);
            let secret_from = packet.len();
            packet.write(conn.initial_send_sequence);
            packet.put_buffer(&conn.accept_data);
            packet.extend_from_slice(&conn.init_vector);
            seal_handshake(&mut packet, secret_from, &shared_secret);
            debug!(conn.log, "sending connect accept");
            (conn.remote, packet)
        };
        self.send_packet(&remote, &packet);
    }

    fn handle_connect_accept(
        &mut self,
        now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let host_nonce = BufExt::get::<u64>(&mut r)?;
        let secret_from = data.len() - r.remaining();
        let index = match self.find_pending_by_addr(&addr) {
            Some(index) => index,
            None => {
                return Ok(());
            }
        };
        let shared_secret = {
            let conn = &self.connections[index];
            if conn.state != State::AwaitingConnectResponse
                || conn.initiator_nonce != initiator_nonce
                || conn.host_nonce != host_nonce
            {
                return Ok(());
            }
            match conn.shared_secret {
                Some(secret) => secret,
                None => {
                    return Ok(());
                }
            }
        };
        let mut packet = data.to_vec();
        if !open_handshake(&mut packet, secret_from, &shared_secret) {
            debug!(self.log, "connect accept failed authentication"; "remote" => %addr);
            return Ok(());
        }
        let mut r = &packet[secret_from..];
        let initial_recv_sequence = BufExt::get::<u32>(&mut r)?;
        let accept_data = r.get_buffer(MAX_STATUS_SIZE)?;
        let iv_bytes = r.get_bytes(SYMMETRIC_KEY_SIZE)?;
        let handle = {
            let conn = &mut self.connections[index];
            conn.init_vector.copy_from_slice(&iv_bytes);
            conn.set_initial_recv_sequence(initial_recv_sequence);
            conn.install_cipher();
            conn.state = State::Connected;
            conn.last_recv_time = now;
            conn.last_send_time = now;
            info!(conn.log, "connection established"; "remote" => %conn.remote);
            conn.handle
        };
        self.promote_to_established(index);
        self.events.push_back(SocketEvent::Accepted {
            connection: handle,
            data: accept_data,
        });
        self.events
            .push_back(SocketEvent::Established { connection: handle });
        Ok(())
    }

    fn send_connect_reject(
        &mut self,
        initiator_nonce: u64,
        host_nonce: u64,
        addr: &SocketAddr,
        reason: &[u8],
    ) {
        let mut packet = Vec::with_capacity(24 + reason.len());
        packet.write(HandshakeType::ConnectReject as u8);
        packet.write(initiator_nonce);
        packet.write(host_nonce);
        packet.put_buffer(reason);
        self.send_packet(addr, &packet);
    }

    fn handle_connect_reject(
        &mut self,
        now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let host_nonce = BufExt::get::<u64>(&mut r)?;
        let index = match self.find_pending_by_addr(&addr) {
            Some(index) => index,
            None => {
                return Ok(());
            }
        };
        {
            let conn = &self.connections[index];
            match conn.state {
                State::AwaitingChallengeResponse | State::AwaitingConnectResponse => {}
                _ => {
                    return Ok(());
                }
            }
            if conn.initiator_nonce != initiator_nonce || conn.host_nonce != host_nonce {
                return Ok(());
            }
        }
        let reason = r.get_buffer(MAX_STATUS_SIZE)?;

        // A failed puzzle gets one transparent retry with a fresh nonce; the
        // solution may simply have outlived the server nonce window.
        if reason == REASON_FAILED_PUZZLE && !self.connections[index].puzzle_retried {
            let retries = self.config.challenge_retry_count.saturating_sub(1);
            let interval = self.config.challenge_retry_interval;
            let fresh_nonce = self.rng.next_u64();
            {
                let conn = &mut self.connections[index];
                debug!(conn.log, "puzzle rejected; retrying with a fresh nonce");
                conn.puzzle_retried = true;
                conn.initiator_nonce = fresh_nonce;
                conn.state = State::AwaitingChallengeResponse;
                conn.arm_state_timer(now, retries, interval);
            }
            self.send_challenge_request(index);
            return Ok(());
        }

        let handle = self.connections[index].handle;
        info!(self.connections[index].log, "connection rejected");
        self.events.push_back(SocketEvent::Rejected {
            connection: handle,
            reason,
        });
        self.remove_connection(index);
        Ok(())
    }

    //
    // Disconnect
    //

    fn handle_disconnect(
        &mut self,
        _now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let host_nonce = BufExt::get::<u64>(&mut r)?;
        let secret_from = data.len() - r.remaining();
        let index = match self.established_remotes.get(&addr) {
            Some(&index) => index,
            None => {
                return Ok(());
            }
        };
        let shared_secret = {
            let conn = &self.connections[index];
            if conn.initiator_nonce != initiator_nonce || conn.host_nonce != host_nonce {
                return Ok(());
            }
            match conn.shared_secret {
                Some(secret) => secret,
                None => {
                    return Ok(());
                }
            }
        };
        let mut packet = data.to_vec();
        if !open_handshake(&mut packet, secret_from, &shared_secret) {
            return Ok(());
        }
        let mut r = &packet[secret_from..];
        let reason = r.get_buffer(MAX_STATUS_SIZE)?;
        let handle = self.connections[index].handle;
        info!(self.connections[index].log, "peer disconnected");
        self.events.push_back(SocketEvent::Disconnected {
            connection: handle,
            reason,
        });
        self.remove_connection(index);
        Ok(())
    }

    /// Sends a sealed disconnect, posts the terminal event, and tears the
    /// connection down.
    fn disconnect_established(&mut self, index: usize, reason: &[u8]) {
        let (remote, packet) = {
            let conn = &self.connections[index];
            match conn.shared_secret {
                Some(shared_secret) => {
                    let mut packet = Vec::with_capacity(32 + reason.len());
                    packet.write(HandshakeType::Disconnect as u8);
                    packet.write(conn.initiator_nonce);
                    packet.write(conn.host_nonce);
                    let secret_from = packet.len();
                    packet.put_buffer(reason);
                    seal_handshake(&mut packet, secret_from, &shared_secret);
                    (conn.remote, Some(packet))
                }
                None => (conn.remote, None),
            }
        };
        if let Some(packet) = packet {
            self.send_packet(&remote, &packet);
        }
        self.post_terminal_disconnect(index, reason.to_vec());
    }

    //
    // Introductions and punching
    //

    fn send_introduction_request(&mut self, index: usize) {
        let (identity, token, introducer) = {
            let conn = &self.connections[index];
            (
                conn.introduction_target,
                conn.introduction_token,
                conn.introducer,
            )
        };
        let introducer_index = match introducer.and_then(|id| self.connection_ids.get(&id)) {
            Some(&index) => index,
            None => {
                return;
            }
        };
        let (remote, packet) = {
            let intro = &self.connections[introducer_index];
            if intro.state != State::Connected {
                return;
            }
            let shared_secret = match intro.shared_secret {
                Some(secret) => secret,
                None => {
                    return;
                }
            };
            let mut packet = Vec::with_capacity(40);
            packet.write(HandshakeType::IntroductionRequest as u8);
            packet.write(intro.initiator_nonce);
            packet.write(intro.host_nonce);
            let secret_from = packet.len();
            packet.write(identity);
            packet.write(token);
            seal_handshake(&mut packet, secret_from, &shared_secret);
            (intro.remote, packet)
        };
        self.send_packet(&remote, &packet);
    }

    fn handle_introduction_request(
        &mut self,
        _now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        let mut r = &data[1..];
        let initiator_nonce = BufExt::get::<u64>(&mut r)?;
        let host_nonce = BufExt::get::<u64>(&mut r)?;
        let secret_from = data.len() - r.remaining();
        let index = match self.established_remotes.get(&addr) {
            Some(&index) => index,
            None => {
                return Ok(());
            }
        };
        let shared_secret = {
            let conn = &self.connections[index];
            if conn.initiator_nonce != initiator_nonce || conn.host_nonce != host_nonce {
                return Ok(());
            }
            match conn.shared_secret {
                Some(secret) => secret,
                None => {
                    return Ok(());
                }
            }
        };
        let mut packet = data.to_vec();
        if !open_handshake(&mut packet, secret_from, &shared_secret) {
            return Ok(());
        }
        let mut r = &packet[secret_from..];
        let identity = BufExt::get::<u32>(&mut r)?;
        let token = BufExt::get::<u32>(&mut r)?;
        let (handle, fresh) = {
            let conn = &mut self.connections[index];
            (conn.handle, conn.record_introduction_request(identity, token))
        };
        if fresh {
            debug!(self.log, "introduction requested";
                   "connection" => handle, "identity" => identity, "token" => token);
            self.events.push_back(SocketEvent::IntroducedConnectionRequest {
                connection: handle,
                client_identity: identity,
                token,
            });
        }
        Ok(())
    }

    fn send_send_punch(
        &mut self,
        recipient: &SocketAddr,
        peer: &SocketAddr,
        recipient_is_initiator: bool,
        token: u32,
    ) {
        let mut packet = Vec::with_capacity(32);
        packet.write(HandshakeType::SendPunchPacket as u8);
        packet.write(*peer);
        packet.write(recipient_is_initiator as u8);
        packet.write(token);
        self.send_packet(recipient, &packet);
    }

    fn handle_send_punch(
        &mut self,
        now: u64,
        addr: SocketAddr,
        data: &[u8],
    ) -> coding::Result<()> {
        // Only a mutually established introducer may direct us to punch.
        let introducer_handle = match self.established_remotes.get(&addr) {
            Some(&index) => self.connections[index].handle,
            None => {
                return Ok(());
            }
        };
        let mut r = &data[1..];
        let peer = BufExt::get::<SocketAddr>(&mut r)?;
        let is_initiator = BufExt::get::<u8>(&mut r)? != 0;
        let token = BufExt::get::<u32>(&mut r)?;
        let found = self.pending.iter().cloned().find(|&index| {
            let conn = &self.connections[index];
            conn.state == State::AwaitingIntroduction
                && conn.introducer == Some(introducer_handle)
                && conn.introduction_token == token
        });
        let index = match found {
            Some(index) => index,
            None => {
                return Ok(());
            }
        };
        let retries = self.config.punch_retry_count.saturating_sub(1);
        let interval = self.config.punch_retry_interval;
        {
            let conn = &mut self.connections[index];
            conn.role = if is_initiator {
                Role::IntroducedInitiator
            } else {
                Role::IntroducedHost
            };
            conn.remote = peer;
            conn.candidate_addresses = vec![peer];
            conn.state = State::SendingPunchPackets;
            conn.arm_state_timer(now, retries, interval);
            debug!(conn.log, "punching"; "peer" => %peer, "initiator" => is_initiator);
        }
        self.send_punch_packets(index);
        Ok(())
    }

    fn send_punch_packets(&mut self, index: usize) {
        let (packet, targets) = {
            let conn = &self.connections[index];
            let mut packet = Vec::with_capacity(8);
            packet.write(HandshakeType::Punch as u8);
            packet.write(conn.introduction_token);
            // The flag names the receiver's role, the inverse of ours.
            packet.write(!conn.role.is_initiator() as u8);
            (packet, conn.candidate_addresses.clone())
        };
        for target in &targets {
            self.send_packet(target, &packet);
        }
    }

    fn handle_punch(&mut self, now: u64, addr: SocketAddr, data: &[u8]) -> coding::Result<()> {
        let mut r = &data[1..];
        let token = BufExt::get::<u32>(&mut r)?;
        let i_am_initiator = BufExt::get::<u8>(&mut r)? != 0;
        let found = self.pending.iter().cloned().find(|&index| {
            let conn = &self.connections[index];
            conn.state == State::SendingPunchPackets
                && conn.introduction_token == token
                && conn.matches_candidate(&addr)
        });
        let index = match found {
            Some(index) => index,
            None => {
                return Ok(());
            }
        };
        if self.connections[index].role.is_initiator() != i_am_initiator {
            return Ok(());
        }
        if i_am_initiator {
            // The pinhole is open; run the direct handshake against the
            // address that actually reached us.
            let retries = self.config.challenge_retry_count.saturating_sub(1);
            let interval = self.config.challenge_retry_interval;
            {
                let conn = &mut self.connections[index];
                conn.remote = addr;
                conn.candidate_addresses = vec![addr];
                conn.state = State::AwaitingChallengeResponse;
                conn.arm_state_timer(now, retries, interval);
                debug!(conn.log, "punch received; starting handshake"; "remote" => %addr);
            }
            self.send_challenge_request(index);
        } else {
            // Keep punching, but aim at the address that worked.
            let conn = &mut self.connections[index];
            conn.remote = addr;
            conn.add_candidate_address(addr);
        }
        Ok(())
    }

    //
    // Tables and lifecycle
    //

    fn new_connection_id(&mut self) -> ConnectionId {
        // Process-wide, so ids stay unique even across sockets. Zero is
        // reserved as an invalid id.
        static NEXT_CONNECTION_INDEX: AtomicU32 = AtomicU32::new(1);
        ConnectionId(NEXT_CONNECTION_INDEX.fetch_add(1, Ordering::Relaxed))
    }

    fn add_pending(&mut self, conn: Connection) -> usize {
        let handle = conn.handle;
        let index = self.connections.insert(conn);
        self.connection_ids.insert(handle, index);
        self.pending.push(index);
        index
    }

    fn create_host_pending(&mut self, addr: SocketAddr, now: u64) -> usize {
        let handle = self.new_connection_id();
        let initial_send_sequence = self.rng.next_u32();
        let conn = Connection::new(
            self.log.new(o!("connection" => handle.0)),
            handle,
            Role::Host,
            State::AwaitingLocalAccept,
            addr,
            0,
            initial_send_sequence,
            now,
        );
        self.add_pending(conn)
    }

    fn find_pending_by_addr(&self, addr: &SocketAddr) -> Option<usize> {
        self.pending
            .iter()
            .cloned()
            .find(|&index| self.connections[index].remote == *addr)
    }

    /// Pending lookup for inbound handshake packets: an exact address match,
    /// or a candidate-address match for a connection mid-punch.
    fn find_pending_for_handshake(&self, addr: &SocketAddr) -> Option<usize> {
        self.find_pending_by_addr(addr).or_else(|| {
            self.pending.iter().cloned().find(|&index| {
                let conn = &self.connections[index];
                conn.state == State::SendingPunchPackets && conn.matches_candidate(addr)
            })
        })
    }

    fn promote_to_established(&mut self, index: usize) {
        self.pending.retain(|&i| i != index);
        let remote = self.connections[index].remote;
        self.established_remotes.insert(remote, index);
    }

    fn cancel_puzzle_job(&mut self, index: usize) {
        if let Some(job_index) = self.connections[index].puzzle_request_index.take() {
            self.puzzle_solver.cancel(job_index);
        }
    }

    fn post_terminal_disconnect(&mut self, index: usize, reason: Vec<u8>) {
        let handle = self.connections[index].handle;
        self.cancel_puzzle_job(index);
        self.events.push_back(SocketEvent::Disconnected {
            connection: handle,
            reason,
        });
        self.remove_connection(index);
    }

    fn remove_connection(&mut self, index: usize) {
        self.cancel_puzzle_job(index);
        let conn = self.connections.remove(index);
        self.connection_ids.remove(&conn.handle);
        self.pending.retain(|&i| i != index);
        if self.established_remotes.get(&conn.remote) == Some(&index) {
            self.established_remotes.remove(&conn.remote);
        }
    }

    //
    // Helpers
    //

    /// A stateless token tying an initiator's address to its nonce, so the
    /// host can recognize its own challenges without remembering them.
    fn compute_client_identity(&self, addr: &SocketAddr, initiator_nonce: u64) -> u32 {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&address_bytes(addr));
        ctx.update(&initiator_nonce.to_le_bytes());
        ctx.update(&self.random_hash_secret);
        let hash = ctx.finish();
        let mut token = [0; 4];
        token.copy_from_slice(&hash.as_ref()[..4]);
        u32::from_le_bytes(token)
    }

    fn send_packet(&self, remote: &SocketAddr, packet: &[u8]) {
        if let Err(e) = self.transport.send_to(remote, packet) {
            debug!(self.log, "failed to send packet"; "remote" => %remote, "error" => %e);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let established: Vec<usize> = self.established_remotes.values().cloned().collect();
        for index in established {
            if self.connections.contains(index) {
                self.disconnect_established(index, REASON_SHUTDOWN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_token_is_stable_per_address_and_nonce(){
        let log = Logger::root(slog::Discard, o!());
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let socket = Socket::new(log, Config::default(), Box::new(transport));
        let addr: SocketAddr = "10.0.0.1:28000".parse().unwrap();
        let other: SocketAddr = "10.0.0.2:28000".parse().unwrap();
        assert_eq!(
            socket.compute_client_identity(&addr, 7),
            socket.compute_client_identity(&addr, 7)
        );
        assert_ne!(
            socket.compute_client_identity(&addr, 7),
            socket.compute_client_identity(&addr, 8)
        );
        assert_ne!(
            socket.compute_client_identity(&addr, 7),
            socket.compute_client_identity(&other, 7)
        );
    }

    #[test]
    fn connection_ids_are_never_reused() {
        let log = Logger::root(slog::Discard, o!());
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut socket = Socket::new(log, Config::default(), Box::new(transport));
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let first = socket.connect(remote, b"").unwrap();
        socket.close_connection(first, b"done").unwrap();
        let second = socket.connect(remote, b"").unwrap();
        assert_ne!(first, second);
        assert_eq!(
            socket.send_to_connection(first, b"x"),
            Err(OpError::UnknownConnection)
        );
    }

    #[test]
    fn blob_limits_enforced() {
        let log = Logger::root(slog::Discard, o!());
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut socket = Socket::new(log, Config::default(), Box::new(transport));
        let big = vec![0; MAX_STATUS_SIZE + 1];
        assert_eq!(socket.set_challenge_response(&big), Err(OpError::DataTooLarge));
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(socket.connect(remote, &big), Err(OpError::DataTooLarge));
        assert!(socket.set_challenge_response(&big[..MAX_STATUS_SIZE]).is_ok());
    }

    #[test]
    fn info_packet_first_byte_checked() {
        let log = Logger::root(slog::Discard, o!());
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut socket = Socket::new(log, Config::default(), Box::new(transport));
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(
            socket.send_to(remote, &[5, 1, 2]),
            Err(OpError::InvalidInfoPacket)
        );
        assert_eq!(
            socket.send_to(remote, &[200, 1, 2]),
            Err(OpError::InvalidInfoPacket)
        );
        assert!(socket.send_to(remote, &[32, 1, 2]).is_ok());
    }

    #[test]
    fn private_key_round_trip() {
        let log = Logger::root(slog::Discard, o!());
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut socket = Socket::new(log, Config::default(), Box::new(transport));
        assert_eq!(socket.set_private_key(&[1; 31]), Err(OpError::InvalidKey));
        let key = [7; 32];
        socket.set_private_key(&key).unwrap();
        let expected = KeyPair::from_bytes(key).public_bytes();
        assert_eq!(socket.public_key(), expected);
    }
}
