//! Peer connection
//!
//! One connection owns its socket and framing state. The receive side is
//! driven by a single reader task, so inbound frames are processed
//! strictly in order; transmits funnel through one writer task draining a
//! bounded outbox, which keeps frames ordered and outbound nonces
//! strictly monotonic.
//!
//! ```text
//! pending --handshake ok--> secured --terminate/error--> retired
//! pending --handshake fail--> retired
//! ```

use crate::db::Level;
use crate::net::address::Address;
use crate::net::coordinator::Coordinator;
use crate::net::protocol::{
    self, CipherState, HEAD_SIZE, InitialHead, KEEPALIVE_QUERY, KEEPALIVE_RESPONSE, Proposal,
};
use crate::net::request::{self, RequestType};
use crate::subscriptions::Subscriptions;
use crate::types::{microtimestamp, now, older};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const STATE_PENDING: u8 = 0;
const STATE_SECURED: u8 = 1;
const STATE_RETIRED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Secured,
    Retired,
}

/// Soft cap of payloads queued while the link is still securing.
const MAX_PENDING_PAYLOADS: usize = 4096;

#[derive(Default)]
pub struct Counters {
    pub received: AtomicU64,
    pub transmitted: AtomicU64,
    pub keepalives: AtomicU64,
    pub delayed: AtomicU64,
}

/// Pre-handshake transmit state: the raw write half plus payloads queued
/// until the link secures. Once secured, a dedicated writer task owns the
/// write half and the outbound cipher, draining the outbox channel.
struct Transmitter {
    writer: Option<tokio::net::tcp::OwnedWriteHalf>,
    pending: VecDeque<Vec<u8>>,
}

enum Outbound {
    Payload(Vec<u8>),
    Token(u16),
}

/// Frames queued for the writer task before backpressure kicks in.
const OUTBOX_DEPTH: usize = 4096;

#[derive(Default)]
struct RequestLimiter {
    counts: BTreeMap<u32, u32>,
    report_time: u32,
}

pub struct Connection {
    /// Inbound connections have port set to 0.
    pub peer: Address,
    pub level: RwLock<Level>,

    state: AtomicU8,
    ever_secured: std::sync::atomic::AtomicBool,
    cancel: Notify,

    pub subscriptions: Subscriptions,
    pub counters: Counters,

    /// Consensus-violating entries received; threshold leads to a ban.
    pub rejected: AtomicU32,
    /// Entries received outside anything we subscribed to.
    pub unsolicited: AtomicU32,

    /// Microtimestamp of last observed liveness.
    latest: AtomicU64,
    /// Microtimestamp of last keep-alive probe we sent.
    probed: AtomicU64,

    transmitter: tokio::sync::Mutex<Transmitter>,
    outbox: Mutex<Option<tokio::sync::mpsc::Sender<Outbound>>>,
    limiter: Mutex<RequestLimiter>,

    /// Handshake nonces for self-connection detection, cleared once
    /// secured.
    proposal_nonces: Mutex<Option<([u8; 32], [u8; 32])>>,
}

impl Connection {
    pub fn new(peer: Address, level: Level) -> Arc<Self> {
        Arc::new(Self {
            peer,
            level: RwLock::new(level),
            state: AtomicU8::new(STATE_PENDING),
            ever_secured: std::sync::atomic::AtomicBool::new(false),
            cancel: Notify::new(),
            subscriptions: Subscriptions::new(),
            counters: Counters::default(),
            rejected: AtomicU32::new(0),
            unsolicited: AtomicU32::new(0),
            latest: AtomicU64::new(microtimestamp()),
            probed: AtomicU64::new(0),
            transmitter: tokio::sync::Mutex::new(Transmitter {
                writer: None,
                pending: VecDeque::new(),
            }),
            outbox: Mutex::new(None),
            limiter: Mutex::new(RequestLimiter::default()),
            proposal_nonces: Mutex::new(None),
        })
    }

    pub fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            STATE_PENDING => State::Pending,
            STATE_SECURED => State::Secured,
            _ => State::Retired,
        }
    }

    pub fn secured(&self) -> bool {
        self.state() == State::Secured
    }

    pub fn retired(&self) -> bool {
        self.state() == State::Retired
    }

    /// The handshake completed at some point in this connection's life.
    pub fn ever_secured(&self) -> bool {
        self.ever_secured.load(Ordering::Relaxed)
    }

    pub fn is_inbound(&self) -> bool {
        self.peer.port == 0
    }

    pub fn is_outbound(&self) -> bool {
        self.peer.port != 0
    }

    pub fn level(&self) -> Level {
        *self.level.read().unwrap()
    }

    pub fn set_level(&self, level: Level) {
        *self.level.write().unwrap() = level;
    }

    /// Microseconds since the last observed liveness or probe.
    pub fn age(&self, micronow: u64) -> u64 {
        let reference = self
            .latest
            .load(Ordering::Relaxed)
            .max(self.probed.load(Ordering::Relaxed));
        micronow.saturating_sub(reference)
    }

    pub fn touch(&self) {
        self.latest.store(microtimestamp(), Ordering::Relaxed);
    }

    /// Interrupts the reader and writer tasks and retires the connection;
    /// the next coordinator sweep reaps it. Closing the outbox guarantees
    /// the writer wakes even if it was not parked when notified.
    pub fn cancel(&self) {
        self.retire();
        *self.outbox.lock().unwrap() = None;
        self.cancel.notify_waiters();
    }

    fn retire(&self) {
        self.state.store(STATE_RETIRED, Ordering::Release);
    }

    /// True when the peer head matches our own outstanding proposal, i.e.
    /// we connected back to ourselves.
    pub fn reflects(&self, head: &InitialHead) -> bool {
        let nonces = self.proposal_nonces.lock().unwrap();
        matches!(
            &*nonces,
            Some((inbound, outbound))
                if *inbound == head.inbound_nonce && *outbound == head.outbound_nonce
        )
    }

    // =========================================================================
    // TRANSMIT
    // =========================================================================

    /// Queue a payload for transmission. Before the link is secured
    /// payloads buffer and flush right after the handshake; afterwards the
    /// writer task drains them in order. A full outbox counts as delayed
    /// and applies backpressure to the caller.
    pub async fn send(&self, payload: &[u8]) -> bool {
        if self.retired() || payload.len() > protocol::MAX_PAYLOAD {
            return false;
        }

        let sender = self.outbox.lock().unwrap().clone();
        match sender {
            Some(outbox) => {
                use tokio::sync::mpsc::error::TrySendError;
                match outbox.try_send(Outbound::Payload(payload.to_vec())) {
                    Ok(()) => true,
                    Err(TrySendError::Full(message)) => {
                        self.counters.delayed.fetch_add(1, Ordering::Relaxed);
                        outbox.send(message).await.is_ok()
                    }
                    Err(TrySendError::Closed(_)) => false,
                }
            }
            None => {
                let mut tx = self.transmitter.lock().await;
                if tx.pending.len() >= MAX_PENDING_PAYLOADS {
                    return false;
                }
                tx.pending.push_back(payload.to_vec());
                self.counters.delayed.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Assemble and send a coordination request.
    pub async fn send_request(&self, request: RequestType, payload: &[u8]) -> bool {
        self.send(&request::build(now(), request, payload)).await
    }

    /// Transmit a keep-alive token when the link has been idle longer
    /// than 'period' microseconds. Returns the delay until the next probe
    /// is due.
    pub async fn keepalive(&self, micronow: u64, expected: u64, period: u64) -> u64 {
        if !self.secured() {
            return expected;
        }
        let age = self.age(micronow);
        if age < period {
            return expected.min(period - age);
        }

        let sender = self.outbox.lock().unwrap().clone();
        if let Some(outbox) = sender
            && outbox.try_send(Outbound::Token(KEEPALIVE_QUERY)).is_ok()
        {
            self.probed.store(micronow, Ordering::Relaxed);
            self.counters.keepalives.fetch_add(1, Ordering::Relaxed);
            return expected.min(period);
        }
        expected
    }

    fn answer_keepalive(&self) {
        let sender = self.outbox.lock().unwrap().clone();
        if let Some(outbox) = sender {
            let _ = outbox.try_send(Outbound::Token(KEEPALIVE_RESPONSE));
        }
    }

    /// Owns the write half and the outbound cipher once the link secures;
    /// drains the outbox strictly in order, keeping nonces monotonic.
    async fn run_writer(
        self: Arc<Self>,
        mut writer: tokio::net::tcp::OwnedWriteHalf,
        mut cipher: CipherState,
        mut outbox: tokio::sync::mpsc::Receiver<Outbound>,
    ) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.notified() => None,
                message = outbox.recv() => message,
            };
            let Some(message) = message else { break };

            let result = match message {
                Outbound::Payload(payload) => match cipher.encode(&payload) {
                    Some(frame) => writer.write_all(&frame).await,
                    None => continue,
                },
                Outbound::Token(token) => writer.write_all(&token.to_le_bytes()).await,
            };
            match result {
                Ok(()) => {
                    self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "transmit failed");
                    self.cancel();
                    break;
                }
            }
        }
    }

    // =========================================================================
    // REQUEST LIMITER
    // =========================================================================

    /// Account one request; false means the per-minute budget is blown and
    /// the request should be silently dropped. The overflow is reported at
    /// most once per second.
    pub fn admit_request(&self, max_per_minute: u32) -> bool {
        if max_per_minute == 0 {
            return true;
        }
        let t = now();
        let mut limiter = self.limiter.lock().unwrap();

        let fresh = {
            let slot = limiter.counts.entry(t).or_insert(0);
            *slot += 1;
            *slot == 1
        };
        if fresh {
            // time moved by at least a second, trim entries beyond a minute
            limiter
                .counts
                .retain(|&second, _| !older(second, t.wrapping_sub(60)));
        }

        let total: u32 = limiter.counts.values().sum();
        if total >= max_per_minute {
            if limiter.report_time != t {
                limiter.report_time = t;
                warn!(peer = %self.peer, limit = max_per_minute, "request limit exceeded, dropping");
            }
            return false;
        }
        true
    }

    /// Charge an expensive request against the budget.
    pub fn penalize_requests(&self, amount: u32) {
        let mut limiter = self.limiter.lock().unwrap();
        *limiter.counts.entry(now()).or_insert(0) += amount;
    }

    // =========================================================================
    // I/O PUMP
    // =========================================================================

    /// Outbound: connect (optionally through the SOCKS5 proxy), handshake,
    /// then pump frames until the connection dies.
    pub async fn run_outbound(self: Arc<Self>, coordinator: Arc<Coordinator>) {
        let target = coordinator
            .settings
            .proxy
            .unwrap_or(self.peer)
            .socket_addr();

        let stream = match tokio::time::timeout(
            Duration::from_secs(coordinator.settings.connect_timeout),
            TcpStream::connect(target),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            _ => {
                debug!(peer = %self.peer, "connect failed");
                self.retire();
                coordinator.unavailable(&self);
                return;
            }
        };

        let (mut reader, writer) = stream.into_split();
        self.transmitter.lock().await.writer = Some(writer);

        if coordinator.settings.proxy.is_some() && !self.socks5_prologue(&mut reader).await {
            self.retire();
            coordinator.unavailable(&self);
            return;
        }

        self.pump(coordinator, reader, true).await;
    }

    /// Inbound: socket is already connected, go straight to handshake.
    pub async fn run_inbound(self: Arc<Self>, coordinator: Arc<Coordinator>, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        self.transmitter.lock().await.writer = Some(writer);
        self.pump(coordinator, reader, false).await;
    }

    async fn socks5_prologue(&self, reader: &mut OwnedReadHalf) -> bool {
        {
            let mut tx = self.transmitter.lock().await;
            let Some(writer) = tx.writer.as_mut() else {
                return false;
            };
            if writer.write_all(&protocol::socks5_greeting()).await.is_err() {
                return false;
            }
        }
        let mut greeting = [0u8; 2];
        if reader.read_exact(&mut greeting).await.is_err() || greeting != [0x05, 0x00] {
            return false;
        }

        {
            let mut tx = self.transmitter.lock().await;
            let Some(writer) = tx.writer.as_mut() else {
                return false;
            };
            if writer
                .write_all(&protocol::socks5_connect(&self.peer))
                .await
                .is_err()
            {
                return false;
            }
        }

        let mut reply = [0u8; 4];
        if reader.read_exact(&mut reply).await.is_err() || reply[0] != 0x05 || reply[1] != 0x00 {
            return false;
        }
        let Some(remainder) = protocol::socks5_reply_remainder(reply[3]) else {
            return false;
        };
        let mut bound = vec![0u8; remainder];
        reader.read_exact(&mut bound).await.is_ok()
    }

    async fn pump(
        self: &Arc<Self>,
        coordinator: Arc<Coordinator>,
        mut reader: OwnedReadHalf,
        outbound: bool,
    ) {
        let recv_timeout = Duration::from_micros(
            (4 * coordinator.settings.keep_alive_period as u64 * 1_000_000).max(1_000_000),
        );

        // exchange handshake heads; ours goes out first
        let (proposal, head) =
            Proposal::propose(coordinator.settings.magic, coordinator.settings.cipher_mode);
        *self.proposal_nonces.lock().unwrap() = Some((head.inbound_nonce, head.outbound_nonce));

        {
            let mut tx = self.transmitter.lock().await;
            let writer_ok = match tx.writer.as_mut() {
                Some(writer) => writer.write_all(&head.to_bytes()).await.is_ok(),
                None => false,
            };
            if !writer_ok {
                self.retire();
                coordinator.disconnected(self, outbound);
                return;
            }
        }

        let mut head_bytes = [0u8; HEAD_SIZE];
        let received = tokio::select! {
            _ = self.cancel.notified() => false,
            read = tokio::time::timeout(recv_timeout, reader.read_exact(&mut head_bytes)) => {
                matches!(read, Ok(Ok(_)))
            }
        };
        if !received {
            self.retire();
            coordinator.disconnected(self, outbound);
            return;
        }

        let peer_head = InitialHead::parse(&head_bytes);
        if coordinator.reflecting(&peer_head, self) {
            self.retire();
            coordinator.disconnected(self, outbound);
            return;
        }

        let pair = match proposal.accept(&peer_head) {
            Ok(pair) => pair,
            Err(reason) => {
                info!(peer = %self.peer, %reason, "handshake refused");
                self.retire();
                coordinator.disagreed(self).await;
                return;
            }
        };

        let mut inbound_cipher = pair.inbound;
        {
            let mut tx = self.transmitter.lock().await;
            let Some(writer) = tx.writer.take() else {
                self.retire();
                coordinator.disconnected(self, outbound);
                return;
            };

            let (outbox_tx, outbox_rx) = tokio::sync::mpsc::channel(OUTBOX_DEPTH);
            // flush payloads queued while securing, in order
            for queued in tx.pending.drain(..) {
                let _ = outbox_tx.try_send(Outbound::Payload(queued));
            }
            *self.outbox.lock().unwrap() = Some(outbox_tx);

            self.state.store(STATE_SECURED, Ordering::Release);
            self.ever_secured.store(true, Ordering::Relaxed);
            *self.proposal_nonces.lock().unwrap() = None;

            tokio::spawn(self.clone().run_writer(writer, pair.outbound, outbox_rx));
        }
        debug!(peer = %self.peer, "connection secured");

        // first encrypted packet carries the magic, proving the encryption
        // agrees end to end
        self.send_request(RequestType::Initial, &coordinator.settings.magic)
            .await;
        {
            let coordinator = coordinator.clone();
            let connection = self.clone();
            tokio::spawn(async move { coordinator.established(&connection).await });
        }

        loop {
            let mut prefix = [0u8; 2];
            let read = tokio::select! {
                _ = self.cancel.notified() => None,
                read = tokio::time::timeout(recv_timeout, reader.read_exact(&mut prefix)) => {
                    match read {
                        Ok(Ok(_)) => Some(u16::from_le_bytes(prefix)),
                        _ => None,
                    }
                }
            };
            let Some(length) = read else { break };
            self.touch();

            match length {
                KEEPALIVE_QUERY => {
                    self.answer_keepalive();
                    continue;
                }
                KEEPALIVE_RESPONSE => continue,
                _ => {}
            }

            let length = length as usize;
            if length < 16 || 2 + length > protocol::MAX_FRAME_SIZE {
                warn!(peer = %self.peer, length, "invalid frame length");
                break;
            }

            let mut frame = vec![0u8; 2 + length];
            frame[0..2].copy_from_slice(&prefix);
            let read = tokio::select! {
                _ = self.cancel.notified() => false,
                read = tokio::time::timeout(recv_timeout, reader.read_exact(&mut frame[2..])) => {
                    matches!(read, Ok(Ok(_)))
                }
            };
            if !read {
                break;
            }

            let Some(payload) = inbound_cipher.decode(&frame) else {
                warn!(peer = %self.peer, "frame failed to decrypt");
                self.retire();
                coordinator.disagreed(self).await;
                return;
            };
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            let ok = if payload.len() < crate::entry::MIN_SIZE {
                coordinator.process(&payload, self).await
            } else {
                coordinator.message(&payload, self).await
            };
            if !ok {
                self.retire();
                coordinator.disagreed(self).await;
                return;
            }
            if self.retired() {
                break;
            }
        }

        // wakes the writer task as well, so it releases the socket
        self.cancel();
        coordinator.disconnected(self, outbound);
    }

    /// Short status line for diagnostics.
    pub fn status(&self) -> String {
        format!(
            "{} [{}] {:?} rx:{} tx:{} ka:{} rejected:{}",
            self.peer,
            self.level().name(),
            self.state(),
            self.counters.received.load(Ordering::Relaxed),
            self.counters.transmitted.load(Ordering::Relaxed),
            self.counters.keepalives.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Arc<Connection> {
        Connection::new("1.2.3.4:44303".parse().unwrap(), Level::Announced)
    }

    #[test]
    fn test_request_limiter_budget() {
        let connection = test_connection();
        let limit = 100;

        let mut admitted = 0;
        for _ in 0..200 {
            if connection.admit_request(limit) {
                admitted += 1;
            }
        }
        // the admitting call itself counts, so one less than the limit
        assert_eq!(admitted, limit as usize - 1);

        // zero disables limiting entirely
        assert!(connection.admit_request(0));
    }

    #[test]
    fn test_request_limiter_penalty() {
        let connection = test_connection();
        connection.penalize_requests(4096 / 3);
        let mut admitted = 0;
        for _ in 0..4096 {
            if connection.admit_request(4096) {
                admitted += 1;
            }
        }
        assert!(admitted < 4096 - 4096 / 3);
    }

    #[test]
    fn test_inbound_marker() {
        let inbound = Connection::new(
            Address {
                ip: "9.9.9.9".parse().unwrap(),
                port: 0,
            },
            Level::Blacklisted,
        );
        assert!(inbound.is_inbound());
        assert!(!inbound.is_outbound());
        assert!(test_connection().is_outbound());
    }

    #[tokio::test]
    async fn test_send_queues_until_secured() {
        let connection = test_connection();
        assert!(connection.send(b"queued before handshake").await);
        assert_eq!(connection.counters.delayed.load(Ordering::Relaxed), 1);
        assert_eq!(connection.transmitter.lock().await.pending.len(), 1);
    }

    /// Keep-alive probes are dropped, not queued, while still pending.
    #[tokio::test]
    async fn test_keepalive_needs_secured_link() {
        let connection = test_connection();
        let t = microtimestamp();
        assert_eq!(connection.keepalive(t, 100, 100).await, 100);
        assert_eq!(connection.counters.keepalives.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_age_tracks_latest() {
        let connection = test_connection();
        connection.touch();
        let age = connection.age(microtimestamp() + 5_000_000);
        assert!(age >= 4_000_000);
    }
}
