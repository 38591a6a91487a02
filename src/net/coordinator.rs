//! Connection coordinator
//!
//! Owns the connection list, listeners, discovery points, peer sets and
//! the orphan/dedup caches. The scheduling tick runs at 1 Hz: it counts
//! secured connections, dials new peers by level priority, fires local
//! discovery and flushes persistent state. Incoming frames route here:
//! requests through [`Coordinator::process`], entries through
//! [`Coordinator::message`].

use crate::consensus;
use crate::db::{Assessment, Db, DbRow, Level, NEW_RECORD_ASSESSMENT, Table};
use crate::detached::Detached;
use crate::entry;
use crate::history::{self, History, HistoryBuilder, Subscription};
use crate::net::address::{Address, Validation};
use crate::net::connection::Connection;
use crate::net::discovery::Discovery;
use crate::net::protocol::{CipherMode, InitialHead, MAGIC};
use crate::net::request::{self, Download, NEWPEER_CORE, NewPeer, RequestType};
use crate::noticed::Noticed;
use crate::subscriptions::SubscriptionSet;
use crate::types::{Eid, microtimestamp, now, older};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recursion bound when reattaching buffered descendants.
const MAX_DETACHED_DRAIN: usize = 2048;

/// Days an address is banned when constructing a connection to it fails
/// outright.
const BAD_ADDRESS_BAN_DAYS: u16 = 64;

// =============================================================================
// SETTINGS
// =============================================================================

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub magic: [u8; 8],
    pub cipher_mode: CipherMode,
    /// Optimistic SOCKS5 proxy (i.e. Tor); None disables.
    pub proxy: Option<Address>,

    /// Average number of connections to keep established.
    pub connections: usize,
    /// Absolute hard maximum, inbound included; 0 means unlimited.
    pub max_connections: usize,
    /// Minimum connected nodes to consider broadcasts meaningful.
    pub min_connections: usize,
    pub max_core_connections: usize,
    pub min_core_connections: usize,
    /// New dials started per tick at most.
    pub max_concurrent_attempts: usize,
    pub connect_timeout: u64,

    pub network_propagation_participation: bool,
    pub channels_synchronization_participation: bool,
    pub full_database_downloads_allowed: bool,

    /// Seconds of idle before a keep-alive token goes out.
    pub keep_alive_period: u32,

    pub announcement_sample_size: usize,
    /// 0 means unlimited.
    pub max_requests_per_minute: u32,
    pub max_allowed_rejected_entries: u32,
    pub max_allowed_unsolicited_entries: u32,
    pub max_individual_subscriptions: usize,

    pub local_peer_discovery_period: u32,
    pub more_peers_query_delay: u32,
    pub full_database_download_limit: u32,

    /// Core nodes asked for a full database download on start.
    pub core_sync_count: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            magic: *MAGIC,
            cipher_mode: CipherMode::Automatic,
            proxy: None,
            connections: 8,
            max_connections: 1024,
            min_connections: 2,
            max_core_connections: 3,
            min_core_connections: 0,
            max_concurrent_attempts: 6,
            connect_timeout: 30,
            network_propagation_participation: true,
            channels_synchronization_participation: true,
            full_database_downloads_allowed: false,
            keep_alive_period: 60,
            announcement_sample_size: 40,
            max_requests_per_minute: 4096,
            max_allowed_rejected_entries: 16,
            max_allowed_unsolicited_entries: 64,
            max_individual_subscriptions: 65536,
            local_peer_discovery_period: 1200,
            more_peers_query_delay: 180,
            full_database_download_limit: 62 * 86400,
            core_sync_count: 3,
        }
    }
}

struct Pacing {
    started: u32,
    last_peers_query: u32,
    last_flush: u32,
    connect_one_more_announced: bool,
    core_sync_count: u32,
    core_sync_threshold: u32,
}

// =============================================================================
// COORDINATOR
// =============================================================================

pub struct Coordinator {
    pub database: Arc<Db>,
    pub settings: CoordinatorSettings,

    /// Front-inserted so reflection checks hit fresh connections first.
    connections: RwLock<VecDeque<Arc<Connection>>>,
    connect_requests: Mutex<BTreeSet<Address>>,
    listening_ports: Mutex<Vec<u16>>,
    discoverers: Mutex<Vec<Arc<Discovery>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    /// Threads/channels subscribed to by client applications.
    pub subscriptions: SubscriptionSet,
    /// Entries manually deleted or blacklisted author/thread/channel.
    pub blacklist: SubscriptionSet,
    /// Entries/threads to keep forever, never automatically deleted.
    pub retained: SubscriptionSet,

    /// Immediate history of propagated entries, stops re-broadcast.
    pub recent: Noticed,
    /// EIDs refused for consensus violations; pre-rejects descendants.
    pub refused: Noticed,
    /// Orphan entries awaiting their parents.
    pub detached: Detached,

    pacing: Mutex<Pacing>,
    rng: Mutex<ChaCha20Rng>,
    terminating: AtomicBool,
}

impl Coordinator {
    pub fn new(database: Arc<Db>, settings: CoordinatorSettings) -> Arc<Self> {
        let t = now();

        // on an empty database ask for everything normal nodes care about;
        // otherwise just re-request a little overlap
        let core_sync_threshold = match database.data.newest_timestamp() {
            Some(newest) => newest.wrapping_sub(database.settings.synchronization_base_offset),
            None => t.wrapping_sub(database.settings.synchronization_threshold),
        };

        let subscriptions = SubscriptionSet::new(&database.path, "subscriptions");
        let blacklist = SubscriptionSet::new(&database.path, "blacklist");
        let retained = SubscriptionSet::new(&database.path, "retained");
        for (set, name) in [
            (&subscriptions, "subscriptions"),
            (&blacklist, "blacklist"),
            (&retained, "retained"),
        ] {
            if let Err(e) = set.load() {
                warn!(set = name, error = %e, "subscription set load failed");
            }
        }

        Arc::new(Self {
            database,
            settings,
            connections: RwLock::new(VecDeque::new()),
            connect_requests: Mutex::new(BTreeSet::new()),
            listening_ports: Mutex::new(Vec::new()),
            discoverers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            subscriptions,
            blacklist,
            retained,
            recent: Noticed::new(),
            refused: Noticed::new(),
            detached: Detached::new(),
            pacing: Mutex::new(Pacing {
                started: t,
                last_peers_query: t,
                last_flush: t,
                connect_one_more_announced: false,
                core_sync_count: 0,
                core_sync_threshold,
            }),
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
            terminating: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // LISTENERS AND DISCOVERY
    // =========================================================================

    /// Bind a TCP listener and start accepting; returns the actual port.
    pub async fn listen(self: &Arc<Self>, port: u16) -> io::Result<u16> {
        let listener = match TcpListener::bind(("::", port)).await {
            Ok(listener) => listener,
            Err(_) => TcpListener::bind(("0.0.0.0", port)).await?,
        };
        let actual = listener.local_addr()?.port();
        self.listening_ports.lock().unwrap().push(actual);

        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => coordinator.incoming(stream, remote.into()),
                    Err(e) => {
                        if coordinator.terminating.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        info!(port = actual, "listening");
        Ok(actual)
    }

    /// Start a local discovery point on the given UDP port.
    pub async fn discover(self: &Arc<Self>, port: u16) -> io::Result<()> {
        let discovery = Arc::new(Discovery::bind(self.settings.magic, port).await?);
        let announced = self.listening_ports.lock().unwrap().first().copied();
        if let Some(tcp) = announced {
            discovery.announcement.store(tcp, Ordering::Relaxed);
        }
        self.discoverers.lock().unwrap().push(discovery.clone());

        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            loop {
                if coordinator.terminating.load(Ordering::Relaxed) {
                    break;
                }
                if let Some(peer) = discovery.poll().await
                    && peer.valid(Validation::AllowPrivate)
                    && !coordinator.blacklisted(&peer)
                    && foreign_announcement(&coordinator, &peer)
                {
                    debug!(%peer, "local peer discovered");
                    coordinator.add(Level::Announced, peer);
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }

    fn incoming(self: &Arc<Self>, stream: tokio::net::TcpStream, remote: Address) {
        if self.blacklisted(&remote) {
            debug!(peer = %remote, "inbound refused, blacklisted");
            return;
        }
        if self.settings.max_connections != 0
            && self.connections.read().unwrap().len() >= self.settings.max_connections
        {
            debug!(peer = %remote, "inbound refused, at capacity");
            return;
        }

        // port zero marks the connection inbound; the level tag is not
        // meaningful until the peer proves an address via 'listening'
        let connection = Connection::new(Address::new(remote.ip, 0), Level::Blacklisted);
        self.connections
            .write()
            .unwrap()
            .push_front(connection.clone());
        let coordinator = self.clone();
        tokio::spawn(async move { connection.run_inbound(coordinator, stream).await });
    }

    fn start_outbound(self: &Arc<Self>, address: Address, level: Level) {
        if !address.valid(Validation::AllowPrivate) {
            self.ban(&address, BAD_ADDRESS_BAN_DAYS);
            return;
        }
        debug!(peer = %address, level = level.name(), "connecting");
        let connection = Connection::new(address, level);
        self.connections
            .write()
            .unwrap()
            .push_front(connection.clone());
        let coordinator = self.clone();
        tokio::spawn(async move { connection.run_outbound(coordinator).await });
    }

    /// User-requested connect, tried with priority on the next tick.
    pub fn connect(&self, address: Address) {
        self.connect_requests.lock().unwrap().insert(address);
    }

    // =========================================================================
    // CONNECTION LIST
    // =========================================================================

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().unwrap().iter().cloned().collect()
    }

    /// Removes and drops all retired connections.
    pub fn sweep(&self) {
        self.connections
            .write()
            .unwrap()
            .retain(|connection| !connection.retired());
    }

    /// Counts of pending and secured connections per level.
    pub fn active_counts(&self) -> ([usize; crate::db::LEVELS], [usize; crate::db::LEVELS]) {
        let mut attempting = [0usize; crate::db::LEVELS];
        let mut connected = [0usize; crate::db::LEVELS];
        for connection in self.connections.read().unwrap().iter() {
            match connection.state() {
                crate::net::connection::State::Pending => {
                    attempting[connection.level() as usize] += 1
                }
                crate::net::connection::State::Secured => {
                    connected[connection.level() as usize] += 1
                }
                crate::net::connection::State::Retired => {}
            }
        }
        (attempting, connected)
    }

    /// Total number of secured connections.
    pub fn active(&self) -> usize {
        let (_, connected) = self.active_counts();
        connected.iter().sum()
    }

    /// Is the mesh sufficient to broadcast data.
    pub fn broadcasting(&self) -> bool {
        self.active() >= self.settings.min_connections
    }

    pub fn inuse(&self, address: &Address) -> bool {
        self.connections.read().unwrap().iter().any(|connection| {
            !connection.retired()
                && (connection.peer == *address
                    || (connection.is_inbound() && connection.peer.ip == address.ip))
        })
    }

    /// The peer is already connected in the opposite direction.
    pub fn reciprocal(&self, connection: &Arc<Connection>) -> bool {
        self.connections.read().unwrap().iter().any(|other| {
            !Arc::ptr_eq(other, connection)
                && !other.retired()
                && other.peer.ip == connection.peer.ip
                && other.is_inbound() != connection.is_inbound()
        })
    }

    /// An incoming head carrying our own outstanding nonces means we
    /// connected back to ourselves through some loop; ban the address.
    pub fn reflecting(&self, head: &InitialHead, at: &Arc<Connection>) -> bool {
        for connection in self.connections.read().unwrap().iter() {
            if !Arc::ptr_eq(connection, at) && connection.reflects(head) {
                warn!(peer = %at.peer, "reflecting connection detected");
                self.ban(&connection.peer, BAD_ADDRESS_BAN_DAYS);
                return true;
            }
        }
        false
    }

    // =========================================================================
    // PEER LEVELS
    // =========================================================================

    pub fn find_level(&self, address: &Address) -> Option<Level> {
        Level::ALL
            .into_iter()
            .find(|&level| self.database.peers[level as usize].count(address))
    }

    /// Insert an address, upgrading its level if already present lower.
    pub fn add(&self, level: Level, address: Address) {
        match self.find_level(&address) {
            Some(existing) if existing <= level => {}
            _ => self.move_level(&address, level, NEW_RECORD_ASSESSMENT),
        }
    }

    fn move_level(&self, address: &Address, level: Level, assessment: u16) {
        for peers in &self.database.peers {
            peers.erase(address);
        }
        self.database.peers[level as usize].insert(*address, assessment);
    }

    /// Ban connecting to the address for a number of days; 0 unbans.
    pub fn ban(&self, address: &Address, days: u16) {
        if days != 0 {
            let unban_day = (now() / 86400) as u16 + days;
            self.move_level(address, Level::Blacklisted, unban_day);
            info!(peer = %address, days, "banned");
        } else {
            self.database.peers[Level::Blacklisted as usize].erase(address);
            info!(peer = %address, "unbanned");
        }
    }

    pub fn blacklisted(&self, address: &Address) -> bool {
        let peers = &self.database.peers[Level::Blacklisted as usize];
        match peers.find_ip(address) {
            Some((record, unban_day)) => {
                if (now() / 86400) as u16 >= unban_day {
                    peers.erase(&record);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    fn select_unused(
        &self,
        level: Level,
        amount: usize,
        addresses: &mut BTreeMap<Address, Level>,
    ) -> usize {
        let peers = &self.database.peers[level as usize];
        if peers.empty() {
            return 0;
        }
        let mut selected = 0;
        for _ in 0..amount {
            let random = self.rng.lock().unwrap().r#gen::<usize>();
            if let Some((address, _)) = peers.select(random)
                && !self.inuse(&address)
                && !addresses.contains_key(&address)
                && !self.blacklisted(&address)
            {
                debug!(level = level.name(), peer = %address, "selected for dialing");
                addresses.insert(address, level);
                selected += 1;
            }
        }
        selected
    }

    // =========================================================================
    // CONNECTION LIFECYCLE CALLBACKS
    // =========================================================================

    /// Connection secured: score the address, announce our ports, kick off
    /// history synchronization and subscriptions.
    pub async fn established(self: &Arc<Self>, connection: &Arc<Connection>) {
        info!(peer = %connection.peer, level = connection.level().name(), "established");

        if self.reciprocal(connection) {
            debug!(peer = %connection.peer, "peer also connected in the opposite direction");
        }

        if connection.is_outbound() {
            let peer = connection.peer;
            match connection.level() {
                Level::Established => {
                    self.database.peers[Level::Established as usize].adjust(&peer, 1);
                }
                Level::Validated => {
                    // enough good observations promote the peer
                    if self.database.peers[Level::Validated as usize].adjust(&peer, 1)
                        >= Some(0xFF)
                    {
                        connection.set_level(Level::Established);
                        self.move_level(&peer, Level::Established, NEW_RECORD_ASSESSMENT);
                    }
                }
                Level::Announced => {
                    connection.set_level(Level::Validated);
                    self.move_level(&peer, Level::Validated, NEW_RECORD_ASSESSMENT);
                    self.announce(&peer, None).await;
                }
                _ => {}
            }

            // not through proxy: tell the peer we also listen
            if self.settings.proxy.is_none() {
                let ports = self.listening_ports.lock().unwrap().clone();
                for port in ports {
                    connection
                        .send_request(RequestType::Listening, &port.to_le_bytes())
                        .await;
                }
            }
        } else {
            // inbound: give our friend a few randomly selected peers
            self.announce_random_peers(connection).await;
        }

        // request identities and channels we may have missed
        self.report_table_history(connection, RequestType::Identities, &self.database.identities)
            .await;
        self.report_table_history(connection, RequestType::Channels, &self.database.channels)
            .await;

        // leaf nodes enumerate subscriptions to conserve bandwidth;
        // propagating nodes request everything. Identity channels are only
        // requested from core nodes to limit traffic correlation.
        if self.settings.network_propagation_participation {
            connection.send_request(RequestType::Everything, &[]).await;
        } else {
            for id in self.subscriptions.enumerate() {
                if id.timestamp != id.identity.timestamp || connection.level() == Level::Core {
                    let packet = self.gather_history(&id);
                    connection
                        .send_request(RequestType::Subscribe, &packet.to_bytes())
                        .await;
                }
            }
        }

        // if connected to a core node, possibly ask for a full download
        if connection.level() == Level::Core && self.settings.full_database_downloads_allowed {
            let download = {
                let mut pacing = self.pacing.lock().unwrap();
                if pacing.core_sync_count < self.settings.core_sync_count {
                    pacing.core_sync_count += 1;
                    Some(Download {
                        parent: Eid::default(),
                        threshold: pacing.core_sync_threshold,
                    })
                } else {
                    None
                }
            };
            if let Some(download) = download {
                connection
                    .send_request(RequestType::Download, &download.to_bytes())
                    .await;
            }
        }
    }

    /// Failed to establish: reduce rating, eventually drop dead peers.
    /// Only when some other connection is up, the outage may be ours.
    pub fn unavailable(&self, connection: &Arc<Connection>) {
        if self.active() == 0 || connection.level() == Level::Blacklisted {
            return;
        }
        let peers = &self.database.peers[connection.level() as usize];
        if peers.adjust(&connection.peer, -1) == Some(0) {
            peers.erase(&connection.peer);
            info!(peer = %connection.peer, "dead address dropped");
        }
    }

    /// The peers disagreed on the protocol; heavy penalty and a short ban
    /// once the assessment is exhausted.
    pub async fn disagreed(&self, connection: &Arc<Connection>) {
        let level = connection.level();
        if connection.is_outbound() && level != Level::Blacklisted {
            if self.database.peers[level as usize].adjust(&connection.peer, -0xF) == Some(0) {
                // known node in network compromised
                self.ban(&connection.peer, 14);
            }
        } else if connection.is_inbound() {
            // might be a new version or a fork, ban the IP lightly
            self.ban(&Address::new(connection.peer.ip, 0), 1);
        }
        connection.cancel();
    }

    pub fn disconnected(&self, connection: &Arc<Connection>, outbound: bool) {
        debug!(peer = %connection.peer, "disconnected");
        if outbound && !connection.ever_secured() {
            self.unavailable(connection);
        }
    }

    // =========================================================================
    // REQUEST PROCESSING
    // =========================================================================

    /// Handle a decoded request frame. Returning false means protocol
    /// disagreement and disconnects the peer.
    pub async fn process(self: &Arc<Self>, payload: &[u8], connection: &Arc<Connection>) -> bool {
        let Some((kind, content)) = request::parse(payload, now()) else {
            return false;
        };
        if !connection.admit_request(self.settings.max_requests_per_minute) {
            return true;
        }
        debug!(peer = %connection.peer, request = kind.name(), size = content.len(), "request");

        match kind {
            RequestType::Initial => {
                if content == self.settings.magic.as_slice() {
                    true
                } else {
                    warn!(peer = %connection.peer, "initial packet magic mismatch");
                    false
                }
            }

            RequestType::Listening => {
                if let Some(port) = content
                    .get(0..2)
                    .map(|b| u16::from_le_bytes([b[0], b[1]]))
                    .filter(|port| *port != 0)
                {
                    let address = Address::new(connection.peer.ip, port);
                    if self.find_level(&address).is_none() {
                        self.database.peers[Level::Announced as usize]
                            .insert(address, NEW_RECORD_ASSESSMENT);
                        self.pacing.lock().unwrap().connect_one_more_announced = true;
                        debug!(peer = %address, "peer announced listening port");
                    }
                }
                true
            }

            RequestType::Peers => {
                self.announce_random_peers(connection).await;
                // significantly restrict how often peers can be queried
                connection.penalize_requests(self.settings.max_requests_per_minute / 3);
                true
            }

            RequestType::Ipv4Peer | RequestType::Ipv6Peer => {
                let Some(advertised) = NewPeer::parse(kind, content) else {
                    return false;
                };
                self.third_party_peer(advertised, connection);
                true
            }

            RequestType::Identities => {
                if self.settings.channels_synchronization_participation {
                    self.process_table_history(content, connection, &self.database.identities)
                        .await
                } else {
                    true
                }
            }
            RequestType::Channels => {
                if self.settings.channels_synchronization_participation {
                    self.process_table_history(content, connection, &self.database.channels)
                        .await
                } else {
                    true
                }
            }

            RequestType::Subscribe => {
                let Some(subscription) = Subscription::decode(content) else {
                    // disconnect so the peer finds someone who understands
                    return false;
                };
                connection.subscriptions.subscribe(
                    &subscription.channel,
                    self.settings.max_individual_subscriptions,
                );
                self.process_history(&subscription, connection).await;
                true
            }

            RequestType::Unsubscribe => {
                if content.len() == Eid::SIZE {
                    connection
                        .subscriptions
                        .unsubscribe(&Eid::read_from(content));
                }
                true
            }

            RequestType::Everything => {
                connection.subscriptions.subscribe_to_everything();
                true
            }

            RequestType::Download => {
                let Some(download) = Download::parse(content) else {
                    return false;
                };
                self.process_download(download, connection).await;
                true
            }
        }
    }

    /// Third-party peer advertisement: someone verified someone else.
    fn third_party_peer(&self, advertised: NewPeer, connection: &Arc<Connection>) {
        let address = advertised.address;

        // peers are not allowed to verify themselves; inbound connections
        // may not even verify other ports on the same IP
        let own = if connection.is_inbound() {
            address.ip == connection.peer.ip
        } else {
            address == connection.peer
        };
        if own {
            if connection.peer.accessible(Validation::Routable) {
                debug!(peer = %connection.peer, "peer tried to verify itself");
            }
            return;
        }
        if !address.valid(Validation::AllowPrivate) {
            return;
        }

        // accept local network addresses only from peers on local network
        if address.accessible(Validation::Routable)
            || !connection.peer.accessible(Validation::Routable)
        {
            if advertised.flags & NEWPEER_CORE != 0 && connection.level() == Level::Core {
                // core nodes may announce other core nodes
                self.move_level(&address, Level::Core, NEW_RECORD_ASSESSMENT);
                debug!(peer = %address, "promoted to core by core node");
            } else {
                self.database.peers[Level::Announced as usize].erase(&address);
                if self.find_level(&address).is_none() {
                    self.database.peers[Level::Validated as usize]
                        .insert(address, NEW_RECORD_ASSESSMENT);
                    debug!(peer = %address, "third-party verified peer added");
                }
            }
        } else {
            debug!(peer = %address, "unreachable peer advertisement ignored");
        }
    }

    // =========================================================================
    // ENTRY PIPELINE
    // =========================================================================

    /// Validate, assess, insert and forward a received entry; then drain
    /// any buffered orphans this entry adopted. Returning false
    /// disconnects the peer.
    pub async fn message(self: &Arc<Self>, bytes: &[u8], connection: &Arc<Connection>) -> bool {
        self.ingest(bytes, Some(connection)).await
    }

    /// Local submission path (source directory); no peer to penalize.
    pub async fn submit(self: &Arc<Self>, bytes: &[u8]) -> bool {
        self.ingest(bytes, None).await
    }

    async fn ingest(
        self: &Arc<Self>,
        bytes: &[u8],
        origin: Option<&Arc<Connection>>,
    ) -> bool {
        let mut queue: VecDeque<(Vec<u8>, bool)> = VecDeque::new();
        queue.push_back((bytes.to_vec(), true));
        let mut drained = 0usize;
        let mut accepted = false;

        while let Some((frame, original)) = queue.pop_front() {
            drained += 1;
            if drained > MAX_DETACHED_DRAIN {
                warn!("detached drain recursion bound hit");
                break;
            }

            let t = now();
            if let Err(error) = entry::validate(&frame, t) {
                debug!(code = error.code(), %error, "invalid entry");
                if original
                    && let Some(connection) = origin
                    && !self.strike(connection)
                {
                    return false;
                }
                continue;
            }

            let id = entry::id(&frame);
            let parent = entry::parent(&frame);

            // descendants of refused entries are pre-rejected
            if self.refused.count(&parent) {
                self.refused.insert(&id);
                if original
                    && let Some(connection) = origin
                    && !self.strike(connection)
                {
                    return false;
                }
                continue;
            }

            match self.database.assess(&frame) {
                Assessment::Rejected => {
                    self.refused.insert(&id);
                    self.detached.reject(&id);
                    if original
                        && let Some(connection) = origin
                        && !self.strike(connection)
                    {
                        return false;
                    }
                }

                Assessment::Detached(waiting_for) => {
                    // the missing ancestor may be on its way; buffer and
                    // re-evaluate on arrival
                    self.detached.insert(&waiting_for, frame);
                }

                Assessment::Classify(top) => {
                    let interesting = self.database.settings.store_everything
                        || origin.is_none()
                        || self.subscriptions.is_subscribed(&[
                            top.channel,
                            top.thread,
                            parent,
                            id,
                        ]);

                    if interesting {
                        if !self.store(&frame, &top).await {
                            continue;
                        }
                        accepted = true;
                    } else if let Some(connection) = origin {
                        let unsolicited =
                            connection.unsolicited.fetch_add(1, Ordering::Relaxed) + 1;
                        if !self.settings.network_propagation_participation
                            && unsolicited > self.settings.max_allowed_unsolicited_entries
                        {
                            return false;
                        }
                    }

                    // rebroadcast either way when participating in
                    // network propagation
                    if (self.settings.network_propagation_participation || origin.is_none())
                        && self.recent.insert(&id)
                    {
                        self.broadcast(&top, &frame, origin).await;
                    }
                    for waiter in self.detached.accept(&id) {
                        queue.push_back((waiter, false));
                    }
                }

                Assessment::Required => {
                    if !self.store(&frame, &crate::db::Root::default()).await {
                        continue;
                    }
                    accepted = true;
                    if self.recent.insert(&id) {
                        self.broadcast(&crate::db::Root::default(), &frame, origin).await;
                    }
                    for waiter in self.detached.accept(&id) {
                        queue.push_back((waiter, false));
                    }
                }
            }
        }
        // peer traffic keeps the connection healthy even when entries are
        // merely buffered; local submissions report acceptance
        origin.is_some() || accepted || self.detached.size() > 0
    }

    /// Count a consensus strike; false once the allowance is exhausted.
    fn strike(&self, connection: &Arc<Connection>) -> bool {
        let rejected = connection.rejected.fetch_add(1, Ordering::Relaxed) + 1;
        rejected <= self.settings.max_allowed_rejected_entries
    }

    async fn store(&self, frame: &[u8], top: &crate::db::Root) -> bool {
        let mut exists = false;
        match self.database.insert(frame, top, &mut exists) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "database insert failed");
                false
            }
        }
    }

    /// Broadcast an entry to every secured connection subscribed to any of
    /// its roots (announcements go to everyone).
    pub async fn broadcast(
        &self,
        top: &crate::db::Root,
        bytes: &[u8],
        except: Option<&Arc<Connection>>,
    ) -> usize {
        let id = entry::id(bytes);
        let parent = entry::parent(bytes);
        let announcement = entry::announcement(&id, &parent) != entry::Announcement::None;

        let mut transmitted = 0;
        for connection in self.snapshot() {
            if !connection.secured() || connection.retired() {
                continue;
            }
            if let Some(except) = except
                && Arc::ptr_eq(&connection, except)
            {
                continue;
            }
            if announcement
                || connection
                    .subscriptions
                    .is_subscribed(&[top.channel, top.thread, parent, id])
            {
                if connection.send(bytes).await {
                    transmitted += 1;
                }
            }
        }
        transmitted
    }

    /// Send a request to all secured connections.
    pub async fn broadcast_request(&self, kind: RequestType, payload: &[u8]) -> usize {
        let mut transmitted = 0;
        for connection in self.snapshot() {
            if connection.secured()
                && !connection.retired()
                && connection.send_request(kind, payload).await
            {
                transmitted += 1;
            }
        }
        transmitted
    }

    // =========================================================================
    // PEER ANNOUNCEMENTS
    // =========================================================================

    /// Advertise a verified address, to one connection or to all others.
    async fn announce(&self, address: &Address, only: Option<&Arc<Connection>>) {
        let advertisement = NewPeer {
            address: *address,
            flags: 0,
        };
        let payload = advertisement.to_bytes();
        let kind = advertisement.request_type();

        match only {
            Some(connection) => {
                connection.send_request(kind, &payload).await;
            }
            None => {
                self.broadcast_request(kind, &payload).await;
            }
        }
    }

    /// Reply to a 'peers' query: a weighted random sample across levels,
    /// fresh or validated addresses only, local addresses only to local
    /// peers.
    async fn announce_random_peers(&self, connection: &Arc<Connection>) {
        let mut sample = BTreeSet::new();
        let peer_is_local = !connection.peer.accessible(Validation::Routable);

        let mut i = 0usize;
        for level in [
            Level::Core,
            Level::Established,
            Level::Validated,
            Level::Announced,
        ] {
            let peers = &self.database.peers[level as usize];
            if peers.empty() {
                continue;
            }
            let quota = (level as usize + 1) * self.settings.announcement_sample_size
                / (crate::db::LEVELS - 1);
            while i < quota {
                let random = self.rng.lock().unwrap().r#gen::<usize>();
                if let Some((address, assessment)) = peers.select(random) {
                    // only addresses that are fresh or already validated,
                    // this prevents endlessly re-sharing dead peers
                    if (address.accessible(Validation::Routable) || peer_is_local)
                        && assessment >= NEW_RECORD_ASSESSMENT
                    {
                        sample.insert(address);
                    }
                }
                i += 1;
            }
        }

        for address in sample {
            self.announce(&address, Some(connection)).await;
        }
    }

    // =========================================================================
    // HISTORY SYNCHRONIZATION
    // =========================================================================

    /// Send the peer a digest of one announcement table so it can stream
    /// back whatever we lack.
    async fn report_table_history<K: DbRow>(
        &self,
        connection: &Arc<Connection>,
        kind: RequestType,
        table: &Table<K>,
    ) {
        let t = now();
        let cutoff = t.wrapping_sub(self.database.settings.synchronization_base_offset);

        let mut builder = HistoryBuilder::new(t, history::TABLE_SCALE, history::DEPTH);
        table.enumerate_shard_info(|base, rows| {
            if !older(base, cutoff) {
                return false;
            }
            builder.push(base, rows as u64)
        });

        // an empty digest reports threshold zero: send simply everything,
        // identities and channels are small
        let digest = builder.finish(0);
        connection.send_request(kind, &digest.to_bytes()).await;
    }

    /// Answer a table digest: ancient prefix the peer does not know about,
    /// spans where we hold more rows, and everything recent.
    async fn process_table_history<K: DbRow>(
        &self,
        content: &[u8],
        connection: &Arc<Connection>,
        table: &Table<K>,
    ) -> bool {
        let Some(digest) = History::decode(content, history::DEPTH) else {
            return false;
        };
        let ranges = digest.ranges();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut collect = |_row: &K, bytes: &[u8]| {
            frames.push(bytes.to_vec());
            true
        };

        let mut origin = 0u32;
        if let Some(((oldest, _), _)) = ranges.iter().next() {
            if *oldest > 0x7000_0000 {
                origin = oldest - 0x7000_0000;
            }

            // total ancient history the digest does not even span
            let before = oldest.wrapping_sub(1);
            if table.count(origin, before) > 0 {
                table.select(origin, before, |_| true, |_| true, &mut collect);
            }

            // compare the peer's spans against what we have
            for (&(low, high), &peer_rows) in &ranges {
                let ours = table.count(low, high);
                debug!(
                    peer = %connection.peer,
                    low, high, peer_rows, ours, "history span"
                );
                if ours > peer_rows as usize {
                    table.select(low, high, |_| true, |_| true, &mut collect);
                }
            }
        }

        // and finish with the most recent data
        let tail = if digest.threshold != 0 {
            digest.threshold
        } else {
            origin
        };
        table.select(tail, now(), |_| true, |_| true, &mut collect);

        for frame in frames {
            connection.send(&frame).await;
        }
        true
    }

    /// Digest of what we hold for a single channel or thread, attached to
    /// subscribe requests.
    fn gather_history(&self, channel: &Eid) -> Subscription {
        let t = now();
        let oldest = t.wrapping_sub(self.database.settings.synchronization_threshold);
        let newest = t.wrapping_sub(self.database.settings.synchronization_base_offset);

        let mut builder =
            HistoryBuilder::new(t, history::CHANNEL_SCALE, history::SUBSCRIPTION_DEPTH);
        let constrain = |row: &crate::db::Row| {
            row.top().channel == *channel || row.top().thread == *channel
        };
        self.database.data.select(
            oldest,
            newest,
            constrain,
            |row| {
                builder.push(row.timestamp(), 1);
                false
            },
            |_, _| true,
        );

        Subscription {
            channel: *channel,
            history: builder.finish(oldest),
        }
    }

    /// Answer a subscription digest with the entries of that channel the
    /// peer seems to lack.
    async fn process_history(&self, subscription: &Subscription, connection: &Arc<Connection>) {
        let channel = subscription.channel;
        let constrain = |row: &crate::db::Row| {
            row.top().channel == channel || row.top().thread == channel
        };

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut collect = |_row: &crate::db::Row, bytes: &[u8]| {
            frames.push(bytes.to_vec());
            true
        };

        for ((low, high), peer_rows) in subscription.history.ranges() {
            let ours = self.database.data.select(low, high, constrain, |_| false, |_, _| true);
            if ours > peer_rows as usize {
                self.database
                    .data
                    .select(low, high, constrain, |_| true, &mut collect);
            }
        }
        self.database.data.select(
            subscription.history.threshold,
            now(),
            constrain,
            |_| true,
            &mut collect,
        );

        for frame in frames {
            connection.send(&frame).await;
        }
    }

    /// Bulk download of a channel, thread, or (between core nodes) the
    /// whole recent database.
    async fn process_download(&self, download: Download, connection: &Arc<Connection>) {
        let t = now();
        let mut parent = download.parent;
        let mut threshold = download.threshold;

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut collect = |_row: &crate::db::Row, bytes: &[u8]| {
            frames.push(bytes.to_vec());
            true
        };

        if parent.is_null() {
            if !self.settings.full_database_downloads_allowed {
                warn!(peer = %connection.peer, "full database download forbidden");
                return;
            }
            if t.wrapping_sub(threshold) > self.settings.full_database_download_limit {
                threshold = t.wrapping_sub(self.settings.full_database_download_limit);
            }
            self.database
                .data
                .select(threshold, t, |_| true, |_| true, &mut collect);
        } else {
            // nested entries widen to their whole thread
            if let Some(row) = self.database.data.get(parent) {
                parent = row.top().thread;
            }
            // descendants cannot be older than their parent
            if older(threshold, parent.timestamp) {
                threshold = parent.timestamp;
            }
            let constrain = |row: &crate::db::Row| {
                row.top().channel == parent || row.top().thread == parent
            };
            self.database
                .data
                .select(threshold, t, constrain, |_| true, &mut collect);
        }

        debug!(peer = %connection.peer, frames = frames.len(), "download served");
        for frame in frames {
            connection.send(&frame).await;
        }
    }

    // =========================================================================
    // APPLICATION SUBSCRIPTIONS
    // =========================================================================

    /// Subscribe a client application; leaf nodes forward the subscription
    /// to peers along with the history of what they already hold.
    pub async fn subscribe(&self, app: &Uuid, id: &Eid) {
        let already = self.settings.network_propagation_participation
            || self.subscriptions.is_subscribed(std::slice::from_ref(id));
        self.subscriptions.subscribe(app, id);

        if !already {
            let packet = self.gather_history(id);
            self.broadcast_request(RequestType::Subscribe, &packet.to_bytes())
                .await;
        }
    }

    pub async fn unsubscribe(&self, app: &Uuid, id: &Eid) -> bool {
        if !self.subscriptions.unsubscribe(app, id) {
            return false;
        }
        if !self.settings.network_propagation_participation
            && !self.subscriptions.is_subscribed(std::slice::from_ref(id))
        {
            self.broadcast_request(RequestType::Unsubscribe, &id.to_bytes())
                .await;
        }
        true
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    /// One pass of the 1 Hz scheduling loop.
    pub async fn tick(self: &Arc<Self>) {
        let t = now();
        self.sweep();

        self.recent.clean(2 * consensus::MAX_ENTRY_AGE_ALLOWED);
        self.refused.clean(consensus::MAX_ENTRY_AGE_STORED / 2);
        self.detached.clean(self.database.settings.synchronization_base_offset);

        // keep-alive probes for idle links
        let micronow = microtimestamp();
        let period = self.settings.keep_alive_period as u64 * 1_000_000;
        for connection in self.snapshot() {
            connection.keepalive(micronow, period, period).await;
        }

        if self.terminating.load(Ordering::Relaxed) {
            return;
        }

        // dial budget for this tick
        let (attempting, connected) = self.active_counts();
        let secured: usize = connected.iter().sum();
        let total_links = self.connections.read().unwrap().len();

        let mut budget = self
            .settings
            .connections
            .saturating_sub(secured)
            .min(self.settings.max_concurrent_attempts);
        if self.settings.max_connections != 0 && total_links >= self.settings.max_connections {
            budget = 0;
        }

        // stuck wanting more connections for a while: ask peers for peers
        {
            let mut pacing = self.pacing.lock().unwrap();
            if budget > 0 {
                if older(
                    pacing.last_peers_query,
                    t.wrapping_sub(self.settings.more_peers_query_delay),
                ) {
                    pacing.last_peers_query = t;
                    drop(pacing);
                    self.broadcast_request(RequestType::Peers, &[]).await;
                }
            } else {
                pacing.last_peers_query = t;
            }
        }

        let mut addresses: BTreeMap<Address, Level> = BTreeMap::new();
        if budget > 0 {
            // don't DDoS the main pillars: core node limits, with an
            // override when totally disconnected for more than 30 seconds
            let started = self.pacing.lock().unwrap().started;
            if attempting[Level::Core as usize] < self.settings.max_core_connections
                && (connected[Level::Core as usize] < self.settings.min_core_connections
                    || (secured <= 1 && t.wrapping_sub(started) > 30))
            {
                budget = budget
                    .saturating_sub(self.select_unused(Level::Core, 1, &mut addresses));
            }

            // user requests take priority over level sampling
            {
                let mut requests = self.connect_requests.lock().unwrap();
                while budget > 0 {
                    let Some(address) = requests.iter().next().copied() else {
                        break;
                    };
                    requests.remove(&address);
                    addresses.insert(address, Level::Announced);
                    budget -= 1;
                }
            }

            budget = budget.saturating_sub(self.select_unused(
                Level::Established,
                budget.min(self.settings.connections / 2),
                &mut addresses,
            ));
            budget = budget.saturating_sub(self.select_unused(
                Level::Validated,
                budget.min(self.settings.connections / 4),
                &mut addresses,
            ));

            let one_more = std::mem::replace(
                &mut self.pacing.lock().unwrap().connect_one_more_announced,
                false,
            );
            if budget > 0 || one_more {
                self.select_unused(Level::Announced, 1, &mut addresses);
            }

            for (address, level) in addresses {
                self.start_outbound(address, level);
            }
        }

        // local peer discovery broadcasts
        let discoverers = self.discoverers.lock().unwrap().clone();
        for discovery in discoverers {
            if older(
                discovery.history.load(Ordering::Relaxed),
                t.wrapping_sub(self.settings.local_peer_discovery_period),
            ) {
                discovery.announce().await;
            }
        }

        // persistent state flushes
        let flush_due = {
            let mut pacing = self.pacing.lock().unwrap();
            let interval = (self.database.settings.disk_flush_interval / 1000).max(1) as u32;
            if older(pacing.last_flush, t.wrapping_sub(interval)) {
                pacing.last_flush = t;
                true
            } else {
                false
            }
        };
        if flush_due {
            self.flush();
        }
    }

    pub fn flush(&self) {
        self.database.flush();
        self.subscriptions.flush();
        self.blacklist.flush();
        self.retained.flush();
    }

    /// Log a status line for every connection.
    pub fn status(&self) {
        for connection in self.snapshot() {
            info!("{}", connection.status());
        }
        let stats = self.database.stats();
        info!(
            rows = stats.rows,
            shards = stats.shards_total,
            active = stats.shards_active,
            detached = self.detached.size(),
            "database status"
        );
    }

    /// Cancel everything and sweep until clean, at most ~15 seconds.
    pub async fn terminate(self: &Arc<Self>) {
        self.terminating.store(true, Ordering::SeqCst);

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for connection in self.snapshot() {
            connection.cancel();
        }

        for _ in 0..150 {
            self.sweep();
            if self.connections.read().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.connections.write().unwrap().clear();
        self.flush();
        info!("coordinator terminated");
    }
}

/// Filter our own discovery broadcast arriving back on the same host;
/// true when the announcement came from someone else.
fn foreign_announcement(coordinator: &Arc<Coordinator>, peer: &Address) -> bool {
    let ports = coordinator.listening_ports.lock().unwrap();
    !(ports.contains(&peer.port) && peer.ip.is_loopback())
}
