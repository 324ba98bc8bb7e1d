use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex, Semaphore},
    task::JoinSet,
    time::{interval_at, timeout, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    bitfield::BitField,
    metainfo::Info,
    peers::{PeerError, PeerSession, SessionCommand, SessionEvent, SessionEventKind},
    piece_manager::PieceManager,
    progress::{DownloadProgress, DownloadState, ProgressConsumer},
    protocol::PeerMessage,
    storage::BlockStore,
    tracker::PeerFinder,
};

pub const MAX_OUTSTANDING_REQUESTS: usize = 300;

const PEER_ID_PREFIX: &str = "OceanC";
const EVENT_CHANNEL_CAPACITY: usize = 1000;
const SESSION_COMMAND_CAPACITY: usize = 64;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
const NO_PEER_RETRY: Duration = Duration::from_secs(1);

/// Generates a random 20 byte peer id: client prefix plus alphanumerics.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0_u8; 20];
    id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX.as_bytes());
    let mut rng = rand::rng();
    for byte in id.iter_mut().skip(PEER_ID_PREFIX.len()) {
        *byte = rng.sample(rand::distr::Alphanumeric);
    }
    id
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Listening port for inbound peer connections.
    pub port: u16,
    /// Output root the metainfo's file table is laid out under.
    pub download_dir: PathBuf,
    /// Wire identity to announce; generated when absent.
    pub local_peer_id: Option<[u8; 20]>,
    /// Global bound on in-flight block requests.
    pub max_outstanding_requests: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub cancellation_token: Option<CancellationToken>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: 6881,
            download_dir: PathBuf::from("."),
            local_peer_id: None,
            max_outstanding_requests: MAX_OUTSTANDING_REQUESTS,
            request_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(100),
            cancellation_token: Some(CancellationToken::new()),
        }
    }
}

/// Scheduling view of one live session. The session task owns the socket;
/// this mirror is what dispatch and the requester work against.
#[derive(Debug)]
struct SessionHandle {
    addr: SocketAddr,
    commands: mpsc::Sender<SessionCommand>,
    bitfield: BitField,
    am_choking: bool,
    peer_interested: bool,
}

#[derive(Debug, Default)]
struct PeerRegistry {
    sessions: HashMap<Uuid, SessionHandle>,
    /// Sessions whose peer has unchoked us.
    unchoked_by: HashSet<Uuid>,
}

impl PeerRegistry {
    fn random_unchoked_with_piece(&self, piece: u32) -> Option<mpsc::Sender<SessionCommand>> {
        let candidates: Vec<_> = self
            .unchoked_by
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|handle| handle.bitfield.has(piece as usize))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rand::rng().random_range(0..candidates.len());
        Some(candidates[pick].commands.clone())
    }

    fn remove(&mut self, id: &Uuid) -> Option<SessionHandle> {
        self.unchoked_by.remove(id);
        self.sessions.remove(id)
    }
}

pub struct SwarmHandle {
    pub cancellation_token: CancellationToken,
    completed: watch::Receiver<bool>,
}

impl SwarmHandle {
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    /// Resolves once every piece is verified and on disk.
    pub async fn wait_complete(&mut self) {
        let _ = self.completed.wait_for(|complete| *complete).await;
    }
}

/// Concurrent supervisor for one torrent: dials and accepts peers, drives
/// the request loop against the [PieceManager] and serves finished pieces
/// back to the swarm.
pub struct Swarm<F> {
    config: ClientConfig,
    info: Info,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    num_pieces: usize,
    finder: F,
    listener: TcpListener,
    listen_addr: SocketAddr,
    manager: Arc<Mutex<PieceManager>>,
    registry: Arc<Mutex<PeerRegistry>>,
    outstanding_requests: Arc<StdMutex<Arc<Semaphore>>>,
    cancellation_token: CancellationToken,
    completed: watch::Sender<bool>,
}

impl<F: PeerFinder + Send + Sync + 'static> Swarm<F> {
    pub async fn new(info: Info, finder: F, config: ClientConfig) -> anyhow::Result<Self> {
        let output_files = info.output_files(&config.download_dir);
        let store = BlockStore::new(&output_files, info.piece_length)
            .await
            .context("materialize output files")?;
        let manager = PieceManager::new(&info, store);
        let info_hash = info.hash();
        let num_pieces = info.pieces.len();
        let local_peer_id = config.local_peer_id.unwrap_or_else(generate_peer_id);
        let cancellation_token = config.cancellation_token.clone().unwrap_or_default();
        let max_outstanding = config.max_outstanding_requests;
        let (completed, _) = watch::channel(false);

        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .context("bind listening port")?;
        let listen_addr = listener.local_addr().context("listening address")?;

        Ok(Self {
            config,
            info,
            info_hash,
            local_peer_id,
            num_pieces,
            finder,
            listener,
            listen_addr,
            manager: Arc::new(Mutex::new(manager)),
            registry: Arc::new(Mutex::new(PeerRegistry::default())),
            outstanding_requests: Arc::new(StdMutex::new(Arc::new(Semaphore::new(
                max_outstanding,
            )))),
            cancellation_token,
            completed,
        })
    }

    pub fn local_peer_id(&self) -> [u8; 20] {
        self.local_peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn handle(&self) -> SwarmHandle {
        SwarmHandle {
            cancellation_token: self.cancellation_token.clone(),
            completed: self.completed.subscribe(),
        }
    }

    /// Drive the whole swarm until it is stopped. Completion does not end
    /// the loop; the swarm keeps serving requests until cancelled.
    pub async fn run(self, mut progress: impl ProgressConsumer) -> anyhow::Result<()> {
        let Swarm {
            config,
            info,
            info_hash,
            local_peer_id,
            num_pieces,
            finder,
            listener,
            listen_addr: _,
            manager,
            registry,
            outstanding_requests,
            cancellation_token: token,
            completed,
        } = self;

        tracing::info!(
            "Starting swarm for {} ({} bytes, {} pieces)",
            info.name,
            info.total_size(),
            num_pieces
        );

        let tracker = TaskTracker::new();
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (new_sessions_tx, mut new_sessions_rx) = mpsc::channel(64);

        tracker.spawn(accept_loop(
            listener,
            info_hash,
            local_peer_id,
            num_pieces,
            manager.clone(),
            new_sessions_tx.clone(),
            config.connect_timeout,
            token.clone(),
        ));

        tracker.spawn(connect_to_found_peers(
            finder,
            info_hash,
            local_peer_id,
            num_pieces,
            manager.clone(),
            new_sessions_tx.clone(),
            config.connect_timeout,
            token.clone(),
        ));

        tracker.spawn(requester(
            manager.clone(),
            registry.clone(),
            outstanding_requests.clone(),
            config.request_timeout,
            config.max_outstanding_requests,
            completed,
            token.clone(),
        ));

        let mut runner = SwarmRunner {
            manager,
            registry,
            outstanding_requests,
            session_tasks: JoinSet::new(),
            events_tx,
        };

        let mut keepalive = interval_at(
            Instant::now() + config.keepalive_interval,
            config.keepalive_interval,
        );
        let mut progress_tick = interval_at(Instant::now() + PROGRESS_INTERVAL, PROGRESS_INTERVAL);

        let mut fatal = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = events_rx.recv() => {
                    if let Err(e) = runner.handle_event(event).await {
                        tracing::error!("Fatal storage failure: {e}");
                        fatal = Some(e);
                        token.cancel();
                    }
                }
                Some(session) = new_sessions_rx.recv() => {
                    runner.register_session(session).await;
                }
                Some(finished) = runner.session_tasks.join_next() => {
                    runner.reap_session(finished).await;
                }
                _ = keepalive.tick() => runner.broadcast(|| SessionCommand::KeepAlive).await,
                _ = progress_tick.tick() => runner.emit_progress(&mut progress).await,
            }
        }

        runner.registry.lock().await.sessions.clear();
        runner.session_tasks.shutdown().await;
        tracker.close();
        token.cancel();
        tracker.wait().await;

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct SwarmRunner {
    manager: Arc<Mutex<PieceManager>>,
    registry: Arc<Mutex<PeerRegistry>>,
    outstanding_requests: Arc<StdMutex<Arc<Semaphore>>>,
    session_tasks: JoinSet<(Uuid, Result<(), PeerError>)>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl SwarmRunner {
    async fn register_session(&mut self, session: PeerSession) {
        let (commands_tx, commands_rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);
        let handle = SessionHandle {
            addr: session.addr,
            commands: commands_tx,
            bitfield: session.bitfield.clone(),
            am_choking: true,
            peer_interested: false,
        };
        tracing::info!(peer = %session.addr, "Peer session is live");
        self.registry.lock().await.sessions.insert(session.id, handle);
        self.session_tasks
            .spawn(session.run(commands_rx, self.events_tx.clone()));
    }

    async fn reap_session(
        &mut self,
        finished: Result<(Uuid, Result<(), PeerError>), tokio::task::JoinError>,
    ) {
        let Ok((id, result)) = finished else {
            return;
        };
        let addr = self.registry.lock().await.remove(&id).map(|h| h.addr);
        match result {
            Ok(()) => tracing::debug!(?addr, "Peer session closed"),
            Err(e) => tracing::debug!(?addr, "Dropped peer session: {e}"),
        }
    }

    /// Packet dispatch. Errors out of here are fatal; per-peer trouble is
    /// handled by dropping the offending session.
    async fn handle_event(&mut self, event: SessionEvent) -> anyhow::Result<()> {
        let SessionEvent { session, kind } = event;
        match kind {
            SessionEventKind::Choked => {
                self.registry.lock().await.unchoked_by.remove(&session);
            }
            SessionEventKind::Unchoked => {
                let mut registry = self.registry.lock().await;
                if registry.sessions.contains_key(&session) {
                    registry.unchoked_by.insert(session);
                }
            }
            SessionEventKind::Interested => {
                let mut registry = self.registry.lock().await;
                if let Some(handle) = registry.sessions.get_mut(&session) {
                    handle.peer_interested = true;
                    // reciprocate so the peer can actually leech off us
                    if handle.am_choking {
                        handle.am_choking = false;
                        let _ = handle.commands.try_send(SessionCommand::Unchoke);
                    }
                }
            }
            SessionEventKind::NotInterested => {
                let mut registry = self.registry.lock().await;
                if let Some(handle) = registry.sessions.get_mut(&session) {
                    handle.peer_interested = false;
                }
            }
            SessionEventKind::Have(index) => {
                let mut registry = self.registry.lock().await;
                if let Some(handle) = registry.sessions.get_mut(&session) {
                    if handle.bitfield.add(index as usize).is_err() {
                        tracing::warn!("Peer announced nonexistent piece {index}");
                    }
                }
            }
            SessionEventKind::Bitfield(bitfield) => {
                let mut registry = self.registry.lock().await;
                if let Some(handle) = registry.sessions.get_mut(&session) {
                    handle.bitfield = bitfield;
                }
            }
            SessionEventKind::BlockRequested(request) => {
                let target = {
                    let registry = self.registry.lock().await;
                    registry
                        .sessions
                        .get(&session)
                        .map(|handle| (handle.commands.clone(), handle.am_choking))
                };
                let Some((commands, am_choking)) = target else {
                    return Ok(());
                };
                if am_choking {
                    tracing::debug!("Peer requested {request} while choked");
                    let _ = commands.try_send(SessionCommand::Choke);
                    return Ok(());
                }
                let block = {
                    let mut manager = self.manager.lock().await;
                    if !manager.has_piece(request.piece) {
                        tracing::debug!("Peer requested unavailable {request}");
                        return Ok(());
                    }
                    manager.get_block(request).await
                };
                match block {
                    Ok(block) => {
                        let _ = commands.try_send(SessionCommand::Block(block));
                    }
                    // the peer will time the request out and retry
                    Err(e) => tracing::warn!("Failed to read {request} for peer: {e}"),
                }
            }
            SessionEventKind::BlockReceived(block) => {
                self.outstanding_requests.lock().unwrap().add_permits(1);
                let finished_piece = self.manager.lock().await.save_block(block).await?;
                if let Some(index) = finished_piece {
                    self.broadcast(|| SessionCommand::Have(index)).await;
                }
            }
        }
        Ok(())
    }

    async fn broadcast(&self, command: impl Fn() -> SessionCommand) {
        let registry = self.registry.lock().await;
        for handle in registry.sessions.values() {
            let _ = handle.commands.try_send(command());
        }
    }

    async fn emit_progress(&self, consumer: &mut impl ProgressConsumer) {
        let (finished_pieces, total_pieces) = {
            let manager = self.manager.lock().await;
            (manager.finished_pieces(), manager.total_pieces())
        };
        let peer_count = self.registry.lock().await.sessions.len();
        let percent = if total_pieces == 0 {
            100.0
        } else {
            finished_pieces as f32 / total_pieces as f32 * 100.0
        };
        let state = if finished_pieces == total_pieces {
            DownloadState::Seeding
        } else {
            DownloadState::Downloading
        };
        consumer.consume_progress(DownloadProgress {
            finished_pieces,
            total_pieces,
            percent,
            peer_count,
            state,
        });
    }
}

/// The request loop: walk the manager's request stream, hand each request
/// to a random unchoked session advertising the piece and bound the
/// in-flight window with the outstanding-requests semaphore. A window that
/// stays dry for the whole request timeout is considered lost wholesale and
/// the semaphore is replaced with a fresh full one; the recirculating piece
/// queues re-issue whatever was in it.
async fn requester(
    manager: Arc<Mutex<PieceManager>>,
    registry: Arc<Mutex<PeerRegistry>>,
    permits: Arc<StdMutex<Arc<Semaphore>>>,
    request_timeout: Duration,
    max_outstanding: usize,
    completed: watch::Sender<bool>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }
        let request = manager.lock().await.next_request();
        let Some(request) = request else {
            break;
        };

        let commands = loop {
            let target = registry
                .lock()
                .await
                .random_unchoked_with_piece(request.piece);
            if let Some(commands) = target {
                break commands;
            }
            tracing::trace!("No unchoked peer advertises piece {}, waiting", request.piece);
            tokio::select! {
                _ = tokio::time::sleep(NO_PEER_RETRY) => {}
                _ = token.cancelled() => return,
            }
        };

        if commands.send(SessionCommand::Request(request)).await.is_err() {
            // session died under us, the request recirculates
            continue;
        }

        let semaphore = permits.lock().unwrap().clone();
        tokio::select! {
            _ = token.cancelled() => return,
            acquired = timeout(request_timeout, semaphore.acquire()) => match acquired {
                Ok(Ok(permit)) => permit.forget(),
                Ok(Err(_)) => return,
                Err(_) => {
                    tracing::debug!("Outstanding request window timed out, resetting");
                    *permits.lock().unwrap() = Arc::new(Semaphore::new(max_outstanding));
                }
            }
        }
    }

    tracing::info!("Download complete, staying around to seed");
    let _ = completed.send(true);
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    num_pieces: usize,
    manager: Arc<Mutex<PieceManager>>,
    new_sessions: mpsc::Sender<PeerSession>,
    handshake_timeout: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((socket, addr)) = accepted else {
                    continue;
                };
                tracing::trace!(%addr, "Accepted inbound connection");
                let manager = manager.clone();
                let new_sessions = new_sessions.clone();
                tokio::spawn(async move {
                    let accepted = timeout(
                        handshake_timeout,
                        PeerSession::accept(socket, info_hash, local_peer_id, num_pieces),
                    )
                    .await;
                    match accepted {
                        Ok(Ok(mut session)) => {
                            if send_bitfield(&manager, &mut session).await.is_err() {
                                return;
                            }
                            let _ = new_sessions.send(session).await;
                        }
                        Ok(Err(e)) => tracing::debug!(%addr, "Inbound handshake failed: {e}"),
                        Err(_) => tracing::trace!(%addr, "Inbound handshake timed out"),
                    }
                });
            }
        }
    }
}

/// One pass over the peer source, dialing everything it returns.
#[allow(clippy::too_many_arguments)]
async fn connect_to_found_peers<F: PeerFinder>(
    finder: F,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    num_pieces: usize,
    manager: Arc<Mutex<PieceManager>>,
    new_sessions: mpsc::Sender<PeerSession>,
    connect_timeout: Duration,
    token: CancellationToken,
) {
    let peers = match finder.get_peers().await {
        Ok(peers) => peers,
        Err(e) => {
            tracing::error!("Peer discovery failed: {e}");
            return;
        }
    };
    tracing::info!("Peer source returned {} peers", peers.len());

    let mut dials = JoinSet::new();
    for peer in peers {
        let manager = manager.clone();
        let new_sessions = new_sessions.clone();
        let token = token.clone();
        dials.spawn(async move {
            let dial = dial(
                peer.addr.into(),
                info_hash,
                local_peer_id,
                num_pieces,
                manager,
                connect_timeout,
            );
            tokio::select! {
                _ = token.cancelled() => {}
                session = dial => match session {
                    Ok(session) => {
                        let _ = new_sessions.send(session).await;
                    }
                    Err(e) => tracing::debug!(peer = %peer.addr, "Could not connect: {e}"),
                }
            }
        });
    }
    while dials.join_next().await.is_some() {}
}

async fn dial(
    addr: SocketAddr,
    info_hash: [u8; 20],
    local_peer_id: [u8; 20],
    num_pieces: usize,
    manager: Arc<Mutex<PieceManager>>,
    connect_timeout: Duration,
) -> anyhow::Result<PeerSession> {
    let socket = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .context("connect timed out")??;
    let mut session = timeout(
        connect_timeout,
        PeerSession::connect(socket, info_hash, local_peer_id, num_pieces),
    )
    .await
    .context("handshake timed out")??;
    send_bitfield(&manager, &mut session).await?;
    session.send(PeerMessage::Interested).await?;
    tracing::debug!(peer = %session.addr, "Connected to peer");
    Ok(session)
}

/// Our holdings go out right after the handshake, and only when non-empty.
async fn send_bitfield(
    manager: &Arc<Mutex<PieceManager>>,
    session: &mut PeerSession,
) -> Result<(), PeerError> {
    let bitfield = manager.lock().await.bitfield().clone();
    if bitfield.num_set() > 0 {
        session.send(PeerMessage::Bitfield { payload: bitfield }).await?;
    }
    Ok(())
}
