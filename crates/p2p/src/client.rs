//! Reverse-range sync client: coordinator main loop and per-peer workers.

use crate::config::SyncConfig;
use crate::error::{RangeError, RequestError};
use crate::limiter::TokenBucket;
use crate::metrics;
use crate::quarantine::{Dropped, Quarantine};
use crate::trust::TrustSet;
use crate::wire::{self, BoxStream};
use async_trait::async_trait;
use libp2p::{PeerId, StreamProtocol};
use opsync_types::{BlockRef, ExecutionPayload, Hash};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Boxed error returned by the payload receiver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opens an outbound stream to a peer for a given protocol.
#[async_trait]
pub trait OpenStream: Send + Sync {
    async fn open(&self, peer: PeerId, protocol: StreamProtocol) -> std::io::Result<BoxStream>;
}

/// Consumes verified payloads, in reverse chain order with possible gaps.
///
/// The same block may be delivered again across range requests; receivers
/// must be idempotent. An error here leaves the block in quarantine for a
/// later promotion attempt.
#[async_trait]
pub trait ReceivePayload: Send + Sync {
    async fn receive_payload(
        &self,
        from: PeerId,
        payload: Arc<ExecutionPayload>,
    ) -> Result<(), BoxError>;
}

/// A fetched payload attributed to the peer that served it.
#[derive(Debug, Clone)]
pub(crate) struct SyncResult {
    pub(crate) payload: Arc<ExecutionPayload>,
    pub(crate) peer: PeerId,
}

/// A requested block range, anchored on a trusted end reference.
#[derive(Debug, Clone)]
struct RangeRequest {
    start: u64,
    end: BlockRef,
}

/// One block number's worth of work for a peer worker.
///
/// `complete` is flipped by whichever worker finishes with an error so the
/// coordinator can forget the in-flight record on its next scheduling pass.
/// On success the coordinator forgets the record when it processes the
/// result instead.
struct PeerRequest {
    number: u64,
    complete: Arc<AtomicBool>,
}

/// State shared between the public surface, the coordinator, and workers.
struct ClientShared {
    cfg: SyncConfig,
    protocol: StreamProtocol,
    requests_tx: mpsc::Sender<RangeRequest>,
    peer_requests_tx: mpsc::Sender<PeerRequest>,
    /// Fan-out queue receiver, shared by all workers. The lock is held only
    /// while one worker awaits a dequeue.
    peer_requests_rx: tokio::sync::Mutex<mpsc::Receiver<PeerRequest>>,
    results_tx: mpsc::Sender<SyncResult>,
    /// Worker cancellation handles, keyed by peer. Mutated from outside the
    /// main loop, so guarded; the lock covers only the map operation.
    peers: parking_lot::Mutex<HashMap<PeerId, CancellationToken>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    open_stream: Arc<dyn OpenStream>,
    receive: Arc<dyn ReceivePayload>,
}

/// Reverse chain sync with a minimal interface: signal the desired range,
/// and receive verified blocks within that range back.
///
/// Through parent-hash verification, received blocks are all ensured to have
/// been part of the canonical chain at one point; organizing and persisting
/// the results is up to the receiver.
///
/// Peers must be added with [`SyncClient::add_peer`] and removed on
/// disconnect with [`SyncClient::remove_peer`]; the client is started with
/// [`SyncClient::start`], before or after any peer changes.
///
/// # Stages
///
/// - [`SyncClient::request_range`] hands the range to the main loop, which
///   processes it from high to low, dividing block requests between parallel
///   peer workers. The high end of the range has a known hash and is marked
///   trusted. Requests already in flight, and numbers already quarantined,
///   are not repeated; quarantined data that is trusted is promoted instead.
///   Once no worker can buffer another request, the pass stops.
/// - Each peer worker fetches its requested block, verifies the number and
///   hash, and sends the result back to the main loop. Failures mark the
///   in-flight record complete and charge the worker a back-off.
/// - The main loop removes each result from the in-flight table, buffers it
///   in quarantine, and promotes it if its hash is trusted.
///
/// # Concepts
///
/// - **Quarantine**: an LRU of the latest fetched blocks, by hash, with an
///   extra index by number. Entries leave by promotion, by eviction under
///   LRU pressure, or by explicit removal when found non-canonical.
/// - **Trust**: a hash becomes trusted as the sync target (or its parent),
///   or as the hash or parent of a promoted block. The trusted set is
///   recency-bounded; only recent blocks matter.
/// - **Promotion**: a quarantined block whose hash is trusted is removed
///   from quarantine and forwarded to the receiver, then its parent is
///   re-examined, cascading backward through the chain.
///
/// # Usage
///
/// Request the range between the local chain head and a trusted future
/// block reference, and adjust the range down as results arrive. Repeat
/// range requests eventually: the client abandons the tail of a range when
/// its workers are saturated. This mechanism targets gap-filling between an
/// existing chain and the gossip head; very long ranges belong to
/// execution-layer sync.
pub struct SyncClient {
    shared: Arc<ClientShared>,
    coordinator: parking_lot::Mutex<Option<Coordinator>>,
}

impl SyncClient {
    /// Create a sync client over the given transport and receiver.
    pub fn new(
        cfg: SyncConfig,
        open_stream: Arc<dyn OpenStream>,
        receive: Arc<dyn ReceivePayload>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (peer_requests_tx, peer_requests_rx) = mpsc::channel(cfg.channel_capacity);
        let (results_tx, results_rx) = mpsc::channel(cfg.channel_capacity);

        let protocol = wire::payload_by_number_protocol(cfg.rollup.l2_chain_id);
        let trust_capacity = cfg.trust_capacity;
        let quarantine_capacity = cfg.quarantine_capacity;

        let shared = Arc::new(ClientShared {
            cfg,
            protocol,
            requests_tx,
            peer_requests_tx,
            peer_requests_rx: tokio::sync::Mutex::new(peer_requests_rx),
            results_tx,
            peers: parking_lot::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            open_stream,
            receive,
        });

        let coordinator = Coordinator {
            shared: shared.clone(),
            requests_rx,
            results_rx,
            trusted: TrustSet::new(trust_capacity),
            quarantine: Quarantine::new(quarantine_capacity),
            in_flight: HashMap::new(),
        };

        Self {
            shared,
            coordinator: parking_lot::Mutex::new(Some(coordinator)),
        }
    }

    /// Start the coordinator main loop.
    pub fn start(&self) {
        let Some(coordinator) = self.coordinator.lock().take() else {
            warn!("sync client already started");
            return;
        };
        self.shared.tasks.spawn(coordinator.run());
    }

    /// Register a peer for sync duties and spawn its worker.
    pub fn add_peer(&self, peer: PeerId) {
        if self.shared.cancel.is_cancelled() {
            warn!(peer = %peer, "cannot register peer for sync duties, client is closed");
            return;
        }
        let mut peers = self.shared.peers.lock();
        if peers.contains_key(&peer) {
            warn!(peer = %peer, "cannot register peer for sync duties, peer was already registered");
            return;
        }
        let cancel = self.shared.cancel.child_token();
        peers.insert(peer, cancel.clone());
        self.shared
            .tasks
            .spawn(peer_loop(self.shared.clone(), peer, cancel));
    }

    /// Remove a peer from sync duties, cancelling its worker.
    pub fn remove_peer(&self, peer: PeerId) {
        let mut peers = self.shared.peers.lock();
        let Some(cancel) = peers.remove(&peer) else {
            warn!(peer = %peer, "cannot remove peer from sync duties, peer was not registered");
            return;
        };
        cancel.cancel();
    }

    /// Request all blocks in `(start.number, end.number)`, verified backward
    /// from `end`.
    ///
    /// A zero `end` carries no trust anchor and is ignored. Returns
    /// [`RangeError::Busy`] when the main loop does not pick the request up
    /// within the configured send budget; the caller is expected to repeat
    /// range requests with updated targets anyway.
    pub async fn request_range(&self, start: BlockRef, end: BlockRef) -> Result<(), RangeError> {
        if end.is_zero() {
            debug!(
                start = %start,
                "ignoring open-ended range request: no sync target to verify blocks through parent-hashes"
            );
            return Ok(());
        }
        let request = RangeRequest {
            start: start.number,
            end,
        };
        match timeout(
            self.shared.cfg.range_send_timeout,
            self.shared.requests_tx.send(request),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RangeError::Closed),
            Err(_) => Err(RangeError::Busy),
        }
    }

    /// Shut down: cancel the coordinator and all workers, then wait for
    /// every spawned task to exit.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
    }
}

/// Single owner of all request bookkeeping: the trust set, the quarantine,
/// and the in-flight table are only ever touched from this task.
struct Coordinator {
    shared: Arc<ClientShared>,
    requests_rx: mpsc::Receiver<RangeRequest>,
    results_rx: mpsc::Receiver<SyncResult>,
    trusted: TrustSet,
    quarantine: Quarantine,
    in_flight: HashMap<u64, Arc<AtomicBool>>,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shared.cancel.cancelled() => {
                    info!("stopped reverse-range block sync client");
                    return;
                }
                Some(request) = self.requests_rx.recv() => {
                    self.on_range_request(request);
                }
                Some(result) = self.results_rx.recv() => {
                    self.on_result(result).await;
                }
                else => return,
            }
        }
    }

    /// Transform a requested block range into work for the peer workers.
    fn on_range_request(&mut self, request: RangeRequest) {
        let deadline = Instant::now() + self.shared.cfg.max_request_scheduling;

        // The range end is the trust anchor.
        self.trusted.add(request.end.hash);
        self.trusted.add(request.end.parent_hash);

        // Sweep in-flight records whose worker finished with an error.
        self.in_flight
            .retain(|_, complete| !complete.load(Ordering::Acquire));

        // Walk from just below the trusted end back toward the start, so
        // blocks closest to the anchor are fetched first and promotion
        // cascades as far as possible.
        for number in (request.start + 1..request.end.number).rev() {
            if let Some(hash) = self.quarantine.hash_for_number(number) {
                if self.trusted.contains(&hash) {
                    self.try_promote(hash);
                }
                // A candidate exists; it is either promoted above or evicted
                // later by a conflict. Don't fetch it again.
                continue;
            }
            if self.in_flight.contains_key(&number) {
                continue;
            }
            if Instant::now() >= deadline {
                info!(
                    target = request.start,
                    end = %request.end,
                    current = number,
                    "did not schedule full sync range, scheduling budget spent"
                );
                return;
            }

            let complete = Arc::new(AtomicBool::new(false));
            debug!(num = number, "scheduling block request");
            match self.shared.peer_requests_tx.try_send(PeerRequest {
                number,
                complete: complete.clone(),
            }) {
                Ok(()) => {
                    self.in_flight.insert(number, complete);
                }
                Err(TrySendError::Full(_)) => {
                    // All workers are busy; the rest of the range is picked
                    // up by a later range request.
                    info!(
                        current = number,
                        "no peers ready to handle more block requests"
                    );
                    return;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }

    /// Ingest one fetched block: verify it against the trust set, and either
    /// promote it or leave it in quarantine.
    async fn on_result(&mut self, result: SyncResult) {
        let number = result.payload.block_number();
        let hash = result.payload.block_hash();

        // We have an answer for this number, whatever it turns out to be.
        self.in_flight.remove(&number);

        // Quarantine first: if promotion fails because the receiver is
        // busy, the entry doubles as a cache for the next attempt.
        if let Some(dropped) = self.quarantine.insert(result.clone()) {
            self.log_dropped(&dropped);
        }

        if self.trusted.contains(&hash) {
            self.promote(result).await;
        }
    }

    /// Hand a block to the receiver and extend trust through its parent.
    async fn promote(&mut self, result: SyncResult) {
        let payload = &result.payload;
        let delivery = timeout(
            self.shared.cfg.max_result_processing,
            self.shared
                .receive
                .receive_payload(result.peer, payload.clone()),
        )
        .await;
        match delivery {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(id = %payload.id(), error = %err, "failed to promote payload, receiver error");
                return;
            }
            Err(_) => {
                warn!(id = %payload.id(), "failed to promote payload, receiver timed out");
                return;
            }
        }

        self.trusted.add(payload.block_hash());
        self.trusted.add(payload.parent_hash());
        metrics::record_block_promoted();

        if let Some(dropped) = self.quarantine.remove(&payload.block_hash()) {
            self.log_dropped(&dropped);
            debug!(id = %payload.id(), "promoted quarantined block to receiver");
        } else {
            debug!(id = %payload.id(), "promoted new block to receiver");
        }

        // The parent may already be quarantined and is trusted now.
        self.try_promote(payload.parent_hash());

        // Anything else buffered at the parent height is not the parent:
        // the true parent was just re-enqueued by hash. Clear the slot in
        // favor of fetching something useful.
        if let Some(parent_number) = payload.block_number().checked_sub(1) {
            if let Some(conflict) = self.quarantine.hash_for_number(parent_number) {
                if let Some(dropped) = self.quarantine.remove(&conflict) {
                    self.log_dropped(&dropped);
                }
            }
        }
    }

    /// Reschedule a quarantined block onto the results channel, getting it
    /// (and possibly its ancestors) promoted without recursion. Dropping
    /// the signal when the channel is full is safe: the block stays
    /// quarantined and a later trigger retries.
    fn try_promote(&mut self, hash: Hash) {
        if let Some(result) = self.quarantine.get(&hash) {
            let result = result.clone();
            if self.shared.results_tx.try_send(result).is_err() {
                debug!(%hash, "results queue full, leaving block in quarantine");
            }
        }
    }

    fn log_dropped(&self, dropped: &Dropped) {
        let payload = &dropped.result.payload;
        if self.trusted.contains(&dropped.hash) {
            debug!(id = %payload.id(), peer = %dropped.result.peer, "evicting trusted payload from quarantine");
        } else {
            // TODO: down-score the peer for serving a block that never
            // turned out to be canonical, once peer scoring lands.
            debug!(id = %payload.id(), peer = %dropped.result.peer, "evicting untrusted payload from quarantine");
            metrics::record_untrusted_eviction();
        }
    }
}

/// Long-lived sync loop for a single peer.
async fn peer_loop(shared: Arc<ClientShared>, peer: PeerId, cancel: CancellationToken) {
    info!(peer = %peer, "starting sync worker for peer");

    let mut limiter = TokenBucket::per(
        shared.cfg.peer_token_interval,
        shared.cfg.peer_token_burst,
    );

    loop {
        // Wait for the peer to be available for more work. Back-off debt
        // from an earlier failure is paid down here.
        if !limiter.acquire(1, &cancel).await {
            break;
        }

        // Once the peer is available, wait for a sync request. Only one
        // worker holds the queue at a time; the lock is released before the
        // exchange starts.
        let request = {
            let mut queue = shared.peer_requests_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = queue.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            }
        };

        if let Err(err) = do_request(&shared, peer, request.number, &cancel).await {
            // No result is coming; the in-flight record can be swept.
            request.complete.store(true, Ordering::Release);
            warn!(peer = %peer, num = request.number, error = %err, "failed sync request to peer");
            metrics::record_request_failed();
            // Count the failure as many requests to back the peer off.
            limiter.reserve(shared.cfg.failure_backoff_tokens);
        }
    }

    shared.peers.lock().remove(&peer);
    debug!(peer = %peer, "stopped sync worker for peer");
}

/// One payload-by-number exchange with a peer.
async fn do_request(
    shared: &ClientShared,
    peer: PeerId,
    number: u64,
    cancel: &CancellationToken,
) -> Result<(), RequestError> {
    let cfg = &shared.cfg;

    let mut stream = timeout(
        cfg.stream_open_timeout,
        shared.open_stream.open(peer, shared.protocol.clone()),
    )
    .await
    .map_err(|_| RequestError::Timeout("opening stream"))??;

    timeout(cfg.write_timeout, wire::write_request(&mut stream, number))
        .await
        .map_err(|_| RequestError::Timeout("writing request"))??;

    let payload = timeout(
        cfg.read_timeout,
        wire::read_response(&mut stream, cfg.max_payload_size),
    )
    .await
    .map_err(|_| RequestError::Timeout("reading response"))??;
    drop(stream);

    if payload.block_number() != number {
        return Err(RequestError::WrongBlock {
            expected: number,
            actual: payload.block_number(),
        });
    }
    if !payload.check_block_hash() {
        return Err(RequestError::BadBlockHash {
            number,
            hash: payload.block_hash(),
        });
    }

    let result = SyncResult {
        payload: Arc::new(payload),
        peer,
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(RequestError::Cancelled),
        sent = shared.results_tx.send(result) => sent.map_err(|_| RequestError::Busy),
    }
}
