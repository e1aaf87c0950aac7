//! Request-response server for the payload-by-number protocol.

use crate::config::{ConfigError, ServerConfig};
use crate::error::{ChainError, RequestError};
use crate::limiter::{acquire_shared, TokenBucket};
use crate::metrics;
use crate::wire;
use async_trait::async_trait;
use libp2p::PeerId;
use lru::LruCache;
use opsync_types::ExecutionPayload;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, warn, Instrument};

/// Canonical chain queries the server answers from.
#[async_trait]
pub trait L2Chain: Send + Sync {
    /// Payload of the canonical block at `number`.
    async fn payload_by_number(&self, number: u64) -> Result<ExecutionPayload, ChainError>;
}

/// Why an inbound sync request was dropped without a response.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Admission throttling hit its ceiling.
    #[error("timed out waiting for {0} sync rate limit")]
    AdmissionExpired(&'static str),

    /// Reading the request or writing the response failed or timed out.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The requested number precedes L2 genesis.
    #[error("cannot serve block {number} before genesis")]
    BeforeGenesis { number: u64 },

    /// The requested number is beyond what the chain can have reached.
    #[error("cannot serve block {number} after max expected block {max}")]
    AboveTarget { number: u64, max: u64 },

    /// The chain configuration could not produce a target block number.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The block source failed.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Per-peer admission state: one token bucket per recently seen peer.
type PeerLimits = LruCache<PeerId, Arc<Mutex<TokenBucket>>>;

/// Serves payload-by-number requests under two-tier admission control.
///
/// A global token bucket bounds concurrent server work across all peers; a
/// per-peer bucket bounds each requester. Peers are throttled rather than
/// disconnected, until the delay grows past the configured ceiling.
///
/// The same peer may open parallel streams; each stream is one request.
pub struct ReqRespServer<C> {
    cfg: ServerConfig,
    chain: C,
    global: Mutex<TokenBucket>,
    /// Rate-limiting state of peers that request blocks from us. Bounded:
    /// peers past the capacity simply start over with a fresh bucket.
    peer_limits: Mutex<PeerLimits>,
}

impl<C: L2Chain> ReqRespServer<C> {
    pub fn new(cfg: ServerConfig, chain: C) -> Self {
        let global = Mutex::new(TokenBucket::new(cfg.global_rate, cfg.global_burst));
        let capacity =
            NonZeroUsize::new(cfg.peer_state_capacity.max(1)).expect("capacity is at least one");
        Self {
            cfg,
            chain,
            global,
            peer_limits: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Stream handler for one inbound sync request.
    ///
    /// Admission and validation failures close the stream without a
    /// response; the requester sees the close and gives up on its own
    /// deadline.
    pub async fn handle_sync_request<S>(&self, peer: PeerId, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.serve(peer, &mut stream).await {
            Ok(number) => {
                debug!(num = number, "successfully served sync response");
            }
            Err(err) => {
                debug!(peer = %peer, error = %err, "dropping sync request stream without response");
            }
        }
        let _ = stream.shutdown().await;
    }

    async fn serve<S>(&self, peer: PeerId, stream: &mut S) -> Result<u64, ServeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // Throttle the peer instead of disconnecting, unless the delay
        // grows past a threshold that is unreasonable to wait out.
        let admission_deadline = Instant::now() + self.cfg.max_throttle_delay;

        // A global token first, bounding concurrent server work between
        // different peers.
        if timeout_at(admission_deadline, acquire_shared(&self.global, 1))
            .await
            .is_err()
        {
            warn!(peer = %peer, "timed out waiting for global sync rate limit");
            metrics::record_admission_expired();
            return Err(ServeError::AdmissionExpired("global"));
        }

        // Then the peer's own token. The lock covers only the lookup.
        let bucket = {
            let mut limits = self.peer_limits.lock();
            match limits.get(&peer) {
                Some(bucket) => Some(bucket.clone()),
                None => {
                    let bucket = Arc::new(Mutex::new(TokenBucket::new(
                        self.cfg.peer_rate,
                        self.cfg.peer_burst,
                    )));
                    // Count the hit, but make it delay the peer's next
                    // request: a fresh bucket has full burst, so an instant
                    // wait here would admit every new peer for free.
                    bucket.lock().reserve(1);
                    limits.push(peer, bucket);
                    None
                }
            }
        };
        if let Some(bucket) = bucket {
            if timeout_at(admission_deadline, acquire_shared(&bucket, 1))
                .await
                .is_err()
            {
                warn!(peer = %peer, "timed out waiting for peer sync rate limit");
                metrics::record_admission_expired();
                return Err(ServeError::AdmissionExpired("peer"));
            }
        }

        let number = timeout(self.cfg.read_timeout, wire::read_request(stream))
            .await
            .map_err(|_| RequestError::Timeout("reading request"))?
            .map_err(RequestError::Transport)?;

        // Range-validate before touching the block source.
        if number < self.cfg.rollup.genesis_number {
            warn!(num = number, "cannot serve request for block before genesis");
            metrics::record_request_rejected();
            return Err(ServeError::BeforeGenesis { number });
        }
        let max = self.cfg.rollup.target_block_number(unix_now())?;
        if number > max {
            warn!(num = number, max, "cannot serve request for block after max expected block");
            metrics::record_request_rejected();
            return Err(ServeError::AboveTarget { number, max });
        }

        let payload = match self.chain.payload_by_number(number).await {
            Ok(payload) => payload,
            Err(ChainError::NotFound) => {
                warn!(num = number, "peer requested unknown block by number");
                return Err(ChainError::NotFound.into());
            }
            Err(err) => {
                error!(num = number, error = %err, "failed to retrieve payload to serve to peer");
                return Err(err.into());
            }
        };

        timeout(
            self.cfg.write_timeout,
            wire::write_response(stream, &payload),
        )
        .await
        .map_err(|_| RequestError::Timeout("writing response"))??;

        metrics::record_payload_served();
        Ok(number)
    }
}

/// Run a stream handler inside its own task, isolating panics, enriching
/// logs with the remote peer, and dropping (closing) the stream on every
/// exit path. This is the only place recovery from unexpected faults
/// happens.
pub async fn serve_stream<S, H, Fut>(peer: PeerId, stream: S, handler: H)
where
    S: Send + 'static,
    H: FnOnce(PeerId, S) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let span = tracing::info_span!("sync_stream", peer = %peer);
    let task = tokio::spawn(handler(peer, stream).instrument(span));
    if let Err(err) = task.await {
        if err.is_panic() {
            error!(peer = %peer, "panic while handling sync request stream");
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RollupConfig;
    use opsync_types::Hash;
    use std::collections::HashMap;

    fn rollup() -> RollupConfig {
        RollupConfig {
            l2_chain_id: 901,
            genesis_number: 5,
            genesis_time: 0,
            block_time: 1,
        }
    }

    struct MapChain {
        blocks: HashMap<u64, ExecutionPayload>,
    }

    impl MapChain {
        fn with_blocks(numbers: impl IntoIterator<Item = u64>) -> Self {
            let blocks = numbers
                .into_iter()
                .map(|n| {
                    let payload = ExecutionPayload::new(
                        Hash::from_bytes(&n.to_le_bytes()),
                        n,
                        n,
                        Hash::from_bytes(b"state"),
                        vec![],
                    );
                    (n, payload)
                })
                .collect();
            Self { blocks }
        }
    }

    #[async_trait]
    impl L2Chain for MapChain {
        async fn payload_by_number(&self, number: u64) -> Result<ExecutionPayload, ChainError> {
            self.blocks.get(&number).cloned().ok_or(ChainError::NotFound)
        }
    }

    fn server() -> ReqRespServer<MapChain> {
        ReqRespServer::new(
            ServerConfig::for_testing(rollup()),
            MapChain::with_blocks(5..20),
        )
    }

    async fn request(
        srv: &ReqRespServer<MapChain>,
        peer: PeerId,
        number: u64,
    ) -> Result<ExecutionPayload, RequestError> {
        let (mut client, mut remote) = tokio::io::duplex(1 << 16);
        let serve = srv.handle_sync_request(peer, &mut remote);
        let exchange = async {
            wire::write_request(&mut client, number).await?;
            wire::read_response(&mut client, 1 << 20).await
        };
        let (_, response) = tokio::join!(serve, exchange);
        response
    }

    #[tokio::test]
    async fn serves_known_block() {
        let srv = server();
        let payload = request(&srv, PeerId::random(), 7).await.unwrap();
        assert_eq!(payload.block_number(), 7);
        assert!(payload.check_block_hash());
    }

    #[tokio::test]
    async fn rejects_block_before_genesis() {
        let srv = server();
        let err = request(&srv, PeerId::random(), 4).await.unwrap_err();
        // Stream closed with no bytes written.
        assert!(matches!(err, RequestError::Transport(_)));
    }

    #[tokio::test]
    async fn rejects_block_beyond_target() {
        let srv = ReqRespServer::new(
            ServerConfig::for_testing(RollupConfig {
                l2_chain_id: 901,
                genesis_number: 5,
                genesis_time: 0,
                // One block per ~136 years: the target stays at genesis.
                block_time: u64::MAX,
            }),
            MapChain::with_blocks(5..20),
        );
        let err = request(&srv, PeerId::random(), 19).await.unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
    }

    #[tokio::test]
    async fn closes_stream_for_unknown_block() {
        let srv = server();
        let err = request(&srv, PeerId::random(), 25_000).await.unwrap_err();
        assert!(matches!(err, RequestError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn per_peer_limit_throttles_fourth_request() {
        // Wide-open global limit isolates the per-peer bucket.
        let srv = ReqRespServer::new(
            ServerConfig::for_testing(rollup()).with_global_limit(1_000.0, 1_000),
            MapChain::with_blocks(5..20),
        );
        let peer = PeerId::random();

        // First contact reserves a token; two more drain the burst.
        let start = Instant::now();
        for _ in 0..3 {
            request(&srv, peer, 7).await.unwrap();
        }
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);

        // The fourth request waits for the refill.
        request(&srv, peer, 7).await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(240));
    }

    #[tokio::test(start_paused = true)]
    async fn known_peer_waits_past_its_burst() {
        let srv = ReqRespServer::new(
            ServerConfig::for_testing(rollup()).with_global_limit(1_000.0, 1_000),
            MapChain::with_blocks(5..20),
        );
        let peer = PeerId::random();
        request(&srv, peer, 7).await.unwrap();

        // Let the bucket refill to a full burst again.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        let start = Instant::now();
        for _ in 0..3 {
            request(&srv, peer, 7).await.unwrap();
        }
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
        request(&srv, peer, 7).await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(240));
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_spreads_a_burst_of_strangers() {
        let srv = Arc::new(ReqRespServer::new(
            ServerConfig::for_testing(rollup()),
            MapChain::with_blocks(5..20),
        ));

        // Five requests from one unknown peer, fired at once: two admitted
        // on the global burst, the rest spaced by the 3/s refill.
        let peer = PeerId::random();
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let srv = srv.clone();
            handles.push(tokio::spawn(async move {
                request(&srv, peer, 7).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(990));
        assert!(elapsed < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stream_handler_isolates_panics() {
        let peer = PeerId::random();
        let (_client, remote) = tokio::io::duplex(64);
        serve_stream(peer, remote, |_, _stream| async move {
            panic!("handler exploded");
        })
        .await;
        // Reaching here is the assertion: the panic did not unwind into us.
    }
}
