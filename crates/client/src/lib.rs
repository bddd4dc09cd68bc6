//! avidfp-client
//!
//! Client orchestrator for the AVID-FP object store.
//!
//! Disperse: probe the cluster, erasure-code the blob, build an FPCC under
//! a fresh random seed, then offer every fragment to every peer (nodes
//! deduplicate). Retrieve: adopt the FPCC from a self-verified fragment 0,
//! collect `m` verified fragments, decode, and right-trim zero padding.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use avidfp_common::{fpcc, ErasureCodec, ErasureError, Fingerprint};
use avidfp_proto::{pb, DispersalClient};
use tonic::transport::{Channel, Endpoint};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DISPERSE_ATTEMPTS: usize = 3;
pub const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("quorum impossible: {reachable} of {total} peers reachable, need at least {required}")]
    QuorumImpossible {
        reachable: usize,
        required: usize,
        total: usize,
    },

    #[error("disperse of fragment {index} to {peer} failed after {attempts} attempts")]
    DisperseFailed {
        peer: String,
        index: u32,
        attempts: usize,
    },

    #[error("unrecoverable object: {have} verified fragments, need {need}")]
    UnrecoverableObject { have: usize, need: usize },

    #[error("erasure: {0}")]
    Erasure(#[from] ErasureError),
}

/// A client bound to one cluster and one erasure geometry.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    peers: Vec<String>,
    m: usize,
    n: usize,
}

impl ClusterClient {
    /// `peers` are `host:port` addresses; `(m, n)` must match the cluster.
    pub fn new(peers: Vec<String>, m: usize, n: usize) -> Result<Self, ClientError> {
        // validates the geometry up front
        ErasureCodec::new(m, n)?;
        let peers = peers
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Ok(ClusterClient { peers, m, n })
    }

    pub fn f(&self) -> usize {
        self.n - self.m
    }

    /// Erasure-code `blob` and disperse it across the cluster under
    /// `object_id`. Every fragment is offered to every peer; each peer's
    /// Disperse is retried up to three times with a linear backoff.
    pub async fn disperse(&self, object_id: &str, blob: &[u8]) -> Result<(), ClientError> {
        let required = 2 * self.f();
        let reachable = self.probe_peers().await;
        if reachable < required {
            return Err(ClientError::QuorumImpossible {
                reachable,
                required,
                total: self.peers.len(),
            });
        }

        let codec = ErasureCodec::new(self.m, self.n)?;
        let (fragments, original_len) = codec.encode(blob)?;
        let fp = Fingerprint::new_random();
        let checksum = fpcc::build(&fragments, &fp);
        info!(
            object = %object_id,
            bytes = original_len,
            m = self.m,
            n = self.n,
            "dispersing"
        );

        for (index, fragment) in fragments.iter().enumerate() {
            let req = pb::DisperseRequest {
                object_id: object_id.to_string(),
                fragment_index: index as u32,
                fragment: fragment.clone(),
                fpcc: Some(checksum.clone()),
            };
            let mut handles = Vec::with_capacity(self.peers.len());
            for peer in &self.peers {
                let req = req.clone();
                handles.push((peer.clone(), tokio::spawn(disperse_to_peer(peer.clone(), req))));
            }
            for (peer, handle) in handles {
                match handle.await {
                    Ok(result) => result?,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "disperse task failed");
                        return Err(ClientError::DisperseFailed {
                            peer,
                            index: index as u32,
                            attempts: DISPERSE_ATTEMPTS,
                        });
                    }
                }
            }
            info!(object = %object_id, index, total = self.n, "fragment dispersed");
        }
        Ok(())
    }

    /// Reassemble `object_id` from the cluster.
    pub async fn retrieve(&self, object_id: &str) -> Result<Vec<u8>, ClientError> {
        let codec = ErasureCodec::new(self.m, self.n)?;
        let mut pool: HashMap<String, DispersalClient<Channel>> = HashMap::new();
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.n];

        // 1) adopt the FPCC from a self-verified fragment 0
        let mut adopted: Option<pb::Fpcc> = None;
        for peer in &self.peers {
            let Some(mut client) = client_for(&mut pool, peer).await else {
                continue;
            };
            let req = pb::RetrieveRequest {
                object_id: object_id.to_string(),
                fragment_index: 0,
            };
            let resp = match client.retrieve(req).await {
                Ok(resp) => resp.into_inner(),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "retrieve rpc failed");
                    continue;
                }
            };
            if !resp.ok {
                debug!(peer = %peer, error = %resp.error, "fragment 0 unavailable");
                continue;
            }
            let Some(checksum) = resp.fpcc else { continue };
            if !fpcc::shape_ok(&checksum, self.n) {
                warn!(peer = %peer, "malformed fpcc");
                continue;
            }
            if !fpcc::verify(&checksum, 0, &resp.fragment) {
                warn!(peer = %peer, "fragment 0 failed verification");
                continue;
            }
            shards[0] = Some(resp.fragment);
            adopted = Some(checksum);
            break;
        }
        let Some(checksum) = adopted else {
            return Err(ClientError::UnrecoverableObject {
                have: 0,
                need: self.m,
            });
        };

        // 2) collect further fragments until m verified shards are held
        let mut have = 1;
        for index in 1..self.n {
            if have >= self.m {
                break;
            }
            for peer in &self.peers {
                let Some(mut client) = client_for(&mut pool, peer).await else {
                    continue;
                };
                let req = pb::RetrieveRequest {
                    object_id: object_id.to_string(),
                    fragment_index: index as u32,
                };
                let resp = match client.retrieve(req).await {
                    Ok(resp) => resp.into_inner(),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "retrieve rpc failed");
                        continue;
                    }
                };
                if !resp.ok {
                    continue;
                }
                if !fpcc::verify(&checksum, index, &resp.fragment) {
                    warn!(peer = %peer, index, "fragment failed verification, skipping");
                    continue;
                }
                shards[index] = Some(resp.fragment);
                have += 1;
                break;
            }
        }
        if have < self.m {
            return Err(ClientError::UnrecoverableObject {
                have,
                need: self.m,
            });
        }

        // 3) decode and strip the zero padding introduced by encoding
        let shard_len = shards
            .iter()
            .flatten()
            .next()
            .map(|s| s.len())
            .unwrap_or(0);
        let blob = codec.decode(shards, shard_len * self.m)?;
        Ok(trim_trailing_zeros(blob))
    }

    /// TCP-probe every peer with a short deadline; returns how many answered.
    async fn probe_peers(&self) -> usize {
        let mut reachable = 0;
        for peer in &self.peers {
            match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(peer.as_str())).await {
                Ok(Ok(_)) => reachable += 1,
                _ => warn!(peer = %peer, "peer unreachable"),
            }
        }
        reachable
    }
}

async fn disperse_to_peer(peer: String, req: pb::DisperseRequest) -> Result<(), ClientError> {
    let index = req.fragment_index;
    for attempt in 1..=DISPERSE_ATTEMPTS {
        match try_disperse(&peer, req.clone()).await {
            Ok(resp) if resp.ok => return Ok(()),
            Ok(resp) => {
                warn!(peer = %peer, index, attempt, error = %resp.error, "disperse rejected")
            }
            Err(e) => warn!(peer = %peer, index, attempt, error = %e, "disperse rpc failed"),
        }
        if attempt < DISPERSE_ATTEMPTS {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
    Err(ClientError::DisperseFailed {
        peer,
        index,
        attempts: DISPERSE_ATTEMPTS,
    })
}

async fn try_disperse(
    peer: &str,
    req: pb::DisperseRequest,
) -> Result<pb::DisperseResponse, Box<dyn std::error::Error + Send + Sync>> {
    let endpoint = Endpoint::from_shared(http_endpoint(peer))?
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(CALL_TIMEOUT);
    let mut client = DispersalClient::new(endpoint.connect().await?);
    Ok(client.disperse(req).await?.into_inner())
}

/// Lazily dial peers, caching one channel per address.
async fn client_for(
    pool: &mut HashMap<String, DispersalClient<Channel>>,
    peer: &str,
) -> Option<DispersalClient<Channel>> {
    if let Some(client) = pool.get(peer) {
        return Some(client.clone());
    }
    let endpoint = match Endpoint::from_shared(http_endpoint(peer)) {
        Ok(endpoint) => endpoint.connect_timeout(CONNECT_TIMEOUT),
        Err(e) => {
            warn!(peer = %peer, error = %e, "bad peer address");
            return None;
        }
    };
    match endpoint.connect().await {
        Ok(channel) => {
            let client = DispersalClient::new(channel);
            pool.insert(peer.to_string(), client.clone());
            Some(client)
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "dial failed");
            None
        }
    }
}

/// Prefix `http://` unless the address already carries a scheme.
fn http_endpoint(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Strip the zero padding appended by the codec. Lossy for blobs whose
/// true content ends in 0x00; the dispersal protocol carries no length.
pub fn trim_trailing_zeros(mut blob: Vec<u8>) -> Vec<u8> {
    while blob.last() == Some(&0) {
        blob.pop();
    }
    blob
}
