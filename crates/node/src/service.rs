//! The tonic `Dispersal` service.
//!
//! Domain failures (mismatched FPCC, bad integrity, storage trouble) are
//! reported in-band as `ok = false` with an error string; transport-level
//! `Status` errors are reserved for the framework. A Disperse call parks
//! on the object's commit signal and answers `ok` only after this node has
//! observed `2f + 1` distinct Ready senders, or times out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prost::Message;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use avidfp_common::fpcc::{self, FpccFault};
use avidfp_proto::{pb, Dispersal};
use avidfp_storage::kv::unix_millis_now;
use avidfp_storage::{valid_object_id, Batcher, FragmentStore, KvError, MetaDb, VoteBucket};

use crate::gossip::Gossip;
use crate::metrics::NodeMetrics;
use crate::state::{DisperseAdmit, NodeState};

pub const DEFAULT_DISPERSE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct DispersalService {
    state: Arc<NodeState>,
    kv: Arc<MetaDb>,
    fragments: Arc<FragmentStore>,
    echo_batcher: Batcher,
    ready_batcher: Batcher,
    gossip: Gossip,
    metrics: Arc<NodeMetrics>,
    disperse_timeout: Duration,
}

impl DispersalService {
    /// Build the service and spawn its evidence batchers.
    pub fn new(
        state: Arc<NodeState>,
        kv: Arc<MetaDb>,
        fragments: Arc<FragmentStore>,
        gossip: Gossip,
        metrics: Arc<NodeMetrics>,
        disperse_timeout: Duration,
    ) -> Self {
        let echo_batcher = Batcher::spawn(kv.clone(), VoteBucket::Echo);
        let ready_batcher = Batcher::spawn(kv.clone(), VoteBucket::Ready);
        DispersalService {
            state,
            kv,
            fragments,
            echo_batcher,
            ready_batcher,
            gossip,
            metrics,
            disperse_timeout,
        }
    }

    /// Flush buffered vote evidence to disk. Called on shutdown.
    pub async fn flush_evidence(&self) {
        self.echo_batcher.flush().await;
        self.ready_batcher.flush().await;
    }

    async fn handle_disperse(&self, req: pb::DisperseRequest) -> pb::DisperseResponse {
        let fail = |error: &str| pb::DisperseResponse {
            ok: false,
            error: error.to_string(),
        };

        info!(
            object = %req.object_id,
            index = req.fragment_index,
            bytes = req.fragment.len(),
            "disperse"
        );

        if !valid_object_id(&req.object_id) {
            return fail("invalid object id");
        }
        let Some(fpcc) = req.fpcc else {
            return fail("missing fpcc");
        };
        let n = self.state.total();
        if !fpcc::shape_ok(&fpcc, n) {
            return fail("malformed fpcc");
        }
        if req.fragment_index as usize >= n {
            return fail("fragment index out of range");
        }

        let admit = self
            .state
            .begin_disperse(&req.object_id, &fpcc, unix_millis_now());
        let (mut commit_rx, newly_pinned, created_at_ms) = match admit {
            DisperseAdmit::FpccMismatch => return fail("FPCC mismatch"),
            DisperseAdmit::Admitted {
                commit_rx,
                newly_pinned,
                created_at_ms,
            } => (commit_rx, newly_pinned, created_at_ms),
        };

        if newly_pinned {
            if let Err(e) = self.pin_object_meta(&req.object_id, &fpcc, created_at_ms) {
                warn!(object = %req.object_id, error = %e, "metadata write failed");
                return fail("metadata write");
            }
            // our own Echo, counted at admit time, persists like any other
            self.echo_batcher.put(&req.object_id, self.state.self_id());
        }

        match fpcc::check(&fpcc, req.fragment_index as usize, &req.fragment) {
            Ok(()) => {}
            Err(FpccFault::HashMismatch) => return fail("hash mismatch"),
            Err(FpccFault::FingerprintMismatch) => return fail("fingerprint mismatch"),
            Err(FpccFault::IndexOutOfRange { .. }) => return fail("fragment index out of range"),
        }

        if let Err(e) = self
            .fragments
            .put(&req.object_id, req.fragment_index, &req.fragment)
        {
            warn!(object = %req.object_id, error = %e, "fragment write failed");
            return fail("fragment write");
        }

        self.gossip.broadcast_echo(req.object_id.clone(), fpcc);

        let result = match tokio::time::timeout(self.disperse_timeout, commit_rx.wait_for(|c| *c))
            .await
        {
            Ok(Ok(_)) => {
                debug!(object = %req.object_id, "commit observed");
                pb::DisperseResponse {
                    ok: true,
                    error: String::new(),
                }
            }
            // commit channel closed: the object was torn down mid-wait
            Ok(Err(_)) => fail("object state torn down"),
            Err(_) => fail("timeout waiting for readies"),
        };
        result
    }

    fn pin_object_meta(
        &self,
        object: &str,
        fpcc: &pb::Fpcc,
        created_at_ms: u64,
    ) -> Result<(), KvError> {
        self.kv.pin_fpcc(object, &fpcc.encode_to_vec())?;
        self.kv.record_created_at(object, created_at_ms)?;
        Ok(())
    }

    /// The pinned FPCC: from memory first, falling back to the KV for
    /// objects not yet warmed up.
    fn pinned_fpcc(&self, object: &str) -> Option<pb::Fpcc> {
        if let Some(fpcc) = self.state.fpcc(object) {
            return Some(fpcc);
        }
        match self.kv.fpcc(object) {
            Ok(Some(bytes)) => pb::Fpcc::decode(bytes.as_slice()).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(object = %object, error = %e, "fpcc read failed");
                None
            }
        }
    }
}

/// Resolve the voting identity of a gossip sender: the declared cluster
/// identity when present, otherwise the transport remote address.
fn sender_identity(declared: &str, remote: Option<std::net::SocketAddr>) -> String {
    if declared.is_empty() {
        remote.map(|addr| addr.to_string()).unwrap_or_default()
    } else {
        declared.to_string()
    }
}

#[tonic::async_trait]
impl Dispersal for DispersalService {
    async fn disperse(
        &self,
        request: Request<pb::DisperseRequest>,
    ) -> Result<Response<pb::DisperseResponse>, Status> {
        let started = Instant::now();
        let reply = self.handle_disperse(request.into_inner()).await;
        self.metrics.record_disperse(started.elapsed());
        Ok(Response::new(reply))
    }

    async fn echo(
        &self,
        request: Request<pb::EchoRequest>,
    ) -> Result<Response<pb::EchoResponse>, Status> {
        self.metrics.record_echo();
        let remote = request.remote_addr();
        let req = request.into_inner();
        if !valid_object_id(&req.object_id) {
            return Ok(Response::new(pb::EchoResponse {
                ok: false,
                error: "invalid object id".to_string(),
            }));
        }
        let sender = sender_identity(&req.sender, remote);
        debug!(object = %req.object_id, peer = %sender, "echo");

        let broadcast = self
            .state
            .record_echo(&req.object_id, &sender, unix_millis_now());
        if broadcast {
            if let Some(fpcc) = req.fpcc {
                self.gossip.broadcast_ready(req.object_id.clone(), fpcc);
            }
        }
        self.echo_batcher.put(&req.object_id, &sender);

        Ok(Response::new(pb::EchoResponse {
            ok: true,
            error: String::new(),
        }))
    }

    async fn ready(
        &self,
        request: Request<pb::ReadyRequest>,
    ) -> Result<Response<pb::ReadyResponse>, Status> {
        self.metrics.record_ready();
        let remote = request.remote_addr();
        let req = request.into_inner();
        if !valid_object_id(&req.object_id) {
            return Ok(Response::new(pb::ReadyResponse {
                ok: false,
                error: "invalid object id".to_string(),
            }));
        }
        let sender = sender_identity(&req.sender, remote);
        debug!(object = %req.object_id, peer = %sender, "ready");

        let outcome = self
            .state
            .record_ready(&req.object_id, &sender, unix_millis_now());
        if outcome.broadcast_ready {
            if let Some(fpcc) = req.fpcc {
                self.gossip.broadcast_ready(req.object_id.clone(), fpcc);
            }
        }
        if outcome.committed_now {
            info!(object = %req.object_id, "object committed");
            self.metrics.record_commit();
        }
        self.ready_batcher.put(&req.object_id, &sender);

        Ok(Response::new(pb::ReadyResponse {
            ok: true,
            error: String::new(),
        }))
    }

    async fn retrieve(
        &self,
        request: Request<pb::RetrieveRequest>,
    ) -> Result<Response<pb::RetrieveResponse>, Status> {
        let started = Instant::now();
        let req = request.into_inner();
        let fail = |error: &str| pb::RetrieveResponse {
            ok: false,
            error: error.to_string(),
            fragment: Vec::new(),
            fragment_index: req.fragment_index,
            fpcc: None,
        };

        let reply = if !valid_object_id(&req.object_id) {
            fail("invalid object id")
        } else {
            match self.fragments.get(&req.object_id, req.fragment_index) {
                Err(e) => {
                    warn!(object = %req.object_id, error = %e, "fragment read failed");
                    fail("fragment read")
                }
                Ok(None) => fail("fragment missing"),
                Ok(Some(fragment)) => match self.pinned_fpcc(&req.object_id) {
                    None => fail("fpcc missing"),
                    Some(fpcc) => pb::RetrieveResponse {
                        ok: true,
                        error: String::new(),
                        fragment,
                        fragment_index: req.fragment_index,
                        fpcc: Some(fpcc),
                    },
                },
            }
        };
        self.metrics.record_retrieve(started.elapsed());
        Ok(Response::new(reply))
    }
}

/// Rebuild in-memory dispersal state from the durable KV after a restart.
/// Fragments on disk are discovered lazily by Retrieve.
pub fn warm_up(state: &NodeState, kv: &MetaDb) -> Result<(), KvError> {
    let now_ms = unix_millis_now();
    for (object, bytes) in kv.fpcc_entries()? {
        match pb::Fpcc::decode(bytes.as_slice()) {
            Ok(fpcc) => state.restore_fpcc(&object, fpcc, now_ms),
            Err(e) => warn!(object = %object, error = %e, "undecodable fpcc in kv, skipping"),
        }
    }
    for (object, peer) in kv.vote_entries(VoteBucket::Echo)? {
        state.restore_echo(&object, &peer, now_ms);
    }
    for (object, peer) in kv.vote_entries(VoteBucket::Ready)? {
        state.restore_ready(&object, &peer, now_ms);
    }
    for (object, created_at) in kv.meta_entries()? {
        state.restore_created_at(&object, created_at);
    }
    state.recompute_commits();
    Ok(())
}
