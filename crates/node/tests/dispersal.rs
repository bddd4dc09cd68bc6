//! Integration tests for the dispersal service.
//!
//! The service is driven directly through the `Dispersal` trait, with
//! durable state on temp directories and an empty gossip peer list, so
//! every scenario is deterministic:
//!
//! 1. Disperse answers ok once the Ready quorum is observed
//! 2. Disperse times out without a quorum, but the fragment persists
//! 3. Equivocating FPCCs are rejected and the pin survives
//! 4. Corrupted fragments never reach disk
//! 5. Evidence flushes to the KV and a restarted node resumes committed

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tonic::Request;

use avidfp_common::{fpcc, ErasureCodec, Fingerprint};
use avidfp_node::gossip::Gossip;
use avidfp_node::metrics::NodeMetrics;
use avidfp_node::service::{warm_up, DispersalService};
use avidfp_node::state::NodeState;
use avidfp_proto::{pb, Dispersal};
use avidfp_storage::{FragmentStore, MetaDb, VoteBucket};

const M: usize = 3;
const N: usize = 5;

struct TestHarness {
    service: DispersalService,
    state: Arc<NodeState>,
    kv: Arc<MetaDb>,
    fragments: Arc<FragmentStore>,
    _dir: TempDir,
}

fn harness(disperse_timeout: Duration) -> TestHarness {
    let dir = TempDir::new().expect("tmpdir");
    let kv = Arc::new(MetaDb::open(dir.path().join("meta.redb")).expect("kv"));
    let fragments = Arc::new(FragmentStore::new(dir.path().join("data")).expect("fragments"));
    let state = Arc::new(NodeState::new("self:1", M, N));
    // no peers: gossip broadcasts are no-ops
    let gossip = Gossip::new(Vec::new(), "self:1");
    let service = DispersalService::new(
        state.clone(),
        kv.clone(),
        fragments.clone(),
        gossip,
        Arc::new(NodeMetrics::new()),
        disperse_timeout,
    );
    TestHarness {
        service,
        state,
        kv,
        fragments,
        _dir: dir,
    }
}

fn encode_object(blob: &[u8], seed: u64) -> (Vec<Vec<u8>>, pb::Fpcc) {
    let codec = ErasureCodec::new(M, N).expect("codec");
    let (fragments, _) = codec.encode(blob).expect("encode");
    let fpcc = fpcc::build(&fragments, &Fingerprint::new_seeded(seed));
    (fragments, fpcc)
}

fn disperse_req(object: &str, index: u32, fragment: Vec<u8>, fpcc: &pb::Fpcc) -> pb::DisperseRequest {
    pb::DisperseRequest {
        object_id: object.to_string(),
        fragment_index: index,
        fragment,
        fpcc: Some(fpcc.clone()),
    }
}

fn ready_req(object: &str, sender: &str, fpcc: &pb::Fpcc) -> pb::ReadyRequest {
    pb::ReadyRequest {
        object_id: object.to_string(),
        fpcc: Some(fpcc.clone()),
        sender: sender.to_string(),
    }
}

fn echo_req(object: &str, sender: &str, fpcc: &pb::Fpcc) -> pb::EchoRequest {
    pb::EchoRequest {
        object_id: object.to_string(),
        fpcc: Some(fpcc.clone()),
        sender: sender.to_string(),
    }
}

#[tokio::test]
async fn test_disperse_ok_after_ready_quorum() {
    let h = harness(Duration::from_secs(5));
    let (fragments, fpcc) = encode_object(b"The quick brown fox jumps over the lazy dog", 31);

    // ready threshold is 2f + 1 = 5 for (3, 5)
    for peer in ["p1:1", "p2:1", "p3:1", "p4:1", "p5:1"] {
        let resp = h
            .service
            .ready(Request::new(ready_req("obj", peer, &fpcc)))
            .await
            .expect("rpc")
            .into_inner();
        assert!(resp.ok);
    }
    assert!(h.state.is_committed("obj"));

    let resp = h
        .service
        .disperse(Request::new(disperse_req("obj", 0, fragments[0].clone(), &fpcc)))
        .await
        .expect("rpc")
        .into_inner();
    assert!(resp.ok, "disperse failed: {}", resp.error);

    // retrieve hands back the fragment and the pinned FPCC
    let resp = h
        .service
        .retrieve(Request::new(pb::RetrieveRequest {
            object_id: "obj".to_string(),
            fragment_index: 0,
        }))
        .await
        .expect("rpc")
        .into_inner();
    assert!(resp.ok);
    assert_eq!(resp.fragment, fragments[0]);
    assert_eq!(resp.fpcc, Some(fpcc));
}

#[tokio::test]
async fn test_disperse_times_out_without_quorum() {
    let h = harness(Duration::from_millis(100));
    let (fragments, fpcc) = encode_object(b"payload without a quorum", 37);

    let resp = h
        .service
        .disperse(Request::new(disperse_req("obj", 1, fragments[1].clone(), &fpcc)))
        .await
        .expect("rpc")
        .into_inner();
    assert!(!resp.ok);
    assert!(resp.error.contains("timeout"), "error: {}", resp.error);

    // the fragment and pinned FPCC were persisted regardless
    assert_eq!(
        h.fragments.get("obj", 1).expect("get").unwrap(),
        fragments[1]
    );
    assert!(h.kv.fpcc("obj").expect("get").is_some());
    assert!(h.kv.created_at("obj").expect("get").is_some());
    assert!(!h.state.is_committed("obj"));
}

#[tokio::test]
async fn test_equivocating_fpcc_rejected() {
    let h = harness(Duration::from_millis(100));
    let (fragments, fpcc_x) = encode_object(b"the honest object bytes", 41);
    let (_, fpcc_y) = encode_object(b"an equivocating object!", 43);

    let resp = h
        .service
        .disperse(Request::new(disperse_req("obj", 0, fragments[0].clone(), &fpcc_x)))
        .await
        .expect("rpc")
        .into_inner();
    assert!(resp.error.contains("timeout"), "error: {}", resp.error);

    let resp = h
        .service
        .disperse(Request::new(disperse_req("obj", 0, fragments[0].clone(), &fpcc_y)))
        .await
        .expect("rpc")
        .into_inner();
    assert!(!resp.ok);
    assert_eq!(resp.error, "FPCC mismatch");

    // the node still carries X
    assert_eq!(h.state.fpcc("obj"), Some(fpcc_x));
}

#[tokio::test]
async fn test_corrupted_fragment_rejected() {
    let h = harness(Duration::from_millis(100));
    let (fragments, fpcc) = encode_object(b"integrity matters most here", 47);

    let mut corrupted = fragments[2].clone();
    corrupted[0] ^= 0x80;
    let resp = h
        .service
        .disperse(Request::new(disperse_req("obj", 2, corrupted, &fpcc)))
        .await
        .expect("rpc")
        .into_inner();
    assert!(!resp.ok);
    assert_eq!(resp.error, "hash mismatch");

    // nothing was written for that index
    assert!(h.fragments.get("obj", 2).expect("get").is_none());

    // a fragment presented under the wrong index also fails
    let resp = h
        .service
        .disperse(Request::new(disperse_req("obj", 3, fragments[2].clone(), &fpcc)))
        .await
        .expect("rpc")
        .into_inner();
    assert!(!resp.ok);
    assert_eq!(resp.error, "hash mismatch");
}

#[tokio::test]
async fn test_retrieve_missing_fragment() {
    let h = harness(Duration::from_millis(100));
    let resp = h
        .service
        .retrieve(Request::new(pb::RetrieveRequest {
            object_id: "never-dispersed".to_string(),
            fragment_index: 0,
        }))
        .await
        .expect("rpc")
        .into_inner();
    assert!(!resp.ok);
    assert_eq!(resp.error, "fragment missing");
}

#[tokio::test]
async fn test_echo_quorum_flips_ready_sent() {
    let h = harness(Duration::from_millis(100));
    let (_, fpcc) = encode_object(b"echo accounting", 53);

    // echo threshold is m + f = n = 5
    for peer in ["p1:1", "p2:1", "p3:1", "p4:1", "p5:1"] {
        let resp = h
            .service
            .echo(Request::new(echo_req("obj", peer, &fpcc)))
            .await
            .expect("rpc")
            .into_inner();
        assert!(resp.ok);
    }
    assert_eq!(h.state.echo_count("obj"), 5);

    // duplicates are counted once
    let _ = h
        .service
        .echo(Request::new(echo_req("obj", "p1:1", &fpcc)))
        .await
        .expect("rpc");
    assert_eq!(h.state.echo_count("obj"), 5);
}

#[tokio::test]
async fn test_evidence_survives_restart_and_commit_resumes() {
    let dir;
    let (fragments, fpcc) = encode_object(b"a restartable dispersal", 59);
    {
        let h = harness(Duration::from_millis(100));

        let _ = h
            .service
            .disperse(Request::new(disperse_req(
                "obj",
                0,
                fragments[0].clone(),
                &fpcc,
            )))
            .await
            .expect("rpc");
        for peer in ["p1:1", "p2:1", "p3:1", "p4:1", "p5:1"] {
            let _ = h
                .service
                .ready(Request::new(ready_req("obj", peer, &fpcc)))
                .await
                .expect("rpc");
            let _ = h
                .service
                .echo(Request::new(echo_req("obj", peer, &fpcc)))
                .await
                .expect("rpc");
        }
        h.service.flush_evidence().await;

        let ready = h.kv.vote_entries(VoteBucket::Ready).expect("entries");
        assert_eq!(ready.len(), 5);
        let echo = h.kv.vote_entries(VoteBucket::Echo).expect("entries");
        // five peers plus our own echo recorded at disperse
        assert_eq!(echo.len(), 6);
        dir = h._dir;
    }

    // "restart": fresh state warmed up from the same KV
    let kv = Arc::new(MetaDb::open(dir.path().join("meta.redb")).expect("kv"));
    let state = NodeState::new("self:1", M, N);
    warm_up(&state, &kv).expect("warm up");

    assert_eq!(state.ready_count("obj"), 5);
    assert_eq!(state.echo_count("obj"), 6);
    assert!(state.is_committed("obj"));
    assert_eq!(state.fpcc("obj"), Some(fpcc));
}
