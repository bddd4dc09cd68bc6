//! Per-object dispersal state machine.
//!
//! Each object accumulates Echo and Ready votes, deduplicated by sender
//! identity, under one node-wide lock (the critical section is a set
//! insert). Thresholds for `f = n - m`:
//!
//! - Echo threshold `m + f`: first crossing flips `ready_sent` and the
//!   caller broadcasts Ready.
//! - Amplification threshold `f + 1` Readies: a node that has not yet sent
//!   Ready does so now. Required for liveness when faulty peers suppress
//!   Echos.
//! - Commit threshold `2f + 1` Readies: the commit signal fires once;
//!   every present and future Disperse waiter proceeds.
//!
//! The commit signal is a `watch` channel: edge-triggered, idempotent,
//! observable by any number of waiters.

use std::collections::{HashMap, HashSet};

use avidfp_proto::Fpcc;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Outcome of admitting a Disperse for an object.
pub enum DisperseAdmit {
    Admitted {
        /// Receiver for the commit signal; resolves immediately if the
        /// object already committed.
        commit_rx: watch::Receiver<bool>,
        /// True when this call pinned the FPCC (first Disperse).
        newly_pinned: bool,
        /// Lifecycle anchor recorded at object creation.
        created_at_ms: u64,
    },
    /// The object is pinned to a different FPCC.
    FpccMismatch,
}

/// What the caller must do after recording a Ready vote.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadyOutcome {
    /// Amplification fired: broadcast our own Ready.
    pub broadcast_ready: bool,
    /// The commit threshold was crossed by this vote.
    pub committed_now: bool,
}

struct ObjectState {
    fpcc: Option<Fpcc>,
    echo_senders: HashSet<String>,
    ready_senders: HashSet<String>,
    ready_sent: bool,
    committed: bool,
    commit_tx: watch::Sender<bool>,
    created_at_ms: u64,
}

impl ObjectState {
    fn new(created_at_ms: u64) -> Self {
        let (commit_tx, _) = watch::channel(false);
        ObjectState {
            fpcc: None,
            echo_senders: HashSet::new(),
            ready_senders: HashSet::new(),
            ready_sent: false,
            committed: false,
            commit_tx,
            created_at_ms,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
        self.commit_tx.send_replace(true);
    }
}

/// All per-object dispersal state of one node.
pub struct NodeState {
    self_id: String,
    m: usize,
    n: usize,
    objects: Mutex<HashMap<String, ObjectState>>,
}

impl NodeState {
    pub fn new(self_id: impl Into<String>, m: usize, n: usize) -> Self {
        NodeState {
            self_id: self_id.into(),
            m,
            n,
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn total(&self) -> usize {
        self.n
    }

    pub fn f(&self) -> usize {
        self.n - self.m
    }

    pub fn echo_threshold(&self) -> usize {
        self.m + self.f()
    }

    pub fn ready_threshold(&self) -> usize {
        2 * self.f() + 1
    }

    pub fn amplify_threshold(&self) -> usize {
        self.f() + 1
    }

    /// Admit a Disperse: create the object record on first contact, pin
    /// the FPCC, and count our own Echo. Later calls either match the
    /// pinned FPCC or are rejected.
    pub fn begin_disperse(&self, object: &str, fpcc: &Fpcc, now_ms: u64) -> DisperseAdmit {
        let mut objects = self.objects.lock();
        let entry = objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(now_ms));

        let newly_pinned = match &entry.fpcc {
            Some(pinned) => {
                if pinned != fpcc {
                    return DisperseAdmit::FpccMismatch;
                }
                false
            }
            None => true,
        };
        if newly_pinned {
            entry.fpcc = Some(fpcc.clone());
            entry.echo_senders.insert(self.self_id.clone());
        }
        DisperseAdmit::Admitted {
            commit_rx: entry.commit_tx.subscribe(),
            newly_pinned,
            created_at_ms: entry.created_at_ms,
        }
    }

    /// Record an Echo vote from `peer`. Returns true when the vote first
    /// crosses the Echo threshold: the caller broadcasts Ready.
    pub fn record_echo(&self, object: &str, peer: &str, now_ms: u64) -> bool {
        let mut objects = self.objects.lock();
        let entry = objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(now_ms));
        entry.echo_senders.insert(peer.to_string());
        if entry.echo_senders.len() >= self.echo_threshold() && !entry.ready_sent {
            entry.ready_sent = true;
            return true;
        }
        false
    }

    /// Record a Ready vote from `peer`.
    pub fn record_ready(&self, object: &str, peer: &str, now_ms: u64) -> ReadyOutcome {
        let mut objects = self.objects.lock();
        let entry = objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(now_ms));
        entry.ready_senders.insert(peer.to_string());

        let mut outcome = ReadyOutcome::default();
        if entry.ready_senders.len() >= self.amplify_threshold() && !entry.ready_sent {
            entry.ready_sent = true;
            outcome.broadcast_ready = true;
        }
        if entry.ready_senders.len() >= self.ready_threshold() && !entry.committed {
            entry.commit();
            outcome.committed_now = true;
        }
        outcome
    }

    /// The pinned FPCC for `object`, if any.
    pub fn fpcc(&self, object: &str) -> Option<Fpcc> {
        self.objects
            .lock()
            .get(object)
            .and_then(|entry| entry.fpcc.clone())
    }

    pub fn is_committed(&self, object: &str) -> bool {
        self.objects
            .lock()
            .get(object)
            .map(|entry| entry.committed)
            .unwrap_or(false)
    }

    pub fn echo_count(&self, object: &str) -> usize {
        self.objects
            .lock()
            .get(object)
            .map(|entry| entry.echo_senders.len())
            .unwrap_or(0)
    }

    pub fn ready_count(&self, object: &str) -> usize {
        self.objects
            .lock()
            .get(object)
            .map(|entry| entry.ready_senders.len())
            .unwrap_or(0)
    }

    /// Forget an object entirely (GC hook). Pending Disperse waiters see
    /// the commit channel close and give up.
    pub fn drop_object(&self, object: &str) {
        self.objects.lock().remove(object);
    }

    // ─── Startup warm-up from the durable KV ────────────────────────────

    /// Re-pin an FPCC loaded from the `fpccs` bucket.
    pub fn restore_fpcc(&self, object: &str, fpcc: Fpcc, now_ms: u64) {
        let mut objects = self.objects.lock();
        let entry = objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(now_ms));
        if entry.fpcc.is_none() {
            entry.fpcc = Some(fpcc);
        }
    }

    /// Re-count an Echo vote loaded from evidence, with no side effects.
    pub fn restore_echo(&self, object: &str, peer: &str, now_ms: u64) {
        let mut objects = self.objects.lock();
        objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(now_ms))
            .echo_senders
            .insert(peer.to_string());
    }

    /// Re-count a Ready vote loaded from evidence, with no side effects.
    pub fn restore_ready(&self, object: &str, peer: &str, now_ms: u64) {
        let mut objects = self.objects.lock();
        objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(now_ms))
            .ready_senders
            .insert(peer.to_string());
    }

    /// Overwrite the lifecycle anchor with the persisted one.
    pub fn restore_created_at(&self, object: &str, created_at_ms: u64) {
        let mut objects = self.objects.lock();
        objects
            .entry(object.to_string())
            .or_insert_with(|| ObjectState::new(created_at_ms))
            .created_at_ms = created_at_ms;
    }

    /// After warm-up, fire the commit signal for every object whose
    /// restored Ready votes already meet the threshold.
    pub fn recompute_commits(&self) {
        let threshold = self.ready_threshold();
        let mut objects = self.objects.lock();
        for entry in objects.values_mut() {
            if entry.ready_senders.len() >= threshold && !entry.committed {
                entry.commit();
            }
        }
    }
}
