//! Write-coalescing batcher for vote evidence.
//!
//! Each vote bucket gets one batcher task that buffers incoming
//! `"<object>|<peer>"` keys and writes them in a single transaction once
//! 100 entries accumulate or 250 ms elapse, whichever comes first. Losing
//! an unflushed batch is tolerated: evidence is advisory and the sending
//! peer's next retry reinstates it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::kv::{MetaDb, VoteBucket};

const MAX_BATCH: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const QUEUE_DEPTH: usize = 1024;

enum Msg {
    Put(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to a batcher task. Cheap to clone; all clones feed one buffer.
#[derive(Clone)]
pub struct Batcher {
    tx: mpsc::Sender<Msg>,
    bucket: VoteBucket,
}

impl Batcher {
    /// Spawn the flush task for `bucket`.
    pub fn spawn(db: Arc<MetaDb>, bucket: VoteBucket) -> Batcher {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(flush_loop(db, bucket, rx));
        Batcher { tx, bucket }
    }

    /// Enqueue one piece of evidence. Non-blocking: a full queue drops the
    /// put rather than stalling an RPC handler on a slow disk.
    pub fn put(&self, object: &str, peer: &str) {
        let msg = Msg::Put(format!("{object}|{peer}"));
        if self.tx.try_send(msg).is_err() {
            warn!(bucket = self.bucket.name(), "evidence queue full, dropping put");
        }
    }

    /// Flush everything buffered so far and wait for the write to land.
    /// Used on shutdown.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Msg::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

async fn flush_loop(db: Arc<MetaDb>, bucket: VoteBucket, mut rx: mpsc::Receiver<Msg>) {
    let mut buf: Vec<String> = Vec::with_capacity(MAX_BATCH);
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Msg::Put(key)) => {
                    buf.push(key);
                    if buf.len() >= MAX_BATCH {
                        flush(&db, bucket, &mut buf);
                    }
                }
                Some(Msg::Flush(ack)) => {
                    flush(&db, bucket, &mut buf);
                    let _ = ack.send(());
                }
                None => {
                    flush(&db, bucket, &mut buf);
                    break;
                }
            },
            _ = tick.tick() => flush(&db, bucket, &mut buf),
        }
    }
}

fn flush(db: &MetaDb, bucket: VoteBucket, buf: &mut Vec<String>) {
    if buf.is_empty() {
        return;
    }
    if let Err(e) = db.record_vote_keys(bucket, buf) {
        warn!(bucket = bucket.name(), error = %e, "evidence flush failed, dropping batch");
    }
    buf.clear();
}
