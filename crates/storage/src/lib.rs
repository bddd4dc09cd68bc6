//! avidfp-storage
//!
//! Durable state for an AVID-FP storage node:
//! - `kv`: bucketed key/value store over redb (FPCCs, vote evidence, meta)
//! - `batcher`: write-coalescing batcher for vote evidence
//! - `fragments`: atomic, write-once per-(object, index) blob store
//! - `gc`: TTL-based eviction of committed objects and derived state

pub mod batcher;
pub mod fragments;
pub mod gc;
pub mod kv;

pub use batcher::Batcher;
pub use fragments::{valid_object_id, FragmentError, FragmentStore};
pub use gc::{Gc, GcError, SweepStats};
pub use kv::{KvError, MetaDb, VoteBucket};
