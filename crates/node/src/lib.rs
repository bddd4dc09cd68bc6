//! avidfp-node
//!
//! The AVID-FP storage node: the per-object Disperse/Echo/Ready/Commit
//! state machine, the tonic `Dispersal` service around it, fire-and-forget
//! gossip to peers, and node metrics.

pub mod gossip;
pub mod metrics;
pub mod service;
pub mod state;

pub use service::DispersalService;
pub use state::NodeState;
