//! avidfp-proto
//!
//! Wire contract for the AVID-FP dispersal protocol: the `Dispersal`
//! service (Disperse, Echo, Ready, Retrieve) and its message types.
//! The schema lives in `proto/dispersal.proto`; everything else in this
//! crate is generated by `tonic_build`.

// generated by tonic_build (OUT_DIR/avidfp.dispersal.rs)
pub mod pb {
    include!(concat!(env!("OUT_DIR"), "/avidfp.dispersal.rs"));
}

pub use pb::dispersal_client::DispersalClient;
pub use pb::dispersal_server::{Dispersal, DispersalServer};
pub use pb::{
    DisperseRequest, DisperseResponse, EchoRequest, EchoResponse, Fpcc, ReadyRequest,
    ReadyResponse, RetrieveRequest, RetrieveResponse,
};

/// Proto crate version string, for logs and compatibility checks.
pub const PROTO_VERSION: &str = "0.1";
