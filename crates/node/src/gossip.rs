//! Fire-and-forget gossip to cluster peers.
//!
//! Echo and Ready broadcasts spawn one task per peer with a bounded
//! connect deadline. Dial and RPC failures are logged and swallowed: the
//! protocol relies on re-delivery (client Disperse retries, peers' own
//! Echos), not on transport reliability.

use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use avidfp_proto::{pb, DispersalClient};

pub const GOSSIP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Gossip {
    peers: Vec<String>,
    self_id: String,
    connect_timeout: Duration,
}

impl Gossip {
    pub fn new(peers: Vec<String>, self_id: impl Into<String>) -> Self {
        Gossip {
            peers,
            self_id: self_id.into(),
            connect_timeout: GOSSIP_CONNECT_TIMEOUT,
        }
    }

    /// Broadcast `Echo(object, fpcc)` to every peer, including ourselves.
    pub fn broadcast_echo(&self, object: String, fpcc: pb::Fpcc) {
        for peer in &self.peers {
            let req = pb::EchoRequest {
                object_id: object.clone(),
                fpcc: Some(fpcc.clone()),
                sender: self.self_id.clone(),
            };
            let peer = peer.clone();
            let connect_timeout = self.connect_timeout;
            tokio::spawn(async move {
                match connect(&peer, connect_timeout).await {
                    Ok(mut client) => {
                        if let Err(e) = client.echo(req).await {
                            warn!(peer = %peer, error = %e, "echo rpc failed");
                        }
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "echo dial failed"),
                }
            });
        }
    }

    /// Broadcast `Ready(object, fpcc)` to every peer, including ourselves.
    pub fn broadcast_ready(&self, object: String, fpcc: pb::Fpcc) {
        for peer in &self.peers {
            let req = pb::ReadyRequest {
                object_id: object.clone(),
                fpcc: Some(fpcc.clone()),
                sender: self.self_id.clone(),
            };
            let peer = peer.clone();
            let connect_timeout = self.connect_timeout;
            tokio::spawn(async move {
                match connect(&peer, connect_timeout).await {
                    Ok(mut client) => {
                        if let Err(e) = client.ready(req).await {
                            warn!(peer = %peer, error = %e, "ready rpc failed");
                        }
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "ready dial failed"),
                }
            });
        }
    }
}

async fn connect(
    addr: &str,
    connect_timeout: Duration,
) -> Result<DispersalClient<Channel>, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(http_endpoint(addr))?.connect_timeout(connect_timeout);
    Ok(DispersalClient::new(endpoint.connect().await?))
}

/// Prefix `http://` unless the address already carries a scheme.
fn http_endpoint(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_endpoint() {
        assert_eq!(http_endpoint("127.0.0.1:50051"), "http://127.0.0.1:50051");
        assert_eq!(http_endpoint("http://a:1"), "http://a:1");
        assert_eq!(http_endpoint("https://a:1"), "https://a:1");
    }
}
