// TCP transports
//
// `connect` reaches a node (or a serial-to-TCP bridge) that serves its console
// on a socket. `accept_one` waits for a node that dials in, as mesh root nodes
// do when bridging to a host.

use crate::error::{ProbeError, Result};
use crate::types::SourceId;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub(super) async fn connect(id: &SourceId, host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    log::debug!("Connecting to TCP: {}", addr);

    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ProbeError::Connection {
            source_id: id.to_string(),
            message: format!("TCP connection to {} failed: {}", addr, e),
        })?;
    stream.set_nodelay(true).ok();

    Ok(stream)
}

pub(super) async fn accept_one(
    id: &SourceId,
    bind_addr: &str,
    accept_timeout_ms: Option<u64>,
) -> Result<TcpStream> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Connection {
            source_id: id.to_string(),
            message: format!("Failed to bind {}: {}", bind_addr, e),
        })?;

    log::info!("Waiting for node '{}' to connect on {}", id, bind_addr);

    let accepted = match accept_timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), listener.accept())
            .await
            .map_err(|_| ProbeError::Connection {
                source_id: id.to_string(),
                message: format!("No connection on {} within {} ms", bind_addr, ms),
            })?,
        None => listener.accept().await,
    };

    let (stream, peer) = accepted.map_err(|e| ProbeError::Connection {
        source_id: id.to_string(),
        message: format!("Accept on {} failed: {}", bind_addr, e),
    })?;

    log::info!("Accepted connection from {} for '{}'", peer, id);
    Ok(stream)
}
