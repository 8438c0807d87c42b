//! # UDP Forwarder
//!
//! One-way datagram forwarding (spec §4.7). Strictly client → backend:
//! nothing correlates a backend's own outbound traffic back to the
//! originating client socket, so there is no reply path to relay. Sticky
//! sessions, when enabled, pin a client source endpoint to the same
//! backend across datagrams without needing any per-client socket state.

use std::sync::Arc;

use tokio::net::UdpSocket;

use super::ForwarderContext;
use crate::balancer::SelectionContext;
use crate::error::ForwarderError;

const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Runs the receive loop for one `Udp` endpoint until `ctx.shutdown` fires.
pub async fn run(ctx: Arc<ForwarderContext>) -> crate::error::Result<()> {
    let addr = format!("{}:{}", ctx.endpoint.listen_ip, ctx.endpoint.listen_port);
    let socket = Arc::new(
        UdpSocket::bind(&addr)
            .await
            .map_err(|source| ForwarderError::Bind { addr: addr.clone(), source })?,
    );

    log::info!("udp forwarder listening on {addr}");

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                log::info!("udp forwarder on {addr} draining");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("udp recv error on {addr}: {e}");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let conn_ctx = Arc::clone(&ctx);
                ctx.connections.lock().await.spawn(async move {
                    if let Err(e) = forward_one(conn_ctx, peer, datagram).await {
                        log::log!(e.log_level(), "udp datagram from {peer} dropped: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn forward_one(
    ctx: Arc<ForwarderContext>,
    peer: std::net::SocketAddr,
    datagram: Vec<u8>,
) -> crate::error::Result<()> {
    let lease = ctx.limiter.acquire(&ctx.shutdown).await?;

    let sel_ctx = SelectionContext {
        key: Some(peer.to_string()),
        client_ip: Some(peer.ip()),
        zone_hint: None,
    };

    let backend_key = ctx.sticky.as_ref().and_then(|s| s.get(&peer.to_string()));
    let pinned = backend_key
        .as_deref()
        .and_then(|key| ctx.metrics.get(key))
        .filter(|b| b.is_healthy());

    let backend = match pinned {
        Some(b) => b,
        None => ctx.balancer.pick(&ctx.endpoint, ctx.geo.as_ref(), &sel_ctx).await?,
    };

    if let Some(sticky) = &ctx.sticky {
        sticky.put(&peer.to_string(), &backend.key());
    }

    backend.record_admit();
    let result = send_datagram(&backend, &datagram).await;
    backend.record_release();
    drop(lease);
    result
}

async fn send_datagram(backend: &crate::config::TargetBackend, datagram: &[u8]) -> crate::error::Result<()> {
    let upstream_addr = format!("{}:{}", backend.host, backend.port);
    let outbound = UdpSocket::bind("0.0.0.0:0").await?;
    tokio::time::timeout(backend.timeout, outbound.connect(&upstream_addr))
        .await
        .map_err(|_| ForwarderError::UpstreamTimeout(backend.timeout))?
        .map_err(|e| ForwarderError::UpstreamUnreachable(format!("{upstream_addr}: {e}")))?;
    outbound.send(datagram).await?;
    Ok(())
}
