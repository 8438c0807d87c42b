//! # TCP / TLS-TCP Forwarder
//!
//! Raw byte-stream passthrough (spec §4.6). Handles both `Tcp` and
//! `TlsTcp` listen protocols: the TLS handshake, when present, is
//! terminated here before the connection is handed off exactly like a
//! plain TCP one. Backend-side TLS (`BackendProtocol::Tls`) is likewise
//! transparent to the relay loop — it only ever sees something that reads
//! and writes bytes.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use super::ForwarderContext;
use crate::balancer::SelectionContext;
use crate::error::ForwarderError;
use crate::pool::ConnectionPool;

/// Runs the accept loop for one `Tcp`/`TlsTcp` endpoint until `ctx.shutdown` fires.
pub async fn run(ctx: Arc<ForwarderContext>) -> crate::error::Result<()> {
    let addr = format!("{}:{}", ctx.endpoint.listen_ip, ctx.endpoint.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ForwarderError::Bind { addr: addr.clone(), source })?;

    let acceptor = match &ctx.endpoint.server_certificate {
        Some(cert) => Some(TlsAcceptor::from(Arc::clone(&cert.tls_config))),
        None => None,
    };

    log::info!("tcp forwarder listening on {addr}");

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                log::info!("tcp forwarder on {addr} draining");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("tcp accept error on {addr}: {e}");
                        continue;
                    }
                };
                let conn_ctx = Arc::clone(&ctx);
                let acceptor = acceptor.clone();
                ctx.connections.lock().await.spawn(async move {
                    if let Err(e) = handle_connection(conn_ctx, stream, peer, acceptor).await {
                        log::log!(e.log_level(), "tcp connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    ctx: Arc<ForwarderContext>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    acceptor: Option<TlsAcceptor>,
) -> crate::error::Result<()> {
    let lease = ctx.limiter.acquire(&ctx.shutdown).await?;

    let sel_ctx = SelectionContext {
        key: ctx.sticky.as_ref().map(|_| peer.to_string()),
        client_ip: Some(peer.ip()),
        zone_hint: None,
    };

    let backend_key = if let Some(sticky) = &ctx.sticky {
        sticky.get(&peer.to_string())
    } else {
        None
    };

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
    let result = relay(ctx.pool.as_ref(), &backend, stream, acceptor, &ctx.shutdown).await;
    backend.record_release();
    drop(lease);
    result
}

async fn relay(
    pool: &ConnectionPool,
    backend: &crate::config::TargetBackend,
    client: TcpStream,
    acceptor: Option<TlsAcceptor>,
    shutdown: &CancellationToken,
) -> crate::error::Result<()> {
    let mut upstream = match pool.take(&backend.key()) {
        Some(stream) => stream,
        None => ConnectionPool::dial(&backend.host, backend.port).await?,
    };

    let backend_tls = backend.backend_protocol == crate::config::BackendProtocol::Tls;

    let mut client_io = match acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(client)
                .await
                .map_err(|e| ForwarderError::TlsHandshakeFailed(e.to_string()))?;
            Box::pin(tls_stream) as std::pin::Pin<Box<dyn AsyncReadWrite>>
        }
        None => Box::pin(client) as std::pin::Pin<Box<dyn AsyncReadWrite>>,
    };

    if backend_tls {
        let connector = TlsConnector::from(crate::tls::build_client_config(None)?);
        let server_name = crate::tls::server_name(&backend.host)?;
        let mut tls_upstream = connector
            .connect(server_name, upstream)
            .await
            .map_err(|e| ForwarderError::TlsHandshakeFailed(e.to_string()))?;
        copy_until_cancelled(&mut client_io, &mut tls_upstream, shutdown).await?;
        // TLS sessions are not returned to the pool: reuse would require
        // keeping the handshake state alive across unrelated connections.
    } else {
        copy_until_cancelled(&mut client_io, &mut upstream, shutdown).await?;
        pool.put(&backend.key(), upstream);
    }

    Ok(())
}

/// Races the bidirectional copy against `shutdown` so a connection mid-relay
/// is abandoned rather than left running past `Orchestrator::stop`'s deadline.
async fn copy_until_cancelled<A, B>(a: &mut A, b: &mut B, shutdown: &CancellationToken) -> crate::error::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(ForwarderError::Cancelled),
        result = tokio::io::copy_bidirectional(a, b) => {
            result?;
            Ok(())
        }
    }
}

/// Object-safe alias for anything the relay loop can read and write.
trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}
