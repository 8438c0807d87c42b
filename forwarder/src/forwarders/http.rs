//! # HTTP Forwarder
//!
//! Request/response rewriting over HTTP/1.1 (spec §4.8). Built on `axum`
//! for the accept/serve side and `reqwest` for the upstream call, bridging
//! their body types directly through `futures_util` streams rather than
//! introducing a third HTTP crate just to glue the two together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use axum::Router;

use super::ForwarderContext;
use crate::balancer::SelectionContext;
use crate::config::TargetBackend;
use crate::error::ForwarderError;

/// Hop-by-hop headers stripped in both directions, per RFC 7230 §6.1 plus
/// the two that would otherwise leak the wrong framing/identity downstream.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "host",
    "content-length",
];

/// Runs the axum server for one `Http` endpoint until `ctx.shutdown` fires.
pub async fn run(ctx: Arc<ForwarderContext>) -> crate::error::Result<()> {
    let addr = format!("{}:{}", ctx.endpoint.listen_ip, ctx.endpoint.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ForwarderError::Bind { addr: addr.clone(), source })?;

    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| ForwarderError::Unexpected(format!("reqwest client: {e}")))?;

    let app = Router::new()
        .fallback(handle)
        .with_state(HttpState { ctx: Arc::clone(&ctx), client });

    log::info!("http forwarder listening on {addr}");

    let shutdown = ctx.shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .map_err(|e| ForwarderError::Unexpected(format!("http server: {e}")))?;

    log::info!("http forwarder on {addr} drained");
    Ok(())
}

#[derive(Clone)]
struct HttpState {
    ctx: Arc<ForwarderContext>,
    client: reqwest::Client,
}

async fn handle(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let ctx = &state.ctx;

    let lease = match ctx.limiter.acquire(&ctx.shutdown).await {
        Ok(lease) => lease,
        Err(_) => return status_only(StatusCode::SERVICE_UNAVAILABLE),
    };

    let client_key = session_key(&headers, &uri, &peer);
    let zone_hint = zone_hint(&headers);
    let sel_ctx = SelectionContext {
        key: Some(client_key.clone()),
        client_ip: Some(peer.ip()),
        zone_hint,
    };

    let backend_key = ctx.sticky.as_ref().and_then(|s| s.get(&client_key));
    let pinned = backend_key
        .as_deref()
        .and_then(|key| ctx.metrics.get(key))
        .filter(|b| b.is_healthy());

    let backend = match pinned {
        Some(b) => b,
        None => match ctx.balancer.pick(&ctx.endpoint, ctx.geo.as_ref(), &sel_ctx).await {
            Ok(b) => b,
            Err(_) => return status_only(StatusCode::SERVICE_UNAVAILABLE),
        },
    };

    if let Some(sticky) = &ctx.sticky {
        sticky.put(&client_key, &backend.key());
    }

    backend.record_admit();
    let started = Instant::now();
    let response = relay(&state.client, &ctx.endpoint, &backend, peer, method, uri, headers, body).await;
    backend.record_response_time(started.elapsed());
    drop(lease);

    match response {
        Ok(resp) => {
            backend.record_http_status(resp.status().as_u16());
            backend.record_release();
            resp
        }
        Err(e) => {
            let status = match &e {
                ForwarderError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                ForwarderError::UpstreamUnreachable(_) | ForwarderError::UpstreamProtocolError(_) => {
                    StatusCode::BAD_GATEWAY
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            log::warn!("http relay to {} failed: {e}", backend.key());
            backend.record_http_status(status.as_u16());
            backend.record_release();
            status_only(status)
        }
    }
}

fn status_only(status: StatusCode) -> Response {
    Response::builder().status(status).body(Body::empty()).expect("static response is well-formed")
}

fn session_key(headers: &HeaderMap, uri: &Uri, peer: &SocketAddr) -> String {
    for name in ["x-request-id", "x-session-id", "x-user-id"] {
        if let Some(v) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return v.to_string();
        }
    }
    if let Some(cookie) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        if let Some(session) = cookie.split(';').find_map(|kv| {
            let mut parts = kv.trim().splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next()?;
            (key == "SESSION_ID").then(|| value.to_string())
        }) {
            return session;
        }
    }
    if let Some(query) = uri.query() {
        if let Some(session) = query.split('&').find_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next()?;
            (key == "session_id").then(|| value.to_string())
        }) {
            return session;
        }
    }
    peer.to_string()
}

fn zone_hint(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("x-client-zone").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    headers
        .get("cf-ipcountry")
        .and_then(|v| v.to_str().ok())
        .map(country_to_zone)
}

fn country_to_zone(country: &str) -> String {
    match country.to_ascii_uppercase().as_str() {
        "US" | "CA" | "MX" => "na".to_string(),
        "GB" | "DE" | "FR" | "NL" | "IE" | "ES" | "IT" => "eu".to_string(),
        "JP" | "SG" | "IN" | "AU" | "KR" => "ap".to_string(),
        _ => "unknown".to_string(),
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Appends `client_ip` to any existing `X-Forwarded-For` value (comma-space
/// separated, per RFC 7239's `X-Forwarded-For` convention) rather than
/// overwriting it, so a chain of proxies accumulates the full client path.
fn append_x_forwarded_for(headers: &mut HeaderMap, client_ip: std::net::IpAddr) {
    let existing = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let combined = match existing {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert("x-forwarded-for", value);
    }
}

fn rewrite_path(endpoint: &crate::config::EndpointConfig, backend: &TargetBackend, uri: &Uri) -> String {
    let mut path = uri.path().to_string();

    if backend.strip_path {
        if let Some(prefix) = &endpoint.path_prefix {
            let matches = path.len() >= prefix.len()
                && path[..prefix.len()].eq_ignore_ascii_case(prefix.as_str());
            if matches {
                path = path[prefix.len()..].to_string();
            }
        }
    }
    if let Some(replacement) = &backend.http_path {
        path = format!("{}{}", replacement.trim_end_matches('/'), path);
    }
    if !path.starts_with('/') {
        path = format!("/{path}");
    }
    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

async fn relay(
    client: &reqwest::Client,
    endpoint: &crate::config::EndpointConfig,
    backend: &TargetBackend,
    peer: SocketAddr,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> crate::error::Result<Response> {
    let scheme = if backend.backend_protocol == crate::config::BackendProtocol::Tls {
        "https"
    } else {
        "http"
    };
    let path = rewrite_path(endpoint, backend, &uri);
    let url = format!("{scheme}://{}:{}{path}", backend.host, backend.port);

    let mut out_headers = strip_hop_by_hop(&headers);
    append_x_forwarded_for(&mut out_headers, peer.ip());
    for (name, value) in &backend.request_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out_headers.insert(name, value);
        }
    }

    let req_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|e| ForwarderError::UpstreamProtocolError(e.to_string()))?;
    let body_stream = body.into_data_stream();
    let req = client
        .request(req_method, &url)
        .headers(out_headers)
        .body(reqwest::Body::wrap_stream(body_stream))
        .timeout(backend.timeout);

    let upstream_resp = req.send().await?;

    let status = StatusCode::from_u16(upstream_resp.status().as_u16())
        .map_err(|e| ForwarderError::UpstreamProtocolError(e.to_string()))?;
    let mut resp_headers = HeaderMap::new();
    for (name, value) in upstream_resp.headers() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) {
            continue;
        }
        if name_str == "location" {
            if let Ok(rewritten) = rewrite_location(value.to_str().unwrap_or(""), endpoint, backend) {
                if let Ok(header_value) = HeaderValue::from_str(&rewritten) {
                    resp_headers.append(axum::http::header::LOCATION, header_value);
                    continue;
                }
            }
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_ref()),
            HeaderValue::from_bytes(value.as_ref()),
        ) {
            resp_headers.append(name, value);
        }
    }

    let body_stream = upstream_resp.bytes_stream();
    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(body_stream))
        .map_err(|e| ForwarderError::UpstreamProtocolError(e.to_string()))
}

/// Rewrites a backend-relative `Location` header back to the forwarder's
/// own `pathPrefix`, so a redirecting backend doesn't leak its real host.
fn rewrite_location(
    location: &str,
    endpoint: &crate::config::EndpointConfig,
    backend: &TargetBackend,
) -> Result<String, ()> {
    let backend_origin = format!("{}:{}", backend.host, backend.port);
    if !location.contains(&backend_origin) {
        return Ok(location.to_string());
    }
    let prefix = endpoint.path_prefix.clone().unwrap_or_default();
    let rewritten = location.replacen(&format!("http://{backend_origin}"), &prefix, 1);
    let rewritten = rewritten.replacen(&format!("https://{backend_origin}"), &prefix, 1);
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendProtocol, EndpointConfig, ListenProtocol, LoadBalancingAlgorithm};
    use std::net::{IpAddr, Ipv4Addr};

    fn endpoint(path_prefix: Option<&str>) -> EndpointConfig {
        EndpointConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            listen_port: 8080,
            protocol: ListenProtocol::Http,
            max_connections: 100,
            path_prefix: path_prefix.map(str::to_string),
            server_certificate: None,
            client_certificate_required: false,
            targets: vec![],
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            zone_affinity: None,
            sticky_sessions: false,
        }
    }

    #[test]
    fn rewrite_path_strips_prefix_and_prepends_backend_path() {
        let endpoint = endpoint(Some("/api"));
        let mut backend = TargetBackend::new("upstream", 9000);
        backend.strip_path = true;
        backend.http_path = Some("/v2".to_string());
        backend.backend_protocol = BackendProtocol::Plain;

        let uri: Uri = "/api/users?active=true".parse().unwrap();
        assert_eq!(rewrite_path(&endpoint, &backend, &uri), "/v2/users?active=true");
    }

    #[test]
    fn rewrite_path_strips_prefix_case_insensitively() {
        let endpoint = endpoint(Some("/api"));
        let mut backend = TargetBackend::new("upstream", 9000);
        backend.strip_path = true;
        backend.http_path = Some("/v2".to_string());
        backend.backend_protocol = BackendProtocol::Plain;

        let uri: Uri = "/API/users?active=true".parse().unwrap();
        assert_eq!(rewrite_path(&endpoint, &backend, &uri), "/v2/users?active=true");
    }

    #[test]
    fn append_x_forwarded_for_sets_header_when_absent() {
        let mut headers = HeaderMap::new();
        append_x_forwarded_for(&mut headers, "203.0.113.7".parse().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7");
    }

    #[test]
    fn append_x_forwarded_for_appends_to_an_existing_value() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        append_x_forwarded_for(&mut headers, "203.0.113.7".parse().unwrap());
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "198.51.100.1, 203.0.113.7");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-custom", HeaderValue::from_static("value"));
        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.get("connection").is_none());
        assert!(stripped.get("x-custom").is_some());
    }

    #[test]
    fn cf_ipcountry_maps_to_the_expected_zone() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-ipcountry", HeaderValue::from_static("DE"));
        assert_eq!(zone_hint(&headers), Some("eu".to_string()));
    }

    #[test]
    fn session_key_prefers_explicit_header_over_cookie_and_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("session-abc"));
        let uri: Uri = "/?session_id=ignored".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(session_key(&headers, &uri, &peer), "session-abc");
    }

    #[test]
    fn location_rewrite_swaps_backend_origin_for_path_prefix() {
        let endpoint = endpoint(Some("/api"));
        let backend = TargetBackend::new("upstream.internal", 9000);
        let rewritten = rewrite_location("http://upstream.internal:9000/reset", &endpoint, &backend).unwrap();
        assert_eq!(rewritten, "/api/reset");
    }
}
