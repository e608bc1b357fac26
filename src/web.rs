//! HTTP/TLS Surface (component H).
//!
//! Routes split exactly along the peer-facing / session-facing line of §6:
//! peer-facing endpoints are open to the LAN (TLS only, no other auth —
//! possession of a file id or a peer identity is the only capability);
//! session-facing endpoints additionally require the request to originate
//! from loopback with a loopback `Origin`, and (apart from `/auth` itself)
//! a matching `X-Api-Key`.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::crypto;
use crate::db::{FileRow, MessageRow, PeerRow};
use crate::events::Event;
use crate::pipeline::{LocalSubmission, WireMessage};
use crate::server::SharedState;

pub fn router(state: Arc<SharedState>) -> Router {
    let peer_facing = Router::new()
        .route("/api/v1/whoami", get(whoami))
        .route("/api/v1/discovery", get(discovery))
        .route("/api/v1/message", post(inbound_message))
        .route("/api/v1/file/:file_id", get(download_file));

    let session_facing = Router::new()
        .route("/api/v1/client/auth", get(client_auth))
        .route("/api/v1/client/message", get(list_messages).post(submit_message))
        .route("/api/v1/client/message/truncate", post(truncate_messages))
        .route("/api/v1/client/name", post(set_name))
        .route("/api/v1/client/peers", get(list_peers))
        .route("/api/v1/client/files", get(list_files))
        .route("/api/v1/client/file", post(register_file))
        .route("/api/v1/client/file/truncate", post(truncate_files))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), require_api_key))
        .layer(middleware::from_fn(require_loopback_and_origin));

    Router::new()
        .merge(peer_facing)
        .merge(session_facing)
        // §3 message content size limit; base64/ciphertext overhead gets a
        // generous allowance beyond the raw 100 MiB content bound.
        .layer(axum::extract::DefaultBodyLimit::max(
            crate::pipeline::MAX_CONTENT_BYTES + (crate::pipeline::MAX_CONTENT_BYTES / 2),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── session-facing access control ───────────────────────────────────────

/// §4.6: a session is accepted only from loopback, with a loopback Origin.
async fn require_loopback_and_origin(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !origin_is_loopback(origin) {
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(req).await
}

fn origin_is_loopback(origin: &str) -> bool {
    let host = origin
        .split("://")
        .nth(1)
        .unwrap_or(origin)
        .split(':')
        .next()
        .unwrap_or("");
    host == "localhost" || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// All session-facing routes except `/client/auth` (which hands out the
/// key in the first place) require a matching `X-Api-Key`.
async fn require_api_key(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if req.uri().path() == "/api/v1/client/auth" {
        return next.run(req).await;
    }
    let supplied = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            req.uri()
                .query()
                .and_then(|q| url_query_param(q, "api_key"))
        });
    match supplied {
        Some(key) if key == state.api_key => next.run(req).await,
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// `/ws` is opened from a browser `WebSocket`, which cannot set custom
/// headers — accept the key as a query param there in addition to the
/// header path used by ordinary fetches.
fn url_query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut it = pair.splitn(2, '=');
        let k = it.next()?;
        let v = it.next()?;
        (k == key).then(|| v.to_string())
    })
}

// ── peer-facing handlers ─────────────────────────────────────────────────

async fn whoami(State(state): State<Arc<SharedState>>) -> Result<Json<crate::identity::WhoAmI>, StatusCode> {
    state.identity.whoami().map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Serialize)]
struct DiscoveryPeerDto {
    #[serde(rename = "GUID")]
    guid: Uuid,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IPAddress")]
    ip_address: String,
    #[serde(rename = "LastSeen")]
    last_seen: i64,
}

async fn discovery(State(state): State<Arc<SharedState>>) -> Json<Vec<DiscoveryPeerDto>> {
    let now_unix = crate::peers::unix_now();
    let peers = state
        .peers
        .get_active_peers()
        .into_iter()
        .map(|p| DiscoveryPeerDto {
            guid: p.guid,
            port: p.port,
            name: p.name,
            ip_address: p.ip.to_string(),
            last_seen: now_unix - p.last_seen.elapsed().as_secs() as i64,
        })
        .collect();
    Json(peers)
}

/// Accepts either the encrypted wire form (peer-to-peer) or, for intra-host
/// bridging only, the plaintext local-submission form (§4.4).
async fn inbound_message(
    State(state): State<Arc<SharedState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<(StatusCode, Json<crate::pipeline::DeliveryReport>), StatusCode> {
    if let Ok(wire) = serde_json::from_slice::<WireMessage>(&body) {
        if wire.receiver_guid != state.identity.guid() {
            return Err(StatusCode::BAD_REQUEST);
        }
        let plaintext = crypto::decrypt(&wire.ciphertext_b64, &wire.id.to_string(), state.identity.private_key())
            .map_err(|e| {
                tracing::warn!("inbound decrypt failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?;
        let report = state.pipeline.handle_inbound_wire(wire, plaintext, addr.ip()).await;
        return Ok((StatusCode::ACCEPTED, Json(report)));
    }

    let submission: LocalSubmission =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let report = state.pipeline.handle_inbound_local_form(submission).await;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn download_file(
    State(state): State<Arc<SharedState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(file_id): Path<String>,
) -> Result<Response, StatusCode> {
    let row = state
        .files
        .get_record(&file_id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let stream = state
        .files
        .open_stream(&row, addr.ip())
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let body = Body::from_stream(stream);
    let disposition = format!("attachment; filename=\"{}\"", row.filename.replace('"', ""));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, row.mime_type)
        .header(axum::http::header::CONTENT_DISPOSITION, disposition)
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?)
}

// ── session-facing handlers ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiKeyResponse {
    api_key: String,
}

async fn client_auth(State(state): State<Arc<SharedState>>) -> Json<ApiKeyResponse> {
    Json(ApiKeyResponse { api_key: state.api_key.clone() })
}

#[derive(Deserialize)]
struct MessageQuery {
    since: Option<i64>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct MessageDto {
    id: String,
    sender_guid: String,
    receiver_guid: String,
    #[serde(rename = "type")]
    kind: String,
    scope: String,
    content_b64: String,
    timestamp: i64,
    source_ip: Option<String>,
}

impl From<MessageRow> for MessageDto {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            sender_guid: row.sender_guid,
            receiver_guid: row.receiver_guid,
            kind: row.kind,
            scope: row.scope,
            content_b64: base64::engine::general_purpose::STANDARD.encode(row.content),
            timestamp: row.timestamp,
            source_ip: row.source_ip,
        }
    }
}

async fn list_messages(
    State(state): State<Arc<SharedState>>,
    Query(q): Query<MessageQuery>,
) -> Result<Json<Vec<MessageDto>>, StatusCode> {
    let rows = state
        .db
        .list_messages_since(q.since.unwrap_or(0), q.limit.unwrap_or(200))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(rows.into_iter().map(MessageDto::from).collect()))
}

async fn submit_message(
    State(state): State<Arc<SharedState>>,
    Json(input): Json<LocalSubmission>,
) -> Json<crate::pipeline::DeliveryReport> {
    Json(state.pipeline.submit_local(input).await)
}

async fn truncate_messages(State(state): State<Arc<SharedState>>) -> StatusCode {
    match state.db.truncate_messages() {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
struct SetNameRequest {
    name: String,
}

async fn set_name(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<SetNameRequest>,
) -> StatusCode {
    match state.identity.set_display_name(&state.db, req.name) {
        Ok(()) => {
            state.discovery.update_display_name(state.identity.display_name());
            StatusCode::OK
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct PeerDto {
    guid: Uuid,
    name: String,
    ip: String,
    port: u16,
    last_seen: i64,
}

async fn list_peers(State(state): State<Arc<SharedState>>) -> Json<Vec<PeerDto>> {
    let now_unix = crate::peers::unix_now();
    let peers = state
        .peers
        .get_active_peers()
        .into_iter()
        .map(|p| PeerDto {
            guid: p.guid,
            name: p.name,
            ip: p.ip.to_string(),
            port: p.port,
            last_seen: now_unix - p.last_seen.elapsed().as_secs() as i64,
        })
        .collect();
    Json(peers)
}

async fn list_files(State(state): State<Arc<SharedState>>) -> Result<Json<Vec<FileRow>>, StatusCode> {
    state.files.list().map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Deserialize)]
struct RegisterFileRequest {
    path: String,
    filename: Option<String>,
    receiver_guid: Option<Uuid>,
}

async fn register_file(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<RegisterFileRequest>,
) -> Result<Json<FileRow>, StatusCode> {
    state
        .files
        .register(state.identity.guid(), req.receiver_guid, &req.path, req.filename)
        .map(Json)
        .map_err(|e| {
            tracing::warn!("file registration failed: {e}");
            StatusCode::BAD_REQUEST
        })
}

async fn truncate_files(State(state): State<Arc<SharedState>>) -> StatusCode {
    match state.files.truncate() {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── event-bus session endpoint ───────────────────────────────────────────

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Submit(LocalSubmission),
    Ping,
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: Arc<SharedState>) {
    let (mut sink, mut stream) = futures::StreamExt::split(socket);
    let mut session = state.events.subscribe();

    let writer_events = Arc::clone(&state.events);
    let session_id = session.id;
    let writer = tokio::spawn(async move {
        while let Some(event) = session.rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if futures::SinkExt::send(&mut sink, WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        writer_events.unsubscribe(session_id);
    });

    while let Some(Ok(msg)) = futures::StreamExt::next(&mut stream).await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Submit(input)) => {
                    let pipeline = Arc::clone(&state.pipeline);
                    tokio::spawn(async move {
                        let _ = pipeline.submit_local(input).await;
                    });
                }
                Ok(ClientFrame::Ping) => state.events.record_liveness(session_id),
                Err(e) => tracing::debug!("ws: unrecognized client frame: {e}"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.events.unsubscribe(session_id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_loopback_detection() {
        assert!(origin_is_loopback("http://localhost:3000"));
        assert!(origin_is_loopback("https://127.0.0.1:8443"));
        assert!(!origin_is_loopback("http://10.0.0.5:3000"));
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(url_query_param("api_key=abc&x=1", "api_key"), Some("abc".to_string()));
        assert_eq!(url_query_param("x=1", "api_key"), None);
    }
}
