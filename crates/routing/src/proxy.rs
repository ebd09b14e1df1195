//! Front-process reverse proxy.
//!
//! Every request is forwarded to the worker owning its session id. A dead or
//! unreachable worker yields 502 straight away; requests are never retried on
//! another worker because session state only exists in its owner.

use std::sync::Arc;

use {
    axum::{
        Json, Router,
        body::{Body, Bytes},
        extract::{Request, State},
        http::{HeaderMap, HeaderName, Uri, header},
        response::Response,
        routing::get,
    },
    tracing::{debug, warn},
};

use crate::{
    error::RouteError,
    shard::{ShardMap, WorkerSlot},
};

/// Request bodies are buffered up to this size to look for a `sessionId`.
pub const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

const SESSION_HEADER: &str = "x-session-id";

#[derive(Clone)]
pub struct ProxyState {
    shards: Arc<ShardMap>,
    client: reqwest::Client,
    upstream_host: Arc<str>,
}

impl ProxyState {
    pub fn new(shards: Arc<ShardMap>) -> Result<Self, RouteError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            shards,
            client,
            upstream_host: Arc::from("127.0.0.1"),
        })
    }

    pub fn with_upstream_host(mut self, host: &str) -> Self {
        self.upstream_host = Arc::from(host);
        self
    }
}

/// Front router: a worker table for operators, everything else proxied.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route("/_router/workers", get(list_workers))
        .fallback(forward)
        .with_state(state)
}

async fn list_workers(State(state): State<ProxyState>) -> Json<Vec<WorkerSlot>> {
    Json(state.shards.snapshot().await)
}

async fn forward(State(state): State<ProxyState>, req: Request) -> Result<Response, RouteError> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| RouteError::BodyTooLarge)?;

    let session_id = session_id_from_parts(&parts.uri, &parts.headers).or_else(|| {
        is_json(&parts.headers)
            .then(|| session_id_from_json(&body))
            .flatten()
    });

    let slot = state
        .shards
        .route(session_id.as_deref())
        .await
        .ok_or(RouteError::NoWorkers)?;
    if !slot.alive {
        warn!(worker = slot.index, session_id = ?session_id, "owning worker is down");
        return Err(RouteError::WorkerDown { index: slot.index });
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://{}:{}{path}", state.upstream_host, slot.port);
    debug!(method = %parts.method, %url, worker = slot.index, "forwarding");

    let upstream = state
        .client
        .request(parts.method, &url)
        .headers(end_to_end(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            warn!(worker = slot.index, error = %e, "upstream request failed");
            RouteError::Upstream(e)
        })?;

    let status = upstream.status();
    let headers = end_to_end(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

// ── Session id resolution ────────────────────────────────────────────────────

/// Session id from the path, the query string or the session header.
///
/// Path ids are percent-decoded the same way the worker's path extractor
/// decodes them, so both sides hash the same string.
fn session_id_from_parts(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let mut segments = uri.path().split('/').filter(|s| !s.is_empty());
    if segments.next() == Some("sessions")
        && let Some(id) = segments.next()
    {
        return Some(
            urlencoding::decode(id)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| id.to_string()),
        );
    }

    if let Some(query) = uri.query()
        && let Some((_, id)) = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, v)| (k == "id" || k == "sessionId") && !v.is_empty())
    {
        return Some(id.into_owned());
    }

    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn session_id_from_json(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("sessionId")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"))
}

// ── Headers ──────────────────────────────────────────────────────────────────

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::shard::shard_for,
        axum::http::{HeaderValue, StatusCode},
        serde_json::{Value, json},
        tokio::net::TcpListener,
    };

    async fn serve(app: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    /// Worker stand-in that reports which port answered.
    async fn fake_worker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new().fallback(move |req: Request| async move {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let body = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
            Json(json!({
                "port": port,
                "method": method,
                "uri": uri,
                "body": String::from_utf8_lossy(&body),
            }))
        });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn front(shards: Arc<ShardMap>) -> String {
        let port = serve(router(ProxyState::new(shards).unwrap())).await;
        format!("http://127.0.0.1:{port}")
    }

    async fn live_fleet(n: usize) -> (Arc<ShardMap>, Vec<u16>) {
        let mut ports = Vec::new();
        for _ in 0..n {
            ports.push(fake_worker().await);
        }
        let shards = Arc::new(ShardMap::from_ports(ports.clone()));
        for i in 0..n {
            shards.mark_up(i, None).await;
        }
        (shards, ports)
    }

    #[test]
    fn session_id_sources() {
        let empty = HeaderMap::new();
        let uri: Uri = "/sessions/abc/restart".parse().unwrap();
        assert_eq!(session_id_from_parts(&uri, &empty).as_deref(), Some("abc"));

        let uri: Uri = "/sessions/tenant%3Aphone/events".parse().unwrap();
        assert_eq!(
            session_id_from_parts(&uri, &empty).as_deref(),
            Some("tenant:phone")
        );

        let uri: Uri = "/chats?sessionId=s%201&limit=5".parse().unwrap();
        assert_eq!(session_id_from_parts(&uri, &empty).as_deref(), Some("s 1"));

        let uri: Uri = "/messages/send?id=s2".parse().unwrap();
        assert_eq!(session_id_from_parts(&uri, &empty).as_deref(), Some("s2"));

        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s3"));
        let uri: Uri = "/contacts".parse().unwrap();
        assert_eq!(session_id_from_parts(&uri, &headers).as_deref(), Some("s3"));

        let uri: Uri = "/sessions".parse().unwrap();
        assert_eq!(session_id_from_parts(&uri, &empty), None);

        let body = Bytes::from_static(br#"{"sessionId":"s4","tenantId":"t"}"#);
        assert_eq!(session_id_from_json(&body).as_deref(), Some("s4"));
        assert_eq!(session_id_from_json(&Bytes::from_static(b"not json")), None);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s1"));

        let kept = end_to_end(&headers);
        assert_eq!(kept.len(), 2);
        assert!(kept.contains_key(header::CONTENT_TYPE));
        assert!(kept.contains_key(SESSION_HEADER));
    }

    #[tokio::test]
    async fn requests_reach_the_owning_worker() {
        let (shards, ports) = live_fleet(3).await;
        let base = front(shards).await;
        let client = reqwest::Client::new();

        for id in ["s1", "s2", "alpha", "tenant-b:phone"] {
            let expected = ports[shard_for(id, 3)];

            let by_path: Value = client
                .get(format!("{base}/sessions/{id}"))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(by_path["port"], expected);

            let encoded: Value = client
                .get(format!("{base}/sessions/{}", urlencoding::encode(id)))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(encoded["port"], expected);

            let by_header: Value = client
                .get(format!("{base}/chats"))
                .header(SESSION_HEADER, id)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(by_header["port"], expected);

            let by_body: Value = client
                .post(format!("{base}/sessions"))
                .json(&json!({ "sessionId": id, "tenantId": "t" }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(by_body["port"], expected);
            assert_eq!(by_body["method"], "POST");
            assert!(by_body["body"].as_str().unwrap().contains(id));
        }
    }

    #[tokio::test]
    async fn requests_without_id_go_somewhere_live() {
        let (shards, ports) = live_fleet(2).await;
        let base = front(shards).await;

        let resp: Value = reqwest::get(format!("{base}/health?x=1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(ports.iter().any(|p| resp["port"] == *p));
        assert_eq!(resp["uri"], "/health?x=1");
    }

    #[tokio::test]
    async fn down_worker_is_bad_gateway() {
        let (shards, _) = live_fleet(2).await;
        let owner = shard_for("s1", 2);
        shards.mark_down(owner).await;
        let base = front(shards).await;

        let resp = reqwest::get(format!("{base}/sessions/s1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn unreachable_worker_is_bad_gateway() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let shards = Arc::new(ShardMap::from_ports([closed]));
        shards.mark_up(0, None).await;
        let base = front(shards).await;

        let resp = reqwest::get(format!("{base}/sessions/s1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn worker_table_is_exposed() {
        let (shards, ports) = live_fleet(2).await;
        let base = front(shards).await;
        let table: Value = reqwest::get(format!("{base}/_router/workers"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(table[1]["port"], ports[1]);
        assert_eq!(table[0]["alive"], true);
    }
}
