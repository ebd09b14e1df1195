use std::{convert::Infallible, sync::Arc};

use {
    axum::{
        Router,
        extract::{Path, Query, State},
        http::StatusCode,
        response::{
            IntoResponse, Json, Response,
            sse::{Event, KeepAlive, Sse},
        },
        routing::{get, post},
    },
    futures::{Stream, StreamExt, future, stream},
    serde::{Deserialize, Serialize},
    serde_json::json,
    switchboard_common::{SessionId, SessionStatus},
    switchboard_sessions::{CreateOptions, CreateOutcome, HandshakeMessage, SessionSummary},
    tokio::{net::TcpListener, sync::mpsc},
    tokio_stream::wrappers::UnboundedReceiverStream,
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{error::ApiError, state::GatewayState};

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the worker router (shared between production startup and tests).
pub fn build_worker_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(list_handler).post(create_handler))
        .route("/sessions/{id}", get(get_handler).delete(delete_handler))
        .route("/sessions/{id}/restart", post(restart_handler))
        .route("/sessions/{id}/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve one worker until `shutdown` fires, then close every protocol
/// connection while leaving sessions recoverable.
pub async fn serve_worker(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(
        %addr,
        worker = state.worker.index,
        workers = state.worker.count,
        version = %state.version,
        "worker listening"
    );

    let app = build_worker_app(Arc::clone(&state));
    let streams = state.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            streams.cancel();
        })
        .await?;

    state.manager.shutdown().await;
    info!(worker = state.worker.index, "worker stopped");
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": state.version,
        "worker": state.worker.index,
        "workers": state.worker.count,
        "sessions": state.manager.registry().len().await,
        "uptimeSecs": state.uptime_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant: Option<String>,
}

async fn list_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<SessionSummary>> {
    Json(state.manager.list(query.tenant.as_deref()).await)
}

async fn create_handler(
    State(state): State<Arc<GatewayState>>,
    Json(mut opts): Json<CreateOptions>,
) -> Result<Response, ApiError> {
    if opts.tenant_id.trim().is_empty() {
        return Err(ApiError::BadRequest("tenantId is required".into()));
    }
    match opts.session_id.as_deref() {
        Some(id) if !state.worker.owns(id) => {
            return Err(ApiError::Misdirected {
                session_id: id.to_string(),
                owner: state.worker.owner_of(id),
            });
        },
        Some(_) => {},
        None => opts.session_id = Some(state.worker.fresh_session_id()),
    }

    let response = match state.manager.create_session(opts).await? {
        CreateOutcome::Qr { session_id, code } => (
            StatusCode::CREATED,
            Json(json!({ "sessionId": session_id, "qr": code })),
        )
            .into_response(),
        CreateOutcome::Opened { session_id } => (
            StatusCode::CREATED,
            Json(json!({ "sessionId": session_id, "status": SessionStatus::Open })),
        )
            .into_response(),
        CreateOutcome::InFlight { session_id } => (
            StatusCode::ACCEPTED,
            Json(json!({ "sessionId": session_id, "status": SessionStatus::Connecting })),
        )
            .into_response(),
        CreateOutcome::Stream {
            session_id,
            messages,
        } => handshake_sse(session_id, messages, state.shutdown_token()).into_response(),
    };
    Ok(response)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDetail {
    #[serde(flatten)]
    summary: SessionSummary,
    retry_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<u64>,
}

async fn get_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let handle = state.manager.get(&id).await?;
    let retry = state.manager.retry_state(&handle.id);
    Ok(Json(SessionDetail {
        summary: handle.summary(),
        retry_attempts: retry.attempts,
        cooldown_until: retry.cooldown_until,
    }))
}

async fn delete_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.restart_session(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "sessionId": id, "status": SessionStatus::Connecting })),
    ))
}

/// Status transitions of one session as SSE, until it is destroyed.
async fn events_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Subscribe before the lookup so no transition slips between the two.
    let subscription = state.manager.subscribe();
    let handle = state.manager.get(&id).await?;
    let current = handle.summary();
    let session_id = handle.id.clone();

    let initial = stream::once(future::ready(current.status));
    let updates = stream::unfold(subscription, |mut sub| async move {
        sub.recv().await.map(|event| (event, sub))
    })
    .filter(move |event| future::ready(event.session_id == session_id))
    .map(|event| event.status);

    let events = initial
        .chain(updates)
        .scan(false, |finished, status| {
            if *finished {
                return future::ready(None);
            }
            *finished = status == SessionStatus::Destroyed;
            future::ready(Some(status))
        })
        .map(|status| Ok::<_, Infallible>(status_event(status)))
        .take_until(state.shutdown_token().cancelled_owned());

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ── SSE rendering ────────────────────────────────────────────────────────────

fn status_event(status: SessionStatus) -> Event {
    Event::default().event("status").data(status.as_str())
}

fn handshake_event(message: &HandshakeMessage) -> Event {
    match Event::default().event(message.event_name()).json_data(message) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "failed to encode handshake message");
            Event::default().event(message.event_name())
        },
    }
}

/// Handshake stream: a `session` event naming the id, then every handshake
/// message until the stream resolves. Dropping the response drops the
/// receiver, which abandons the handshake on the next tick.
fn handshake_sse(
    session_id: SessionId,
    messages: mpsc::UnboundedReceiver<HandshakeMessage>,
    shutdown: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let hello = Event::default()
        .event("session")
        .data(json!({ "sessionId": session_id }).to_string());
    let events = stream::once(future::ready(hello))
        .chain(UnboundedReceiverStream::new(messages).map(|message| handshake_event(&message)))
        .map(Ok::<_, Infallible>)
        .take_until(shutdown.cancelled_owned());
    Sse::new(events).keep_alive(KeepAlive::default())
}
