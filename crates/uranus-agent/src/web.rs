use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use liburanus::{AgentError, ChannelTransport, Dispatcher, Outbound, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use uranus_protocol::{ControlMessage, ResponseMessage};

const OUTBOUND_QUEUE: usize = 256;
const TERMINATE_GRACE: Duration = Duration::from_millis(100);
/// How long to keep relaying output after the shell exits on its own.
const EXIT_DRAIN: Duration = Duration::from_millis(300);
const CTRL_C: u8 = 0x03;

type WsSink = SplitSink<WebSocket, Message>;

#[derive(Clone)]
pub struct WebState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalQuery {
    session_id: Option<String>,
    shell: Option<String>,
    rows: Option<u16>,
    cols: Option<u16>,
}

enum Flow {
    Continue,
    /// Leave the session to its other owners.
    Detach,
    /// End the session even if this socket did not create it.
    Terminate,
}

pub fn router(state: Arc<WebState>, allow_origins: &[String]) -> Result<Router> {
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/terminal", get(ws_terminal))
        .layer(build_cors(allow_origins)?)
        .with_state(state))
}

/// Serve the direct-socket listener until `shutdown` fires.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("failed to read listener address")?;
    info!(%addr, "direct terminal listener ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server failed")
}

fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

async fn healthz(State(state): State<Arc<WebState>>) -> Json<Value> {
    let sessions = state.dispatcher.registry().len().await;
    Json(json!({ "status": "ok", "sessions": sessions }))
}

async fn ws_terminal(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
    Query(query): Query<TerminalQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| terminal_task(socket, state, query))
}

async fn terminal_task(socket: WebSocket, state: Arc<WebState>, query: TerminalQuery) {
    if let Err(err) = terminal_inner(socket, state, query).await {
        warn!(error = %err, "terminal socket closed with error");
    }
}

async fn terminal_inner(socket: WebSocket, state: Arc<WebState>, query: TerminalQuery) -> Result<()> {
    let session_id = query
        .session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (channel, mut published) = ChannelTransport::new(OUTBOUND_QUEUE);
    let transport: Arc<dyn Transport> = Arc::new(channel);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let created = dispatch_control(&state, &transport, create_control(&session_id, &query)).await;
    send_json(&mut ws_tx, &created).await?;
    if !created.success {
        return Ok(());
    }
    // A socket that attached to someone else's live session only detaches.
    let owns_session = created.kind.as_deref() == Some("created");
    info!(%session_id, owns_session, "terminal socket attached");

    let done = state.dispatcher.registry().get(&session_id).await?.done();
    let mut exit_deadline: Option<Instant> = None;
    let mut terminate = false;

    let result = async {
        loop {
            tokio::select! {
                publication = published.recv() => {
                    let Some(publication) = publication else {
                        break;
                    };
                    match publication.message {
                        Outbound::Output(output) => {
                            if output.session_id == session_id {
                                ws_tx.send(Message::Binary(output.data.into_bytes().into())).await?;
                            }
                        }
                        other => {
                            let text = String::from_utf8(other.to_json()?)?;
                            ws_tx.send(Message::Text(text.into())).await?;
                        }
                    }
                }
                maybe_msg = ws_rx.next() => {
                    let Some(msg) = maybe_msg else {
                        break;
                    };
                    match msg? {
                        Message::Binary(bytes) => {
                            send_raw(&state, &session_id, bytes.to_vec(), &mut ws_tx).await?;
                        }
                        Message::Text(text) => match parse_control(text.as_str()) {
                            Some(control) => {
                                match handle_control(&state, &transport, &session_id, control, &mut ws_tx).await? {
                                    Flow::Continue => {}
                                    Flow::Detach => break,
                                    Flow::Terminate => {
                                        terminate = true;
                                        break;
                                    }
                                }
                            }
                            None => send_raw(&state, &session_id, text.as_str().as_bytes().to_vec(), &mut ws_tx).await?,
                        },
                        Message::Close(_) => break,
                        Message::Ping(v) => ws_tx.send(Message::Pong(v)).await?,
                        Message::Pong(_) => {}
                    }
                }
                _ = done.cancelled(), if exit_deadline.is_none() => {
                    debug!(%session_id, "shell exited, draining output");
                    exit_deadline = Some(Instant::now() + EXIT_DRAIN);
                }
                _ = tokio::time::sleep_until(exit_deadline.unwrap_or_else(Instant::now)), if exit_deadline.is_some() => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    state.dispatcher.forwarding().stop(&session_id).await;
    if owns_session || terminate {
        match state.dispatcher.registry().close(&session_id).await {
            Ok(stage) => info!(%session_id, ?stage, "terminal socket detached, session closed"),
            Err(AgentError::SessionNotFound(_)) => debug!(%session_id, "terminal socket detached"),
            Err(err) => warn!(%session_id, error = %err, "failed to close session"),
        }
    } else {
        info!(%session_id, "terminal socket detached, session left running");
    }
    let _ = ws_tx.close().await;
    result
}

fn create_control(session_id: &str, query: &TerminalQuery) -> ControlMessage {
    let mut data = Map::new();
    if let Some(shell) = &query.shell {
        data.insert("shell".to_string(), json!(shell));
    }
    if let Some(rows) = query.rows {
        data.insert("rows".to_string(), json!(rows));
    }
    if let Some(cols) = query.cols {
        data.insert("cols".to_string(), json!(cols));
    }
    ControlMessage {
        kind: "create".to_string(),
        session_id: Some(session_id.to_string()),
        data: Some(Value::Object(data)),
    }
}

/// A text frame is a control message only if it is a JSON object with a
/// `type`; anything else is keyboard input.
fn parse_control(text: &str) -> Option<ControlMessage> {
    if !text.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str(text).ok()
}

async fn handle_control(
    state: &WebState,
    transport: &Arc<dyn Transport>,
    session_id: &str,
    mut control: ControlMessage,
    ws_tx: &mut WsSink,
) -> Result<Flow> {
    let kind = control.kind.clone();
    match kind.as_str() {
        "ping" => {
            send_json(ws_tx, &ControlMessage::pong()).await?;
        }
        "interrupt" => {
            send_raw(state, session_id, vec![CTRL_C], ws_tx).await?;
        }
        "terminate" => {
            send_json(ws_tx, &ControlMessage::new("terminated", None)).await?;
            tokio::time::sleep(TERMINATE_GRACE).await;
            return Ok(Flow::Terminate);
        }
        "input" => {
            let data = match control.data {
                Some(Value::String(text)) => text,
                Some(Value::Object(map)) => map
                    .get("input")
                    .or_else(|| map.get("data"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            if !data.is_empty() {
                send_raw(state, session_id, data.into_bytes(), ws_tx).await?;
            }
        }
        _ => {
            // Frames on this socket always address its own session.
            control.session_id = Some(session_id.to_string());
            let closing = kind == "close";
            let response = dispatch_control(state, transport, control).await;
            let closed = closing && response.success;
            send_json(ws_tx, &response).await?;
            if closed {
                return Ok(Flow::Detach);
            }
        }
    }
    Ok(Flow::Continue)
}

async fn dispatch_control(
    state: &WebState,
    transport: &Arc<dyn Transport>,
    control: ControlMessage,
) -> ResponseMessage {
    let request_id = uuid::Uuid::new_v4().to_string();
    let kind = control.kind.clone();
    match control.into_command_message(request_id.as_str()).into_request() {
        Ok(request) => state.dispatcher.dispatch(request, transport).await,
        Err(err) => {
            let (code, message) = AgentError::from(err).to_error_code();
            ResponseMessage::error(kind, request_id, code, message)
        }
    }
}

async fn send_raw(state: &WebState, session_id: &str, bytes: Vec<u8>, ws_tx: &mut WsSink) -> Result<()> {
    let sent = match state.dispatcher.registry().get(session_id).await {
        Ok(session) => session.send_input(bytes),
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        let (code, message) = err.to_error_code();
        let response = ResponseMessage::error("input", "", code, message).with_session(session_id);
        send_json(ws_tx, &response).await?;
    }
    Ok(())
}

async fn send_json<T: Serialize>(ws_tx: &mut WsSink, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}
