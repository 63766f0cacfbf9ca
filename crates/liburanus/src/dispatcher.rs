use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use uranus_protocol::{
    Command, CommandMessage, ErrorCode, NginxAction, Request, ResponseMessage, SessionId,
    TerminalOp, Topics,
};

use crate::error::AgentError;
use crate::escalation::EscalationPolicy;
use crate::exec::{self, DEFAULT_EXEC_TIMEOUT};
use crate::forwarder::ForwardingRegistry;
use crate::nginx::{NGINX_DOWN, NGINX_OK, NginxControl};
use crate::registry::SessionRegistry;
use crate::session::{DEFAULT_QUEUE_CAPACITY, SessionOptions};
use crate::shell::resolve_shell;
use crate::transport::{Outbound, Transport};
use crate::update::Updater;

const INBOUND_QUEUE: usize = 256;

/// Knobs fixed at startup.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub default_shell: Option<PathBuf>,
    pub queue_capacity: usize,
    pub exec_timeout: Duration,
    /// Pause between a successful nginx stop and the start of a restart.
    pub restart_delay: Duration,
    pub escalation: EscalationPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_shell: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            restart_delay: Duration::from_millis(500),
            escalation: EscalationPolicy::default(),
        }
    }
}

/// Routes decoded commands to sessions and collaborators and turns every
/// outcome into a [`ResponseMessage`].
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    forwarding: Arc<ForwardingRegistry>,
    nginx: Arc<dyn NginxControl>,
    updater: Arc<dyn Updater>,
    topics: Topics,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        forwarding: Arc<ForwardingRegistry>,
        nginx: Arc<dyn NginxControl>,
        updater: Arc<dyn Updater>,
        topics: Topics,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            forwarding,
            nginx,
            updater,
            topics,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn forwarding(&self) -> &Arc<ForwardingRegistry> {
        &self.forwarding
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Decode a raw payload. Failures come back as a ready-to-send error
    /// response that keeps whatever correlation id could be recovered.
    pub fn decode(payload: &[u8]) -> Result<Request, Box<ResponseMessage>> {
        CommandMessage::decode(payload)
            .and_then(CommandMessage::into_request)
            .map_err(|err| {
                let (command, request_id) = salvage_envelope(payload);
                let (code, message) = AgentError::from(err).to_error_code();
                Box::new(ResponseMessage::error(command, request_id, code, message))
            })
    }

    /// Decode, dispatch and publish the response for one inbound payload.
    pub async fn handle(&self, payload: &[u8], transport: &Arc<dyn Transport>) {
        let response = match Self::decode(payload) {
            Ok(request) => self.dispatch(request, transport).await,
            Err(response) => {
                warn!(request_id = %response.request_id, message = %response.message, "rejected command payload");
                *response
            }
        };
        self.respond(transport, response).await;
    }

    pub async fn respond(&self, transport: &Arc<dyn Transport>, response: ResponseMessage) {
        let request_id = response.request_id.clone();
        if let Err(err) = transport
            .publish(&self.topics.response(), Outbound::Response(response))
            .await
        {
            warn!(%request_id, error = %err, "failed to publish response");
        }
    }

    /// Subscribe to this agent's command topic and handle messages until
    /// `shutdown` fires.
    ///
    /// Create, input and resize are handled one at a time in arrival order,
    /// so input for a session is never reordered. Long-running commands,
    /// session close included, get their own task.
    pub async fn serve(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE);
        let pattern = self.topics.command();
        transport.subscribe(&pattern, tx).await?;
        info!(topic = %pattern, "listening for commands");

        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => break,
                inbound = rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            let request = match Self::decode(&inbound.payload) {
                Ok(request) => request,
                Err(response) => {
                    warn!(topic = %inbound.topic, message = %response.message, "rejected command payload");
                    self.respond(&transport, *response).await;
                    continue;
                }
            };

            if request.command.is_long_running() {
                let this = Arc::clone(&self);
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let response = this.dispatch(request, &transport).await;
                    this.respond(&transport, response).await;
                });
            } else {
                let response = self.dispatch(request, &transport).await;
                self.respond(&transport, response).await;
            }
        }
        debug!("command loop stopped");
        Ok(())
    }

    /// Execute one request. Never fails: errors become failed responses.
    pub async fn dispatch(&self, request: Request, transport: &Arc<dyn Transport>) -> ResponseMessage {
        let Request {
            request_id,
            name,
            command,
            ..
        } = request;
        debug!(%request_id, command = %name, "dispatching");

        match command {
            Command::Terminal { session_id, op } => {
                match self.terminal(&session_id, op, &name, &request_id, transport).await {
                    Ok(response) => response,
                    Err(err) => failure(&name, &request_id, &err).with_session(session_id),
                }
            }
            Command::Nginx(action) => self.nginx(action, &name, &request_id).await,
            Command::Status => {
                let running = self.nginx.status().await != NGINX_DOWN;
                ResponseMessage::ok(&name, &request_id, "status").with_data(json!({ "nginx": running }))
            }
            Command::Execute { command } => {
                match exec::run_command(&command, self.settings.exec_timeout).await {
                    Ok(output) => {
                        ResponseMessage::ok(&name, &request_id, "command executed").with_output(output)
                    }
                    Err(err) => {
                        warn!(%request_id, error = %err, "execute failed");
                        failure(&name, &request_id, &err)
                    }
                }
            }
            Command::Update { url } => {
                let updater = Arc::clone(&self.updater);
                tokio::spawn(async move {
                    if let Err(err) = updater.update(url).await {
                        warn!(error = %format!("{err:#}"), "self-update failed");
                    }
                });
                ResponseMessage::ok(&name, &request_id, "update started")
            }
            Command::Sessions => {
                let sessions = self.registry.list().await;
                let count = sessions.len();
                ResponseMessage::ok(&name, &request_id, format!("{count} session(s)"))
                    .with_data(serde_json::to_value(sessions).unwrap_or(Value::Null))
            }
        }
    }

    async fn terminal(
        &self,
        session_id: &SessionId,
        op: TerminalOp,
        name: &str,
        request_id: &str,
        transport: &Arc<dyn Transport>,
    ) -> Result<ResponseMessage, AgentError> {
        match op {
            TerminalOp::Create { shell, rows, cols } => {
                let (session, reused) = match self.registry.get(session_id).await {
                    Ok(session) => (session, true),
                    Err(_) => {
                        let shell =
                            resolve_shell(shell.as_deref(), self.settings.default_shell.as_deref())?;
                        let mut options = SessionOptions::new(shell).with_geometry(rows, cols);
                        options.queue_capacity = self.settings.queue_capacity;
                        options.escalation = self.settings.escalation;
                        self.registry.get_or_create(session_id, options).await?
                    }
                };

                if reused
                    && let (Some(rows), Some(cols)) = (rows, cols)
                    && let Err(err) = session.resize(rows, cols)
                {
                    debug!(%session_id, error = %err, "resize on reuse failed");
                }

                self.forwarding
                    .start(Arc::clone(&session), Arc::clone(transport), self.topics.response())
                    .await;

                let (message, kind) = if reused {
                    info!(%session_id, "session reused");
                    ("session reused", "reused")
                } else {
                    info!(%session_id, shell = %session.shell().display(), pid = ?session.pid(), "session created");
                    ("session created", "created")
                };
                Ok(ResponseMessage::ok(name, request_id, message)
                    .with_session(session_id.clone())
                    .with_kind(kind)
                    .with_data(json!({ "pid": session.pid() })))
            }
            TerminalOp::Input { data } => {
                let session = self.registry.get(session_id).await?;
                session.send_input(data)?;
                Ok(ResponseMessage::ok(name, request_id, "input accepted")
                    .with_session(session_id.clone())
                    .with_kind("input"))
            }
            TerminalOp::Resize { rows, cols } => {
                let session = self.registry.get(session_id).await?;
                session.resize(rows, cols)?;
                Ok(ResponseMessage::ok(name, request_id, format!("resized to {rows}x{cols}"))
                    .with_session(session_id.clone())
                    .with_kind("resized"))
            }
            TerminalOp::Close => {
                let stage = self.registry.close(session_id).await?;
                info!(%session_id, ?stage, "session closed");
                Ok(ResponseMessage::ok(name, request_id, "session closed")
                    .with_session(session_id.clone())
                    .with_kind("closed"))
            }
        }
    }

    async fn nginx(&self, action: NginxAction, name: &str, request_id: &str) -> ResponseMessage {
        let result = match action {
            NginxAction::Reload => self.nginx.reload().await,
            NginxAction::Start => self.nginx.start().await,
            NginxAction::Stop => self.nginx.stop().await,
            NginxAction::Restart => {
                let stopped = self.nginx.stop().await;
                if stopped != NGINX_OK {
                    warn!(result = %stopped, "nginx stop failed, not starting");
                    return ResponseMessage::error(
                        name,
                        request_id,
                        ErrorCode::ServerError,
                        format!("nginx restart failed: stop returned {stopped}"),
                    );
                }
                tokio::time::sleep(self.settings.restart_delay).await;
                self.nginx.start().await
            }
        };

        if result == NGINX_OK {
            ResponseMessage::ok(name, request_id, format!("nginx {} succeeded", action.as_str()))
        } else {
            warn!(action = action.as_str(), %result, "nginx command failed");
            ResponseMessage::error(
                name,
                request_id,
                ErrorCode::ServerError,
                format!("nginx {} failed: {result}", action.as_str()),
            )
        }
    }
}

fn failure(name: &str, request_id: &str, err: &AgentError) -> ResponseMessage {
    let (code, message) = err.to_error_code();
    ResponseMessage::error(name, request_id, code, message)
}

/// Best-effort recovery of `command` and `requestId` from a payload that
/// did not decode.
fn salvage_envelope(payload: &[u8]) -> (String, String) {
    let value: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
    let field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let mut command = field("command");
    if command.is_empty() {
        command = "unknown".to_string();
    }
    (command, field("requestId"))
}
