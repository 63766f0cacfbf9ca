//! End-to-end command flows through the dispatcher.
//!
//! Each test drives a real shell in a PTY and watches what would be
//! published to the broker through an in-process channel transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use liburanus::{
    AgentError, ChannelTransport, DispatchSettings, Dispatcher, ForwardingRegistry, NGINX_OK,
    NginxControl, Outbound, Publication, SessionRegistry, Transport, Updater,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uranus_protocol::{ResponseMessage, Topics};

struct ScriptedNginx {
    result: &'static str,
}

#[async_trait]
impl NginxControl for ScriptedNginx {
    async fn reload(&self) -> String {
        self.result.to_string()
    }
    async fn start(&self) -> String {
        self.result.to_string()
    }
    async fn stop(&self) -> String {
        self.result.to_string()
    }
    async fn status(&self) -> String {
        "KO".to_string()
    }
}

struct NoUpdates;

#[async_trait]
impl Updater for NoUpdates {
    async fn update(&self, _url: Option<String>) -> anyhow::Result<()> {
        anyhow::bail!("updates disabled in tests")
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    channel: Arc<ChannelTransport>,
    transport: Arc<dyn Transport>,
    published: mpsc::Receiver<Publication>,
    /// Responses read while looking for a different request id.
    stashed: Vec<ResponseMessage>,
}

impl Harness {
    fn new(nginx_result: &'static str, exec_timeout: Duration) -> Self {
        let (channel, published) = ChannelTransport::new(1024);
        let channel = Arc::new(channel);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(ForwardingRegistry::default()),
            Arc::new(ScriptedNginx {
                result: nginx_result,
            }),
            Arc::new(NoUpdates),
            Topics::new("uranus", "itest"),
            DispatchSettings {
                default_shell: Some("/bin/sh".into()),
                exec_timeout,
                ..DispatchSettings::default()
            },
        ));
        let transport: Arc<dyn Transport> = channel.clone();
        Self {
            dispatcher,
            channel,
            transport,
            published,
            stashed: Vec::new(),
        }
    }

    fn standard() -> Self {
        Self::new(NGINX_OK, Duration::from_secs(30))
    }

    async fn send(&self, command: Value) -> ResponseMessage {
        let request = Dispatcher::decode(command.to_string().as_bytes()).expect("decode command");
        self.dispatcher.dispatch(request, &self.transport).await
    }

    /// Run the broker command loop over the channel transport.
    fn serve(&self, shutdown: CancellationToken) -> JoinHandle<Result<(), AgentError>> {
        tokio::spawn(Arc::clone(&self.dispatcher).serve(Arc::clone(&self.transport), shutdown))
    }

    /// Deliver a command on the agent's command topic, retrying until the
    /// command loop has subscribed.
    async fn deliver(&self, command: Value) {
        for _ in 0..100 {
            let delivered = self
                .channel
                .deliver("uranus/command/itest", command.to_string().into_bytes())
                .await;
            if delivered > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("command loop never subscribed");
    }

    /// Next published response for `request_id`.
    async fn response_for(&mut self, request_id: &str) -> ResponseMessage {
        if let Some(pos) = self.stashed.iter().position(|r| r.request_id == request_id) {
            return self.stashed.remove(pos);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let publication = tokio::time::timeout_at(deadline, self.published.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for response {request_id}"))
                .expect("transport closed");
            if let Outbound::Response(response) = publication.message {
                if response.request_id == request_id {
                    return response;
                }
                self.stashed.push(response);
            }
        }
    }

    /// Collect output published for `session_id` until it contains `needle`.
    async fn output_until(&mut self, session_id: &str, needle: &str) -> String {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !seen.contains(needle) {
            let publication = tokio::time::timeout_at(deadline, self.published.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got: {seen:?}"))
                .expect("transport closed");
            assert_eq!(publication.topic, "uranus/response/itest");
            match publication.message {
                Outbound::Output(output) if output.session_id == session_id => {
                    seen.push_str(&output.data);
                }
                Outbound::Response(response) => self.stashed.push(response),
                _ => {}
            }
        }
        seen
    }
}

#[tokio::test]
async fn create_twice_reuses_the_live_session() {
    let h = Harness::standard();
    let first = h
        .send(json!({"command": "create", "requestId": "c1", "sessionId": "t1"}))
        .await;
    assert!(first.success, "{}", first.message);
    assert_eq!(first.request_id, "c1");
    assert_eq!(first.kind.as_deref(), Some("created"));

    let second = h
        .send(json!({"command": "terminal", "type": "create", "requestId": "c2", "sessionId": "t1"}))
        .await;
    assert!(second.success);
    assert!(second.message.contains("reused"));
    assert_eq!(h.dispatcher.registry().len().await, 1);
    assert_eq!(h.dispatcher.forwarding().len().await, 1);

    h.dispatcher.registry().close_all().await;
}

#[tokio::test]
async fn input_output_flows_back_in_order() {
    let mut h = Harness::standard();
    h.send(json!({"command": "create", "requestId": "c", "sessionId": "t1"}))
        .await;

    let resp = h
        .send(json!({"command": "input", "requestId": "i1", "sessionId": "t1", "data": "echo hi\n"}))
        .await;
    assert!(resp.success);
    h.output_until("t1", "hi").await;

    h.send(json!({"command": "input", "requestId": "i2", "sessionId": "t1", "data": "printf 'first-%s\\n' one\n"}))
        .await;
    h.send(json!({"command": "input", "requestId": "i3", "sessionId": "t1", "data": "printf 'second-%s\\n' two\n"}))
        .await;
    let seen = h.output_until("t1", "second-two").await;
    let first = seen.find("first-one").expect("first output");
    let second = seen.find("second-two").expect("second output");
    assert!(first < second, "output reordered: {seen:?}");

    h.dispatcher.registry().close_all().await;
}

#[tokio::test]
async fn resize_reaches_the_terminal() {
    let mut h = Harness::standard();
    h.send(json!({"command": "create", "requestId": "c", "sessionId": "t1"}))
        .await;

    let resp = h
        .send(json!({"command": "resize", "requestId": "r", "sessionId": "t1", "data": {"rows": 40, "cols": 120}}))
        .await;
    assert!(resp.success, "{}", resp.message);

    h.send(json!({"command": "input", "requestId": "i", "sessionId": "t1", "data": "stty size\n"}))
        .await;
    h.output_until("t1", "40 120").await;

    let missing = h
        .send(json!({"command": "resize", "requestId": "r2", "sessionId": "does-not-exist", "data": {"rows": 40, "cols": 120}}))
        .await;
    assert!(!missing.success);
    assert!(missing.message.contains("not found"));

    h.dispatcher.registry().close_all().await;
}

#[tokio::test]
async fn close_removes_the_session() {
    let h = Harness::standard();
    h.send(json!({"command": "create", "requestId": "c", "sessionId": "t1"}))
        .await;

    let resp = h
        .send(json!({"command": "close", "requestId": "x", "sessionId": "t1"}))
        .await;
    assert!(resp.success);
    assert_eq!(resp.kind.as_deref(), Some("closed"));
    assert!(h.dispatcher.registry().get("t1").await.is_err());

    let again = h
        .send(json!({"command": "close", "requestId": "x2", "sessionId": "t1"}))
        .await;
    assert!(!again.success);
    assert!(again.message.contains("not found"));
}

#[tokio::test]
async fn reload_follows_the_collaborator_result() {
    let ok = Harness::new(NGINX_OK, Duration::from_secs(30));
    let resp = ok.send(json!({"command": "reload", "requestId": "n1"})).await;
    assert!(resp.success);

    let failing = Harness::new("nginx: [emerg] bad config", Duration::from_secs(30));
    let resp = failing
        .send(json!({"command": "reload", "requestId": "n2"}))
        .await;
    assert!(!resp.success);
    assert_eq!(resp.request_id, "n2");
}

#[tokio::test]
async fn execute_times_out_and_kills_the_command() {
    let h = Harness::new(NGINX_OK, Duration::from_secs(1));
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("pid");
    let command = format!("echo $$ > {}; exec sleep 60", pid_file.display());

    let started = std::time::Instant::now();
    let resp = h
        .send(json!({"command": "execute", "requestId": "e", "params": {"command": command}}))
        .await;
    assert!(!resp.success);
    assert!(resp.message.contains("timeout"), "{}", resp.message);
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
    assert!(!alive, "sleep {pid} survived the timeout");
}

#[tokio::test]
async fn execute_returns_command_output() {
    let h = Harness::standard();
    let resp = h
        .send(json!({"command": "execute", "requestId": "e", "data": "echo from-execute"}))
        .await;
    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.output.as_deref().map(str::trim), Some("from-execute"));
}

#[tokio::test]
async fn closing_a_stubborn_session_does_not_delay_other_sessions() {
    let mut h = Harness::standard();
    let shutdown = CancellationToken::new();
    let serving = h.serve(shutdown.clone());

    h.deliver(json!({"command": "create", "requestId": "ca", "sessionId": "a"}))
        .await;
    assert!(h.response_for("ca").await.success);
    h.deliver(json!({"command": "create", "requestId": "cb", "sessionId": "b"}))
        .await;
    assert!(h.response_for("cb").await.success);

    h.deliver(json!({
        "command": "input",
        "requestId": "ia",
        "sessionId": "a",
        "data": "trap '' INT TERM; echo armed-$((2*3))\n"
    }))
    .await;
    h.output_until("a", "armed-6").await;

    h.deliver(json!({"command": "close", "requestId": "xa", "sessionId": "a"}))
        .await;
    let sent = Instant::now();
    h.deliver(json!({"command": "input", "requestId": "ib", "sessionId": "b", "data": "true\n"}))
        .await;
    let input = h.response_for("ib").await;
    let waited = sent.elapsed();
    assert!(input.success, "{}", input.message);
    assert!(
        waited < Duration::from_millis(300),
        "input for b waited {waited:?} behind the close of a"
    );

    let closed = h.response_for("xa").await;
    assert!(closed.success, "{}", closed.message);
    assert_eq!(h.dispatcher.registry().len().await, 1);

    shutdown.cancel();
    serving.await.expect("join").expect("serve");
    h.dispatcher.registry().close_all().await;
}
