//! Per-session output batching and the registry of running forwarders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use uranus_protocol::{OutputMessage, SessionId, now_millis};

use crate::dedup::DedupCache;
use crate::session::Session;
use crate::transport::{Outbound, Transport};

/// Prompt endings that suggest a command just finished.
const PROMPT_MARKERS: [&[u8]; 3] = [b"$ ", b"# ", b"> "];
/// A prompt marker only counts inside this many trailing bytes of a chunk.
const PROMPT_TAIL_BYTES: usize = 20;
const IDLE_PARK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_bytes: usize,
    pub flush_ceiling: Duration,
    pub idle_flush: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 32 * 1024,
            flush_ceiling: Duration::from_millis(500),
            idle_flush: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Ceiling,
    Boundary,
    Idle,
    Final,
}

/// True when `chunk` looks like a command's output followed by a prompt.
pub fn is_command_boundary(chunk: &[u8]) -> bool {
    if !chunk.contains(&b'\n') {
        return false;
    }
    let tail = &chunk[chunk.len().saturating_sub(PROMPT_TAIL_BYTES)..];
    PROMPT_MARKERS
        .iter()
        .any(|marker| tail.windows(marker.len()).any(|w| w == *marker))
}

/// Byte buffer with the flush rules applied on every push.
#[derive(Debug)]
pub struct Accumulator {
    policy: BatchPolicy,
    buf: Vec<u8>,
    last_flush: Instant,
}

impl Accumulator {
    pub fn new(policy: BatchPolicy, now: Instant) -> Self {
        Self {
            policy,
            buf: Vec::with_capacity(policy.max_bytes),
            last_flush: now,
        }
    }

    /// Append a chunk and report whether the buffer must go out now.
    pub fn push(&mut self, chunk: &[u8], now: Instant) -> Option<FlushReason> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() >= self.policy.max_bytes {
            Some(FlushReason::Size)
        } else if now.saturating_duration_since(self.last_flush) >= self.policy.flush_ceiling {
            Some(FlushReason::Ceiling)
        } else if is_command_boundary(chunk) {
            Some(FlushReason::Boundary)
        } else {
            None
        }
    }

    /// Whether anything beyond an incomplete UTF-8 tail is buffered.
    pub fn has_flushable(&self) -> bool {
        self.buf.len() > incomplete_utf8_tail(&self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// When the idle timer fires, capped by the flush ceiling.
    pub fn idle_deadline(&self, last_byte: Instant) -> Instant {
        (last_byte + self.policy.idle_flush).min(self.ceiling_deadline())
    }

    fn ceiling_deadline(&self) -> Instant {
        self.last_flush + self.policy.flush_ceiling
    }

    /// Next time the buffer needs attention, or `None` when it is empty.
    /// A lone held tail waits for the ceiling rather than the idle timer.
    pub fn deadline(&self, last_byte: Instant) -> Option<Instant> {
        if self.has_flushable() {
            Some(self.idle_deadline(last_byte))
        } else if self.buf.is_empty() {
            None
        } else {
            Some(self.ceiling_deadline())
        }
    }

    /// A held tail that outlived the flush ceiling.
    pub fn tail_expired(&self, now: Instant) -> bool {
        !self.buf.is_empty() && !self.has_flushable() && now >= self.ceiling_deadline()
    }

    /// Drain the buffer as text. Unless `last` is set, an incomplete UTF-8
    /// sequence at the end stays buffered for the next batch.
    pub fn take(&mut self, now: Instant, last: bool) -> Option<String> {
        self.last_flush = now;
        let cut = if last {
            self.buf.len()
        } else {
            self.buf.len() - incomplete_utf8_tail(&self.buf)
        };
        if cut == 0 {
            return None;
        }
        let rest = self.buf.split_off(cut);
        let batch = std::mem::replace(&mut self.buf, rest);
        Some(String::from_utf8_lossy(&batch).into_owned())
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

struct ForwardContext {
    transport: Arc<dyn Transport>,
    topic: String,
    policy: BatchPolicy,
    dedup: Arc<Mutex<DedupCache>>,
}

struct Forwarding {
    generation: u64,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// At most one running forwarder per session.
pub struct ForwardingRegistry {
    active: RwLock<HashMap<SessionId, Forwarding>>,
    dedup: Arc<Mutex<DedupCache>>,
    policy: BatchPolicy,
    next_generation: AtomicU64,
}

impl ForwardingRegistry {
    pub fn new(policy: BatchPolicy, dedup: DedupCache) -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
            dedup: Arc::new(Mutex::new(dedup)),
            policy,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start forwarding `session` output to `topic` on `transport`.
    ///
    /// A forwarder already running for the same session is stopped and
    /// awaited first, so its final batch is published before ours begins.
    pub async fn start(
        self: &Arc<Self>,
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
    ) {
        lock(&self.dedup).evict(Instant::now());

        let id = session.id().to_string();
        let previous = self.active.write().await.remove(&id);
        if let Some(previous) = previous {
            debug!(session_id = %id, "replacing active forwarder");
            previous.stop.cancel();
            if let Err(err) = previous.task.await {
                warn!(session_id = %id, error = %err, "previous forwarder failed");
            }
        }

        let ctx = ForwardContext {
            transport,
            topic: topic.into(),
            policy: self.policy,
            dedup: Arc::clone(&self.dedup),
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let registry = Arc::downgrade(self);

        let mut active = self.active.write().await;
        let task = {
            let stop = stop.clone();
            let id = id.clone();
            tokio::spawn(async move {
                forward(session, ctx, stop).await;
                if let Some(registry) = registry.upgrade() {
                    registry.finished(&id, generation).await;
                }
            })
        };
        let displaced = active.insert(
            id,
            Forwarding {
                generation,
                stop,
                task,
            },
        );
        drop(active);

        if let Some(displaced) = displaced {
            displaced.stop.cancel();
        }
    }

    /// Stop the forwarder for `id` without touching the session itself.
    pub async fn stop(&self, id: &str) -> bool {
        let Some(forwarding) = self.active.write().await.remove(id) else {
            return false;
        };
        forwarding.stop.cancel();
        let _ = forwarding.task.await;
        true
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Forwarding> = self.active.write().await.drain().map(|(_, f)| f).collect();
        for forwarding in &drained {
            forwarding.stop.cancel();
        }
        for forwarding in drained {
            let _ = forwarding.task.await;
        }
    }

    pub async fn is_forwarding(&self, id: &str) -> bool {
        self.active.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn dedup_len(&self) -> usize {
        lock(&self.dedup).len()
    }

    async fn finished(&self, id: &str, generation: u64) {
        let mut active = self.active.write().await;
        if active.get(id).is_some_and(|f| f.generation == generation) {
            active.remove(id);
        }
    }
}

impl Default for ForwardingRegistry {
    fn default() -> Self {
        Self::new(BatchPolicy::default(), DedupCache::default())
    }
}

async fn forward(session: Arc<Session>, ctx: ForwardContext, stop: CancellationToken) {
    let id = session.id().to_string();
    let mut rx = tokio::select! {
        _ = stop.cancelled() => return,
        guard = session.output() => guard,
    };
    let done = session.done();
    let mut acc = Accumulator::new(ctx.policy, Instant::now());
    let mut last_byte = Instant::now();
    debug!(session_id = %id, "forwarder started");

    loop {
        let deadline = acc
            .deadline(last_byte)
            .unwrap_or_else(|| Instant::now() + IDLE_PARK);

        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                flush(&id, &ctx, &mut acc, FlushReason::Final).await;
                break;
            }
            chunk = rx.recv() => {
                let Some(chunk) = chunk else {
                    flush(&id, &ctx, &mut acc, FlushReason::Final).await;
                    break;
                };
                let now = Instant::now();
                last_byte = now;
                if let Some(reason) = acc.push(&chunk, now) {
                    flush(&id, &ctx, &mut acc, reason).await;
                }
            }
            _ = done.cancelled() => {
                while let Ok(chunk) = rx.try_recv() {
                    if let Some(reason) = acc.push(&chunk, Instant::now()) {
                        flush(&id, &ctx, &mut acc, reason).await;
                    }
                }
                flush(&id, &ctx, &mut acc, FlushReason::Final).await;
                break;
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                if acc.has_flushable() {
                    flush(&id, &ctx, &mut acc, FlushReason::Idle).await;
                } else if acc.tail_expired(Instant::now()) {
                    flush(&id, &ctx, &mut acc, FlushReason::Ceiling).await;
                }
            }
        }
    }
    debug!(session_id = %id, "forwarder stopped");
}

async fn flush(session_id: &str, ctx: &ForwardContext, acc: &mut Accumulator, reason: FlushReason) {
    let now = Instant::now();
    // A ceiling flush with nothing but a held tail releases the tail as-is.
    let last = reason == FlushReason::Final || (reason == FlushReason::Ceiling && !acc.has_flushable());
    let Some(text) = acc.take(now, last) else {
        return;
    };
    let timestamp = now_millis();
    let key = DedupCache::key(session_id, timestamp, text.as_bytes());
    if lock(&ctx.dedup).record(key, now) {
        debug!(session_id, "identical output batch repeated");
    }

    let bytes = text.len();
    let message = Outbound::Output(OutputMessage::new(session_id, text, timestamp));
    match ctx.transport.publish(&ctx.topic, message).await {
        Ok(()) => debug!(session_id, bytes, ?reason, "output batch published"),
        Err(err) => warn!(session_id, error = %err, "failed to publish output batch"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
