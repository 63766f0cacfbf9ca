use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use uranus_protocol::SessionId;

use crate::error::AgentError;
use crate::escalation::EscalationStage;
use crate::session::{Session, SessionInfo, SessionOptions};

/// Owns every live [`Session`], at most one per identifier.
///
/// The map lock only guards lookups and mutations; spawning and teardown
/// happen outside it.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn and register a new session. Fails if a live one holds `id`.
    pub async fn create(
        self: &Arc<Self>,
        id: &str,
        options: SessionOptions,
    ) -> Result<Arc<Session>, AgentError> {
        if self.live(id).await.is_some() {
            return Err(AgentError::SessionAlreadyExists(id.to_string()));
        }

        let session = Session::spawn(id, options)?;

        let mut sessions = self.sessions.write().await;
        if sessions.get(id).is_some_and(|s| s.is_alive()) {
            drop(sessions);
            // Lost a creation race; discard our spawn.
            tokio::spawn(async move {
                session.close().await;
            });
            return Err(AgentError::SessionAlreadyExists(id.to_string()));
        }
        let replaced = sessions.insert(id.to_string(), Arc::clone(&session));
        drop(sessions);

        if let Some(stale) = replaced {
            tokio::spawn(async move {
                stale.close().await;
            });
        }
        self.watch_exit(&session);
        Ok(session)
    }

    /// Return the live session for `id`, or create it. The flag is true when
    /// an existing session was reused.
    pub async fn get_or_create(
        self: &Arc<Self>,
        id: &str,
        options: SessionOptions,
    ) -> Result<(Arc<Session>, bool), AgentError> {
        if let Some(session) = self.live(id).await {
            return Ok((session, true));
        }
        match self.create(id, options).await {
            Ok(session) => Ok((session, false)),
            Err(AgentError::SessionAlreadyExists(_)) => self
                .live(id)
                .await
                .map(|s| (s, true))
                .ok_or_else(|| AgentError::SessionNotFound(id.to_string())),
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, AgentError> {
        self.live(id)
            .await
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))
    }

    /// Remove `id` and tear its session down.
    pub async fn close(&self, id: &str) -> Result<Option<EscalationStage>, AgentError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;
        Ok(session.close().await)
    }

    /// Drain the map and close everything. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = drained.len();
        join_all(drained.iter().map(|s| s.close())).await;
        if count > 0 {
            info!(count, "closed all sessions");
        }
        count
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info())
            .collect();
        infos.sort_by_key(|i| i.created_at_ms);
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close sessions without input or output for longer than `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<SessionId> {
        let idle: Vec<SessionId> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for() >= max_idle)
            .map(|s| s.id().to_string())
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for id in idle {
            if self.close(&id).await.is_ok() {
                info!(session_id = %id, idle_secs = max_idle.as_secs(), "closed idle session");
                reaped.push(id);
            }
        }
        reaped
    }

    /// Periodically run [`reap_idle`](Self::reap_idle) until `shutdown` fires.
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        every: Duration,
        max_idle: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.reap_idle(max_idle).await;
                    }
                }
            }
        })
    }

    async fn live(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .filter(|s| s.is_alive())
            .cloned()
    }

    /// Drop the map entry once the session finishes on its own.
    fn watch_exit(self: &Arc<Self>, session: &Arc<Session>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let done = session.done();
        let watched = Arc::downgrade(session);
        let id = session.id().to_string();
        tokio::spawn(async move {
            done.cancelled().await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut sessions = registry.sessions.write().await;
            let same = sessions
                .get(&id)
                .is_some_and(|current| Weak::ptr_eq(&Arc::downgrade(current), &watched));
            if same {
                sessions.remove(&id);
                debug!(session_id = %id, "finished session removed from registry");
            }
        });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
