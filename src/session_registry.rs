use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(2 * 60);

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type SharedSessionRegistry = Arc<RwLock<SessionRegistry>>;

/// One browser preview that has pinged "start".
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: String,
    pub title: String,
    pub started_at: SystemTime,
}

/// Serialized view of a session, as listed by `GET /sessions`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    /// Milliseconds since the Unix epoch.
    pub started_at: u64,
    pub age_minutes: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Active {
        count: usize,
        session_id: String,
        title: String,
    },
    Inactive {
        count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

pub struct SessionRegistry {
    sessions: HashMap<String, StreamSession>,
    timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: HashMap::new(),
            timeout,
            events,
        }
    }

    pub fn into_shared(self) -> SharedSessionRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Upsert a session and return the number of active sessions.
    pub fn start(&mut self, id: &str, title: &str) -> usize {
        self.start_at(id, title, SystemTime::now())
    }

    fn start_at(&mut self, id: &str, title: &str, now: SystemTime) -> usize {
        let was_idle = self.sessions.is_empty();
        self.sessions.insert(
            id.to_string(),
            StreamSession {
                id: id.to_string(),
                title: title.to_string(),
                started_at: now,
            },
        );

        let count = self.sessions.len();
        if was_idle {
            info!("Preview session {} ({}) started, streaming is active", id, title);
            self.emit(SessionEvent::Active {
                count,
                session_id: id.to_string(),
                title: title.to_string(),
            });
        } else {
            debug!("Preview session {} refreshed, {} active", id, count);
        }
        count
    }

    /// Remove a session. Unknown ids are ignored.
    pub fn stop(&mut self, id: &str) -> usize {
        if self.sessions.remove(id).is_some() {
            info!("Preview session {} stopped", id);
            if self.sessions.is_empty() {
                self.emit(SessionEvent::Inactive {
                    count: 0,
                    reason: None,
                });
            }
        }
        self.sessions.len()
    }

    /// Drop every session and return how many were removed.
    pub fn clear_all(&mut self) -> usize {
        let cleared = self.sessions.len();
        self.sessions.clear();
        if cleared > 0 {
            info!("Cleared {} preview sessions", cleared);
            self.emit(SessionEvent::Inactive {
                count: 0,
                reason: Some("manual_clear".to_string()),
            });
        }
        cleared
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.list_at(SystemTime::now())
    }

    fn list_at(&self, now: SystemTime) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                title: s.title.clone(),
                started_at: epoch_millis(s.started_at),
                age_minutes: age(s.started_at, now).as_secs() / 60,
            })
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Evict sessions older than the timeout; returns how many were evicted.
    pub fn reap(&mut self) -> usize {
        self.reap_at(SystemTime::now())
    }

    fn reap_at(&mut self, now: SystemTime) -> usize {
        let before = self.sessions.len();
        let timeout = self.timeout;
        self.sessions.retain(|id, session| {
            let keep = age(session.started_at, now) <= timeout;
            if !keep {
                info!("Preview session {} expired without a stop signal", id);
            }
            keep
        });

        let evicted = before - self.sessions.len();
        if evicted > 0 && self.sessions.is_empty() {
            self.emit(SessionEvent::Inactive {
                count: 0,
                reason: Some("session_cleanup".to_string()),
            });
        }
        evicted
    }

    pub fn is_active(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

/// Run `reap` on a fixed interval until the returned handle is aborted.
pub fn spawn_reaper(
    registry: SharedSessionRegistry,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = registry.write().await.reap();
            if evicted > 0 {
                debug!("Session reaper evicted {} sessions", evicted);
            }
        }
    })
}

fn age(started_at: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(started_at).unwrap_or(Duration::ZERO)
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
