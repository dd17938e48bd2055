//! Session routing
//!
//! A session is one conversation between a sender and the backend on one
//! channel instance. Messages for the same [`SessionKey`] are processed
//! strictly in arrival order; different keys proceed concurrently.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::Clock;
use crate::backend::{Backend, Role, SessionContext, Turn};
use crate::channels::InboundMessage;
use crate::sync::OrderedLanes;

/// Identifies one conversation: `(channel instance, sender id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub instance: String,
    pub sender_id: String,
}

impl SessionKey {
    #[must_use]
    pub fn new(instance: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            sender_id: sender_id.into(),
        }
    }

    /// Key of the conversation a message belongs to
    #[must_use]
    pub fn of(message: &InboundMessage) -> Self {
        Self::new(message.instance.clone(), message.sender_id.clone())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance, self.sender_id)
    }
}

/// Accumulated conversation state
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub history: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

impl Session {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            history: Vec::new(),
            created_at: now,
            last_activity: now,
            message_count: 0,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        now - self.last_activity >= idle_timeout
    }
}

/// Read-only view of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub instance: String,
    pub sender_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

/// Session policy
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Inactivity after which a session is closed
    pub idle_timeout: Duration,
    /// Turns kept per session
    pub max_history: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::minutes(30),
            max_history: 50,
        }
    }
}

type SessionSlot = Arc<tokio::sync::Mutex<Session>>;

/// Maps session keys to sessions and forwards approved messages to the backend
pub struct SessionRouter {
    sessions: Mutex<HashMap<SessionKey, SessionSlot>>,
    lanes: OrderedLanes<SessionKey>,
    backend: Arc<dyn Backend>,
    settings: SessionSettings,
    clock: Clock,
}

impl SessionRouter {
    /// Create a router in front of `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, settings: SessionSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            lanes: OrderedLanes::new(),
            backend,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Queue work for a session key
    ///
    /// Jobs for the same key run one at a time in the order `enqueue` was
    /// called; jobs for different keys run concurrently. Resolves to `None`
    /// if the job panicked.
    pub fn enqueue<T: Send + 'static>(
        &self,
        key: SessionKey,
        job: impl Future<Output = T> + Send + 'static,
    ) -> BoxFuture<'static, Option<T>> {
        self.lanes.submit(key, job)
    }

    /// Record an approved message in its session and ask the backend for a reply
    ///
    /// Backend errors and panics are logged and produce no reply.
    pub async fn route(&self, message: &InboundMessage) -> Option<String> {
        let key = SessionKey::of(message);
        let slot = self.slot(&key);
        let mut session = slot.lock().await;

        let now = (self.clock)();
        if session.message_count > 0 && session.is_expired(now, self.settings.idle_timeout) {
            tracing::info!(session = %key, old_session_id = %session.id, "session expired, starting fresh");
            *session = Session::fresh(now);
        }

        let context = SessionContext {
            session_id: session.id.clone(),
            history: session.history.clone(),
        };
        session.history.push(Turn {
            role: Role::User,
            text: message.text.clone(),
        });
        session.message_count += 1;
        session.last_activity = now;

        let outcome = AssertUnwindSafe(self.backend.respond(message, &context))
            .catch_unwind()
            .await;

        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(session = %key, error = %e, "backend failed");
                None
            }
            Err(_) => {
                tracing::error!(session = %key, "backend panicked");
                None
            }
        };

        if let Some(text) = &reply {
            session.history.push(Turn {
                role: Role::Assistant,
                text: text.clone(),
            });
        }
        let excess = session.history.len().saturating_sub(self.settings.max_history);
        session.history.drain(..excess);
        session.last_activity = (self.clock)();

        reply
    }

    fn slot(&self, key: &SessionKey) -> SessionSlot {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = sessions.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(session = %key, "session created");
            Arc::new(tokio::sync::Mutex::new(Session::fresh((self.clock)())))
        });
        Arc::clone(slot)
    }

    /// Close a session; the next message for `key` starts a fresh one
    ///
    /// Returns true if a session existed.
    pub fn close_session(&self, key: &SessionKey) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if removed {
            tracing::info!(session = %key, "session closed");
        }
        removed
    }

    /// Snapshot of live sessions, sorted by key
    ///
    /// Sessions busy with a message are reported from their last idle state
    /// and skipped if they have never completed one.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let now = (self.clock)();
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .filter_map(|(key, slot)| {
                let session = slot.try_lock().ok()?;
                if session.message_count > 0 && session.is_expired(now, self.settings.idle_timeout) {
                    return None;
                }
                Some(SessionInfo {
                    instance: key.instance.clone(),
                    sender_id: key.sender_id.clone(),
                    session_id: session.id.clone(),
                    created_at: session.created_at,
                    last_activity: session.last_activity,
                    message_count: session.message_count,
                })
            })
            .collect();
        infos.sort_by(|a, b| (&a.instance, &a.sender_id).cmp(&(&b.instance, &b.sender_id)));
        infos
    }

    /// Drop sessions idle past the timeout; returns how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = (self.clock)();
        let idle = self.settings.idle_timeout;
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        // A locked session is mid-message and therefore not idle
        sessions.retain(|_, slot| slot.try_lock().map_or(true, |s| !s.is_expired(now, idle)));
        let pruned = before - sessions.len();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned expired sessions");
        }
        pruned
    }

    /// Number of tracked sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no session is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::Result;
    use crate::channels::ChannelType;

    fn msg(instance: &str, sender: &str, text: &str) -> InboundMessage {
        InboundMessage {
            channel_type: ChannelType::WEB,
            instance: instance.to_string(),
            sender_id: sender.to_string(),
            sender_label: sender.to_string(),
            text: text.to_string(),
            thread_id: None,
            received_at: Utc::now(),
        }
    }

    /// Replies with the session id and history length
    struct Recorder;

    #[async_trait]
    impl Backend for Recorder {
        async fn respond(&self, _m: &InboundMessage, s: &SessionContext) -> Result<Option<String>> {
            Ok(Some(format!("{}:{}", s.session_id, s.history.len())))
        }
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl Backend for Failing {
        async fn respond(&self, m: &InboundMessage, _s: &SessionContext) -> Result<Option<String>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => Err(crate::Error::Backend("down".to_string())),
                1 => panic!("backend bug"),
                _ => Ok(Some(m.text.clone())),
            }
        }
    }

    fn split(reply: &str) -> (String, usize) {
        let (id, len) = reply.rsplit_once(':').unwrap();
        (id.to_string(), len.parse().unwrap())
    }

    #[tokio::test]
    async fn messages_accumulate_in_one_session() {
        let router = SessionRouter::new(Arc::new(Recorder), SessionSettings::default());
        let (id1, len1) = split(&router.route(&msg("web", "u1", "a")).await.unwrap());
        let (id2, len2) = split(&router.route(&msg("web", "u1", "b")).await.unwrap());

        assert_eq!(id1, id2);
        assert_eq!(len1, 0);
        assert_eq!(len2, 2);

        // Same sender on another instance is a different conversation
        let (id3, _) = split(&router.route(&msg("other", "u1", "c")).await.unwrap());
        assert_ne!(id1, id3);
        assert_eq!(router.len(), 2);
    }

    #[tokio::test]
    async fn idle_session_starts_fresh() {
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = Arc::clone(&now);
        let router = SessionRouter::new(
            Arc::new(Recorder),
            SessionSettings {
                idle_timeout: Duration::minutes(5),
                max_history: 50,
            },
        )
        .with_clock(Arc::new(move || *clock_now.lock().unwrap()));

        let (id1, _) = split(&router.route(&msg("web", "u1", "a")).await.unwrap());
        *now.lock().unwrap() += Duration::minutes(6);
        let (id2, len) = split(&router.route(&msg("web", "u1", "b")).await.unwrap());

        assert_ne!(id1, id2);
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn close_session_forgets_context() {
        let router = SessionRouter::new(Arc::new(Recorder), SessionSettings::default());
        let (id1, _) = split(&router.route(&msg("web", "u1", "a")).await.unwrap());

        assert!(router.close_session(&SessionKey::new("web", "u1")));
        assert!(!router.close_session(&SessionKey::new("web", "u1")));

        let (id2, len) = split(&router.route(&msg("web", "u1", "b")).await.unwrap());
        assert_ne!(id1, id2);
        assert_eq!(len, 0);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let router = SessionRouter::new(
            Arc::new(Recorder),
            SessionSettings {
                idle_timeout: Duration::minutes(30),
                max_history: 3,
            },
        );
        for text in ["a", "b", "c", "d"] {
            router.route(&msg("web", "u1", text)).await;
        }
        let (_, len) = split(&router.route(&msg("web", "u1", "e")).await.unwrap());
        assert_eq!(len, 3);
    }

    #[tokio::test]
    async fn backend_failures_yield_no_reply() {
        let router = SessionRouter::new(Arc::new(Failing(AtomicUsize::new(0))), SessionSettings::default());
        assert_eq!(router.route(&msg("web", "u1", "one")).await, None);
        assert_eq!(router.route(&msg("web", "u1", "two")).await, None);
        assert_eq!(router.route(&msg("web", "u1", "three")).await.as_deref(), Some("three"));
    }

    #[tokio::test]
    async fn prune_and_list() {
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = Arc::clone(&now);
        let router = SessionRouter::new(Arc::new(Recorder), SessionSettings::default())
            .with_clock(Arc::new(move || *clock_now.lock().unwrap()));

        router.route(&msg("web", "old", "x")).await;
        *now.lock().unwrap() += Duration::minutes(20);
        router.route(&msg("web", "new", "x")).await;

        let listed: Vec<_> = router.list_sessions().into_iter().map(|s| s.sender_id).collect();
        assert_eq!(listed, vec!["new", "old"]);

        *now.lock().unwrap() += Duration::minutes(15);
        assert_eq!(router.prune_expired(), 1);
        let listed: Vec<_> = router.list_sessions().into_iter().map(|s| s.sender_id).collect();
        assert_eq!(listed, vec!["new"]);
    }

    #[tokio::test]
    async fn enqueue_orders_same_key() {
        let router = Arc::new(SessionRouter::new(Arc::new(Recorder), SessionSettings::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for i in 0..10_u64 {
            let seen = Arc::clone(&seen);
            pending.push(router.enqueue(SessionKey::new("web", "u1"), async move {
                tokio::time::sleep(std::time::Duration::from_millis(10 - i)).await;
                seen.lock().unwrap().push(i);
            }));
        }
        futures::future::join_all(pending).await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }
}
