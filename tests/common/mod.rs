//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Response;
use beacon_switchboard::backend::{Backend, SessionContext};
use beacon_switchboard::config::file::SwitchboardConfigFile;
use beacon_switchboard::registry::builtin_channels;
use beacon_switchboard::{Clock, Config, Daemon, DbPool, InboundMessage, Registry, db};
use chrono::{DateTime, Utc};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Configuration from a TOML snippet with no environment overrides
pub fn config(toml: &str) -> Config {
    let file = SwitchboardConfigFile::parse(toml).expect("invalid test config");
    Config::resolve(file, |_| None).expect("invalid test config")
}

/// Daemon over built-in channels, an in-memory database and `backend`
pub fn daemon(toml: &str, backend: Arc<dyn Backend>, clock: &TestClock) -> Arc<Daemon> {
    let daemon = Daemon::builder(config(toml))
        .registry(Registry::empty().builtins(builtin_channels()))
        .pool(setup_test_db())
        .backend(backend)
        .clock(clock.clock())
        .build()
        .expect("failed to build daemon");
    Arc::new(daemon)
}

/// Manually advanced time source
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Utc::now())))
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.0);
        Arc::new(move || *now.lock().unwrap())
    }

    pub fn advance(&self, secs: i64) {
        *self.0.lock().unwrap() += chrono::Duration::seconds(secs);
    }
}

/// What a backend saw for one message
#[derive(Debug, Clone)]
pub struct Seen {
    pub sender_id: String,
    pub text: String,
    pub session_id: String,
    pub history_len: usize,
}

/// Backend replying `re: <text>` and recording every call
#[derive(Default)]
pub struct RecordingBackend {
    pub seen: Mutex<Vec<Seen>>,
    pub delay: Option<Duration>,
}

impl RecordingBackend {
    pub fn slow(delay: Duration) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn texts_from(&self, sender: &str) -> Vec<String> {
        self.seen()
            .into_iter()
            .filter(|s| s.sender_id == sender)
            .map(|s| s.text)
            .collect()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn respond(
        &self,
        message: &InboundMessage,
        session: &SessionContext,
    ) -> beacon_switchboard::Result<Option<String>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.seen.lock().unwrap().push(Seen {
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            session_id: session.session_id.clone(),
            history_len: session.history.len(),
        });
        Ok(Some(format!("re: {}", message.text)))
    }
}

/// Parse a JSON response body
pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
