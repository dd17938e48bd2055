//! Sender pairing and access control
//!
//! Every sender is tracked per `(channel type, sender id)` with one of three
//! states:
//! - Pending: has been issued a pairing code and is waiting for approval
//! - Approved: messages reach the session router, subject to a rate limit
//! - Blocked: messages are dropped
//!
//! Records are never deleted; every status change is appended to
//! `sender_events` in the same transaction. Concurrent access to one sender is serialized with a
//! per-key lock so pairing codes and rate-limit counters are never lost.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::channels::{ChannelType, InboundMessage};
use crate::db::{DbConn, DbPool};
use crate::sync::KeyedLocks;
use crate::{Clock, Error, Result};

/// Pairing code length
const PAIRING_CODE_LENGTH: usize = 6;

/// Characters used in pairing codes (no 0/O or 1/I)
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Reply sent after a successful in-chat pairing
pub const PAIRED_REPLY: &str = "Pairing successful! You can now send messages.";

/// How unknown senders are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Accept everyone; first contact creates an approved record
    Open,

    /// New senders must pair with a code
    #[default]
    Pairing,

    /// Only senders approved by an operator may message
    Allowlist,
}

impl DmPolicy {
    /// Parse from string representation
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "pairing" => Some(Self::Pairing),
            "allowlist" | "whitelist" => Some(Self::Allowlist),
            _ => None,
        }
    }
}

impl fmt::Display for DmPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Pairing => write!(f, "pairing"),
            Self::Allowlist => write!(f, "allowlist"),
        }
    }
}

/// Trust state of a sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderStatus {
    Pending,
    Approved,
    Blocked,
}

impl SenderStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Blocked => "blocked",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for SenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderRecord {
    pub channel_type: ChannelType,
    pub sender_id: String,
    pub status: SenderStatus,
    pub pairing_code: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub window_started_at: Option<DateTime<Utc>>,
    pub window_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One status transition from the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderEvent {
    pub from_status: Option<SenderStatus>,
    pub to_status: SenderStatus,
    pub at: DateTime<Utc>,
}

/// Why a message was not let through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Blocked,
    RateLimited,
    NotAllowlisted,
}

/// Outcome of checking an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Pass the message on to the session router
    Allow,
    /// Sender is pending; reply with the pairing prompt
    Challenge(String),
    /// The message was a valid pairing code; reply with a confirmation
    Paired(String),
    /// Drop the message, optionally replying with a fixed text
    Drop {
        reason: DropReason,
        reply: Option<String>,
    },
}

impl AuthDecision {
    /// Whether the message may reach the session router
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Text to send back to the sender instead of routing, if any
    #[must_use]
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Challenge(text) | Self::Paired(text) => Some(text),
            Self::Drop { reply, .. } => reply.as_deref(),
        }
    }
}

/// Tunables for the sender store
#[derive(Debug, Clone)]
pub struct PairingSettings {
    pub policy: DmPolicy,
    /// Lifetime of an issued pairing code
    pub code_ttl: Duration,
    /// Messages allowed per window for an approved sender
    pub rate_limit_messages: u32,
    /// Length of the fixed rate-limit window
    pub rate_limit_window: Duration,
    /// Reply to blocked senders; `None` drops silently
    pub blocked_reply: Option<String>,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            policy: DmPolicy::Pairing,
            code_ttl: Duration::minutes(10),
            rate_limit_messages: 20,
            rate_limit_window: Duration::seconds(60),
            blocked_reply: None,
        }
    }
}

type SenderKey = (ChannelType, String);

/// Persistent sender trust store
#[derive(Clone)]
pub struct SenderStore {
    pool: DbPool,
    settings: Arc<PairingSettings>,
    locks: Arc<KeyedLocks<SenderKey>>,
    clock: Clock,
}

impl SenderStore {
    /// Create a store over an initialized database
    #[must_use]
    pub fn new(pool: DbPool, settings: PairingSettings) -> Self {
        Self {
            pool,
            settings: Arc::new(settings),
            locks: Arc::new(KeyedLocks::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Active settings
    #[must_use]
    pub fn settings(&self) -> &PairingSettings {
        &self.settings
    }

    /// Current policy
    #[must_use]
    pub fn policy(&self) -> DmPolicy {
        self.settings.policy
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Decide what happens to an inbound message
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub async fn check(&self, message: &InboundMessage) -> Result<AuthDecision> {
        let key = (message.channel_type.clone(), message.sender_id.clone());
        let _guard = self.locks.lock(&key).await;

        let now = self.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let channel = &message.channel_type;
        let sender = message.sender_id.as_str();

        let decision = match load(&tx, channel, sender)? {
            None => self.first_contact(&tx, channel, sender, now)?,
            Some(record) => match record.status {
                SenderStatus::Blocked => {
                    tracing::debug!(channel = %channel, sender, "dropping message from blocked sender");
                    AuthDecision::Drop {
                        reason: DropReason::Blocked,
                        reply: self.settings.blocked_reply.clone(),
                    }
                }
                SenderStatus::Pending => self.pending_message(&tx, &record, &message.text, now)?,
                SenderStatus::Approved => self.count_message(&tx, &record, now)?,
            },
        };
        tx.commit()?;
        Ok(decision)
    }

    fn first_contact(
        &self,
        conn: &Connection,
        channel: &ChannelType,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthDecision> {
        match self.settings.policy {
            DmPolicy::Open => {
                insert(conn, channel, sender, SenderStatus::Approved, None, now)?;
                record_event(conn, channel, sender, None, SenderStatus::Approved, now)?;
                conn.execute(
                    "UPDATE senders SET window_started_at = ?1, window_count = 1
                     WHERE channel_type = ?2 AND sender_id = ?3",
                    params![now.to_rfc3339(), channel.as_str(), sender],
                )?;
                tracing::info!(channel = %channel, sender, "sender auto-approved");
                Ok(AuthDecision::Allow)
            }
            DmPolicy::Pairing => {
                let code = generate_code(PAIRING_CODE_LENGTH);
                let expires = now + self.settings.code_ttl;
                insert(conn, channel, sender, SenderStatus::Pending, Some((&code, expires)), now)?;
                record_event(conn, channel, sender, None, SenderStatus::Pending, now)?;
                tracing::info!(channel = %channel, sender, "pairing code issued");
                Ok(AuthDecision::Challenge(self.prompt(&code)))
            }
            DmPolicy::Allowlist => {
                tracing::debug!(channel = %channel, sender, "dropping message from unlisted sender");
                Ok(AuthDecision::Drop {
                    reason: DropReason::NotAllowlisted,
                    reply: None,
                })
            }
        }
    }

    fn pending_message(
        &self,
        conn: &Connection,
        record: &SenderRecord,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthDecision> {
        let live_code = record
            .pairing_code
            .as_deref()
            .filter(|_| record.code_expires_at.is_some_and(|exp| now <= exp));

        match live_code {
            Some(code) if text.trim().eq_ignore_ascii_case(code) => {
                approve_record(conn, record, now)?;
                tracing::info!(channel = %record.channel_type, sender = %record.sender_id, "sender paired successfully");
                Ok(AuthDecision::Paired(PAIRED_REPLY.to_string()))
            }
            Some(code) => Ok(AuthDecision::Challenge(self.prompt(code))),
            None => {
                let code = generate_code(PAIRING_CODE_LENGTH);
                conn.execute(
                    "UPDATE senders SET pairing_code = ?1, code_expires_at = ?2, updated_at = ?3
                     WHERE channel_type = ?4 AND sender_id = ?5",
                    params![
                        code,
                        (now + self.settings.code_ttl).to_rfc3339(),
                        now.to_rfc3339(),
                        record.channel_type.as_str(),
                        record.sender_id,
                    ],
                )?;
                tracing::info!(channel = %record.channel_type, sender = %record.sender_id, "expired pairing code reissued");
                Ok(AuthDecision::Challenge(self.prompt(&code)))
            }
        }
    }

    fn count_message(
        &self,
        conn: &Connection,
        record: &SenderRecord,
        now: DateTime<Utc>,
    ) -> Result<AuthDecision> {
        let window_open = record
            .window_started_at
            .is_some_and(|start| now < start + self.settings.rate_limit_window);

        if window_open && record.window_count >= self.settings.rate_limit_messages {
            tracing::debug!(
                channel = %record.channel_type,
                sender = %record.sender_id,
                limit = self.settings.rate_limit_messages,
                "rate limit exceeded, dropping message"
            );
            return Ok(AuthDecision::Drop {
                reason: DropReason::RateLimited,
                reply: None,
            });
        }

        let (started, count) = if window_open {
            (record.window_started_at.unwrap_or(now), record.window_count + 1)
        } else {
            (now, 1)
        };
        conn.execute(
            "UPDATE senders SET window_started_at = ?1, window_count = ?2
             WHERE channel_type = ?3 AND sender_id = ?4",
            params![started.to_rfc3339(), count, record.channel_type.as_str(), record.sender_id],
        )?;
        Ok(AuthDecision::Allow)
    }

    fn prompt(&self, code: &str) -> String {
        let minutes = self.settings.code_ttl.num_minutes().max(1);
        format!(
            "Please enter the pairing code to start messaging.\n\nYour code: {code}\n\n\
             Share it with the operator for approval. (This code expires in {minutes} minutes)"
        )
    }

    /// Look up one sender
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub fn get(&self, channel: &ChannelType, sender_id: &str) -> Result<Option<SenderRecord>> {
        load(&*self.conn()?, channel, sender_id)
    }

    /// List known senders, optionally for one channel type
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub fn list(&self, channel: Option<&ChannelType>) -> Result<Vec<SenderRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT channel_type, sender_id, status, pairing_code, code_expires_at,
                    window_started_at, window_count, created_at, updated_at
             FROM senders
             WHERE ?1 IS NULL OR channel_type = ?1
             ORDER BY channel_type, sender_id",
        )?;

        let records = stmt
            .query_map([channel.map(ChannelType::as_str)], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Status history of one sender, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub fn events(&self, channel: &ChannelType, sender_id: &str) -> Result<Vec<SenderEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT from_status, to_status, at FROM sender_events
             WHERE channel_type = ?1 AND sender_id = ?2
             ORDER BY id",
        )?;

        let events = stmt
            .query_map(params![channel.as_str(), sender_id], |row| {
                let from: Option<String> = row.get(0)?;
                let to: String = row.get(1)?;
                Ok(SenderEvent {
                    from_status: from.as_deref().and_then(SenderStatus::parse),
                    to_status: SenderStatus::parse(&to).unwrap_or(SenderStatus::Pending),
                    at: parse_datetime(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Approve a sender, creating the record if it is unknown
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub async fn approve(&self, channel: &ChannelType, sender_id: &str) -> Result<SenderRecord> {
        self.set_status(channel, sender_id, SenderStatus::Approved).await
    }

    /// Block a sender, creating the record if it is unknown
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub async fn block(&self, channel: &ChannelType, sender_id: &str) -> Result<SenderRecord> {
        self.set_status(channel, sender_id, SenderStatus::Blocked).await
    }

    /// Move a blocked sender straight to approved, without re-pairing
    ///
    /// Senders that are not blocked are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown sender
    pub async fn unblock(&self, channel: &ChannelType, sender_id: &str) -> Result<SenderRecord> {
        let key = (channel.clone(), sender_id.to_string());
        let _guard = self.locks.lock(&key).await;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let record = load(&tx, channel, sender_id)?
            .ok_or_else(|| Error::NotFound(format!("sender {channel}/{sender_id}")))?;

        if record.status != SenderStatus::Blocked {
            return Ok(record);
        }

        approve_record(&tx, &record, self.now())?;
        tx.commit()?;
        tracing::info!(channel = %channel, sender = sender_id, "sender unblocked");
        load(&conn, channel, sender_id)?
            .ok_or_else(|| Error::NotFound(format!("sender {channel}/{sender_id}")))
    }

    /// Approve whichever pending sender on `channel` holds `code`
    ///
    /// Returns `None` if no pending sender holds a live code matching it.
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub async fn approve_code(&self, channel: &ChannelType, code: &str) -> Result<Option<SenderRecord>> {
        let code = code.trim().to_uppercase();
        let sender_id: Option<String> = self
            .conn()?
            .query_row(
                "SELECT sender_id FROM senders
                 WHERE channel_type = ?1 AND pairing_code = ?2 AND status = 'pending'",
                params![channel.as_str(), code],
                |row| row.get(0),
            )
            .optional()?;

        let Some(sender_id) = sender_id else {
            tracing::debug!(channel = %channel, "no pending sender holds that code");
            return Ok(None);
        };

        if self.verify_pairing(channel, &sender_id, &code).await? {
            self.get(channel, &sender_id)
        } else {
            Ok(None)
        }
    }

    /// Verify a pairing code for a specific sender and approve on success
    ///
    /// Returns false for a wrong or expired code, or a sender that is not
    /// pending.
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub async fn verify_pairing(&self, channel: &ChannelType, sender_id: &str, code: &str) -> Result<bool> {
        let key = (channel.clone(), sender_id.to_string());
        let _guard = self.locks.lock(&key).await;

        let now = self.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(record) = load(&tx, channel, sender_id)? else {
            return Ok(false);
        };

        let valid = record.status == SenderStatus::Pending
            && record
                .pairing_code
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(code.trim()))
            && record.code_expires_at.is_some_and(|exp| now <= exp);

        if !valid {
            tracing::debug!(channel = %channel, sender = sender_id, "invalid or expired pairing code");
            return Ok(false);
        }

        approve_record(&tx, &record, now)?;
        tx.commit()?;
        tracing::info!(channel = %channel, sender = sender_id, "sender paired successfully");
        Ok(true)
    }

    async fn set_status(
        &self,
        channel: &ChannelType,
        sender_id: &str,
        status: SenderStatus,
    ) -> Result<SenderRecord> {
        let key = (channel.clone(), sender_id.to_string());
        let _guard = self.locks.lock(&key).await;

        let now = self.now();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match load(&tx, channel, sender_id)? {
            None => {
                insert(&tx, channel, sender_id, status, None, now)?;
                record_event(&tx, channel, sender_id, None, status, now)?;
            }
            Some(record) if record.status != status => {
                tx.execute(
                    "UPDATE senders SET status = ?1, pairing_code = NULL, code_expires_at = NULL,
                            window_started_at = NULL, window_count = 0, updated_at = ?2
                     WHERE channel_type = ?3 AND sender_id = ?4",
                    params![status.as_str(), now.to_rfc3339(), channel.as_str(), sender_id],
                )?;
                record_event(&tx, channel, sender_id, Some(record.status), status, now)?;
            }
            Some(_) => {}
        }
        tx.commit()?;

        tracing::info!(channel = %channel, sender = sender_id, %status, "sender status set");
        load(&conn, channel, sender_id)?
            .ok_or_else(|| Error::NotFound(format!("sender {channel}/{sender_id}")))
    }
}

fn load(conn: &Connection, channel: &ChannelType, sender_id: &str) -> Result<Option<SenderRecord>> {
    let record = conn
        .query_row(
            "SELECT channel_type, sender_id, status, pairing_code, code_expires_at,
                    window_started_at, window_count, created_at, updated_at
             FROM senders WHERE channel_type = ?1 AND sender_id = ?2",
            params![channel.as_str(), sender_id],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

fn insert(
    conn: &Connection,
    channel: &ChannelType,
    sender_id: &str,
    status: SenderStatus,
    code: Option<(&str, DateTime<Utc>)>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO senders (channel_type, sender_id, status, pairing_code, code_expires_at,
                              window_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
        params![
            channel.as_str(),
            sender_id,
            status.as_str(),
            code.map(|(c, _)| c),
            code.map(|(_, exp)| exp.to_rfc3339()),
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn approve_record(conn: &Connection, record: &SenderRecord, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE senders SET status = 'approved', pairing_code = NULL, code_expires_at = NULL,
                window_started_at = NULL, window_count = 0, updated_at = ?1
         WHERE channel_type = ?2 AND sender_id = ?3",
        params![now.to_rfc3339(), record.channel_type.as_str(), record.sender_id],
    )?;
    record_event(
        conn,
        &record.channel_type,
        &record.sender_id,
        Some(record.status),
        SenderStatus::Approved,
        now,
    )
}

fn record_event(
    conn: &Connection,
    channel: &ChannelType,
    sender_id: &str,
    from: Option<SenderStatus>,
    to: SenderStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sender_events (channel_type, sender_id, from_status, to_status, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            channel.as_str(),
            sender_id,
            from.map(SenderStatus::as_str),
            to.as_str(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SenderRecord> {
    let status: String = row.get(2)?;
    let count: i64 = row.get(6)?;
    Ok(SenderRecord {
        channel_type: ChannelType::new(row.get::<_, String>(0)?),
        sender_id: row.get(1)?,
        status: SenderStatus::parse(&status).unwrap_or(SenderStatus::Pending),
        pairing_code: row.get(3)?,
        code_expires_at: row.get::<_, Option<String>>(4)?.map(|s| parse_datetime(&s)),
        window_started_at: row.get::<_, Option<String>>(5)?.map(|s| parse_datetime(&s)),
        window_count: u32::try_from(count).unwrap_or(u32::MAX),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

/// Generate a random pairing code
fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())]))
        .collect()
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::init_memory;

    struct TestClock(Arc<Mutex<DateTime<Utc>>>);

    impl TestClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Utc::now())))
        }

        fn clock(&self) -> Clock {
            let now = Arc::clone(&self.0);
            Arc::new(move || *now.lock().unwrap())
        }

        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    fn setup(policy: DmPolicy) -> (SenderStore, TestClock) {
        let clock = TestClock::new();
        let settings = PairingSettings {
            policy,
            rate_limit_messages: 3,
            ..PairingSettings::default()
        };
        let store = SenderStore::new(init_memory().unwrap(), settings).with_clock(clock.clock());
        (store, clock)
    }

    fn msg(channel: &str, sender: &str, text: &str) -> InboundMessage {
        InboundMessage {
            channel_type: ChannelType::new(channel),
            instance: format!("{channel}-1"),
            sender_id: sender.to_string(),
            sender_label: sender.to_string(),
            text: text.to_string(),
            thread_id: None,
            received_at: Utc::now(),
        }
    }

    fn code_of(store: &SenderStore, channel: &str, sender: &str) -> String {
        store
            .get(&ChannelType::new(channel), sender)
            .unwrap()
            .unwrap()
            .pairing_code
            .unwrap()
    }

    #[tokio::test]
    async fn open_policy_auto_approves() {
        let (store, _) = setup(DmPolicy::Open);
        assert_eq!(store.check(&msg("web", "u1", "hi")).await.unwrap(), AuthDecision::Allow);

        let record = store.get(&ChannelType::WEB, "u1").unwrap().unwrap();
        assert_eq!(record.status, SenderStatus::Approved);
        assert_eq!(record.window_count, 1);
    }

    #[tokio::test]
    async fn allowlist_drops_unknown_without_code() {
        let (store, _) = setup(DmPolicy::Allowlist);
        let decision = store.check(&msg("web", "stranger", "hi")).await.unwrap();
        assert_eq!(
            decision,
            AuthDecision::Drop {
                reason: DropReason::NotAllowlisted,
                reply: None
            }
        );
        assert!(store.get(&ChannelType::WEB, "stranger").unwrap().is_none());

        store.approve(&ChannelType::WEB, "stranger").await.unwrap();
        assert!(store.check(&msg("web", "stranger", "hi")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn pairing_flow_in_chat() {
        let (store, _) = setup(DmPolicy::Pairing);

        let first = store.check(&msg("telegram", "newuser", "hello")).await.unwrap();
        let AuthDecision::Challenge(prompt) = first else {
            panic!("expected challenge, got {first:?}");
        };
        let code = code_of(&store, "telegram", "newuser");
        assert_eq!(code.len(), PAIRING_CODE_LENGTH);
        assert!(prompt.contains(&code));

        // Still pending: same code is repeated, nothing is allowed through
        let again = store.check(&msg("telegram", "newuser", "anyone there?")).await.unwrap();
        assert_eq!(again, AuthDecision::Challenge(prompt));

        // Codes are accepted regardless of case and surrounding whitespace
        let presented = format!("  {}  ", code.to_lowercase());
        let paired = store.check(&msg("telegram", "newuser", &presented)).await.unwrap();
        assert_eq!(paired, AuthDecision::Paired(PAIRED_REPLY.to_string()));

        assert!(store.check(&msg("telegram", "newuser", "hi")).await.unwrap().is_allowed());

        // Code can't be reused
        assert!(!store.verify_pairing(&ChannelType::TELEGRAM, "newuser", &code).await.unwrap());
    }

    #[tokio::test]
    async fn operator_approves_by_code() {
        let (store, _) = setup(DmPolicy::Pairing);
        store.check(&msg("signal", "+1555", "hello")).await.unwrap();
        let code = code_of(&store, "signal", "+1555");

        assert!(store.approve_code(&ChannelType::SIGNAL, "ZZZZZZ").await.unwrap().is_none());
        // Codes are scoped to their channel type
        assert!(store.approve_code(&ChannelType::TELEGRAM, &code).await.unwrap().is_none());

        let record = store.approve_code(&ChannelType::SIGNAL, &code).await.unwrap().unwrap();
        assert_eq!(record.status, SenderStatus::Approved);
        assert!(record.pairing_code.is_none());
    }

    #[tokio::test]
    async fn expired_code_is_rejected_and_reissued() {
        let (store, clock) = setup(DmPolicy::Pairing);
        store.check(&msg("web", "late", "hello")).await.unwrap();
        let code = code_of(&store, "web", "late");

        clock.advance(Duration::minutes(11));

        assert!(store.approve_code(&ChannelType::WEB, &code).await.unwrap().is_none());
        assert!(!store.verify_pairing(&ChannelType::WEB, "late", &code).await.unwrap());

        let decision = store.check(&msg("web", "late", &code)).await.unwrap();
        assert!(matches!(decision, AuthDecision::Challenge(_)));

        let record = store.get(&ChannelType::WEB, "late").unwrap().unwrap();
        assert_eq!(record.status, SenderStatus::Pending);
        assert_ne!(record.pairing_code.as_deref(), Some(code.as_str()));
    }

    #[tokio::test]
    async fn blocked_sender_is_dropped_and_not_reprompted() {
        let (store, _) = setup(DmPolicy::Pairing);
        store.check(&msg("web", "troll", "hello")).await.unwrap();
        store.block(&ChannelType::WEB, "troll").await.unwrap();

        let decision = store.check(&msg("web", "troll", "hello?")).await.unwrap();
        assert_eq!(
            decision,
            AuthDecision::Drop {
                reason: DropReason::Blocked,
                reply: None
            }
        );
        let record = store.get(&ChannelType::WEB, "troll").unwrap().unwrap();
        assert!(record.pairing_code.is_none());
    }

    #[tokio::test]
    async fn blocked_reply_is_configurable() {
        let settings = PairingSettings {
            blocked_reply: Some("You have been blocked.".to_string()),
            ..PairingSettings::default()
        };
        let store = SenderStore::new(init_memory().unwrap(), settings);
        store.block(&ChannelType::WEB, "u1").await.unwrap();

        let decision = store.check(&msg("web", "u1", "hi")).await.unwrap();
        assert_eq!(decision.reply(), Some("You have been blocked."));
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn unblock_goes_straight_to_approved() {
        let (store, _) = setup(DmPolicy::Pairing);
        store.block(&ChannelType::WEB, "u1").await.unwrap();

        let record = store.unblock(&ChannelType::WEB, "u1").await.unwrap();
        assert_eq!(record.status, SenderStatus::Approved);
        assert!(store.check(&msg("web", "u1", "hi")).await.unwrap().is_allowed());

        assert!(matches!(
            store.unblock(&ChannelType::WEB, "ghost").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rate_limit_drops_without_changing_status() {
        let (store, clock) = setup(DmPolicy::Open);
        for _ in 0..3 {
            assert!(store.check(&msg("web", "chatty", "x")).await.unwrap().is_allowed());
        }

        let fourth = store.check(&msg("web", "chatty", "x")).await.unwrap();
        assert_eq!(
            fourth,
            AuthDecision::Drop {
                reason: DropReason::RateLimited,
                reply: None
            }
        );
        let record = store.get(&ChannelType::WEB, "chatty").unwrap().unwrap();
        assert_eq!(record.status, SenderStatus::Approved);

        clock.advance(Duration::seconds(61));
        assert!(store.check(&msg("web", "chatty", "x")).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn concurrent_checks_do_not_lose_counts() {
        let (store, _) = setup(DmPolicy::Open);
        store.approve(&ChannelType::WEB, "burst").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.check(&msg("web", "burst", "x")).await.unwrap().is_allowed()
            }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn list_filters_by_channel() {
        let (store, _) = setup(DmPolicy::Allowlist);
        store.approve(&ChannelType::DISCORD, "alice").await.unwrap();
        store.approve(&ChannelType::DISCORD, "bob").await.unwrap();
        store.block(&ChannelType::SLACK, "charlie").await.unwrap();

        assert_eq!(store.list(Some(&ChannelType::DISCORD)).unwrap().len(), 2);
        assert_eq!(store.list(None).unwrap().len(), 3);
        assert!(store.list(Some(&ChannelType::new("custom"))).unwrap().is_empty());
    }

    #[tokio::test]
    async fn transitions_are_audited() {
        let (store, _) = setup(DmPolicy::Pairing);
        store.check(&msg("web", "u1", "hello")).await.unwrap();
        let code = code_of(&store, "web", "u1");
        store.verify_pairing(&ChannelType::WEB, "u1", &code).await.unwrap();
        store.block(&ChannelType::WEB, "u1").await.unwrap();
        store.unblock(&ChannelType::WEB, "u1").await.unwrap();

        let trail: Vec<_> = store
            .events(&ChannelType::WEB, "u1")
            .unwrap()
            .into_iter()
            .map(|e| (e.from_status, e.to_status))
            .collect();
        assert_eq!(
            trail,
            vec![
                (None, SenderStatus::Pending),
                (Some(SenderStatus::Pending), SenderStatus::Approved),
                (Some(SenderStatus::Approved), SenderStatus::Blocked),
                (Some(SenderStatus::Blocked), SenderStatus::Approved),
            ]
        );
    }

    #[tokio::test]
    async fn status_change_rolls_back_without_its_event() {
        let (store, _) = setup(DmPolicy::Pairing);
        store.check(&msg("web", "u1", "hello")).await.unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch("DROP TABLE sender_events")
            .unwrap();

        assert!(store.block(&ChannelType::WEB, "u1").await.is_err());
        let record = store.get(&ChannelType::WEB, "u1").unwrap().unwrap();
        assert_eq!(record.status, SenderStatus::Pending);
        assert!(record.pairing_code.is_some());

        assert!(store.approve(&ChannelType::WEB, "u2").await.is_err());
        assert!(store.get(&ChannelType::WEB, "u2").unwrap().is_none());

        assert!(store.check(&msg("web", "u3", "hello")).await.is_err());
        assert!(store.get(&ChannelType::WEB, "u3").unwrap().is_none());
    }

    #[test]
    fn custom_channel_types_are_case_sensitive() {
        assert_ne!(ChannelType::new("Web"), ChannelType::WEB);
    }

    #[test]
    fn generate_code_format() {
        let code = generate_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| CODE_CHARSET.contains(&b)));
    }

    #[test]
    fn dm_policy_parse() {
        assert_eq!(DmPolicy::parse("open"), Some(DmPolicy::Open));
        assert_eq!(DmPolicy::parse("Pairing"), Some(DmPolicy::Pairing));
        assert_eq!(DmPolicy::parse("whitelist"), Some(DmPolicy::Allowlist));
        assert_eq!(DmPolicy::parse("unknown"), None);
    }
}
