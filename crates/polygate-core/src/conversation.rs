//! `ConversationStateMachine` (C3): the server-canonical transcript kept
//! per SCID (server conversation id), grounded on
//! `original_source/src/state_manager.py`. Backed by a `DashMap` in memory
//! (a sharded-mutex table, strictly more concurrent than the source's single
//! `threading.Lock` — a deliberate improvement noted in DESIGN.md) with the
//! same SQLite database the signature cache uses for L2 hydrate/persist.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;

use crate::error::{GatewayError, Result};
use crate::model::Message;
use crate::signature::sqlite::SqliteSignatureStore;

const DEFAULT_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct ConversationState {
    pub scid: String,
    pub client_type: String,
    pub authoritative_history: Vec<Message>,
    pub last_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
}

impl ConversationState {
    fn new(scid: &str, client_type: &str) -> Self {
        let now = Utc::now();
        Self {
            scid: scid.to_string(),
            client_type: client_type.to_string(),
            authoritative_history: Vec::new(),
            last_signature: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ChronoDuration::hours(DEFAULT_MAX_AGE_HOURS),
            access_count: 0,
        }
    }
}

/// A row's worth of conversation state as stored in the `conversation_state`
/// table (serialized history, not the live in-memory struct).
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub scid: String,
    pub client_type: String,
    pub authoritative_history_json: String,
    pub last_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: i64,
}

impl ConversationState {
    fn to_record(&self) -> Result<ConversationRecord> {
        Ok(ConversationRecord {
            scid: self.scid.clone(),
            client_type: self.client_type.clone(),
            authoritative_history_json: serde_json::to_string(&self.authoritative_history)?,
            last_signature: self.last_signature.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            access_count: self.access_count as i64,
        })
    }

    fn from_record(record: ConversationRecord) -> Result<Self> {
        let authoritative_history: Vec<Message> =
            serde_json::from_str(&record.authoritative_history_json)?;
        Ok(Self {
            scid: record.scid,
            client_type: record.client_type,
            authoritative_history,
            last_signature: record.last_signature,
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            access_count: record.access_count.max(0) as u64,
        })
    }
}

pub struct ConversationStateManager {
    states: DashMap<String, ConversationState>,
    l2: Arc<SqliteSignatureStore>,
    max_age_hours: i64,
}

impl ConversationStateManager {
    pub fn new(l2: Arc<SqliteSignatureStore>, max_age_hours: Option<i64>) -> Self {
        Self {
            states: DashMap::new(),
            l2,
            max_age_hours: max_age_hours.unwrap_or(DEFAULT_MAX_AGE_HOURS),
        }
    }

    /// Returns the existing state for `scid`, hydrating from L2 on a memory
    /// miss, or creates a fresh one. Empty SCIDs are rejected (spec §4.3
    /// "Empty SCID → raise").
    pub async fn get_or_create(&self, scid: &str, client_type: &str) -> Result<ConversationState> {
        if scid.is_empty() {
            return Err(GatewayError::ClientFatal("empty conversation scid".into()));
        }
        if let Some(state) = self.states.get(scid) {
            return Ok(state.clone());
        }
        match self.l2.conversation_get(scid).await {
            Ok(Some(record)) => match ConversationState::from_record(record) {
                Ok(state) => {
                    self.states.insert(scid.to_string(), state.clone());
                    return Ok(state);
                }
                Err(e) => {
                    tracing::warn!(scid, error = %e, "failed to decode hydrated conversation state");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(scid, error = %e, "conversation state L2 hydrate failed, creating fresh state");
            }
        }
        let state = ConversationState::new(scid, client_type);
        self.states.insert(scid.to_string(), state.clone());
        Ok(state)
    }

    /// Appends `new_user_msgs` then `assistant_msg` to the authoritative
    /// history, deduplicating by structural hash against the current tail,
    /// and persists asynchronously (in-memory update is synchronous and
    /// authoritative; L2 persistence failure is logged, never surfaced).
    pub async fn update(
        &self,
        scid: &str,
        new_user_msgs: &[Message],
        assistant_msg: &Message,
        signature: Option<String>,
    ) -> Result<()> {
        if scid.is_empty() {
            return Err(GatewayError::ClientFatal("empty conversation scid".into()));
        }
        let record = {
            let mut entry = self
                .states
                .get_mut(scid)
                .ok_or_else(|| GatewayError::Internal(format!("no conversation state for {scid}")))?;

            for msg in new_user_msgs {
                append_deduplicated(&mut entry.authoritative_history, msg);
            }
            append_deduplicated(&mut entry.authoritative_history, assistant_msg);
            if signature.is_some() {
                entry.last_signature = signature;
            }
            entry.updated_at = Utc::now();
            entry.expires_at = entry.updated_at + ChronoDuration::hours(self.max_age_hours);
            entry.access_count += 1;
            entry.to_record()?
        };

        if let Err(e) = self.l2.conversation_set(&record).await {
            tracing::warn!(scid, error = %e, "conversation state L2 persist failed, continuing in-memory only");
        }
        Ok(())
    }

    /// The anti-tampering merge: positional comparison against
    /// the authoritative history, preferring the server's own record of what
    /// was said whenever the client and server agree on turn structure.
    pub fn merge_with_client_history(
        &self,
        scid: &str,
        client_msgs: &[Message],
    ) -> Vec<Message> {
        let auth = match self.states.get(scid) {
            Some(state) => state.authoritative_history.clone(),
            None => return client_msgs.to_vec(),
        };

        let shared_len = auth.len().min(client_msgs.len());
        let mut merged = Vec::with_capacity(auth.len().max(client_msgs.len()));

        for i in 0..shared_len {
            if auth[i].role == client_msgs[i].role {
                merged.push(auth[i].clone());
            } else {
                tracing::warn!(
                    scid,
                    index = i,
                    authoritative_role = auth[i].role.as_str(),
                    client_role = client_msgs[i].role.as_str(),
                    "conversation history forked at this turn"
                );
                merged.push(client_msgs[i].clone());
            }
        }

        if client_msgs.len() > auth.len() {
            merged.extend_from_slice(&client_msgs[shared_len..]);
        } else if auth.len() > client_msgs.len() {
            merged.extend_from_slice(&auth[shared_len..]);
        }

        merged
    }

    /// Evicts conversation state idle beyond `max_age_hours` from both the
    /// in-memory table and L2.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.scid.clone())
            .collect();
        for scid in &expired {
            self.states.remove(scid);
        }
        let l2_removed = self.l2.conversation_delete_expired(now).await?;
        Ok(l2_removed.max(expired.len() as u64))
    }
}

fn append_deduplicated(history: &mut Vec<Message>, msg: &Message) {
    if let Some(last) = history.last() {
        if last.structural_hash() == msg.structural_hash() {
            return;
        }
    }
    history.push(msg.clone());
}
