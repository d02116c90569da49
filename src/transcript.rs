use crate::error::AppError;
use crate::retriever::Domain;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Where a call currently is in its lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CallPhase {
    Greeting,
    Listening,
    Responding,
    Terminated,
}

pub struct CallSession {
    pub call_id: String,
    pub domain: Domain,
    pub messages: Vec<Message>,
    pub phase: CallPhase,
    pub retry_count: u32,
    pub elapsed_seconds: u32,
    /// Set once the provider's terminal status callback has been processed
    pub finalized: bool,
    pub created: Instant,
}

impl CallSession {
    fn new(call_id: &str, domain: Domain, system_prompt: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            domain,
            messages: vec![Message::new(Role::System, system_prompt)],
            phase: CallPhase::Greeting,
            retry_count: 0,
            elapsed_seconds: 0,
            finalized: false,
            created: Instant::now(),
        }
    }

    /// Moves the session into `Terminated`. Returns true only for the first
    /// transition.
    pub fn terminate(&mut self) -> bool {
        if self.phase == CallPhase::Terminated {
            return false;
        }
        self.phase = CallPhase::Terminated;
        true
    }
}

type SessionHandle = Arc<AsyncMutex<CallSession>>;

/// Registry of live conversations keyed by provider call id.
///
/// The outer map lock is only held long enough to clone a session handle; all
/// mutation of a session goes through its own async mutex, so turns for one
/// call are serialized without blocking other calls.
#[derive(Default)]
pub struct TranscriptStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, call_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(call_id).cloned()
    }

    /// Creates a session seeded with the system prompt, replacing any prior
    /// session for the same call id.
    pub fn start(&self, call_id: &str, domain: Domain, system_prompt: &str) {
        let session = Arc::new(AsyncMutex::new(CallSession::new(call_id, domain, system_prompt)));
        let replaced = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.insert(call_id.to_string(), session).is_some()
        };
        if replaced {
            info!(call_sid=%call_id, "restarted conversation; previous history discarded");
        } else {
            debug!(call_sid=%call_id, "conversation started");
        }
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.handle(call_id).is_some()
    }

    /// Exclusive access to one session for the duration of a turn.
    pub async fn lock(&self, call_id: &str) -> Result<OwnedMutexGuard<CallSession>, AppError> {
        let handle = self
            .handle(call_id)
            .ok_or_else(|| AppError::UnknownSession(call_id.to_string()))?;
        Ok(handle.lock_owned().await)
    }

    pub async fn append(&self, call_id: &str, role: Role, content: &str) -> Result<(), AppError> {
        let mut session = self.lock(call_id).await?;
        session.messages.push(Message::new(role, content));
        Ok(())
    }

    /// Ordered history, empty when the call is unknown.
    pub async fn get(&self, call_id: &str) -> Vec<Message> {
        match self.handle(call_id) {
            Some(handle) => handle.lock().await.messages.clone(),
            None => vec![],
        }
    }

    /// Copy of the full history. The session stays retrievable afterwards.
    pub async fn end(&self, call_id: &str) -> Vec<Message> {
        let history = self.get(call_id).await;
        debug!(call_sid=%call_id, messages = history.len(), "conversation ended");
        history
    }

    /// Marks the terminal status callback as processed. False for duplicate
    /// callbacks and unknown calls.
    pub async fn finalize(&self, call_id: &str) -> bool {
        let Some(handle) = self.handle(call_id) else {
            return false;
        };
        let mut session = handle.lock().await;
        if session.finalized {
            return false;
        }
        session.finalized = true;
        session.terminate();
        true
    }

    /// Drops sessions older than `ttl`. Sessions that are mid-turn are kept
    /// until the next sweep.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, handle| match handle.try_lock() {
            Ok(session) => session.created.elapsed() < ttl,
            Err(_) => true,
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "swept expired conversation sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
