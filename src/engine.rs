use crate::error::AppError;
use crate::llm::{ChatModel, SamplingParams};
use crate::normalizer::normalize;
use crate::retriever::{retrieve, Domain};
use crate::transcript::{CallSession, Message, Role, TranscriptStore};

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Separates caller speech from knowledge-base grounding in a user message.
pub const CONTEXT_MARKER: &str = "[INFO Z DATABÁZE]";

static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.+?)\*").expect("valid regex"));
static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\x{1F000}-\x{1FAFF}\x{2600}-\x{27BF}\x{FE0F}\x{200D}]").expect("valid regex")
});
static DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\.{2,}|…)").expect("valid regex"));
static BANGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"([!?])[!?]+").expect("valid regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Strips things a voice can't say: markdown emphasis, emoji, runs of
/// punctuation.
pub fn sanitize_reply(raw: &str) -> String {
    let text = BOLD.replace_all(raw, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = EMOJI.replace_all(&text, "");
    let text = DOTS.replace_all(&text, ".");
    let text = BANGS.replace_all(&text, "$1");
    SPACES.replace_all(&text, " ").trim().to_string()
}

/// Produces the assistant's next line for a call and records both sides of
/// the exchange in the transcript store.
pub struct ConversationEngine {
    store: Arc<TranscriptStore>,
    model: Arc<dyn ChatModel>,
}

impl ConversationEngine {
    pub fn new(store: Arc<TranscriptStore>, model: Arc<dyn ChatModel>) -> Self {
        Self { store, model }
    }

    pub fn store(&self) -> &Arc<TranscriptStore> {
        &self.store
    }

    pub fn start(&self, call_id: &str, domain: Domain, system_prompt: &str) {
        self.store.start(call_id, domain, system_prompt);
    }

    /// Runs one turn against a session the caller has locked with
    /// [`TranscriptStore::lock`], so the whole turn is serialized against
    /// other turns for the same call.
    pub async fn respond(
        &self,
        session: &mut CallSession,
        utterance: &str,
    ) -> Result<String, AppError> {
        let cleaned = normalize(utterance);
        let context = retrieve(&cleaned, session.domain);
        let user_message = if context.is_empty() {
            cleaned
        } else {
            debug!(call_sid=%session.call_id, context=%context, "injecting knowledge base context");
            format!("{cleaned}\n\n{CONTEXT_MARKER}:\n{context}")
        };
        session.messages.push(Message::new(Role::User, user_message));

        let raw = self
            .model
            .complete(&session.messages, &SamplingParams::CONVERSATION)
            .await?;
        let reply = sanitize_reply(&raw);
        if reply.is_empty() {
            return Err(AppError::Model("reply was empty after cleanup".to_string()));
        }
        session.messages.push(Message::new(Role::Assistant, reply.clone()));
        Ok(reply)
    }
}
