//! Per-turn call decisions: greet, listen, respond, hang up.
//!
//! Turn-local counters travel in the callback path of every listen document
//! (`/process/{retry_count}/{elapsed_seconds}`) and are mirrored into the
//! session, which acts as a floor when a callback arrives without them. The
//! path carries no `&`, so the url is safe inside a TwiML attribute.

use crate::analyzer::{AnalysisJob, AnalysisQueue};
use crate::engine::ConversationEngine;
use crate::normalizer::normalize;
use crate::prompts::{
    outbound_greeting, receptionist_prompt, sales_prompt, DID_NOT_HEAR, ERROR_APOLOGY,
    GOODBYE_MARKERS, INBOUND_GREETING, SILENCE_GOODBYE, TIME_BUDGET_GOODBYE,
};
use crate::retriever::{is_hard_rejection, Domain};
use crate::synthesizer::SpeechSynthesizer;
use crate::transcript::{CallPhase, CallSession, Message, Role, TranscriptStore};
use crate::twilio_types::{
    wrap_twiml, GatherAction, GatherInput, HangupAction, PlayAction, RedirectAction, Response,
    ResponseAction, SayAction, StatusPayload,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

pub const MAX_SILENCE_RETRIES: u32 = 2;
pub const SILENCE_RETRY_COST_SECS: u32 = 4;
pub const TURN_COST_SECS: u32 = 8;
/// Hard ceiling on a call's accounted time, checked before every model call.
pub const MAX_CALL_SECS: u32 = 300;
/// Replies longer than this are cut to their first two sentences.
pub const MAX_REPLY_CHARS: usize = 200;
/// Fewer non-whitespace characters than this counts as silence.
pub const MIN_SPEECH_CHARS: usize = 2;

const LANGUAGE: &str = "cs-CZ";
const FALLBACK_VOICE: &str = "woman";
const GATHER_TIMEOUT_SECS: u16 = 15;

#[derive(Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct TurnState {
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub elapsed_seconds: u32,
}

/// Something to say: pre-rendered audio, or text for the provider's own voice.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Utterance {
    Audio(String),
    Text(String),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum VoiceDocument {
    /// Speak, then wait for the caller's next turn.
    Listen { say: Utterance, next: TurnState },
    /// Optionally speak, then end the call.
    End { say: Option<Utterance> },
}

impl VoiceDocument {
    pub fn to_twiml(&self, public_base_url: &str) -> String {
        let mut actions = vec![];
        match self {
            VoiceDocument::Listen { say, next } => {
                let process_url = format!(
                    "{public_base_url}/process/{}/{}",
                    next.retry_count, next.elapsed_seconds
                );
                actions.push(utterance_action(say));
                actions.push(ResponseAction::Gather(GatherAction {
                    input: Some(GatherInput::Speech),
                    action: Some(process_url.clone()),
                    method: Some("POST".to_string()),
                    language: Some(LANGUAGE.to_string()),
                    speech_timeout: Some("auto".to_string()),
                    timeout: Some(GATHER_TIMEOUT_SECS),
                    ..Default::default()
                }));
                // Gather falls through to here when nothing was said
                actions.push(ResponseAction::Redirect(RedirectAction {
                    url: process_url,
                    method: Some("POST".to_string()),
                }));
            }
            VoiceDocument::End { say } => {
                if let Some(say) = say {
                    actions.push(utterance_action(say));
                }
                actions.push(ResponseAction::Hangup(HangupAction {}));
            }
        }
        wrap_twiml(xmlserde::xml_serialize(Response { actions }))
    }

    pub fn is_end(&self) -> bool {
        matches!(self, VoiceDocument::End { .. })
    }
}

fn utterance_action(say: &Utterance) -> ResponseAction {
    match say {
        Utterance::Audio(url) => ResponseAction::Play(PlayAction {
            url: url.clone(),
            ..Default::default()
        }),
        Utterance::Text(text) => ResponseAction::Say(SayAction {
            text: text.clone(),
            voice: Some(FALLBACK_VOICE.to_string()),
            language: Some(LANGUAGE.to_string()),
            ..Default::default()
        }),
    }
}

/// Mirrors the next turn's counters into the session. Never leaves
/// `Terminated`.
fn mark_listening(session: &mut CallSession, state: TurnState) {
    if session.phase == CallPhase::Terminated {
        return;
    }
    session.phase = CallPhase::Listening;
    session.retry_count = state.retry_count;
    session.elapsed_seconds = state.elapsed_seconds;
}

fn is_silence(speech: &str) -> bool {
    speech.chars().filter(|c| !c.is_whitespace()).count() < MIN_SPEECH_CHARS
}

pub fn contains_goodbye(reply: &str) -> bool {
    let reply = reply.to_lowercase();
    GOODBYE_MARKERS.iter().any(|marker| reply.contains(marker))
}

/// Keeps phone turns short: long replies are cut after their second sentence,
/// or at a word boundary if there is no second sentence.
pub fn truncate_reply(reply: &str) -> String {
    if reply.chars().count() <= MAX_REPLY_CHARS {
        return reply.to_string();
    }
    let mut sentences = 0;
    for (i, c) in reply.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            if reply[end..].chars().next().map_or(true, char::is_whitespace) {
                sentences += 1;
                if sentences == 2 {
                    return reply[..end].to_string();
                }
            }
        }
    }
    let head: String = reply.chars().take(MAX_REPLY_CHARS).collect();
    match head.rsplit_once(char::is_whitespace) {
        Some((words, _)) => words.trim_end().to_string(),
        None => head,
    }
}

pub struct CallFlowController {
    engine: Arc<ConversationEngine>,
    synthesizer: Arc<SpeechSynthesizer>,
    analysis: AnalysisQueue,
}

impl CallFlowController {
    pub fn new(
        engine: Arc<ConversationEngine>,
        synthesizer: Arc<SpeechSynthesizer>,
        analysis: AnalysisQueue,
    ) -> Self {
        Self {
            engine,
            synthesizer,
            analysis,
        }
    }

    fn store(&self) -> &TranscriptStore {
        self.engine.store()
    }

    pub fn active_sessions(&self) -> usize {
        self.store().len()
    }

    /// Drops conversations older than `ttl`; run periodically by the server.
    pub fn sweep_sessions(&self, ttl: std::time::Duration) -> usize {
        self.store().sweep(ttl)
    }

    async fn speak(&self, text: &str) -> Utterance {
        match self.synthesizer.resolve(text).await {
            Some(url) => Utterance::Audio(url),
            None => Utterance::Text(text.to_string()),
        }
    }

    /// Records a line the assistant says outside of a model turn.
    async fn say_line(&self, call_sid: &str, text: &str) {
        if let Err(e) = self.store().append(call_sid, Role::Assistant, text).await {
            debug!(call_sid, error=%e, "not recording line for unknown call");
        }
    }

    async fn set_listening(&self, call_sid: &str, state: TurnState) {
        if let Ok(mut session) = self.store().lock(call_sid).await {
            mark_listening(&mut session, state);
        }
    }

    /// Records the closing line and terminates the locked session.
    async fn hang_up(&self, mut session: OwnedMutexGuard<CallSession>, line: &str) -> VoiceDocument {
        session.messages.push(Message::new(Role::Assistant, line));
        if session.terminate() {
            info!(call_sid=%session.call_id, "call terminated");
        }
        drop(session);
        VoiceDocument::End {
            say: Some(self.speak(line).await),
        }
    }

    async fn greet(&self, call_sid: &str, domain: Domain, prompt: &str, greeting: &str) -> VoiceDocument {
        self.engine.start(call_sid, domain, prompt);
        self.say_line(call_sid, greeting).await;
        let next = TurnState::default();
        self.set_listening(call_sid, next).await;
        VoiceDocument::Listen {
            say: self.speak(greeting).await,
            next,
        }
    }

    pub async fn greet_outbound(
        &self,
        call_sid: &str,
        name: &str,
        company: Option<&str>,
    ) -> VoiceDocument {
        info!(call_sid, name, "outbound call answered");
        self.greet(
            call_sid,
            Domain::Sales,
            &sales_prompt(name, company),
            &outbound_greeting(name, company),
        )
        .await
    }

    pub async fn greet_inbound(&self, call_sid: &str, caller: Option<&str>) -> VoiceDocument {
        info!(call_sid, caller = caller.unwrap_or("unknown"), "inbound call");
        self.greet(call_sid, Domain::Reception, &receptionist_prompt(), INBOUND_GREETING)
            .await
    }

    /// One caller turn. `speech` is the recognizer's text, absent or empty
    /// when the caller said nothing.
    pub async fn handle_speech(
        &self,
        call_sid: &str,
        speech: Option<&str>,
        state: TurnState,
    ) -> VoiceDocument {
        // held until the turn's outcome is recorded, so turns for one call
        // never overlap and a terminated call stays terminated
        let mut session = match self.store().lock(call_sid).await {
            Ok(session) => session,
            Err(e) => {
                warn!(call_sid, error=%e, "turn without a conversation");
                return VoiceDocument::End {
                    say: Some(self.speak(ERROR_APOLOGY).await),
                };
            }
        };
        if session.phase == CallPhase::Terminated {
            debug!(call_sid, "turn for a terminated call");
            return VoiceDocument::End { say: None };
        }
        // a callback that lost its state must not rewind the call
        let state = TurnState {
            retry_count: state.retry_count.max(session.retry_count),
            elapsed_seconds: state.elapsed_seconds.max(session.elapsed_seconds),
        };

        let speech = speech.unwrap_or_default().trim();
        if is_silence(speech) {
            let retry_count = state.retry_count + 1;
            if retry_count > MAX_SILENCE_RETRIES {
                info!(call_sid, retry_count, "caller stayed silent");
                return self.hang_up(session, SILENCE_GOODBYE).await;
            }
            let next = TurnState {
                retry_count,
                elapsed_seconds: state.elapsed_seconds + SILENCE_RETRY_COST_SECS,
            };
            debug!(call_sid, retry_count, "no speech; re-prompting");
            mark_listening(&mut session, next);
            drop(session);
            return VoiceDocument::Listen {
                say: self.speak(DID_NOT_HEAR).await,
                next,
            };
        }

        if state.elapsed_seconds >= MAX_CALL_SECS {
            info!(call_sid, elapsed = state.elapsed_seconds, "call time budget spent");
            return self.hang_up(session, TIME_BUDGET_GOODBYE).await;
        }

        debug!(call_sid, speech, "caller said");
        let rejected = is_hard_rejection(&normalize(speech), session.domain);
        session.phase = CallPhase::Responding;
        let reply = match self.engine.respond(&mut session, speech).await {
            Ok(reply) => truncate_reply(&reply),
            Err(e) => {
                error!(call_sid, error=%e, "no reply for this turn; ending call");
                return self.hang_up(session, ERROR_APOLOGY).await;
            }
        };

        if rejected || contains_goodbye(&reply) {
            info!(call_sid, rejected, reply=%reply, "conversation finished");
            session.terminate();
            drop(session);
            return VoiceDocument::End {
                say: Some(self.speak(&reply).await),
            };
        }

        let next = TurnState {
            retry_count: 0,
            elapsed_seconds: state.elapsed_seconds + TURN_COST_SECS,
        };
        mark_listening(&mut session, next);
        drop(session);
        VoiceDocument::Listen {
            say: self.speak(&reply).await,
            next,
        }
    }

    /// Status callback. The first terminal status for a call hands it to the
    /// analysis queue; anything else is a no-op.
    pub async fn handle_status(&self, payload: &StatusPayload, contact_id: Option<i64>) {
        let call_sid = payload.call_sid.as_str();
        if !payload.call_status.is_terminal() {
            debug!(call_sid, status = payload.call_status.as_str(), "call progress");
            return;
        }
        let transcript = if self.store().finalize(call_sid).await {
            self.store().end(call_sid).await
        } else if self.store().contains(call_sid) {
            debug!(call_sid, "duplicate terminal status ignored");
            return;
        } else {
            // never answered, or answered before a restart
            vec![]
        };
        let phone = if contact_id.is_some() {
            payload.to.clone()
        } else {
            payload.from.clone()
        };
        let job = AnalysisJob {
            call_sid: call_sid.to_string(),
            contact_id,
            phone: phone.unwrap_or_default(),
            status: payload.call_status.as_str().to_string(),
            duration_seconds: payload.call_duration.unwrap_or(0),
            transcript,
        };
        info!(
            call_sid,
            status = payload.call_status.as_str(),
            duration = job.duration_seconds,
            "call ended"
        );
        if let Err(e) = self.analysis.enqueue(job) {
            error!(call_sid, error=%e, "call record dropped");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::analyzer::{AnalysisWorker, CallAnalyzer, RetryPolicy};
    use crate::db::Db;
    use crate::llm::fake::ScriptedModel;
    use crate::synthesizer::fake::{voice, CountingProvider};
    use std::time::Duration;
    use tempfile::TempDir;

    pub struct Harness {
        pub controller: CallFlowController,
        pub worker: AnalysisWorker,
        pub model: Arc<ScriptedModel>,
        pub tts: Arc<CountingProvider>,
        pub synthesizer: Arc<SpeechSynthesizer>,
        pub db: Db,
        pub _audio: TempDir,
    }

    /// `replies` feed the conversation; `analysis` feeds the post-call worker.
    pub async fn harness(replies: Vec<Result<&str, &str>>, analysis: Vec<Result<&str, &str>>) -> Harness {
        harness_with(Arc::new(ScriptedModel::new(replies)), analysis).await
    }

    pub async fn harness_with(model: Arc<ScriptedModel>, analysis: Vec<Result<&str, &str>>) -> Harness {
        let audio = tempfile::tempdir().unwrap();
        let db = Db::in_memory().await;
        let tts = Arc::new(CountingProvider::default());
        let synthesizer = Arc::new(
            SpeechSynthesizer::load(
                Some(tts.clone()),
                voice(),
                audio.path(),
                "https://bot.example.com",
            )
            .await
            .unwrap(),
        );
        let engine = ConversationEngine::new(Arc::new(TranscriptStore::new()), model.clone());
        let (queue, worker) = AnalysisQueue::new(
            CallAnalyzer::new(Arc::new(ScriptedModel::new(analysis))),
            db.clone(),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::ZERO,
            },
        );
        Harness {
            controller: CallFlowController::new(Arc::new(engine), synthesizer.clone(), queue),
            worker,
            model,
            tts,
            synthesizer,
            db,
            _audio: audio,
        }
    }
}
