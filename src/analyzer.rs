use crate::db::Db;
use crate::db_types::{ContactStatus, NewCall};
use crate::error::AppError;
use crate::llm::{ChatModel, SamplingParams};
use crate::transcript::{Message, Role};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Calls shorter than this carry too little signal to score.
pub const MIN_ANALYSIS_SECS: u32 = 10;
/// Dialogue lines (system prompt excluded) a transcript needs before scoring.
pub const MIN_ANALYSIS_MESSAGES: usize = 2;

const ANALYST_PROMPT: &str =
    "Jsi AI analytik prodejních hovorů. Analyzuješ cold calling a vracíš JSON.";

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    MeetingScheduled,
    Interested,
    CallbackNeeded,
    Rejected,
    NoInterest,
    Unknown,
    Error,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::MeetingScheduled => "meeting_scheduled",
            Outcome::Interested => "interested",
            Outcome::CallbackNeeded => "callback_needed",
            Outcome::Rejected => "rejected",
            Outcome::NoInterest => "no_interest",
            Outcome::Unknown => "unknown",
            Outcome::Error => "error",
        }
    }

    /// Only the five classes the model may choose from.
    fn classified(raw: &str) -> Option<Self> {
        match raw.trim() {
            "meeting_scheduled" => Some(Outcome::MeetingScheduled),
            "interested" => Some(Outcome::Interested),
            "callback_needed" => Some(Outcome::CallbackNeeded),
            "rejected" => Some(Outcome::Rejected),
            "no_interest" => Some(Outcome::NoInterest),
            _ => None,
        }
    }

    pub fn contact_status(self) -> ContactStatus {
        match self {
            Outcome::MeetingScheduled => ContactStatus::Success,
            Outcome::Rejected => ContactStatus::Failed,
            _ => ContactStatus::Contacted,
        }
    }
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct AnalysisReport {
    pub outcome: Outcome,
    pub sales_score: u8,
    pub ai_summary: String,
    pub key_points: Vec<String>,
    pub next_action: String,
}

#[derive(Clone, PartialEq, Debug)]
pub enum AnalysisResult {
    Ok(AnalysisReport),
    /// The model answered but the answer was not a usable report
    Degraded { reason: String },
    /// The model could not be reached or refused the request
    Error { reason: String },
}

impl AnalysisResult {
    /// The report to persist. Degraded and failed analyses become placeholder
    /// reports with a zero score.
    pub fn to_report(&self) -> AnalysisReport {
        match self {
            AnalysisResult::Ok(report) => report.clone(),
            AnalysisResult::Degraded { reason } => AnalysisReport {
                outcome: Outcome::Unknown,
                sales_score: 0,
                ai_summary: format!("Chyba při parsování AI odpovědi: {reason}"),
                key_points: vec![],
                next_action: "Zkontrolovat manuálně".to_string(),
            },
            AnalysisResult::Error { reason } => AnalysisReport {
                outcome: Outcome::Error,
                sales_score: 0,
                ai_summary: format!("Analýza selhala: {reason}"),
                key_points: vec![],
                next_action: "Zkontrolovat manuálně".to_string(),
            },
        }
    }
}

#[derive(Deserialize)]
struct RawReport {
    outcome: String,
    sales_score: f64,
    #[serde(default)]
    ai_summary: String,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    next_action: String,
}

/// Long enough, with enough dialogue, and the caller said something.
pub fn should_analyze(duration_seconds: u32, transcript: &[Message]) -> bool {
    let dialogue = transcript.iter().filter(|m| m.role != Role::System).count();
    let caller_spoke = transcript.iter().any(|m| m.role == Role::User);
    duration_seconds >= MIN_ANALYSIS_SECS && dialogue >= MIN_ANALYSIS_MESSAGES && caller_spoke
}

/// Readable dialogue without the system prompt or knowledge-base context.
fn dialogue(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let speaker = match m.role {
                Role::Assistant => "Pavel (prodejce)",
                Role::User => "Zákazník",
                Role::System => return None,
            };
            let said = m
                .content
                .split(crate::engine::CONTEXT_MARKER)
                .next()
                .unwrap_or_default()
                .trim();
            Some(format!("{speaker}: {said}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn analysis_prompt(dialogue: &str) -> String {
    format!(
        r#"Analyzuj tento cold calling hovor o prodeji webových stránek.

KONVERZACE:
{dialogue}

VYHODNOŤ:
1. VÝSLEDEK (outcome): "meeting_scheduled" = schůzka domluvena nebo silný zájem, "interested" = zájem, ale nerozhodnut, "callback_needed" = zavolat později, "rejected" = tvrdé odmítnutí, "no_interest" = žádný zájem.
2. SALES SKÓRE (0-100): 90-100 schůzka domluvena, 70-89 silný zájem, 50-69 střední zájem, 30-49 slabý zájem, 0-29 odmítnutí.
3. SHRNUTÍ (2-3 věty): co se stalo, jak zákazník reagoval, důvod výsledku.
4. KLÍČOVÉ BODY: 2-3 nejdůležitější věci z hovoru.
5. DALŠÍ AKCE: co dělat dál.

VRAŤ JSON:
{{"outcome": "...", "sales_score": 0, "ai_summary": "...", "key_points": ["..."], "next_action": "..."}}

ODPOVĚĎ (POUZE JSON):"#
    )
}

/// Strips a markdown code fence if the model wrapped its JSON in one.
fn unfence(raw: &str) -> &str {
    let raw = raw.trim();
    let body = if let Some((_, rest)) = raw.split_once("```json") {
        rest
    } else if let Some((_, rest)) = raw.split_once("```") {
        rest
    } else {
        return raw;
    };
    body.split("```").next().unwrap_or(body).trim()
}

fn parse_report(raw: &str) -> AnalysisResult {
    let parsed = match serde_json::from_str::<RawReport>(unfence(raw)) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error=%e, raw=%raw, "analysis was not valid json");
            return AnalysisResult::Degraded {
                reason: e.to_string(),
            };
        }
    };
    let Some(outcome) = Outcome::classified(&parsed.outcome) else {
        return AnalysisResult::Degraded {
            reason: format!("unknown outcome '{}'", parsed.outcome),
        };
    };
    AnalysisResult::Ok(AnalysisReport {
        outcome,
        sales_score: parsed.sales_score.round().clamp(0.0, 100.0) as u8,
        ai_summary: parsed.ai_summary,
        key_points: parsed.key_points,
        next_action: parsed.next_action,
    })
}

/// Scores a finished conversation with one structured model request.
pub struct CallAnalyzer {
    model: Arc<dyn ChatModel>,
}

impl CallAnalyzer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    pub async fn analyze(&self, call_id: &str, transcript: &[Message]) -> AnalysisResult {
        let request = [
            Message::new(Role::System, ANALYST_PROMPT),
            Message::new(Role::User, analysis_prompt(&dialogue(transcript))),
        ];
        match self.model.complete(&request, &SamplingParams::ANALYSIS).await {
            Ok(raw) => {
                let result = parse_report(&raw);
                if let AnalysisResult::Ok(report) = &result {
                    info!(call_sid=%call_id, outcome=report.outcome.as_str(), score=report.sales_score, "call analyzed");
                }
                result
            }
            Err(e) => {
                error!(call_sid=%call_id, error=%e, "analysis request failed");
                AnalysisResult::Error {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Everything needed to record one ended call.
#[derive(Serialize, Clone, Debug)]
pub struct AnalysisJob {
    pub call_sid: String,
    pub contact_id: Option<i64>,
    pub phone: String,
    pub status: String,
    pub duration_seconds: u32,
    pub transcript: Vec<Message>,
}

impl AnalysisJob {
    pub fn should_analyze(&self) -> bool {
        should_analyze(self.duration_seconds, &self.transcript)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Sending half of the post-call pipeline. Enqueueing never blocks the
/// webhook that ended the call.
#[derive(Clone)]
pub struct AnalysisQueue {
    tx: mpsc::UnboundedSender<AnalysisJob>,
}

impl AnalysisQueue {
    pub fn new(analyzer: CallAnalyzer, db: Db, retry: RetryPolicy) -> (Self, AnalysisWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = AnalysisWorker {
            rx,
            analyzer,
            db,
            retry,
        };
        (Self { tx }, worker)
    }

    pub fn enqueue(&self, job: AnalysisJob) -> Result<(), AppError> {
        debug!(call_sid=%job.call_sid, "queueing post-call analysis");
        self.tx.send(job).map_err(|e| {
            error!(call_sid=%e.0.call_sid, "analysis worker is gone");
            AppError::BadRequest("analysis queue closed".to_string())
        })
    }
}

pub struct AnalysisWorker {
    rx: mpsc::UnboundedReceiver<AnalysisJob>,
    analyzer: CallAnalyzer,
    db: Db,
    retry: RetryPolicy,
}

impl AnalysisWorker {
    pub async fn run(mut self) {
        info!("analysis worker started");
        while self.run_once().await {}
        info!("analysis worker stopped");
    }

    /// Processes the next queued job. Returns false once every sender is gone.
    pub async fn run_once(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                if self.already_recorded(&job).await {
                    debug!(call_sid=%job.call_sid, "late status for a recorded call; keeping the existing record");
                } else {
                    self.process(&job).await;
                }
                true
            }
            None => false,
        }
    }

    /// A job without a transcript comes from a callback for a call the
    /// process no longer knows. It must not replace a record written earlier.
    async fn already_recorded(&self, job: &AnalysisJob) -> bool {
        if !job.transcript.is_empty() {
            return false;
        }
        match self.db.get_call_by_sid(&job.call_sid).await {
            Ok(existing) => existing.is_some(),
            Err(e) => {
                warn!(call_sid=%job.call_sid, error=%e, "could not check for an existing call record");
                false
            }
        }
    }

    async fn analyze_with_retry(&self, job: &AnalysisJob) -> AnalysisResult {
        let mut attempt = 1;
        loop {
            let result = self.analyzer.analyze(&job.call_sid, &job.transcript).await;
            match result {
                AnalysisResult::Error { .. } if attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(call_sid=%job.call_sid, attempt, ?delay, "retrying analysis");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn persist(&self, job: &AnalysisJob, report: &AnalysisReport) -> Result<(), AppError> {
        let call = NewCall {
            contact_id: job.contact_id,
            call_sid: job.call_sid.clone(),
            phone: job.phone.clone(),
            duration_seconds: job.duration_seconds,
            status: job.status.clone(),
            outcome: report.outcome.as_str().to_string(),
            sales_score: report.sales_score,
            ai_summary: Some(report.ai_summary.clone()).filter(|s| !s.is_empty()),
            key_points: report.key_points.clone(),
            next_action: Some(report.next_action.clone()).filter(|s| !s.is_empty()),
            transcript: serde_json::to_string(&job.transcript)
                .map_err(|e| AppError::BadRequest(format!("unserializable transcript: {e}")))?,
        };
        self.db.upsert_call(&call).await?;
        if let Some(contact_id) = job.contact_id {
            self.db
                .update_contact_status(contact_id, report.outcome.contact_status())
                .await?;
        }
        Ok(())
    }

    async fn persist_with_retry(&self, job: &AnalysisJob, report: &AnalysisReport) -> Result<(), AppError> {
        let mut attempt = 1;
        loop {
            match self.persist(job, report).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.attempts => {
                    warn!(call_sid=%job.call_sid, attempt, error=%e, "retrying call record write");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dead_letter(&self, job: &AnalysisJob, reason: &str) {
        let payload = serde_json::to_string(job).unwrap_or_default();
        if let Err(e) = self.db.insert_dead_letter(&job.call_sid, reason, &payload).await {
            error!(call_sid=%job.call_sid, error=%e, reason, "failed to write dead letter; analysis lost");
        }
    }

    /// Analyzes the call when it carries enough signal and records the
    /// outcome. Permanent failures end up in the dead-letter table.
    pub async fn process(&self, job: &AnalysisJob) -> AnalysisReport {
        let report = if job.should_analyze() {
            let result = self.analyze_with_retry(job).await;
            if let AnalysisResult::Error { reason } = &result {
                self.dead_letter(job, reason).await;
            }
            result.to_report()
        } else {
            debug!(
                call_sid=%job.call_sid,
                duration = job.duration_seconds,
                messages = job.transcript.len(),
                "call too short to analyze"
            );
            AnalysisReport {
                outcome: Outcome::Unknown,
                sales_score: 0,
                ai_summary: String::new(),
                key_points: vec![],
                next_action: String::new(),
            }
        };
        if let Err(e) = self.persist_with_retry(job, &report).await {
            error!(call_sid=%job.call_sid, error=%e, "giving up on call record");
            self.dead_letter(job, &e.to_string()).await;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::seeded_contact;
    use crate::llm::fake::ScriptedModel;

    fn transcript() -> Vec<Message> {
        vec![
            Message::new(Role::System, "sys"),
            Message::new(Role::Assistant, "Dobrý den, Jan, volám z MoravskeWeby."),
            Message::new(Role::User, "kolik to stojí\n\n[INFO Z DATABÁZE]:\nCENÍK: ..."),
            Message::new(Role::Assistant, "One-page web stojí 8 000 Kč."),
        ]
    }

    fn job(contact_id: Option<i64>, duration_seconds: u32, transcript: Vec<Message>) -> AnalysisJob {
        AnalysisJob {
            call_sid: "CA1".to_string(),
            contact_id,
            phone: "+420111222333".to_string(),
            status: "completed".to_string(),
            duration_seconds,
            transcript,
        }
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn thresholds_need_duration_and_caller_speech() {
        assert!(should_analyze(10, &transcript()));
        assert!(!should_analyze(9, &transcript()));
        assert!(!should_analyze(120, &transcript()[..2]));
    }

    #[test]
    fn silent_caller_is_not_scored() {
        let silent = vec![
            Message::new(Role::System, "sys"),
            Message::new(Role::Assistant, "Dobrý den, Jan, volám z MoravskeWeby."),
            Message::new(Role::Assistant, crate::prompts::SILENCE_GOODBYE),
        ];
        assert!(!should_analyze(45, &silent));
    }

    #[test]
    fn dialogue_hides_system_prompt_and_context() {
        let text = dialogue(&transcript());
        assert!(!text.contains("sys"));
        assert!(!text.contains("CENÍK"));
        assert!(text.contains("Zákazník: kolik to stojí"));
        assert!(text.starts_with("Pavel (prodejce): Dobrý den"));
    }

    #[test]
    fn parses_fenced_json_and_clamps_score() {
        let raw = "```json\n{\"outcome\": \"interested\", \"sales_score\": 140, \"ai_summary\": \"Zájem.\", \"key_points\": [\"starý web\"], \"next_action\": \"Poslat nabídku\"}\n```";
        match parse_report(raw) {
            AnalysisResult::Ok(report) => {
                assert_eq!(report.outcome, Outcome::Interested);
                assert_eq!(report.sales_score, 100);
                assert_eq!(report.key_points, vec!["starý web"]);
            }
            other => panic!("expected a report, got {other:?}"),
        }
    }

    #[test]
    fn malformed_output_degrades() {
        let result = parse_report("Hovor proběhl dobře.");
        assert!(matches!(result, AnalysisResult::Degraded { .. }));
        let report = result.to_report();
        assert_eq!(report.outcome, Outcome::Unknown);
        assert_eq!(report.sales_score, 0);
        assert_eq!(report.next_action, "Zkontrolovat manuálně");

        let unknown = parse_report(r#"{"outcome": "maybe", "sales_score": 50}"#);
        assert!(matches!(unknown, AnalysisResult::Degraded { reason } if reason.contains("maybe")));
    }

    #[tokio::test]
    async fn provider_failure_is_error_result() {
        let analyzer = CallAnalyzer::new(Arc::new(ScriptedModel::new(vec![Err("quota")])));
        let result = analyzer.analyze("CA1", &transcript()).await;
        assert!(matches!(result, AnalysisResult::Error { .. }));
        assert_eq!(result.to_report().outcome, Outcome::Error);
    }

    #[tokio::test]
    async fn rejected_call_fails_contact() {
        let db = Db::in_memory().await;
        let (_, contact_id) = seeded_contact(&db, "Jan", "+420111222333").await;
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            r#"{"outcome":"rejected","sales_score":5,"ai_summary":"Nemá zájem.","key_points":[],"next_action":"Nevolat"}"#,
        )]));
        let (_queue, worker) = AnalysisQueue::new(CallAnalyzer::new(model), db.clone(), no_wait());

        let report = worker.process(&job(Some(contact_id), 40, transcript())).await;
        assert_eq!(report.outcome, Outcome::Rejected);
        let contact = db.get_contact(contact_id).await.unwrap().unwrap();
        assert_eq!(contact.status, "failed");
        let call = db.get_call_by_sid("CA1").await.unwrap().unwrap();
        assert_eq!(call.outcome, "rejected");
        assert_eq!(call.sales_score, 5);
    }

    #[tokio::test]
    async fn short_call_is_recorded_without_analysis() {
        let db = Db::in_memory().await;
        let model = Arc::new(ScriptedModel::new(vec![]));
        let (_queue, worker) =
            AnalysisQueue::new(CallAnalyzer::new(model.clone()), db.clone(), no_wait());

        let two_messages = transcript()[..2].to_vec();
        worker.process(&job(None, 300, two_messages)).await;
        assert_eq!(model.calls(), 0);
        let call = db.get_call_by_sid("CA1").await.unwrap().unwrap();
        assert_eq!(call.outcome, "unknown");
        assert_eq!(call.duration_seconds, 300);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let db = Db::in_memory().await;
        let model = Arc::new(ScriptedModel::new(vec![
            Err("timeout"),
            Ok(r#"{"outcome":"meeting_scheduled","sales_score":95}"#),
        ]));
        let (_queue, worker) =
            AnalysisQueue::new(CallAnalyzer::new(model.clone()), db.clone(), no_wait());

        let report = worker.process(&job(None, 60, transcript())).await;
        assert_eq!(report.outcome, Outcome::MeetingScheduled);
        assert_eq!(model.calls(), 2);
        assert!(db.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered() {
        let db = Db::in_memory().await;
        let (_, contact_id) = seeded_contact(&db, "Jan", "+420111222333").await;
        let model = Arc::new(ScriptedModel::new(vec![Err("down"), Err("down"), Err("down")]));
        let (_queue, worker) =
            AnalysisQueue::new(CallAnalyzer::new(model.clone()), db.clone(), no_wait());

        worker.process(&job(Some(contact_id), 60, transcript())).await;
        assert_eq!(model.calls(), 3);
        let letters = db.list_dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].payload.contains("\"call_sid\":\"CA1\""));
        let call = db.get_call_by_sid("CA1").await.unwrap().unwrap();
        assert_eq!(call.outcome, "error");
        let contact = db.get_contact(contact_id).await.unwrap().unwrap();
        assert_eq!(contact.status, "contacted");
    }

    #[tokio::test]
    async fn late_status_keeps_analyzed_record() {
        let db = Db::in_memory().await;
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            r#"{"outcome":"interested","sales_score":70,"ai_summary":"Zájem.","key_points":[],"next_action":"Poslat nabídku"}"#,
        )]));
        let (queue, mut worker) = AnalysisQueue::new(CallAnalyzer::new(model), db.clone(), no_wait());
        queue.enqueue(job(None, 60, transcript())).unwrap();
        queue.enqueue(job(None, 60, vec![])).unwrap();
        assert!(worker.run_once().await);
        assert!(worker.run_once().await);

        let call = db.get_call_by_sid("CA1").await.unwrap().unwrap();
        assert_eq!(call.outcome, "interested");
        assert_eq!(call.sales_score, 70);
        assert!(call.transcript.contains("kolik to stojí"));
    }

    #[tokio::test]
    async fn queue_feeds_worker() {
        let db = Db::in_memory().await;
        let model = Arc::new(ScriptedModel::new(vec![]));
        let (queue, mut worker) = AnalysisQueue::new(CallAnalyzer::new(model), db.clone(), no_wait());
        queue.enqueue(job(None, 3, vec![])).unwrap();
        drop(queue);
        assert!(worker.run_once().await);
        assert!(!worker.run_once().await);
        assert!(db.get_call_by_sid("CA1").await.unwrap().is_some());
    }
}
