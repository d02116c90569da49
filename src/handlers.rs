use crate::campaign::OutboundParams;
use crate::flow::{TurnState, VoiceDocument};
use crate::twilio_types::{StatusPayload, VoicePayload};
use crate::types::AppState;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

#[derive(Deserialize, Debug, Default)]
pub struct StatusQuery {
    #[serde(default)]
    pub contact_id: Option<i64>,
}

fn twiml_response(app_state: &AppState, doc: &VoiceDocument) -> Response {
    let twiml = doc.to_twiml(&app_state.config.public_base_url);
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml).into_response()
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "Bad request").into_response()
}

fn parse_voice(body: &str) -> Option<VoicePayload> {
    trace!(body=%body, "voice webhook body");
    match serde_urlencoded::from_str::<VoicePayload>(body) {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio voice payload");
            None
        }
    }
}

/// `/inbound` and `/voice`: someone called us.
pub async fn inbound(State(app_state): State<Arc<AppState>>, body: String) -> Response {
    let Some(payload) = parse_voice(&body) else {
        return bad_request();
    };
    let doc = app_state
        .controller
        .greet_inbound(&payload.call_sid, payload.from.as_deref())
        .await;
    twiml_response(&app_state, &doc)
}

/// `/outbound`: a campaign call was answered.
pub async fn outbound(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<OutboundParams>,
    body: String,
) -> Response {
    let Some(payload) = parse_voice(&body) else {
        return bad_request();
    };
    debug!(call_sid=%payload.call_sid, ?params, "outbound webhook");
    let doc = app_state
        .controller
        .greet_outbound(&payload.call_sid, &params.name, params.company.as_deref())
        .await;
    twiml_response(&app_state, &doc)
}

/// `/process/:retry_count/:elapsed_seconds`: one gathered turn (or a timeout
/// redirect with no speech). Bare `/process` starts from zero.
pub async fn process(
    State(app_state): State<Arc<AppState>>,
    state: Option<Path<TurnState>>,
    body: String,
) -> Response {
    let state = state.map(|Path(state)| state).unwrap_or_default();
    let Some(payload) = parse_voice(&body) else {
        return bad_request();
    };
    if let Some(confidence) = payload.confidence {
        debug!(call_sid=%payload.call_sid, confidence, "speech recognized");
    }
    let doc = app_state
        .controller
        .handle_speech(&payload.call_sid, payload.speech_result.as_deref(), state)
        .await;
    twiml_response(&app_state, &doc)
}

/// `/call-status`: always acknowledged so the provider doesn't retry.
pub async fn call_status(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "status callback body");
    match serde_urlencoded::from_str::<StatusPayload>(&body) {
        Ok(payload) => {
            app_state
                .controller
                .handle_status(&payload, query.contact_id)
                .await
        }
        Err(e) => warn!(error=%e, "ignoring unreadable status callback"),
    }
    "OK"
}

pub async fn audio_handler(
    State(app_state): State<Arc<AppState>>,
    Path(file_name): Path<String>,
) -> Response {
    let Some(path) = app_state.synthesizer.audio_path(&file_name) else {
        warn!(file=%file_name, "rejected audio path");
        return StatusCode::NOT_FOUND.into_response();
    };
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error=%e, file=%file_name, "audio not found");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("audio/mpeg"),
    );
    (headers, body).into_response()
}

pub async fn health(State(app_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "twilio-callbot",
        "active_calls": app_state.controller.active_sessions(),
    }))
}

pub async fn stats(State(app_state): State<Arc<AppState>>) -> Response {
    match app_state.db.overall_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error=%e, "failed to load stats");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::flow::test_support::{harness, Harness};
    use crate::router;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct TestApp {
        router: axum::Router,
        synthesizer: Arc<crate::synthesizer::SpeechSynthesizer>,
        _worker: crate::analyzer::AnalysisWorker,
        _audio: tempfile::TempDir,
    }

    async fn app(replies: Vec<Result<&str, &str>>) -> TestApp {
        let Harness {
            controller,
            worker,
            synthesizer,
            db,
            _audio,
            ..
        } = harness(replies, vec![]).await;
        let state = Arc::new(AppState {
            config: test_config(),
            db,
            controller,
            synthesizer: synthesizer.clone(),
        });
        TestApp {
            router: router(state),
            synthesizer,
            _worker: worker,
            _audio,
        }
    }

    fn form(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn inbound_call_gets_greeting_and_gather() {
        let test_app = app(vec![]).await;
        let app = test_app.router.clone();
        let resp = app
            .oneshot(form("/inbound", "CallSid=CA1&From=%2B420111222333"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/xml");
        let twiml = body_text(resp).await;
        assert!(twiml.contains("<Play>https://bot.example.com/audio/"));
        assert!(twiml.contains("<Gather input=\"speech\""));
    }

    #[tokio::test]
    async fn malformed_webhook_is_bad_request() {
        let test_app = app(vec![]).await;
        let app = test_app.router.clone();
        let resp = app.oneshot(form("/voice", "nothing=here")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn outbound_then_process_round_trips_state() {
        let test_app = app(vec![Ok("Rozumím. Kdy se vám hodí schůzka?")]).await;
        let app = test_app.router.clone();
        let resp = app
            .clone()
            .oneshot(form("/outbound?name=Jan&contact_id=1", "CallSid=CA1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(form(
                "/process/1/12",
                "CallSid=CA1&SpeechResult=nem%C3%A1me+web&Confidence=0.91",
            ))
            .await
            .unwrap();
        let twiml = body_text(resp).await;
        assert!(twiml.contains("/process/0/20"));
    }

    #[tokio::test]
    async fn status_callback_always_acknowledges() {
        let test_app = app(vec![]).await;
        let app = test_app.router.clone();
        let resp = app
            .clone()
            .oneshot(form("/call-status?contact_id=3", "garbage"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "OK");

        let resp = app
            .oneshot(form("/call-status", "CallSid=CA9&CallStatus=completed&CallDuration=3"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn audio_is_served_and_traversal_rejected() {
        let test_app = app(vec![]).await;
        let audio = test_app.synthesizer.synthesize("Dobrý den", true).await.unwrap();
        let app = test_app.router.clone();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/audio/{}", audio.file_name))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "audio/mpeg");

        let resp = app
            .oneshot(Request::builder().uri("/audio/cache.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_stats_are_json() {
        let test_app = app(vec![]).await;
        let app = test_app.router.clone();
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(health["status"], "ok");

        let resp = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(stats["total_calls"], 0);
    }
}
