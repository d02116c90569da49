use crate::error::AppError;
use crate::openai_types::{OpenAIBatchResponse, OpenAIPayload};
use crate::transcript::Message;

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Sampling knobs for one completion request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub top_p: Option<f32>,
}

impl SamplingParams {
    /// Lively, one-or-two-sentence phone replies.
    pub const CONVERSATION: SamplingParams = SamplingParams {
        temperature: 0.9,
        max_tokens: 60,
        presence_penalty: Some(0.4),
        frequency_penalty: Some(0.4),
        top_p: Some(0.95),
    };

    pub const ANALYSIS: SamplingParams = SamplingParams {
        temperature: 0.3,
        max_tokens: 500,
        presence_penalty: None,
        frequency_penalty: None,
        top_p: None,
    };
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, messages: &[Message], params: &SamplingParams)
        -> Result<String, AppError>;
}

pub struct OpenAIClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIClient {
    pub fn new(http_client: reqwest::Client, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ChatModel for OpenAIClient {
    async fn complete(
        &self,
        messages: &[Message],
        params: &SamplingParams,
    ) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = OpenAIPayload {
            model: &self.model,
            messages,
            temperature: Some(params.temperature),
            max_tokens: Some(params.max_tokens),
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            top_p: params.top_p,
        };
        let resp = self
            .http_client
            .post(url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(20))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to OpenAI");
                AppError::Model(format!("request failed: {e}"))
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body=%body, "OpenAI returned an error status");
            return Err(AppError::Model(format!("status {status}")));
        }
        let resp = resp.json::<OpenAIBatchResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize openai response");
            AppError::Model(format!("malformed response: {e}"))
        })?;
        let usage = resp.usage.unwrap_or_default();
        let choice = resp.choices.into_iter().next();
        let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
        debug!(
            id=%resp.id,
            model=%resp.model,
            finish_reason=?finish_reason,
            prompt_tokens=usage.prompt_tokens,
            completion_tokens=usage.completion_tokens,
            total_tokens=usage.total_tokens,
            "openai completion"
        );
        if finish_reason.as_deref() == Some("length") {
            warn!(id=%resp.id, "completion cut off at max_tokens");
        }
        choice
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::Model("empty completion".to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;

    #[tokio::test]
    async fn sends_sampling_params_and_reads_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4o-mini",
                "temperature": 0.9,
                "max_tokens": 60,
                "messages": [{"role": "system", "content": "sys"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4o-mini",
                "choices":[{"index":0,"finish_reason":"stop","message":{"role":"assistant","content":"  Dobrý den!  "}}]}"#,
            )
            .create_async()
            .await;

        let client = OpenAIClient::new(
            reqwest::Client::new(),
            &format!("{}/v1", server.url()),
            "sk-test",
            "gpt-4o-mini",
        );
        let reply = client
            .complete(&[Message::new(Role::System, "sys")], &SamplingParams::CONVERSATION)
            .await
            .unwrap();
        assert_eq!(reply, "Dobrý den!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_status_is_a_model_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"quota"}}"#)
            .create_async()
            .await;

        let client = OpenAIClient::new(reqwest::Client::new(), &server.url(), "k", "m");
        let err = client
            .complete(&[Message::new(Role::User, "hi")], &SamplingParams::ANALYSIS)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Model(_)));
    }
}
