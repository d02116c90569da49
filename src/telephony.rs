use crate::error::AppError;

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

/// Everything the provider needs to ring one number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundCall {
    pub to: String,
    pub from: String,
    /// Fetched by the provider when the callee answers
    pub url: String,
    pub status_callback: String,
    pub timeout_secs: u32,
}

#[async_trait]
pub trait Telephony: Send + Sync {
    /// Returns the provider's call id.
    async fn place_call(&self, call: &OutboundCall) -> Result<String, AppError>;
}

#[derive(Deserialize)]
struct CreatedCall {
    sid: String,
}

pub struct TwilioClient {
    http_client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
}

impl TwilioClient {
    pub fn new(
        http_client: reqwest::Client,
        api_base: &str,
        account_sid: &str,
        auth_token: &str,
    ) -> Self {
        Self {
            http_client,
            api_base: api_base.trim_end_matches('/').to_string(),
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
        }
    }
}

#[async_trait]
impl Telephony for TwilioClient {
    async fn place_call(&self, call: &OutboundCall) -> Result<String, AppError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );
        let timeout = call.timeout_secs.to_string();
        let resp = self
            .http_client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .timeout(Duration::from_secs(15))
            .form(&[
                ("To", call.to.as_str()),
                ("From", call.from.as_str()),
                ("Url", call.url.as_str()),
                ("Method", "POST"),
                ("StatusCallback", call.status_callback.as_str()),
                ("StatusCallbackEvent", "completed"),
                ("StatusCallbackMethod", "POST"),
                ("Timeout", timeout.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send create-call request to Twilio");
                AppError::Telephony(format!("request failed: {e}"))
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body=%body, to=%call.to, "Twilio rejected the call");
            return Err(AppError::Telephony(format!("status {status}")));
        }
        let created = resp.json::<CreatedCall>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize Twilio create-call response");
            AppError::Telephony(format!("malformed response: {e}"))
        })?;
        info!(call_sid=%created.sid, to=%call.to, "outbound call placed");
        Ok(created.sid)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn call() -> OutboundCall {
        OutboundCall {
            to: "+420111222333".to_string(),
            from: "+420555000111".to_string(),
            url: "https://bot.example.com/outbound?name=Jan".to_string(),
            status_callback: "https://bot.example.com/call-status?contact_id=1".to_string(),
            timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn posts_form_and_returns_sid() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/2010-04-01/Accounts/AC123/Calls.json")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("To".into(), "+420111222333".into()),
                Matcher::UrlEncoded("Timeout".into(), "30".into()),
                Matcher::UrlEncoded("StatusCallbackEvent".into(), "completed".into()),
            ]))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sid":"CA42","status":"queued"}"#)
            .create_async()
            .await;

        let client = TwilioClient::new(reqwest::Client::new(), &server.url(), "AC123", "secret");
        assert_eq!(client.place_call(&call()).await.unwrap(), "CA42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn provider_error_is_telephony_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/2010-04-01/Accounts/AC123/Calls.json")
            .with_status(400)
            .with_body(r#"{"code":21211,"message":"invalid To"}"#)
            .create_async()
            .await;

        let client = TwilioClient::new(reqwest::Client::new(), &server.url(), "AC123", "secret");
        let err = client.place_call(&call()).await.unwrap_err();
        assert!(matches!(err, AppError::Telephony(_)));
    }
}
