use crate::config::{CallingHours, Config};
use crate::db::Db;
use crate::db_types::{CampaignStatus, ContactStatus};
use crate::error::AppError;
use crate::prompts::outbound_greeting;
use crate::synthesizer::SpeechSynthesizer;
use crate::telephony::{OutboundCall, Telephony};
use crate::utils::with_query;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

const RING_TIMEOUT_SECS: u32 = 30;

/// Query parameters of the `/outbound` webhook, set when the call is placed.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct OutboundParams {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<i64>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CampaignSummary {
    pub placed: usize,
    pub failed: usize,
    pub stopped_outside_hours: bool,
}

/// Dials a campaign's pending contacts one at a time.
pub struct CampaignRunner {
    db: Db,
    telephony: Arc<dyn Telephony>,
    synthesizer: Arc<SpeechSynthesizer>,
    from_number: String,
    public_base_url: String,
    calling_hours: CallingHours,
    interval: Duration,
    clock: fn() -> OffsetDateTime,
}

impl CampaignRunner {
    pub fn new(
        db: Db,
        telephony: Arc<dyn Telephony>,
        synthesizer: Arc<SpeechSynthesizer>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            telephony,
            synthesizer,
            from_number: config.twilio_phone_number.clone(),
            public_base_url: config.public_base_url.clone(),
            calling_hours: config.calling_hours.clone(),
            interval: config.dial_interval(),
            clock: OffsetDateTime::now_utc,
        }
    }

    pub async fn run(
        &self,
        campaign_id: i64,
        max_calls: Option<usize>,
    ) -> Result<CampaignSummary, AppError> {
        let campaign = self
            .db
            .get_campaign(campaign_id)
            .await?
            .ok_or_else(|| AppError::BadRequest(format!("no campaign with id {campaign_id}")))?;
        if campaign.status == CampaignStatus::Paused.as_str() {
            warn!(campaign_id, "campaign is paused; not dialing");
            return Ok(CampaignSummary::default());
        }
        let mut contacts = self
            .db
            .list_contacts(Some(campaign_id), Some(ContactStatus::Pending))
            .await?;
        if let Some(max_calls) = max_calls {
            contacts.truncate(max_calls);
        }
        info!(campaign_id, name=%campaign.name, contacts = contacts.len(), "starting campaign");

        let mut summary = CampaignSummary::default();
        for (i, contact) in contacts.iter().enumerate() {
            if i > 0 {
                debug!(interval = ?self.interval, "waiting before next dial");
                tokio::time::sleep(self.interval).await;
            }
            if !self.calling_hours.allows((self.clock)()) {
                warn!(campaign_id, "outside calling hours; stopping");
                summary.stopped_outside_hours = true;
                break;
            }

            self.db
                .update_contact_status(contact.id, ContactStatus::Calling)
                .await?;
            let greeting = outbound_greeting(&contact.name, contact.company.as_deref());
            if self.synthesizer.synthesize(&greeting, true).await.is_none() {
                debug!(contact_id = contact.id, "greeting not pre-synthesized");
            }

            let params = OutboundParams {
                name: contact.name.clone(),
                company: contact.company.clone(),
                campaign_id: Some(campaign_id),
                contact_id: Some(contact.id),
            };
            let call = OutboundCall {
                to: contact.phone.clone(),
                from: self.from_number.clone(),
                url: with_query(&format!("{}/outbound", self.public_base_url), &params),
                status_callback: with_query(
                    &format!("{}/call-status", self.public_base_url),
                    &[("contact_id", contact.id)],
                ),
                timeout_secs: RING_TIMEOUT_SECS,
            };
            match self.telephony.place_call(&call).await {
                Ok(call_sid) => {
                    info!(%call_sid, contact_id = contact.id, phone=%contact.phone, "dialed");
                    summary.placed += 1;
                }
                Err(e) => {
                    error!(contact_id = contact.id, error=%e, "dial failed");
                    self.db
                        .update_contact_status(contact.id, ContactStatus::Error)
                        .await?;
                    summary.failed += 1;
                }
            }
        }

        self.db.refresh_campaign_status(campaign_id).await?;
        info!(
            campaign_id,
            placed = summary.placed,
            failed = summary.failed,
            stopped_outside_hours = summary.stopped_outside_hours,
            "campaign run finished"
        );
        Ok(summary)
    }
}
