use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Pending,
    Calling,
    Contacted,
    Success,
    Failed,
    Error,
}

impl ContactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::Calling => "calling",
            ContactStatus::Contacted => "contacted",
            ContactStatus::Success => "success",
            ContactStatus::Failed => "failed",
            ContactStatus::Error => "error",
        }
    }
}

impl FromStr for ContactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContactStatus::Pending),
            "calling" => Ok(ContactStatus::Calling),
            "contacted" => Ok(ContactStatus::Contacted),
            "success" => Ok(ContactStatus::Success),
            "failed" => Ok(ContactStatus::Failed),
            "error" => Ok(ContactStatus::Error),
            other => Err(format!("unknown contact status '{other}'")),
        }
    }
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            other => Err(format!("unknown campaign status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Contact {
    pub id: i64,
    pub campaign_id: Option<i64>,
    pub name: String,
    pub phone: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewContact {
    pub campaign_id: Option<i64>,
    pub name: String,
    pub phone: String,
    pub company: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddContact {
    Added(i64),
    /// A contact with this phone number already exists; nothing was written
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct CallRecord {
    pub id: i64,
    pub contact_id: Option<i64>,
    pub call_sid: String,
    pub phone: String,
    pub duration_seconds: i64,
    pub status: String,
    pub outcome: String,
    pub sales_score: i64,
    pub ai_summary: Option<String>,
    pub key_points: Option<String>,
    pub next_action: Option<String>,
    /// JSON-serialized message list
    pub transcript: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Values written by an upsert keyed on `call_sid`.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub contact_id: Option<i64>,
    pub call_sid: String,
    pub phone: String,
    pub duration_seconds: u32,
    pub status: String,
    pub outcome: String,
    pub sales_score: u8,
    pub ai_summary: Option<String>,
    pub key_points: Vec<String>,
    pub next_action: Option<String>,
    pub transcript: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CampaignStats {
    pub total_contacts: i64,
    pub total_calls: i64,
    pub called: i64,
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub avg_score: f64,
    pub avg_duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverallStats {
    pub campaigns: i64,
    pub contacts: i64,
    pub total_calls: i64,
    pub meetings: i64,
    pub success_rate: f64,
    pub avg_score: f64,
    pub avg_duration: f64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub call_sid: String,
    pub reason: String,
    pub payload: String,
    pub created_at: i64,
}

/// Rounds to one decimal place, the precision reports are shown in.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_parse_their_own_names() {
        for status in [
            ContactStatus::Pending,
            ContactStatus::Calling,
            ContactStatus::Contacted,
            ContactStatus::Success,
            ContactStatus::Failed,
            ContactStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ContactStatus>(), Ok(status));
        }
        assert!("done".parse::<CampaignStatus>().is_err());
    }

    #[test]
    fn rounds_to_one_decimal() {
        assert_eq!(round1(66.666), 66.7);
        assert_eq!(round1(0.0), 0.0);
    }
}
