use crate::error::ConfigError;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset, Weekday};

/// When the campaign runner is allowed to dial.
#[derive(Debug, Clone)]
pub struct CallingHours {
    pub start_hour: u8,
    pub end_hour: u8,
    pub work_days: Vec<Weekday>,
    pub utc_offset_hours: i8,
}

impl CallingHours {
    pub fn allows(&self, now_utc: OffsetDateTime) -> bool {
        let offset = UtcOffset::from_hms(self.utc_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC);
        let local = now_utc.to_offset(offset);
        self.work_days.contains(&local.weekday())
            && self.start_hour <= local.hour()
            && local.hour() < self.end_hour
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub google_tts_api_key: Option<String>,
    pub google_tts_base_url: String,
    pub tts_language: String,
    pub tts_voice: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_phone_number: String,
    pub twilio_api_base: String,
    /// Externally reachable base url, used for webhook and audio links.
    pub public_base_url: String,
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub audio_dir: PathBuf,
    pub calls_per_minute: u32,
    pub calling_hours: CallingHours,
    pub session_ttl: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let or_default = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let calling_hours = CallingHours {
            start_hour: parse(&lookup, "CALL_START_HOUR", 9)?,
            end_hour: parse(&lookup, "CALL_END_HOUR", 18)?,
            work_days: parse_work_days(&or_default("CALL_WORK_DAYS", "mon,tue,wed,thu,fri"))?,
            utc_offset_hours: parse(&lookup, "CALL_UTC_OFFSET_HOURS", 1)?,
        };
        let calls_per_minute: u32 = parse(&lookup, "CALLS_PER_MINUTE", 2)?;
        if calls_per_minute == 0 {
            return Err(ConfigError::Invalid {
                name: "CALLS_PER_MINUTE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_base_url: or_default("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            openai_model: or_default("OPENAI_MODEL", "gpt-4o-mini"),
            google_tts_api_key: lookup("GOOGLE_TTS_API_KEY").filter(|v| !v.is_empty()),
            google_tts_base_url: or_default(
                "GOOGLE_TTS_BASE_URL",
                "https://texttospeech.googleapis.com",
            ),
            tts_language: or_default("TTS_LANGUAGE", "cs-CZ"),
            tts_voice: or_default("TTS_VOICE", "cs-CZ-Wavenet-A"),
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: required("TWILIO_AUTH_TOKEN")?,
            twilio_phone_number: required("TWILIO_PHONE_NUMBER")?,
            twilio_api_base: or_default("TWILIO_API_BASE", "https://api.twilio.com"),
            public_base_url: required("PUBLIC_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            bind_addr: parse(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 5000)))?,
            database_url: or_default("DATABASE_URL", "data/cold_calling.db"),
            audio_dir: PathBuf::from(or_default("AUDIO_DIR", "static/audio")),
            calls_per_minute,
            calling_hours,
            session_ttl: Duration::from_secs(parse(&lookup, "SESSION_TTL_SECS", 3600)?),
            log_level: or_default("LOG_LEVEL", "debug"),
        })
    }

    /// Pause between two outbound dials.
    pub fn dial_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / f64::from(self.calls_per_minute))
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn parse_work_days(raw: &str) -> Result<Vec<Weekday>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d.to_ascii_lowercase().as_str() {
            "mon" => Ok(Weekday::Monday),
            "tue" => Ok(Weekday::Tuesday),
            "wed" => Ok(Weekday::Wednesday),
            "thu" => Ok(Weekday::Thursday),
            "fri" => Ok(Weekday::Friday),
            "sat" => Ok(Weekday::Saturday),
            "sun" => Ok(Weekday::Sunday),
            _ => Err(ConfigError::Invalid {
                name: "CALL_WORK_DAYS",
                value: raw.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let vars: std::collections::HashMap<&str, &str> = [
        ("OPENAI_API_KEY", "sk-test"),
        ("TWILIO_ACCOUNT_SID", "AC123"),
        ("TWILIO_AUTH_TOKEN", "secret"),
        ("TWILIO_PHONE_NUMBER", "+420555000111"),
        ("PUBLIC_BASE_URL", "https://bot.example.com/"),
    ]
    .into_iter()
    .collect();
    Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).expect("test config")
}
