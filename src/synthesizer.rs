use crate::error::AppError;
use crate::utils::b64_decode_to_buf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CACHE_INDEX: &str = "cache.json";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceParams {
    pub language: String,
    pub name: String,
}

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Returns encoded MP3 audio for `text`.
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>, AppError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: SynthesisInput<'a>,
    voice: VoiceSelection<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct SynthesisInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

/// Google Cloud Text-to-Speech over its REST api.
pub struct GoogleTts {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoogleTts {
    pub fn new(http_client: reqwest::Client, base_url: &str, api_key: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl SpeechProvider for GoogleTts {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>, AppError> {
        let url = format!("{}/v1/text:synthesize", self.base_url);
        let request = SynthesizeRequest {
            input: SynthesisInput { text },
            voice: VoiceSelection {
                language_code: &voice.language,
                name: &voice.name,
            },
            audio_config: AudioConfig {
                audio_encoding: "MP3",
            },
        };
        let resp = self
            .http_client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(Duration::from_secs(15))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to google tts");
                AppError::Speech(format!("request failed: {e}"))
            })?;
        let status = resp.status();
        if !status.is_success() {
            error!(%status, "google tts returned an error status");
            return Err(AppError::Speech(format!("status {status}")));
        }
        let resp = resp.json::<SynthesizeResponse>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize google tts response");
            AppError::Speech(format!("malformed response: {e}"))
        })?;
        let mut audio = Vec::new();
        b64_decode_to_buf(&resp.audio_content, &mut audio)?;
        Ok(audio)
    }
}

/// A synthesized utterance stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioRef {
    pub file_name: String,
    pub path: PathBuf,
    pub url: String,
}

/// Text to audio url, with a content-keyed cache of previously rendered
/// utterances. Concurrent misses for the same text may both reach the
/// provider; the last write wins.
pub struct SpeechSynthesizer {
    provider: Option<Arc<dyn SpeechProvider>>,
    voice: VoiceParams,
    audio_dir: PathBuf,
    public_base_url: String,
    // cache key => file name
    cache: RwLock<HashMap<String, String>>,
}

impl SpeechSynthesizer {
    /// Opens the audio directory and loads the persisted cache index.
    /// Without a provider every miss yields `None`.
    pub async fn load(
        provider: Option<Arc<dyn SpeechProvider>>,
        voice: VoiceParams,
        audio_dir: &Path,
        public_base_url: &str,
    ) -> Result<Self, AppError> {
        tokio::fs::create_dir_all(audio_dir).await?;
        let index_path = audio_dir.join(CACHE_INDEX);
        let cache = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(error=%e, "ignoring unreadable tts cache index");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        info!(entries = cache.len(), dir = %audio_dir.display(), "loaded tts cache");
        Ok(Self {
            provider,
            voice,
            audio_dir: audio_dir.to_path_buf(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            cache: RwLock::new(cache),
        })
    }

    fn cache_key(&self, text: &str) -> String {
        format!("{}|{}|{}", self.voice.language, self.voice.name, text)
    }

    fn audio_ref(&self, file_name: &str) -> AudioRef {
        AudioRef {
            file_name: file_name.to_string(),
            path: self.audio_dir.join(file_name),
            url: format!("{}/audio/{}", self.public_base_url, file_name),
        }
    }

    pub async fn synthesize(&self, text: &str, use_cache: bool) -> Option<AudioRef> {
        let key = self.cache_key(text);
        if use_cache {
            if let Some(file_name) = self.cache.read().await.get(&key) {
                debug!(file=%file_name, "tts cache hit");
                return Some(self.audio_ref(file_name));
            }
        }

        let provider = self.provider.as_ref()?;
        let audio = match provider.synthesize(text, &self.voice).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(error=%e, "speech synthesis failed; caller falls back to built-in voice");
                return None;
            }
        };
        let file_name = format!(
            "{}.mp3",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
        );
        let audio_ref = self.audio_ref(&file_name);
        if let Err(e) = tokio::fs::write(&audio_ref.path, &audio).await {
            error!(error=%e, path=%audio_ref.path.display(), "failed to store synthesized audio");
            return None;
        }
        self.cache.write().await.insert(key, file_name);
        self.persist_index().await;
        debug!(file=%audio_ref.file_name, bytes = audio.len(), "tts cache miss; stored audio");
        Some(audio_ref)
    }

    async fn persist_index(&self) {
        let json = {
            let cache = self.cache.read().await;
            serde_json::to_vec_pretty(&*cache)
        };
        let result = match json {
            Ok(json) => tokio::fs::write(self.audio_dir.join(CACHE_INDEX), json)
                .await
                .map_err(AppError::from),
            Err(e) => Err(AppError::Speech(e.to_string())),
        };
        if let Err(e) = result {
            warn!(error=%e, "failed to persist tts cache index");
        }
    }

    pub async fn exists(&self, audio: &AudioRef) -> bool {
        matches!(tokio::fs::metadata(&audio.path).await, Ok(meta) if meta.is_file())
    }

    /// Synthesizes `text` and returns its url only if the artifact is
    /// actually on disk; cache metadata and files can drift apart.
    pub async fn resolve(&self, text: &str) -> Option<String> {
        let audio = self.synthesize(text, true).await?;
        if self.exists(&audio).await {
            return Some(audio.url);
        }
        warn!(file=%audio.file_name, "cached audio missing on disk; regenerating");
        let audio = self.synthesize(text, false).await?;
        if self.exists(&audio).await {
            Some(audio.url)
        } else {
            None
        }
    }

    /// Maps a requested file name to a path inside the audio directory.
    pub fn audio_path(&self, file_name: &str) -> Option<PathBuf> {
        let valid = file_name.ends_with(".mp3")
            && file_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !file_name.contains("..");
        valid.then(|| self.audio_dir.join(file_name))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct CountingProvider {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl CountingProvider {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechProvider for CountingProvider {
        async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AppError::Speech("provider down".to_string()));
            }
            Ok(format!("mp3:{text}").into_bytes())
        }
    }

    pub fn voice() -> VoiceParams {
        VoiceParams {
            language: "cs-CZ".to_string(),
            name: "cs-CZ-Wavenet-A".to_string(),
        }
    }
}
