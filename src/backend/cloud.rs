//! Cloud TTS providers: ElevenLabs and OpenAI.
//!
//! Both take a named voice instead of a reference recording, answer with
//! MP3, and are called over blocking HTTPS with a per-request deadline.
//! A request that runs past the deadline fails with [`TimedOut`] so the
//! dispatcher records it as a timeout for that unit.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::ACCEPT;
use serde::Serialize;

use super::{StyleOptions, SynthesisBackend};
use crate::audio::{decode_bytes, Fragment};
use crate::error::TimedOut;
use crate::segment::SpeakableUnit;

pub const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";
pub const ELEVENLABS_MODEL: &str = "eleven_multilingual_v2";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_MODEL: &str = "tts-1-hd";

// ─────────────────────────────────────────────────────────────────────────────
// ElevenLabs catalogue
// ─────────────────────────────────────────────────────────────────────────────

/// A Turkish voice from the ElevenLabs library.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CatalogueVoice {
    pub key: &'static str,
    pub voice_id: &'static str,
    pub name: &'static str,
    pub gender: &'static str,
    pub age: &'static str,
    pub description: &'static str,
}

pub const ELEVENLABS_VOICES: &[CatalogueVoice] = &[
    CatalogueVoice {
        key: "ada",
        voice_id: "XB0fDUnXU5powFXDhCwa",
        name: "Ada",
        gender: "female",
        age: "young",
        description: "clear young female voice, suited to literary text",
    },
    CatalogueVoice {
        key: "emre",
        voice_id: "VR6AewLTigWG4xSOukaG",
        name: "Emre",
        gender: "male",
        age: "middle",
        description: "warm middle-aged male voice, suited to presentations",
    },
    CatalogueVoice {
        key: "aylin",
        voice_id: "pNInz6obpgDQGcFmaJgB",
        name: "Aylin",
        gender: "female",
        age: "mature",
        description: "mature authoritative female voice, suited to news",
    },
    CatalogueVoice {
        key: "burak",
        voice_id: "yoZ06aMxZJJ28mfd3POQ",
        name: "Burak",
        gender: "male",
        age: "young",
        description: "energetic young male voice, suited to adverts",
    },
];

/// A catalogue voice with tuned settings for a narration style.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceProfile {
    pub key: &'static str,
    pub voice: &'static str,
    pub stability: f32,
    pub similarity_boost: f32,
    pub category: &'static str,
    pub description: &'static str,
}

pub const VOICE_PROFILES: &[VoiceProfile] = &[
    VoiceProfile {
        key: "story_teller_male",
        voice: "emre",
        stability: 0.4,
        similarity_boost: 0.8,
        category: "Edebiyat",
        description: "warm male storyteller",
    },
    VoiceProfile {
        key: "story_teller_female",
        voice: "ada",
        stability: 0.3,
        similarity_boost: 0.85,
        category: "Edebiyat",
        description: "soft, emotional female narrator",
    },
    VoiceProfile {
        key: "educator_male",
        voice: "burak",
        stability: 0.6,
        similarity_boost: 0.7,
        category: "Eğitim",
        description: "clear educational voice",
    },
    VoiceProfile {
        key: "news_anchor_female",
        voice: "aylin",
        stability: 0.7,
        similarity_boost: 0.9,
        category: "Profesyonel",
        description: "authoritative news anchor",
    },
    VoiceProfile {
        key: "wise_elder",
        voice: "emre",
        stability: 0.2,
        similarity_boost: 0.6,
        category: "Karakter",
        description: "wise elderly character",
    },
    VoiceProfile {
        key: "young_hero",
        voice: "burak",
        stability: 0.5,
        similarity_boost: 0.8,
        category: "Karakter",
        description: "young energetic hero",
    },
];

pub fn find_voice(name: &str) -> Option<&'static CatalogueVoice> {
    ELEVENLABS_VOICES.iter().find(|v| v.key.eq_ignore_ascii_case(name))
}

pub fn find_profile(name: &str) -> Option<&'static VoiceProfile> {
    VOICE_PROFILES.iter().find(|p| p.key == name)
}

/// Profiles, optionally restricted to one category.
pub fn profiles_in(category: Option<&str>) -> Vec<&'static VoiceProfile> {
    VOICE_PROFILES
        .iter()
        .filter(|p| category.map_or(true, |c| p.category == c))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self { stability: 0.5, similarity_boost: 0.75, style: 0.0, use_speaker_boost: true }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP plumbing
// ─────────────────────────────────────────────────────────────────────────────

fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> anyhow::Error {
    if err.is_timeout() {
        anyhow::Error::new(TimedOut(timeout.as_secs())).context(err.to_string())
    } else {
        anyhow::Error::new(err).context("request failed")
    }
}

/// Send `request` and return the body, or fail with the status and the
/// provider's own message.
fn send(request: RequestBuilder, timeout: Duration) -> Result<Vec<u8>> {
    let response = request.send().map_err(|e| transport_error(e, timeout))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        bail!("HTTP {status}: {}", provider_message(&body));
    }
    let bytes = response.bytes().map_err(|e| transport_error(e, timeout))?;
    Ok(bytes.to_vec())
}

/// Pull the human-readable message out of a provider error body.
fn provider_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            json.pointer("/detail/message"),
            json.pointer("/error/message"),
            json.get("detail").filter(|d| d.is_string()),
        ];
        if let Some(msg) = candidates.into_iter().flatten().find_map(|v| v.as_str()) {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no message".to_string();
    }
    trimmed.chars().take(200).collect()
}

fn decode_mp3(bytes: Vec<u8>) -> Result<Fragment> {
    if bytes.is_empty() {
        bail!("provider returned an empty body");
    }
    decode_bytes(bytes, Some("mp3")).context("provider audio undecodable")
}

// ─────────────────────────────────────────────────────────────────────────────
// ElevenLabs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

pub struct ElevenLabsBackend {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    voice: String,
    settings: VoiceSettings,
    timeout: Duration,
}

impl ElevenLabsBackend {
    /// `api_key` may be `None`; [`SynthesisBackend::prepare`] then fails.
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            base_url: ELEVENLABS_BASE_URL.to_string(),
            voice: "ada".to_string(),
            settings: VoiceSettings::default(),
            timeout,
        })
    }

    pub fn with_voice(mut self, voice: &str) -> Self {
        self.voice = voice.to_ascii_lowercase();
        self
    }

    /// Use a named profile's voice and settings.
    pub fn with_profile(mut self, profile: &str) -> Result<Self> {
        let p = find_profile(profile).ok_or_else(|| {
            anyhow!(
                "unknown profile '{profile}' (known: {})",
                VOICE_PROFILES.iter().map(|p| p.key).collect::<Vec<_>>().join(", ")
            )
        })?;
        self.voice = p.voice.to_string();
        self.settings.stability = p.stability;
        self.settings.similarity_boost = p.similarity_boost;
        Ok(self)
    }

    pub fn with_settings(mut self, settings: VoiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.settings
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("ElevenLabs API key missing (set ELEVENLABS_API_KEY or config.json)"))
    }

    fn catalogue_voice(&self) -> Result<&'static CatalogueVoice> {
        find_voice(&self.voice).ok_or_else(|| {
            anyhow!(
                "unknown ElevenLabs voice '{}' (known: {})",
                self.voice,
                ELEVENLABS_VOICES.iter().map(|v| v.key).collect::<Vec<_>>().join(", ")
            )
        })
    }
}

impl SynthesisBackend for ElevenLabsBackend {
    fn name(&self) -> String {
        format!("elevenlabs({})", self.voice)
    }

    fn prepare(&self) -> Result<()> {
        self.api_key()?;
        self.catalogue_voice()?;
        Ok(())
    }

    fn synthesize(&self, unit: &SpeakableUnit, _style: &StyleOptions) -> Result<Fragment> {
        let voice = self.catalogue_voice()?;
        let url = format!("{}/text-to-speech/{}", self.base_url, voice.voice_id);
        let body = ElevenLabsRequest {
            text: &unit.text,
            model_id: ELEVENLABS_MODEL,
            voice_settings: self.settings,
        };
        let request = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key()?)
            .header(ACCEPT, "audio/mpeg")
            .json(&body);
        let bytes = send(request, self.timeout).context("ElevenLabs")?;
        decode_mp3(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI
// ─────────────────────────────────────────────────────────────────────────────

pub const OPENAI_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

pub struct OpenAiBackend {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    voice: String,
    timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            base_url: OPENAI_BASE_URL.to_string(),
            voice: "alloy".to_string(),
            timeout,
        })
    }

    pub fn with_voice(mut self, voice: &str) -> Self {
        self.voice = voice.to_ascii_lowercase();
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OpenAI API key missing (set OPENAI_API_KEY or config.json)"))
    }
}

impl SynthesisBackend for OpenAiBackend {
    fn name(&self) -> String {
        format!("openai({})", self.voice)
    }

    fn prepare(&self) -> Result<()> {
        self.api_key()?;
        if !OPENAI_VOICES.contains(&self.voice.as_str()) {
            bail!("unknown OpenAI voice '{}' (known: {})", self.voice, OPENAI_VOICES.join(", "));
        }
        Ok(())
    }

    fn synthesize(&self, unit: &SpeakableUnit, _style: &StyleOptions) -> Result<Fragment> {
        let body = OpenAiRequest {
            model: OPENAI_MODEL,
            input: &unit.text,
            voice: &self.voice,
            response_format: "mp3",
        };
        let request = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(self.api_key()?)
            .json(&body);
        let bytes = send(request, self.timeout).context("OpenAI")?;
        decode_mp3(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnitSynthesisError;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve one HTTP request on localhost; `respond` gets the raw request
    /// and returns the raw response (or `None` to hang up after a pause).
    fn serve_once<F>(respond: F) -> String
    where
        F: FnOnce(&str) -> Option<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            match respond(&request) {
                Some(response) => {
                    let _ = stream.write_all(response.as_bytes());
                }
                None => std::thread::sleep(Duration::from_secs(3)),
            }
        });
        format!("http://{addr}")
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
                    })
                    .unwrap_or(0usize);
                if buf.len() >= end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn unit() -> SpeakableUnit {
        SpeakableUnit::new("Merhaba!").unwrap()
    }

    #[test]
    fn test_catalogue_lookup() {
        assert_eq!(find_voice("Ada").unwrap().voice_id, "XB0fDUnXU5powFXDhCwa");
        assert!(find_voice("zeynep").is_none());
        assert_eq!(find_profile("wise_elder").unwrap().voice, "emre");
        assert_eq!(profiles_in(None).len(), 6);
        let karakter: Vec<_> = profiles_in(Some("Karakter")).iter().map(|p| p.key).collect();
        assert_eq!(karakter, vec!["wise_elder", "young_hero"]);
    }

    #[test]
    fn test_profile_sets_voice_and_settings() {
        let b = ElevenLabsBackend::new(Some("k".into()), Duration::from_secs(5))
            .unwrap()
            .with_profile("news_anchor_female")
            .unwrap();
        assert_eq!(b.voice(), "aylin");
        assert_eq!(b.settings().stability, 0.7);
        assert_eq!(b.settings().similarity_boost, 0.9);
        assert!(ElevenLabsBackend::new(None, Duration::from_secs(5))
            .unwrap()
            .with_profile("narrator")
            .is_err());
    }

    #[test]
    fn test_prepare_requires_key_and_known_voice() {
        let t = Duration::from_secs(5);
        assert!(ElevenLabsBackend::new(None, t).unwrap().prepare().is_err());
        assert!(ElevenLabsBackend::new(Some("k".into()), t).unwrap().prepare().is_ok());
        assert!(ElevenLabsBackend::new(Some("k".into()), t)
            .unwrap()
            .with_voice("zeynep")
            .prepare()
            .is_err());
        assert!(OpenAiBackend::new(None, t).unwrap().prepare().is_err());
        assert!(OpenAiBackend::new(Some("k".into()), t).unwrap().with_voice("Nova").prepare().is_ok());
        assert!(OpenAiBackend::new(Some("k".into()), t).unwrap().with_voice("bob").prepare().is_err());
    }

    #[test]
    fn test_provider_message_extraction() {
        assert_eq!(
            provider_message(r#"{"detail":{"status":"quota","message":"quota exceeded"}}"#),
            "quota exceeded"
        );
        assert_eq!(provider_message(r#"{"error":{"message":"bad key"}}"#), "bad key");
        assert_eq!(provider_message(""), "no message");
        assert_eq!(provider_message("gateway down"), "gateway down");
    }

    #[test]
    fn test_error_status_carries_provider_message() {
        let base = serve_once(|request| {
            assert!(request.starts_with("POST /text-to-speech/XB0fDUnXU5powFXDhCwa"));
            assert!(request.to_ascii_lowercase().contains("xi-api-key: secret"));
            assert!(request.contains(ELEVENLABS_MODEL));
            let body = r#"{"detail":{"message":"invalid api key"}}"#;
            Some(format!(
                "HTTP/1.1 401 Unauthorized\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ))
        });
        let backend = ElevenLabsBackend::new(Some("secret".into()), Duration::from_secs(5))
            .unwrap()
            .with_base_url(&base);
        let err = backend.synthesize(&unit(), &StyleOptions::default()).unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("401"), "{text}");
        assert!(text.contains("invalid api key"), "{text}");
        assert!(matches!(UnitSynthesisError::from_backend(&err), UnitSynthesisError::Backend(_)));
    }

    #[test]
    fn test_slow_provider_times_out() {
        let base = serve_once(|_| None);
        let backend = OpenAiBackend::new(Some("k".into()), Duration::from_secs(1))
            .unwrap()
            .with_base_url(&base);
        let err = backend.synthesize(&unit(), &StyleOptions::default()).unwrap_err();
        assert_eq!(UnitSynthesisError::from_backend(&err), UnitSynthesisError::Timeout(1));
    }
}
