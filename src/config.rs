use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Server configuration, loaded once at startup from the environment
/// (optionally seeded from a `.env` file in development).
#[derive(Debug)]
pub struct Settings {
    // Remote service endpoints
    pub whisper_base_url: String,
    pub whisper_api_key: SecretBox<String>,
    pub whisper_model: String,
    pub whisper_language: String,
    pub llm_base_url: String,
    pub llm_api_key: SecretBox<String>,
    pub llm_model: String,
    pub parler_tts_base_url: String,
    pub xtts_tts_base_url: Option<String>,

    // ASR windowing
    pub asr_window_ms: u64,
    pub asr_slide_ms: u64,
    pub asr_silence_ms: u64,
    pub asr_silence_rms: f64,

    // LLM
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,

    // TTS
    pub tts_chunk_size_sentences: usize,
    pub tts_voice: String,
    pub tts_language: String,

    // Session & pipeline
    pub session_expiry_minutes: u64,
    pub max_concurrent_sessions: usize,
    pub memory_context_tokens: usize,
    pub log_frames_every: u64,

    // Monitoring
    pub health_check_interval: u64,
    pub service_timeout: u64,
    pub metrics_save_path: String,
    pub enable_metrics: bool,
    pub monitor_port: u16,
}

impl Settings {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        Ok(Self {
            whisper_base_url: env_or(
                "WHISPER_BASE_URL",
                "http://localhost:9000/v1",
            ),
            whisper_api_key: load_api_key("WHISPER_API_KEY")?,
            whisper_model: env_or("WHISPER_MODEL", "openai/whisper-large-v3-turbo"),
            whisper_language: env_or("WHISPER_LANGUAGE", "en"),
            llm_base_url: env_or("LLM_BASE_URL", "http://localhost:9001/v1"),
            llm_api_key: load_api_key("LLM_API_KEY")?,
            llm_model: env_or("LLM_MODEL", "microsoft/Phi-3.5-mini-instruct"),
            parler_tts_base_url: env_or("PARLER_TTS_BASE_URL", "http://localhost:9002"),
            xtts_tts_base_url: env::var("XTTS_TTS_BASE_URL").ok().filter(|s| !s.is_empty()),

            asr_window_ms: env_parse("ASR_BUFFER_WINDOW_MS", 500)?,
            asr_slide_ms: env_parse("ASR_BUFFER_SLIDE_MS", 250)?,
            asr_silence_ms: env_parse("ASR_SILENCE_MS", 800)?,
            asr_silence_rms: env_parse("ASR_SILENCE_RMS", 250.0)?,

            llm_max_tokens: env_parse("LLM_MAX_TOKENS", 256)?,
            llm_temperature: env_parse("LLM_TEMPERATURE", 0.8)?,

            tts_chunk_size_sentences: env_parse("TTS_CHUNK_SIZE_SENTENCES", 2)?,
            tts_voice: env_or("TTS_VOICE", "female"),
            tts_language: env_or("TTS_LANGUAGE", "en"),

            session_expiry_minutes: env_parse("SESSION_EXPIRY_MINUTES", 10)?,
            max_concurrent_sessions: env_parse("MAX_CONCURRENT_SESSIONS", 5)?,
            memory_context_tokens: env_parse("MEMORY_CONTEXT_TOKENS", 512)?,
            log_frames_every: env_parse("LOG_FRAMES_EVERY", 50)?,

            health_check_interval: env_parse("HEALTH_CHECK_INTERVAL", 30)?,
            service_timeout: env_parse("SERVICE_TIMEOUT", 3)?,
            metrics_save_path: env_or("METRICS_SAVE_PATH", "./logs/metrics.jsonl"),
            enable_metrics: env_parse("ENABLE_METRICS", true)?,
            monitor_port: env_parse("MONITOR_PORT", 8500)?,
        })
    }

    pub fn whisper_api_key(&self) -> &str {
        self.whisper_api_key.expose_secret()
    }

    pub fn llm_api_key(&self) -> &str {
        self.llm_api_key.expose_secret()
    }

    pub fn asr_window(&self) -> Duration {
        Duration::from_millis(self.asr_window_ms)
    }

    pub fn asr_slide(&self) -> Duration {
        Duration::from_millis(self.asr_slide_ms)
    }

    pub fn asr_silence(&self) -> Duration {
        Duration::from_millis(self.asr_silence_ms)
    }

    pub fn session_expiry(&self) -> Duration {
        Duration::from_secs(self.session_expiry_minutes * 60)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout)
    }
}

impl Default for Settings {
    /// Defaults without touching the environment. Used by tests; `load()` is
    /// the production path.
    fn default() -> Self {
        Self {
            whisper_base_url: "http://localhost:9000/v1".to_string(),
            whisper_api_key: SecretBox::new(Box::new(String::new())),
            whisper_model: "openai/whisper-large-v3-turbo".to_string(),
            whisper_language: "en".to_string(),
            llm_base_url: "http://localhost:9001/v1".to_string(),
            llm_api_key: SecretBox::new(Box::new(String::new())),
            llm_model: "microsoft/Phi-3.5-mini-instruct".to_string(),
            parler_tts_base_url: "http://localhost:9002".to_string(),
            xtts_tts_base_url: None,
            asr_window_ms: 500,
            asr_slide_ms: 250,
            asr_silence_ms: 800,
            asr_silence_rms: 250.0,
            llm_max_tokens: 256,
            llm_temperature: 0.8,
            tts_chunk_size_sentences: 2,
            tts_voice: "female".to_string(),
            tts_language: "en".to_string(),
            session_expiry_minutes: 10,
            max_concurrent_sessions: 5,
            memory_context_tokens: 512,
            log_frames_every: 50,
            health_check_interval: 30,
            service_timeout: 3,
            metrics_save_path: "./logs/metrics.jsonl".to_string(),
            enable_metrics: true,
            monitor_port: 8500,
        }
    }
}

/// Voice description prompts for the primary TTS provider, keyed by the
/// `TTS_VOICE` setting.
pub fn voice_description(voice: &str) -> &'static str {
    match voice {
        "male" => {
            "Jon's voice is monotone yet slightly fast in delivery, with a very \
             close recording that almost has no background noise."
        }
        "male_casual" => {
            "Gary's voice is casual and relaxed, speaking naturally with a \
             conversational tone."
        }
        "female_casual" => {
            "Jenny's voice is casual and friendly, speaking naturally with a \
             warm conversational tone."
        }
        _ => {
            "Lea's voice is warm and clear, delivering her words in a friendly \
             manner with good audio quality."
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

/// API keys may legitimately be absent when the service runs against local,
/// unauthenticated model servers; an empty secret produces no auth header.
fn load_api_key(env_var: &str) -> Result<SecretBox<String>, ConfigError> {
    let key = env::var(env_var).unwrap_or_default();
    Ok(SecretBox::new(Box::new(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.asr_window_ms, 500);
        assert_eq!(settings.asr_slide_ms, 250);
        assert_eq!(settings.asr_silence_ms, 800);
        assert_eq!(settings.llm_max_tokens, 256);
        assert_eq!(settings.tts_chunk_size_sentences, 2);
        assert_eq!(settings.max_concurrent_sessions, 5);
        assert_eq!(settings.session_expiry_minutes, 10);
        assert_eq!(settings.memory_context_tokens, 512);
        assert!(settings.enable_metrics);
    }

    #[test]
    fn test_duration_helpers() {
        let settings = Settings::default();
        assert_eq!(settings.asr_window(), Duration::from_millis(500));
        assert_eq!(settings.asr_slide(), Duration::from_millis(250));
        assert_eq!(settings.session_expiry(), Duration::from_secs(600));
        assert_eq!(settings.probe_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_voice_descriptions() {
        assert!(voice_description("male").contains("Jon"));
        assert!(voice_description("female").contains("Lea"));
        // Unknown voices fall back to the default female description
        assert!(voice_description("nonexistent").contains("Lea"));
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        env::set_var("VOXBRIDGE_TEST_BAD_NUMBER", "not-a-number");
        let result: Result<u64, _> = env_parse("VOXBRIDGE_TEST_BAD_NUMBER", 5);
        assert!(result.is_err());
        env::remove_var("VOXBRIDGE_TEST_BAD_NUMBER");
    }
}
