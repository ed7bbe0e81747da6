//! # Configuration Management
//!
//! This module loads the tutor backend configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix, `__` between section and key)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (`HOST`, `PORT`, `GEMINI_API_KEY`)
//! 2. Environment variables (APP_SERVER__PORT, APP_GEMINI__LIVE_MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket server listens
/// - **gemini**: remote AI service settings (credentials, models, endpoints)
/// - **tutor**: default learner settings for new chat sessions
/// - **performance**: live session limits and heartbeat timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub tutor: TutorDefaults,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote AI service configuration.
///
/// ## Fields:
/// - `api_key`: Gemini API key; `None` disables every LLM feature
/// - `chat_model`: model used for request/response chat and feedback turns
/// - `live_model`: model used by the bidirectional audio session
/// - `rest_base_url`: base URL of the `generateContent` REST API
/// - `live_url`: WebSocket URL of the `BidiGenerateContent` endpoint
/// - `input_sample_rate`: sample rate advertised for the raw PCM audio chunks
/// - `request_timeout_secs`: timeout applied to REST calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub chat_model: String,
    pub live_model: String,
    pub rest_base_url: String,
    pub live_url: String,
    pub input_sample_rate: u32,
    pub request_timeout_secs: u64,
}

/// Learner settings a fresh chat session starts with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TutorDefaults {
    pub native_lang: String,
    pub target_lang: String,
    pub difficulty: String,
    pub tone: String,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: live audio sessions allowed at the same time
/// - `heartbeat_interval_secs`: how often the live socket pings the browser
/// - `client_timeout_secs`: silence after which the live socket is closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Provides default configuration values.
///
/// Defaults let the server start without any configuration file; without an
/// API key the chat routes answer with the "not configured" texts and the live
/// socket reports an error followed by `disconnected`.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5000,
            },
            gemini: GeminiConfig {
                api_key: None,
                chat_model: "gemini-1.5-flash".to_string(),
                live_model: "models/gemini-2.0-flash-live-001".to_string(),
                rest_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                input_sample_rate: 16000,
                request_timeout_secs: 30,
            },
            tutor: TutorDefaults {
                native_lang: "English".to_string(),
                target_lang: "Spanish".to_string(),
                difficulty: "Beginner".to_string(),
                tone: "Serious".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_GEMINI__LIVE_MODEL=models/other-live-model`: Override live model
    /// - `GEMINI_API_KEY=...`: The API key, as most deployments provide it
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                settings = settings.set_override("gemini.api_key", key)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - At least one live session is allowed
    /// - The audio sample rate and REST timeout are non-zero
    /// - The heartbeat fires more often than the client timeout expires
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.gemini.input_sample_rate == 0 {
            return Err(anyhow::anyhow!("Input sample rate must be greater than 0"));
        }

        if self.gemini.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0
            || self.performance.heartbeat_interval_secs >= self.performance.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be non-zero and shorter than the client timeout"
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example,
    /// `{"tutor": {"target_lang": "French"}}` changes only the default target
    /// language. The API key cannot be changed at runtime; credentials are
    /// fixed at startup.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(gemini) = partial_config.get("gemini") {
            if gemini.get("api_key").is_some() {
                return Err(anyhow::anyhow!("The API key cannot be changed at runtime"));
            }
            if let Some(model) = gemini.get("chat_model").and_then(|v| v.as_str()) {
                self.gemini.chat_model = model.to_string();
            }
            if let Some(model) = gemini.get("live_model").and_then(|v| v.as_str()) {
                self.gemini.live_model = model.to_string();
            }
            if let Some(timeout) = gemini.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                self.gemini.request_timeout_secs = timeout;
            }
        }

        if let Some(tutor) = partial_config.get("tutor") {
            let fields: [(&str, &mut String); 4] = [
                ("native_lang", &mut self.tutor.native_lang),
                ("target_lang", &mut self.tutor.target_lang),
                ("difficulty", &mut self.tutor.difficulty),
                ("tone", &mut self.tutor.tone),
            ];
            for (key, slot) in fields {
                if let Some(value) = tutor.get(key).and_then(|v| v.as_str()) {
                    *slot = value.to_string();
                }
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(secs) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_secs = secs;
            }
            if let Some(secs) = performance.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.performance.client_timeout_secs = secs;
            }
        }

        self.validate()?;
        Ok(())
    }
}

/// Runtime-updatable configuration shared by the server state and the Gemini
/// clients. Readers take the current value on every use, so a successful
/// `PUT /api/v1/config` applies to the next request or session.
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<RwLock<AppConfig>>);

impl SharedConfig {
    pub fn new(config: AppConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    /// A poisoned lock still holds a complete config, so it is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn replace(&self, config: AppConfig) {
        *self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_config_sees_replacement() {
        let shared = SharedConfig::new(AppConfig::default());
        let reader = shared.clone();

        let mut updated = AppConfig::default();
        updated.gemini.chat_model = "gemini-next".to_string();
        shared.replace(updated);

        assert_eq!(reader.read().gemini.chat_model, "gemini-next");
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert!(config.gemini.api_key.is_none());
        assert_eq!(config.tutor.target_lang, "Spanish");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.heartbeat_interval_secs = 60;
        config.performance.client_timeout_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "tutor": {"target_lang": "French"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.tutor.target_lang, "French");
        // Untouched fields keep their values
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.tutor.native_lang, "English");
    }

    #[test]
    fn test_api_key_is_not_updatable() {
        let mut config = AppConfig::default();
        let json = r#"{"gemini": {"api_key": "stolen"}}"#;
        assert!(config.update_from_json(json).is_err());
        assert!(config.gemini.api_key.is_none());
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"performance": {"max_concurrent_sessions": 0}}"#).is_err());
    }
}
