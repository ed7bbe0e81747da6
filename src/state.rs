//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every live socket actor.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration, shared with the Gemini clients
//! - **metrics**: request counters, per-endpoint timings and live session count
//! - **credentials**: the Gemini key and its one-shot "not configured" warning
//! - **tutor**: the request/response tutor model (chat replies and feedback)
//! - **live_connector**: opens duplex streams for live audio sessions
//! - **chats**: in-memory chat sessions keyed by cookie
//!
//! The collaborators are trait objects so tests can swap in fakes without a
//! network.
//!
//! ## Lock poisoning:
//! A panic while a lock is held leaves counters in a usable state, so every
//! accessor recovers the inner value instead of propagating the poison.

use crate::config::{AppConfig, SharedConfig};
use crate::credentials::Credentials;
use crate::live::{GeminiLiveConnector, LiveConnector, LiveSetup};
use crate::tutor::model::live_instructions;
use crate::tutor::{ChatStore, GeminiTutor, LearnerSettings, TutorModel};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// The main application state shared across handlers and actors.
///
/// Cloning is cheap: every field is either `Copy` or reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: SharedConfig,

    /// Counters updated by the middleware and the live socket
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    pub credentials: Credentials,
    pub tutor: Arc<dyn TutorModel>,
    pub live_connector: Arc<dyn LiveConnector>,
    pub chats: ChatStore,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of requests that ended with a 4xx/5xx status
    pub error_count: u64,

    /// Live audio sessions currently holding a slot
    pub active_sessions: u32,

    /// Live audio sessions admitted since start
    pub live_sessions_total: u64,

    /// Live audio sessions refused because every slot was taken
    pub live_sessions_rejected: u64,

    /// Chat messages answered through `/send_message`
    pub chat_turns: u64,

    /// Key: endpoint name (e.g. "POST /send_message")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Timing and error counters for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Assemble state from already-built collaborators.
    pub fn new(
        config: AppConfig,
        credentials: Credentials,
        tutor: Arc<dyn TutorModel>,
        live_connector: Arc<dyn LiveConnector>,
    ) -> Self {
        Self::with_shared_config(SharedConfig::new(config), credentials, tutor, live_connector)
    }

    fn with_shared_config(
        config: SharedConfig,
        credentials: Credentials,
        tutor: Arc<dyn TutorModel>,
        live_connector: Arc<dyn LiveConnector>,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            credentials,
            tutor,
            live_connector,
            chats: ChatStore::new(),
        }
    }

    /// Build the Gemini-backed collaborators from configuration.
    ///
    /// A missing API key is not an error here: the server still starts and
    /// every AI feature reports that it is not configured.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let credentials = Credentials::new(config.gemini.api_key.clone());
        let connector = GeminiLiveConnector::new(config.gemini.live_url.clone(), credentials.clone());
        let shared = SharedConfig::new(config);
        let tutor = GeminiTutor::new(shared.clone(), credentials.clone())?;

        Ok(Self::with_shared_config(
            shared,
            credentials,
            Arc::new(tutor),
            Arc::new(connector),
        ))
    }

    fn config_read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read()
    }

    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config_read().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.config.replace(new_config);
        Ok(())
    }

    /// Settings saved for a chat session, or the configured defaults.
    pub fn learner_settings(&self, session_id: Option<&str>) -> LearnerSettings {
        session_id
            .and_then(|id| self.chats.settings(id))
            .unwrap_or_else(|| LearnerSettings::from(&self.config_read().tutor))
    }

    /// Stream settings for a live session with the given learner.
    pub fn live_setup(&self, settings: &LearnerSettings) -> LiveSetup {
        let config = self.config_read();
        LiveSetup::conversational(config.gemini.live_model.clone(), config.gemini.input_sample_rate)
            .with_system_instruction(live_instructions(settings))
            .with_setup_timeout(Duration::from_secs(config.gemini.request_timeout_secs))
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    pub fn increment_chat_turns(&self) {
        self.metrics_write().chat_turns += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a live session slot if fewer than `max_concurrent_sessions` are
    /// in use. Check and increment happen under one lock.
    pub fn try_acquire_live_slot(&self) -> bool {
        let max = self.config_read().performance.max_concurrent_sessions;
        let mut metrics = self.metrics_write();

        if (metrics.active_sessions as usize) < max {
            metrics.active_sessions += 1;
            metrics.live_sessions_total += 1;
            true
        } else {
            metrics.live_sessions_rejected += 1;
            false
        }
    }

    /// Give back a slot taken by [`try_acquire_live_slot`](Self::try_acquire_live_slot).
    pub fn release_live_slot(&self) {
        let mut metrics = self.metrics_write();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Consistent copy of the counters, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time, 0.0 before the first request.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Offline collaborators for handler and actor tests.

    use super::*;
    use crate::live::events::RemoteEvent;
    use crate::live::stream::{LiveConnection, LiveReceiver, LiveSender};
    use crate::live::LiveError;
    use crate::tutor::Exchange;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Tutor that echoes the learner message.
    pub struct EchoTutor;

    #[async_trait]
    impl TutorModel for EchoTutor {
        async fn chat_reply(
            &self,
            user_input: &str,
            history: &[Exchange],
            settings: &LearnerSettings,
        ) -> String {
            format!("[{} #{}] {}", settings.target_lang, history.len() + 1, user_input)
        }

        async fn feedback(&self, exchange: &Exchange, _settings: &LearnerSettings) -> String {
            format!("Feedback on: {}", exchange.user)
        }

        fn is_configured(&self) -> bool {
            true
        }
    }

    /// Connector whose stream answers every chunk with one text event. Once
    /// told the input ended it sends one closing reply a moment later and then
    /// ends the stream, the way a remote finishes its last turn. A connection
    /// closed in the meantime never sees that reply.
    #[derive(Default)]
    pub struct EchoConnector {
        connect_delay: Duration,
    }

    impl EchoConnector {
        /// Takes `connect_delay` to open, like a slow setup handshake.
        pub fn delayed(connect_delay: Duration) -> Self {
            Self { connect_delay }
        }
    }

    struct EchoSender {
        tx: Option<mpsc::UnboundedSender<RemoteEvent>>,
        chunks: usize,
        open: Arc<AtomicBool>,
    }

    struct EchoReceiver {
        rx: mpsc::UnboundedReceiver<RemoteEvent>,
    }

    fn text_event(text: String) -> RemoteEvent {
        RemoteEvent::from_json(serde_json::json!({
            "serverContent": {"modelTurn": {"parts": [{"text": text}]}}
        }))
    }

    #[async_trait]
    impl LiveConnector for EchoConnector {
        async fn connect(&self, _setup: &LiveSetup) -> Result<LiveConnection, LiveError> {
            if !self.connect_delay.is_zero() {
                tokio::time::sleep(self.connect_delay).await;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(LiveConnection {
                session_id: "echo".to_string(),
                sender: Box::new(EchoSender {
                    tx: Some(tx),
                    chunks: 0,
                    open: Arc::new(AtomicBool::new(true)),
                }),
                receiver: Box::new(EchoReceiver { rx }),
            })
        }
    }

    #[async_trait]
    impl LiveSender for EchoSender {
        async fn send_audio(&mut self, chunk: Bytes) -> Result<(), LiveError> {
            let tx = self.tx.as_ref().ok_or(LiveError::Transport {
                code: None,
                reason: "input ended".to_string(),
            })?;
            self.chunks += 1;
            let _ = tx.send(text_event(format!("heard {} bytes", chunk.len())));
            Ok(())
        }

        async fn end_input(&mut self) -> Result<(), LiveError> {
            let Some(tx) = self.tx.take() else {
                return Ok(());
            };
            let open = self.open.clone();
            let reply = text_event(format!("input ended after {} chunks", self.chunks));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if open.load(Ordering::SeqCst) {
                    let _ = tx.send(reply);
                }
            });
            Ok(())
        }

        async fn close(&mut self) -> Result<(), LiveError> {
            self.open.store(false, Ordering::SeqCst);
            self.tx = None;
            Ok(())
        }
    }

    #[async_trait]
    impl LiveReceiver for EchoReceiver {
        async fn next_event(&mut self) -> Option<Result<RemoteEvent, LiveError>> {
            self.rx.recv().await.map(Ok)
        }
    }

    /// State with offline collaborators and a configured key.
    pub fn offline_state(config: AppConfig) -> AppState {
        AppState::new(
            config,
            Credentials::new(Some("test-key".to_string())),
            Arc::new(EchoTutor),
            Arc::new(EchoConnector::default()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::offline_state;
    use super::*;

    #[test]
    fn test_live_slots_respect_limit() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 2;
        let state = offline_state(config);

        assert!(state.try_acquire_live_slot());
        assert!(state.try_acquire_live_slot());
        assert!(!state.try_acquire_live_slot());

        state.release_live_slot();
        assert!(state.try_acquire_live_slot());

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 2);
        assert_eq!(metrics.live_sessions_total, 3);
        assert_eq!(metrics.live_sessions_rejected, 1);
    }

    #[test]
    fn test_release_never_underflows() {
        let state = offline_state(AppConfig::default());
        state.release_live_slot();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = offline_state(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_live_setup_uses_config_and_learner() {
        let state = offline_state(AppConfig::default());
        let mut learner = LearnerSettings::default();
        learner.target_lang = "Japanese".to_string();

        let setup = state.live_setup(&learner);
        assert_eq!(setup.model, "models/gemini-2.0-flash-live-001");
        assert_eq!(setup.input_sample_rate, 16000);
        assert!(setup
            .system_instruction
            .as_deref()
            .is_some_and(|text| text.contains("Japanese")));
    }

    #[test]
    fn test_live_setup_follows_runtime_config() {
        let state = offline_state(AppConfig::default());
        let mut updated = state.get_config();
        updated.gemini.live_model = "models/other-live".to_string();
        updated.gemini.request_timeout_secs = 5;
        state.update_config(updated).unwrap();

        let setup = state.live_setup(&LearnerSettings::default());
        assert_eq!(setup.model, "models/other-live");
        assert_eq!(setup.setup_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_learner_settings_fall_back_to_config() {
        let mut config = AppConfig::default();
        config.tutor.target_lang = "Portuguese".to_string();
        let state = offline_state(config);

        assert_eq!(state.learner_settings(None).target_lang, "Portuguese");
        assert_eq!(state.learner_settings(Some("new")).target_lang, "Portuguese");

        let mut saved = LearnerSettings::default();
        saved.target_lang = "Korean".to_string();
        state.chats.set_settings("known", saved);
        assert_eq!(state.learner_settings(Some("known")).target_lang, "Korean");
    }

    #[test]
    fn test_update_config_validates() {
        let state = offline_state(AppConfig::default());
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, 5000);
    }
}
