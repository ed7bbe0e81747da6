//! In-memory chat sessions keyed by the `tutor_session` cookie value.
//!
//! Each session keeps its learner settings and a log mixing chat exchanges and
//! feedback notes in the order they happened. Nothing is persisted; a restart
//! starts every learner over.

use super::model::{Exchange, LearnerSettings};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One entry of a session's conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Chat {
        user: String,
        bot: String,
        timestamp: String,
    },
    Feedback {
        user_message: String,
        feedback: String,
        timestamp: String,
    },
}

#[derive(Debug, Clone, Default)]
struct ChatSession {
    log: Vec<LogEntry>,
    settings: Option<LearnerSettings>,
}

/// Shared store of chat sessions.
#[derive(Debug, Clone, Default)]
pub struct ChatStore {
    sessions: Arc<RwLock<HashMap<String, ChatSession>>>,
}

fn now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings stored for `session_id`, if any were ever saved.
    pub fn settings(&self, session_id: &str) -> Option<LearnerSettings> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(session_id).and_then(|s| s.settings.clone()))
    }

    pub fn set_settings(&self, session_id: &str, settings: LearnerSettings) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.entry(session_id.to_string()).or_default().settings = Some(settings);
        }
    }

    /// Full log, chat and feedback entries in order.
    pub fn history(&self, session_id: &str) -> Vec<LogEntry> {
        self.sessions
            .read()
            .ok()
            .and_then(|sessions| sessions.get(session_id).map(|s| s.log.clone()))
            .unwrap_or_default()
    }

    /// Chat exchanges only, oldest first.
    pub fn exchanges(&self, session_id: &str) -> Vec<Exchange> {
        self.history(session_id)
            .into_iter()
            .filter_map(|entry| match entry {
                LogEntry::Chat { user, bot, .. } => Some(Exchange { user, bot }),
                LogEntry::Feedback { .. } => None,
            })
            .collect()
    }

    pub fn record_exchange(&self, session_id: &str, exchange: &Exchange) {
        self.append(
            session_id,
            LogEntry::Chat {
                user: exchange.user.clone(),
                bot: exchange.bot.clone(),
                timestamp: now(),
            },
        );
    }

    pub fn record_feedback(&self, session_id: &str, user_message: &str, feedback: &str) {
        self.append(
            session_id,
            LogEntry::Feedback {
                user_message: user_message.to_string(),
                feedback: feedback.to_string(),
                timestamp: now(),
            },
        );
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    fn append(&self, session_id: &str, entry: LogEntry) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.entry(session_id.to_string()).or_default().log.push(entry);
        }
    }
}
