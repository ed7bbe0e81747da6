//! # Tutor Model Interface
//!
//! The request/response side of the tutor: one call produces the tutor's reply
//! to a learner message, a second call produces feedback on that message.
//!
//! Both calls are infallible from the caller's point of view. A missing API
//! key or a failed request turns into one of the fixed fallback texts below so
//! the chat routes always have something to show the learner.

use crate::config::TutorDefaults;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const CHAT_ERROR_MESSAGE: &str =
    "Sorry, I can't respond right now. The AI service seems to be unavailable. Please try again later.";
pub const FEEDBACK_ERROR_MESSAGE: &str =
    "No feedback available at the moment. The AI service might be temporarily down.";
pub const SERVICE_NOT_CONFIGURED_CHAT_MESSAGE: &str =
    "Sorry, I can't respond right now. The service is not configured.";
pub const SERVICE_NOT_CONFIGURED_FEEDBACK_MESSAGE: &str =
    "No feedback available at the moment. The service is not configured.";
pub const NO_USER_MESSAGE_FEEDBACK: &str =
    "No user message found in the last exchange to provide feedback on.";

/// Learner settings attached to one chat session.
///
/// Records written by an older build may lack a field; deserialization fills
/// any gap from [`LearnerSettings::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerSettings {
    pub native_lang: String,
    pub target_lang: String,
    pub difficulty: String,
    pub tone: String,
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            native_lang: "English".to_string(),
            target_lang: "Spanish".to_string(),
            difficulty: "Beginner".to_string(),
            tone: "Serious".to_string(),
        }
    }
}

impl From<&TutorDefaults> for LearnerSettings {
    fn from(defaults: &TutorDefaults) -> Self {
        Self {
            native_lang: defaults.native_lang.clone(),
            target_lang: defaults.target_lang.clone(),
            difficulty: defaults.difficulty.clone(),
            tone: defaults.tone.clone(),
        }
    }
}

/// Partial settings sent by the browser; omitted fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub native_lang: Option<String>,
    pub target_lang: Option<String>,
    pub difficulty: Option<String>,
    pub tone: Option<String>,
}

impl SettingsUpdate {
    pub fn apply_to(&self, current: &LearnerSettings) -> LearnerSettings {
        LearnerSettings {
            native_lang: self.native_lang.clone().unwrap_or_else(|| current.native_lang.clone()),
            target_lang: self.target_lang.clone().unwrap_or_else(|| current.target_lang.clone()),
            difficulty: self.difficulty.clone().unwrap_or_else(|| current.difficulty.clone()),
            tone: self.tone.clone().unwrap_or_else(|| current.tone.clone()),
        }
    }
}

/// One learner message and the tutor's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub bot: String,
}

/// Produces tutor replies and feedback.
#[async_trait]
pub trait TutorModel: Send + Sync {
    /// Reply to `user_input`, given the earlier exchanges of this session.
    async fn chat_reply(
        &self,
        user_input: &str,
        history: &[Exchange],
        settings: &LearnerSettings,
    ) -> String;

    /// Feedback on the learner's side of `exchange`.
    async fn feedback(&self, exchange: &Exchange, settings: &LearnerSettings) -> String;

    fn is_configured(&self) -> bool;
}

/// Tutor instructions prepended to the first message of a conversation.
pub fn chat_instructions(settings: &LearnerSettings) -> String {
    let LearnerSettings {
        native_lang,
        target_lang,
        difficulty,
        tone,
    } = settings;

    format!(
        "You are a language learning tutor.\n\
         The user's native language is {native_lang}.\n\
         The user wants to learn {target_lang}.\n\
         The user's current learning difficulty is {difficulty}.\n\
         Use a {tone} tone.\n\
         Keep your responses concise and helpful for a {difficulty} learner of {target_lang}.\n\
         Engage in a conversation in {target_lang}. If the user speaks in {native_lang}, \
         gently guide them to use {target_lang}."
    )
}

/// Text sent as the first user turn when there is no history yet.
pub fn first_turn(settings: &LearnerSettings, user_input: &str) -> String {
    format!(
        "{}\n\nUser: {}\nAssistant (in {}):",
        chat_instructions(settings),
        user_input,
        settings.target_lang
    )
}

/// Prompt asking for feedback on one learner message.
pub fn feedback_prompt(user_message: &str, settings: &LearnerSettings) -> String {
    let LearnerSettings {
        native_lang,
        target_lang,
        difficulty,
        tone,
    } = settings;

    format!(
        "The user's native language is {native_lang}.\n\
         They are trying to learn {target_lang} at a {difficulty} level.\n\
         The user's message was: \"{user_message}\"\n\n\
         Please provide constructive feedback on the user's message in a {tone} tone.\n\
         Address the following:\n\
         1. Grammar: Identify errors and provide corrections. Briefly explain for a {difficulty} learner.\n\
         2. Vocabulary: Suggest more natural or appropriate words if applicable.\n\
         3. Phrasing: Offer alternative phrasings for better fluency or politeness in {target_lang}.\n\
         4. Positive Reinforcement: Begin with encouragement.\n\n\
         Deliver the feedback in {native_lang}. Keep it concise and easy to understand for a {difficulty} learner.\n\
         If the user's message is grammatically correct and appropriate for their level, acknowledge this.\n\n\
         User's message in {target_lang} (or attempted {target_lang}): \"{user_message}\"\n\
         Your feedback (in {native_lang}):"
    )
}

/// System instruction for a live audio conversation.
pub fn live_instructions(settings: &LearnerSettings) -> String {
    format!(
        "{}\nYou are speaking with the learner in real time; answer briefly and naturally.",
        chat_instructions(settings)
    )
}
