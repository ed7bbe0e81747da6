//! Gemini `generateContent` client for chat replies and feedback.
//!
//! Model, base URL and timeout are read from the shared config on every
//! request, so `PUT /api/v1/config` changes apply to the next chat turn.

use super::model::{
    feedback_prompt, first_turn, Exchange, LearnerSettings, TutorModel, CHAT_ERROR_MESSAGE,
    FEEDBACK_ERROR_MESSAGE, NO_USER_MESSAGE_FEEDBACK, SERVICE_NOT_CONFIGURED_CHAT_MESSAGE,
    SERVICE_NOT_CONFIGURED_FEEDBACK_MESSAGE,
};
use crate::config::SharedConfig;
use crate::credentials::Credentials;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Tutor backed by the Gemini REST API.
pub struct GeminiTutor {
    client: reqwest::Client,
    config: SharedConfig,
    credentials: Credentials,
}

/// Per-request view of the REST settings.
struct Endpoint {
    url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl<'a> Content<'a> {
    fn user(text: &'a str) -> Self {
        Self {
            role: "user",
            parts: vec![TextPart { text }],
        }
    }

    fn model(text: &'a str) -> Self {
        Self {
            role: "model",
            parts: vec![TextPart { text }],
        }
    }
}

impl GeminiTutor {
    pub fn new(config: SharedConfig, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    fn endpoint(&self) -> Endpoint {
        let config = self.config.read();
        let gemini = &config.gemini;
        Endpoint {
            url: format!(
                "{}/models/{}:generateContent",
                gemini.rest_base_url.trim_end_matches('/'),
                gemini.chat_model
            ),
            model: gemini.chat_model.clone(),
            timeout: Duration::from_secs(gemini.request_timeout_secs),
        }
    }

    async fn generate(&self, contents: Vec<Content<'_>>) -> Result<String> {
        let key = self
            .credentials
            .api_key()
            .ok_or_else(|| anyhow!("API key missing"))?;
        let endpoint = self.endpoint();
        debug!(turns = contents.len(), model = %endpoint.model, "Calling generateContent");

        let response = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout)
            .header("x-goog-api-key", key)
            .json(&GenerateRequest { contents })
            .send()
            .await
            .context("Request to Gemini failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini returned {}: {}", status, body));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .context("Invalid Gemini response body")?;

        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(anyhow!("Gemini response contained no text"));
        }
        Ok(text)
    }
}

#[async_trait]
impl TutorModel for GeminiTutor {
    async fn chat_reply(
        &self,
        user_input: &str,
        history: &[Exchange],
        settings: &LearnerSettings,
    ) -> String {
        if !self.credentials.is_configured() {
            self.credentials.warn_unconfigured("chat");
            return SERVICE_NOT_CONFIGURED_CHAT_MESSAGE.to_string();
        }

        let mut contents = Vec::with_capacity(history.len() * 2 + 1);
        for exchange in history {
            contents.push(Content::user(&exchange.user));
            contents.push(Content::model(&exchange.bot));
        }

        let opening;
        let text = if history.is_empty() {
            opening = first_turn(settings, user_input);
            opening.as_str()
        } else {
            user_input
        };
        contents.push(Content::user(text));

        match self.generate(contents).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Error generating chat response from Gemini: {:#}", e);
                CHAT_ERROR_MESSAGE.to_string()
            }
        }
    }

    async fn feedback(&self, exchange: &Exchange, settings: &LearnerSettings) -> String {
        if !self.credentials.is_configured() {
            self.credentials.warn_unconfigured("feedback");
            return SERVICE_NOT_CONFIGURED_FEEDBACK_MESSAGE.to_string();
        }
        if exchange.user.is_empty() {
            return NO_USER_MESSAGE_FEEDBACK.to_string();
        }

        let prompt = feedback_prompt(&exchange.user, settings);
        match self.generate(vec![Content::user(&prompt)]).await {
            Ok(feedback) => feedback,
            Err(e) => {
                error!("Error generating feedback from Gemini: {:#}", e);
                FEEDBACK_ERROR_MESSAGE.to_string()
            }
        }
    }

    fn is_configured(&self) -> bool {
        self.credentials.is_configured()
    }
}
