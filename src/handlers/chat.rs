//! # Tutor Chat Handlers
//!
//! Cookie-keyed chat routes used by the browser bundle:
//! - `GET /`: current learner settings and whether Gemini is configured
//! - `POST /send_message`: one chat turn plus feedback on the learner message
//! - `GET /get_history`: the session's chat and feedback log
//! - `POST /update_settings`: change learner settings without chatting
//!
//! A request without a `tutor_session` cookie starts a new session; the
//! response carries the new cookie.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::tutor::{Exchange, LearnerSettings, SettingsUpdate};
use actix_web::cookie::{Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse, HttpResponseBuilder};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

pub const SESSION_COOKIE: &str = "tutor_session";

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: Option<String>,
    #[serde(flatten)]
    pub settings: SettingsUpdate,
}

/// The caller's chat session id and whether it was just created.
pub struct ChatSessionId {
    pub id: String,
    pub is_new: bool,
}

impl ChatSessionId {
    pub fn from_request(req: &HttpRequest) -> Self {
        match req.cookie(SESSION_COOKIE) {
            Some(cookie) if !cookie.value().is_empty() => Self {
                id: cookie.value().to_string(),
                is_new: false,
            },
            _ => Self {
                id: uuid::Uuid::new_v4().to_string(),
                is_new: true,
            },
        }
    }

    /// `200 OK` builder that sets the cookie for new sessions.
    fn ok(&self) -> HttpResponseBuilder {
        let mut builder = HttpResponse::Ok();
        if self.is_new {
            builder.cookie(
                Cookie::build(SESSION_COOKIE, self.id.clone())
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax)
                    .finish(),
            );
        }
        builder
    }
}

/// Learner settings for the caller, or the configured defaults.
pub fn learner_settings(state: &AppState, req: &HttpRequest) -> LearnerSettings {
    let cookie = req.cookie(SESSION_COOKIE);
    state.learner_settings(cookie.as_ref().map(|c| c.value()))
}

pub async fn index(req: HttpRequest, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let session = ChatSessionId::from_request(&req);
    let settings = state.learner_settings(Some(&session.id));

    Ok(session.ok().json(json!({
        "settings": settings,
        "gemini_configured": state.tutor.is_configured(),
    })))
}

pub async fn send_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SendMessageRequest>,
) -> AppResult<HttpResponse> {
    let session = ChatSessionId::from_request(&req);
    let SendMessageRequest { message, settings: update } = body.into_inner();

    let settings = update.apply_to(&state.learner_settings(Some(&session.id)));
    let user_message = message
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing message".to_string()))?;

    state.chats.set_settings(&session.id, settings.clone());
    let history = state.chats.exchanges(&session.id);
    debug!(
        session = %session.id,
        history_len = history.len(),
        target_lang = %settings.target_lang,
        "Generating tutor reply"
    );

    let bot_response = state.tutor.chat_reply(&user_message, &history, &settings).await;
    let exchange = Exchange {
        user: user_message,
        bot: bot_response,
    };
    state.chats.record_exchange(&session.id, &exchange);

    let feedback = state.tutor.feedback(&exchange, &settings).await;
    if !feedback.is_empty() {
        state.chats.record_feedback(&session.id, &exchange.user, &feedback);
    }
    state.increment_chat_turns();

    info!(session = %session.id, turn = history.len() + 1, "Chat turn answered");

    Ok(session.ok().json(json!({
        "user_message": exchange.user,
        "bot_response": exchange.bot,
        "feedback": feedback,
    })))
}

pub async fn get_history(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let session = ChatSessionId::from_request(&req);

    Ok(session.ok().json(json!({
        "history": state.chats.history(&session.id),
        "settings": state.learner_settings(Some(&session.id)),
    })))
}

pub async fn update_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SettingsUpdate>,
) -> AppResult<HttpResponse> {
    let session = ChatSessionId::from_request(&req);
    let settings = body.apply_to(&state.learner_settings(Some(&session.id)));
    state.chats.set_settings(&session.id, settings.clone());

    info!(session = %session.id, target_lang = %settings.target_lang, "Learner settings updated");

    Ok(session.ok().json(json!({
        "message": "Settings updated successfully",
        "settings": settings,
    })))
}
