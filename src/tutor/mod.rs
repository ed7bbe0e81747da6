//! # Tutor Chat
//!
//! Request/response language tutoring: the model interface and its Gemini
//! implementation, plus the in-memory store of per-learner chat sessions.

pub mod gemini;
pub mod model;
pub mod store;

pub use gemini::GeminiTutor;
pub use model::{Exchange, LearnerSettings, SettingsUpdate, TutorModel};
pub use store::ChatStore;
