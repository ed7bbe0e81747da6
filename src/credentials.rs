//! # Remote Service Credentials
//!
//! One `Credentials` value is built at startup from the loaded configuration
//! and handed to every collaborator that talks to the remote AI service. It
//! answers a single question ("is the service configured?") and owns the
//! one-shot latch that keeps the "not configured" warning from repeating on
//! every request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Shared handle to the Gemini API key.
///
/// Cloning is cheap; all clones share the same warning latch.
#[derive(Clone)]
pub struct Credentials {
    inner: Arc<CredentialsInner>,
}

struct CredentialsInner {
    api_key: Option<String>,
    warned: AtomicBool,
}

impl Credentials {
    /// Build credentials from an optional key. Blank keys count as missing.
    pub fn new(api_key: Option<String>) -> Self {
        let api_key = api_key.filter(|key| !key.trim().is_empty());
        Self {
            inner: Arc::new(CredentialsInner {
                api_key,
                warned: AtomicBool::new(false),
            }),
        }
    }

    /// Credentials with no key, for tests and offline runs.
    pub fn missing() -> Self {
        Self::new(None)
    }

    pub fn is_configured(&self) -> bool {
        self.inner.api_key.is_some()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.inner.api_key.as_deref()
    }

    /// Log the "not configured" warning the first time any caller hits it.
    ///
    /// Returns `true` when this call emitted the warning.
    pub fn warn_unconfigured(&self, context: &str) -> bool {
        if self.inner.warned.swap(true, Ordering::SeqCst) {
            return false;
        }
        warn!(
            context = %context,
            "GEMINI_API_KEY is not configured; LLM features are disabled"
        );
        true
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("configured", &self.is_configured())
            .finish()
    }
}
