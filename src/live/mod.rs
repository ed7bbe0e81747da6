//! # Live Audio Sessions
//!
//! Everything behind the `/ws/live` endpoint: the per-connection audio queue,
//! the duplex stream to Gemini Live, the session manager that runs the send
//! and receive duties, and the dispatcher that turns endpoint events into
//! client messages.

pub mod dispatch;
pub mod events;
pub mod gemini;
pub mod queue;
pub mod session;
pub mod stream;

pub use dispatch::{ClientSink, Dispatcher};
pub use events::ClientMessage;
pub use gemini::GeminiLiveConnector;
pub use queue::{audio_channel, AudioQueue, PushError};
pub use session::{EventCallback, LiveSession, SessionStats};
pub use stream::{LiveConnector, LiveError, LiveSetup};
