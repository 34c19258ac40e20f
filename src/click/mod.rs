//! Click tokens and the click recording pipeline

pub mod recorder;
pub mod token;

pub use recorder::{ClickError, ClickOutcome, ClickRecorder, ClickSubmission, RecorderPolicy};
pub use token::{ClickPayload, ClickToken, ClickTokenCodec, TokenError, DEFAULT_TOKEN_TTL_MS};
