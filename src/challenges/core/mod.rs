//! Core utilities shared by the challenge engines and the transport.

pub mod markers;
pub mod polling;
pub mod types;

pub use markers::{
    CHALLENGE_KEYWORDS, CHALLENGE_MARKERS, ERROR_MARKER, MarkerScan, is_challenge_document,
    mentions_challenge, probe_expression, scan_html,
};
pub use polling::{PageProbe, PollOutcome, PollSettings, poll_challenge};
pub use types::{ChallengeEngineError, ChallengeResponse, ChallengeResult};
