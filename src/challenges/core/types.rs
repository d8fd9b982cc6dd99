//! Core data structures shared by the challenge engines and the transport.

use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::error::Error as StdError;
use thiserror::Error;
use url::Url;

/// Borrowed view of an HTTP response used for challenge detection.
#[derive(Debug, Clone)]
pub struct ChallengeResponse<'a> {
    pub url: &'a Url,
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
    pub request_method: &'a Method,
}

/// Cookies and headers harvested from a browser after a challenge cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeResult {
    pub cookies: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl ChallengeResult {
    pub fn new(cookies: HashMap<String, String>, headers: HashMap<String, String>) -> Self {
        Self { cookies, headers }
    }
}

/// Failures raised by a challenge engine.
#[derive(Debug, Error)]
pub enum ChallengeEngineError {
    /// The browser or its driver could not be driven.
    #[error("browser automation error: {message}")]
    Automation {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
    /// The challenge page reported an error.
    #[error("cloudflare challenge failed: {0}")]
    Failed(String),
    #[error("cloudflare challenge timed out after {0:.1}s")]
    Timeout(f64),
}

impl ChallengeEngineError {
    pub fn automation(message: impl Into<String>) -> Self {
        ChallengeEngineError::Automation {
            message: message.into(),
            source: None,
        }
    }

    /// Automation failure that keeps the underlying error as its source.
    pub fn automation_caused_by<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ChallengeEngineError::Automation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
