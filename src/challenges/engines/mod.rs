//! Browser automation backends that sit in front of a challenge.
//!
//! An engine loads a URL in a real browser, waits for any Cloudflare
//! interstitial to clear, and exposes the resulting cookie jar plus a
//! representative header set. The bridge only talks to [`ChallengeEngine`],
//! so tests substitute scripted fakes.

pub mod browser;
pub mod devtools;
pub mod webdriver;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::challenges::core::{ChallengeEngineError, ChallengeResult};
use crate::config::CloudBridgeConfig;

pub use browser::{BrowserLocator, BrowserOptions, CHROME_CANDIDATES};
pub use devtools::DevToolsEngine;
pub use webdriver::WebDriverEngine;

/// Concrete engine variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    DevTools,
    WebDriver,
    /// Caller-supplied engine.
    Custom,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::DevTools => "devtools",
            EngineKind::WebDriver => "webdriver",
            EngineKind::Custom => "custom",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract every challenge-solving backend satisfies.
#[async_trait]
pub trait ChallengeEngine: Send {
    fn kind(&self) -> EngineKind {
        EngineKind::Custom
    }

    /// Load `url`, launching the browser first if needed.
    async fn navigate(&mut self, url: &Url) -> Result<(), ChallengeEngineError>;

    /// Wait out a challenge on the loaded page.
    async fn wait_for_challenge(&mut self, timeout: Duration) -> Result<(), ChallengeEngineError>;

    async fn cookies(&mut self) -> Result<HashMap<String, String>, ChallengeEngineError>;

    async fn headers(&mut self) -> Result<HashMap<String, String>, ChallengeEngineError>;

    /// Release the browser. Safe to call repeatedly; never fails.
    async fn close(&mut self);

    async fn harvest(&mut self) -> Result<ChallengeResult, ChallengeEngineError> {
        let cookies = self.cookies().await?;
        let headers = self.headers().await?;
        Ok(ChallengeResult::new(cookies, headers))
    }
}

/// Build the engine a configuration selects.
pub fn engine_for(config: &CloudBridgeConfig) -> Box<dyn ChallengeEngine> {
    match config.engine_kind() {
        EngineKind::WebDriver => Box::new(WebDriverEngine::from_config(config)),
        EngineKind::DevTools | EngineKind::Custom => Box::new(DevToolsEngine::from_config(config)),
    }
}
