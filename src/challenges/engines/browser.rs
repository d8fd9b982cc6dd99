//! Browser process plumbing shared by the engines.

use std::env;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use crate::challenges::core::ChallengeEngineError;
use crate::modules::spoofing::BrowserFingerprint;

/// Well-known Chromium-family install locations, checked in order.
pub const CHROME_CANDIDATES: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/usr/local/bin/chrome",
    "/usr/local/bin/google-chrome",
    "/usr/local/bin/chromium",
    "/usr/local/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
    "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
];

/// Ordered browser binary lookup.
///
/// Sources are captured when the locator is built; nothing is read from the
/// environment afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserLocator {
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl BrowserLocator {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            from_env: env::var_os("CHROME_BIN")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            candidates: CHROME_CANDIDATES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_env_value(mut self, value: Option<PathBuf>) -> Self {
        self.from_env = value;
        self
    }

    pub fn with_candidates<I, P>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    /// First usable binary. An explicit path is trusted as-is; the
    /// environment value and candidates must exist on disk.
    pub fn resolve(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            return Some(path.clone());
        }
        self.from_env
            .iter()
            .chain(self.candidates.iter())
            .find(|path| path.is_file())
            .cloned()
    }
}

/// Launch options shared by both engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserOptions {
    pub headless: bool,
    pub proxy: Option<String>,
    pub window_size: Option<(u16, u16)>,
    pub user_agent: Option<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            proxy: None,
            window_size: None,
            user_agent: None,
        }
    }
}

/// Chromium command line flags (without the binary or debugging port).
pub fn chrome_args(options: &BrowserOptions, profile_dir: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-sandbox".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".into());
    }
    if let Some(proxy) = &options.proxy {
        args.push(format!("--proxy-server={proxy}"));
    }
    if let Some((width, height)) = options.window_size {
        args.push(format!("--window-size={width},{height}"));
    }
    if let Some(user_agent) = &options.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }
    if let Some(dir) = profile_dir {
        args.push(format!("--user-data-dir={}", dir.display()));
    }
    args
}

/// Script overriding screen size and timezone offset on every new document.
pub fn fingerprint_script(fingerprint: &BrowserFingerprint) -> String {
    let (width, height) = fingerprint.screen_resolution;
    // getTimezoneOffset() is negated relative to UTC offsets.
    let offset = -fingerprint.timezone_offset;
    format!(
        "(() => {{ \
            Object.defineProperty(screen, 'width', {{ get: () => {width} }}); \
            Object.defineProperty(screen, 'height', {{ get: () => {height} }}); \
            Object.defineProperty(screen, 'availWidth', {{ get: () => {width} }}); \
            Object.defineProperty(screen, 'availHeight', {{ get: () => {height} }}); \
            Date.prototype.getTimezoneOffset = function () {{ return {offset}; }}; \
        }})();"
    )
}

/// Reserve a free localhost port.
pub fn free_port() -> Result<u16, ChallengeEngineError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| {
        ChallengeEngineError::automation_caused_by("failed to reserve a local port", err)
    })?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|err| ChallengeEngineError::automation_caused_by("failed to read local port", err))
}

/// Fresh profile directory for one browser launch.
pub fn profile_dir(tag: &str, port: u16) -> PathBuf {
    env::temp_dir().join(format!("cloudbridge-{tag}-{}-{port}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::spoofing::FingerprintProvider;

    #[test]
    fn explicit_path_wins() {
        let locator = BrowserLocator::new(Some(PathBuf::from("/opt/custom/chrome")))
            .with_env_value(Some(PathBuf::from("/nonexistent/env-chrome")));
        assert_eq!(locator.resolve(), Some(PathBuf::from("/opt/custom/chrome")));
    }

    #[test]
    fn falls_through_missing_candidates() {
        let existing = std::env::current_exe().unwrap();
        let locator = BrowserLocator::new(None)
            .with_env_value(Some(PathBuf::from("/nonexistent/env-chrome")))
            .with_candidates(vec![PathBuf::from("/nonexistent/a"), existing.clone()]);
        assert_eq!(locator.resolve(), Some(existing));

        let empty = BrowserLocator::new(None)
            .with_env_value(None)
            .with_candidates(Vec::<PathBuf>::new());
        assert_eq!(empty.resolve(), None);
    }

    #[test]
    fn builds_headless_proxy_args() {
        let options = BrowserOptions {
            headless: true,
            proxy: Some("http://127.0.0.1:8080".into()),
            window_size: Some((1920, 1080)),
            user_agent: None,
        };
        let args = chrome_args(&options, None);
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--proxy-server=http://127.0.0.1:8080".to_string()));
        assert!(args.contains(&"--window-size=1920,1080".to_string()));
    }

    #[test]
    fn script_embeds_fingerprint_values() {
        let mut fingerprint = FingerprintProvider::new().fingerprint(Some("chrome_120"));
        fingerprint.screen_resolution = (1366, 768);
        fingerprint.timezone_offset = 60;
        let script = fingerprint_script(&fingerprint);
        assert!(script.contains("get: () => 1366"));
        assert!(script.contains("return -60;"));
    }
}
