//! Browser fingerprint data provider.
//!
//! Maps fingerprint identifiers (`chrome_120`, `firefox_119`, ...) to a user
//! agent plus the structural traits a browser engine should present. Unknown
//! or absent identifiers fall back to a random known profile.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::tls::{TlsParameters, tls_parameters_for};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    Chrome,
    Firefox,
    Safari,
    Edge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserFingerprint {
    pub identifier: String,
    pub browser: BrowserType,
    pub user_agent: String,
    pub screen_resolution: (u16, u16),
    /// Offset from UTC in minutes.
    pub timezone_offset: i32,
    pub languages: Vec<String>,
    pub tls: TlsParameters,
}

impl BrowserFingerprint {
    pub fn accept_language(&self) -> String {
        match self.languages.as_slice() {
            [] => "en-US,en;q=0.5".into(),
            [first, rest @ ..] => {
                let mut header = first.clone();
                for (idx, lang) in rest.iter().enumerate() {
                    let q = 0.9 - (idx as f32 * 0.1);
                    header.push_str(&format!(",{lang};q={:.1}", q.max(0.1)));
                }
                header
            }
        }
    }
}

struct ProfileEntry {
    identifier: &'static str,
    browser: BrowserType,
    user_agent: &'static str,
}

const PROFILES: &[ProfileEntry] = &[
    ProfileEntry {
        identifier: "chrome_120",
        browser: BrowserType::Chrome,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    },
    ProfileEntry {
        identifier: "chrome_119",
        browser: BrowserType::Chrome,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    },
    ProfileEntry {
        identifier: "firefox_120",
        browser: BrowserType::Firefox,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
    },
    ProfileEntry {
        identifier: "firefox_119",
        browser: BrowserType::Firefox,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:119.0) Gecko/20100101 Firefox/119.0",
    },
    ProfileEntry {
        identifier: "edge_120",
        browser: BrowserType::Edge,
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
    },
    ProfileEntry {
        identifier: "safari_17",
        browser: BrowserType::Safari,
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15",
    },
];

const SCREEN_RESOLUTIONS: &[(u16, u16)] = &[
    (1920, 1080),
    (2560, 1440),
    (1366, 768),
    (1440, 900),
    (1536, 864),
];

const TIMEZONE_OFFSETS: &[i32] = &[
    -480, -420, -360, -300, -240, -180, 0, 60, 120, 180, 240, 300, 360, 480,
];

/// Static fingerprint/user-agent table.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintProvider;

impl FingerprintProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &'static str> {
        PROFILES.iter().map(|entry| entry.identifier)
    }

    pub fn is_known(&self, identifier: &str) -> bool {
        PROFILES.iter().any(|entry| entry.identifier == identifier)
    }

    fn entry(&self, identifier: Option<&str>) -> &'static ProfileEntry {
        identifier
            .and_then(|id| PROFILES.iter().find(|entry| entry.identifier == id))
            .unwrap_or_else(|| {
                PROFILES
                    .choose(&mut rand::thread_rng())
                    .unwrap_or(&PROFILES[0])
            })
    }

    pub fn user_agent(&self, identifier: Option<&str>) -> String {
        self.entry(identifier).user_agent.to_string()
    }

    /// Full fingerprint; screen size and timezone are randomised per call.
    pub fn fingerprint(&self, identifier: Option<&str>) -> BrowserFingerprint {
        let entry = self.entry(identifier);
        let mut rng = rand::thread_rng();

        BrowserFingerprint {
            identifier: entry.identifier.to_string(),
            browser: entry.browser,
            user_agent: entry.user_agent.to_string(),
            screen_resolution: SCREEN_RESOLUTIONS
                .choose(&mut rng)
                .copied()
                .unwrap_or((1920, 1080)),
            timezone_offset: TIMEZONE_OFFSETS.choose(&mut rng).copied().unwrap_or(0),
            languages: vec!["en-US".into(), "en".into()],
            tls: tls_parameters_for(entry.browser),
        }
    }
}

/// Header set a navigating browser sends, keyed by canonical header name.
pub fn baseline_headers(user_agent: &str) -> HashMap<String, String> {
    [
        ("User-Agent", user_agent),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.5"),
        ("Accept-Encoding", "gzip, deflate, br"),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-Site", "none"),
        ("Sec-Fetch-User", "?1"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_identifier_is_stable() {
        let provider = FingerprintProvider::new();
        let fp = provider.fingerprint(Some("firefox_120"));
        assert_eq!(fp.identifier, "firefox_120");
        assert_eq!(fp.browser, BrowserType::Firefox);
        assert!(fp.user_agent.contains("Firefox/120.0"));
        assert_eq!(fp.tls.browser, BrowserType::Firefox);
    }

    #[test]
    fn unknown_identifier_falls_back_to_table() {
        let provider = FingerprintProvider::new();
        let ua = provider.user_agent(Some("netscape_4"));
        assert!(PROFILES.iter().any(|entry| entry.user_agent == ua));
    }

    #[test]
    fn baseline_headers_carry_user_agent() {
        let headers = baseline_headers("test-agent");
        assert_eq!(headers.get("User-Agent").map(String::as_str), Some("test-agent"));
        assert_eq!(headers.len(), 10);
    }

    #[test]
    fn accept_language_weights_secondary_languages() {
        let provider = FingerprintProvider::new();
        let mut fp = provider.fingerprint(Some("chrome_120"));
        fp.languages = vec!["en-US".into(), "en".into(), "fr".into()];
        assert_eq!(fp.accept_language(), "en-US,en;q=0.9,fr;q=0.8");
    }
}
