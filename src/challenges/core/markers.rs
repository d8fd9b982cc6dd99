//! Structural markers of Cloudflare interstitial pages.
//!
//! The same selector set is evaluated inside a live browser (through
//! [`probe_expression`]) and against static HTML (through [`scan_html`]).

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Deserialize;

/// Selectors present on challenge pages while the challenge is running.
pub const CHALLENGE_MARKERS: &[&str] = &[
    "#cf-challenge-running",
    "#cf-please-wait",
    "#cf-content",
    "div.cf-browser-verification",
    "#challenge-form",
    "#challenge-running",
    "#challenge-error-title",
];

/// Selector Cloudflare uses to report a failed challenge.
pub const ERROR_MARKER: &str = "#challenge-error-title";

/// Words in an error message that suggest a challenge page was served.
pub const CHALLENGE_KEYWORDS: &[&str] = &["cloudflare", "challenge", "captcha"];

static COMPILED_MARKERS: Lazy<Vec<(&'static str, Selector)>> = Lazy::new(|| {
    CHALLENGE_MARKERS
        .iter()
        .filter_map(|marker| Selector::parse(marker).ok().map(|sel| (*marker, sel)))
        .collect()
});

/// Result of one marker scan over a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerScan {
    #[serde(skip, default = "available")]
    pub available: bool,
    #[serde(default)]
    pub present: Vec<String>,
    #[serde(default)]
    pub error_text: Option<String>,
}

fn available() -> bool {
    true
}

impl MarkerScan {
    /// A scan that could not run, for instance while the page is navigating.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            present: Vec::new(),
            error_text: None,
        }
    }

    pub fn is_challenge(&self) -> bool {
        !self.present.is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.present.iter().any(|marker| marker == ERROR_MARKER)
    }

    /// Parse the JSON string produced by [`probe_expression`].
    pub fn from_probe_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// JavaScript expression that evaluates to a JSON string describing the
/// markers present in the current document.
pub fn probe_expression() -> String {
    let selectors = serde_json::to_string(CHALLENGE_MARKERS).unwrap_or_else(|_| "[]".into());
    let error = serde_json::to_string(ERROR_MARKER).unwrap_or_else(|_| "''".into());
    format!(
        "(() => {{ \
            const present = {selectors}.filter((s) => document.querySelector(s) !== null); \
            const err = document.querySelector({error}); \
            const errorText = err ? (err.innerText || err.textContent || '').trim() : null; \
            return JSON.stringify({{ present, errorText }}); \
        }})()"
    )
}

/// Scan a static HTML document for challenge markers.
pub fn scan_html(html: &str) -> MarkerScan {
    let document = Html::parse_document(html);
    let mut scan = MarkerScan {
        available: true,
        ..MarkerScan::default()
    };

    for (marker, selector) in COMPILED_MARKERS.iter() {
        if let Some(element) = document.select(selector).next() {
            scan.present.push((*marker).to_string());
            if *marker == ERROR_MARKER {
                let text = element.text().collect::<String>().trim().to_string();
                scan.error_text = Some(text);
            }
        }
    }
    scan
}

pub fn is_challenge_document(html: &str) -> bool {
    scan_html(html).is_challenge()
}

/// Case-insensitive keyword check on an error message.
pub fn mentions_challenge(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    CHALLENGE_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}
