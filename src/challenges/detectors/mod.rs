//! Challenge detection module.
//!
//! Pattern-based identification of Cloudflare challenge responses, used by
//! the transport to turn a served interstitial into a structured error.

use http::header::SERVER;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::challenges::core::ChallengeResponse;

/// High level challenge categories recognised by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    JavaScriptV1,
    JavaScriptV2,
    ManagedV3,
    Turnstile,
    RateLimit,
    AccessDenied,
    BotManagement,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::JavaScriptV1 => "javascript_v1",
            ChallengeType::JavaScriptV2 => "javascript_v2",
            ChallengeType::ManagedV3 => "managed_v3",
            ChallengeType::Turnstile => "turnstile",
            ChallengeType::RateLimit => "rate_limit",
            ChallengeType::AccessDenied => "access_denied",
            ChallengeType::BotManagement => "bot_management",
        }
    }
}

#[derive(Debug, Clone)]
struct ChallengePattern {
    id: &'static str,
    name: &'static str,
    challenge_type: ChallengeType,
    base_confidence: f32,
    patterns: Vec<Regex>,
}

impl ChallengePattern {
    fn new(
        id: &'static str,
        name: &'static str,
        challenge_type: ChallengeType,
        base_confidence: f32,
        raw_patterns: &[&str],
    ) -> Self {
        let patterns = raw_patterns
            .iter()
            .filter_map(|pattern| build_regex(pattern))
            .collect();

        Self {
            id,
            name,
            challenge_type,
            base_confidence,
            patterns,
        }
    }

    fn evaluate(&self, body: &str) -> Option<(f32, Vec<String>)> {
        let matches: Vec<_> = self
            .patterns
            .iter()
            .filter(|regex| regex.is_match(body))
            .map(|regex| regex.as_str().to_string())
            .collect();

        if matches.is_empty() || self.patterns.is_empty() {
            return None;
        }

        let total = self.patterns.len() as f32;
        let confidence = ((matches.len() as f32 / total) * self.base_confidence).min(1.0);
        // Too few indicators matched.
        if confidence < 0.2 {
            return None;
        }
        Some((confidence, matches))
    }
}

static KNOWN_PATTERNS: Lazy<Vec<ChallengePattern>> = Lazy::new(|| {
    vec![
        ChallengePattern::new(
            "cf_iuam_v1",
            "Cloudflare IUAM v1",
            ChallengeType::JavaScriptV1,
            0.95,
            &[
                r#"<title>\s*Just a moment\.\.\.\s*</title>"#,
                r#"<form[^>]*id="challenge-form"[^>]*action="/[^"]*__cf_chl_f_tk="#,
                r#"id="cf-please-wait""#,
            ],
        ),
        ChallengePattern::new(
            "cf_iuam_v2",
            "Cloudflare IUAM v2",
            ChallengeType::JavaScriptV2,
            0.90,
            &[
                r#"cpo\.src\s*=\s*['"]/cdn-cgi/challenge-platform/.*?orchestrate/jsch/v1"#,
                r"window\._cf_chl_opt\s*=",
                r#"<form[^>]*id="challenge-form"[^>]*action="/[^"]*__cf_chl_rt_tk="#,
            ],
        ),
        ChallengePattern::new(
            "cf_managed_v3",
            "Cloudflare Managed Challenge v3",
            ChallengeType::ManagedV3,
            0.92,
            &[
                r#"cpo\.src\s*=\s*['"]/cdn-cgi/challenge-platform/.*?orchestrate/(?:captcha|managed)/v1"#,
                r"window\._cf_chl_ctx\s*=",
                r#"<div[^>]*class="cf-browser-verification"#,
            ],
        ),
        ChallengePattern::new(
            "cf_turnstile",
            "Cloudflare Turnstile",
            ChallengeType::Turnstile,
            0.98,
            &[
                r#"class="cf-turnstile""#,
                r#"src="https://challenges\.cloudflare\.com/turnstile/v0/api\.js"#,
                r"cf-turnstile-response",
            ],
        ),
        ChallengePattern::new(
            "cf_rate_limit",
            "Cloudflare Rate Limit",
            ChallengeType::RateLimit,
            0.99,
            &[
                r#"<span[^>]*class="cf-error-code">1015<"#,
                r"You are being rate limited",
            ],
        ),
        ChallengePattern::new(
            "cf_access_denied",
            "Cloudflare Access Denied",
            ChallengeType::AccessDenied,
            0.99,
            &[
                r#"<span[^>]*class="cf-error-code">1020<"#,
                r"The owner of this website has banned your access",
            ],
        ),
        ChallengePattern::new(
            "cf_bot_management",
            "Cloudflare Bot Management",
            ChallengeType::BotManagement,
            0.95,
            &[
                r#"<span[^>]*class="cf-error-code">1010<"#,
                r"has banned you temporarily",
            ],
        ),
    ]
});

/// Detection output.
#[derive(Debug, Clone)]
pub struct ChallengeDetection {
    pub pattern_id: String,
    pub pattern_name: String,
    pub challenge_type: ChallengeType,
    pub confidence: f32,
    pub status_code: u16,
    pub url: String,
    pub matched_indicators: Vec<String>,
}

/// Whether the response was served by Cloudflare.
pub fn is_cloudflare_response(response: &ChallengeResponse<'_>) -> bool {
    response
        .headers
        .get(SERVER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().starts_with("cloudflare"))
        .unwrap_or(false)
}

/// Pattern-based challenge detector.
#[derive(Debug, Clone, Default)]
pub struct ChallengeDetector;

impl ChallengeDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detect a challenge in the provided HTTP response.
    ///
    /// Requires a Cloudflare `Server` header, a 403/429/503 status and at
    /// least one body signature.
    pub fn detect(&self, response: &ChallengeResponse<'_>) -> Option<ChallengeDetection> {
        if !is_cloudflare_response(response) || !matches!(response.status, 403 | 429 | 503) {
            return None;
        }

        let mut best: Option<ChallengeDetection> = None;
        for pattern in KNOWN_PATTERNS.iter() {
            if let Some((confidence, matched)) = pattern.evaluate(response.body)
                && best
                    .as_ref()
                    .is_none_or(|current| confidence > current.confidence)
            {
                best = Some(ChallengeDetection {
                    pattern_id: pattern.id.to_string(),
                    pattern_name: pattern.name.to_string(),
                    challenge_type: pattern.challenge_type,
                    confidence,
                    status_code: response.status,
                    url: response.url.as_str().to_string(),
                    matched_indicators: matched,
                });
            }
        }

        if let Some(detection) = &best {
            log::debug!(
                "detected {} on {} (confidence {:.2})",
                detection.pattern_name,
                detection.url,
                detection.confidence
            );
        }
        best
    }
}

fn build_regex(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
    {
        Ok(regex) => Some(regex),
        Err(err) => {
            log::warn!("invalid challenge detection regex `{pattern}`: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use url::Url;

    struct ResponseFixture {
        url: Url,
        headers: HeaderMap,
        method: Method,
        body: String,
        status: u16,
    }

    impl ResponseFixture {
        fn new(body: &str, status: u16, server: &str) -> Self {
            let mut headers = HeaderMap::new();
            headers.insert(SERVER, server.parse().unwrap());
            Self {
                url: Url::parse("https://example.com/").unwrap(),
                headers,
                method: Method::GET,
                body: body.to_string(),
                status,
            }
        }

        fn response(&self) -> ChallengeResponse<'_> {
            ChallengeResponse {
                url: &self.url,
                status: self.status,
                headers: &self.headers,
                body: &self.body,
                request_method: &self.method,
            }
        }
    }

    const TURNSTILE: &str = r#"
        <html><head><title>Test</title></head>
        <body>
            <div class="cf-turnstile" data-sitekey="0123456789ABCDEFGHIJ0123456789ABCDEFGHIJ"></div>
            <script src="https://challenges.cloudflare.com/turnstile/v0/api.js"></script>
        </body>
        </html>
    "#;

    #[test]
    fn detects_turnstile() {
        let fixture = ResponseFixture::new(TURNSTILE, 403, "cloudflare");
        let detection = ChallengeDetector::new()
            .detect(&fixture.response())
            .expect("should detect");
        assert_eq!(detection.challenge_type, ChallengeType::Turnstile);
        assert_eq!(detection.status_code, 403);
    }

    #[test]
    fn detects_iuam_interstitial() {
        let html = r#"<html><head><title>Just a moment...</title></head>
            <body><div id="cf-please-wait">Please wait</div></body></html>"#;
        let fixture = ResponseFixture::new(html, 503, "cloudflare");
        let detection = ChallengeDetector::new().detect(&fixture.response()).unwrap();
        assert_eq!(detection.challenge_type, ChallengeType::JavaScriptV1);
    }

    #[test]
    fn ignores_non_cloudflare_or_success_status() {
        let other_server = ResponseFixture::new(TURNSTILE, 403, "nginx");
        assert!(ChallengeDetector::new().detect(&other_server.response()).is_none());

        let ok_status = ResponseFixture::new(TURNSTILE, 200, "cloudflare");
        assert!(ChallengeDetector::new().detect(&ok_status.response()).is_none());
    }
}
