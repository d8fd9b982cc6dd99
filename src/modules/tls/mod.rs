//! TLS parameter sets describing how each browser family negotiates.
//!
//! These are descriptive profiles handed to transport engines that can
//! impersonate a ClientHello; the reqwest transport only reports them.

use serde::{Deserialize, Serialize};

use super::spoofing::BrowserType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsParameters {
    pub browser: BrowserType,
    pub ja3: String,
    pub http2: bool,
    pub grease: bool,
    pub cipher_suites: Vec<String>,
    pub signature_algorithms: Vec<String>,
    pub supported_versions: Vec<String>,
    pub key_share_curves: Vec<String>,
    pub alpn_protocols: Vec<String>,
    pub cert_compression: Option<String>,
    pub record_size_limit: Option<u16>,
    pub extensions: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Parameter set for a browser family.
pub fn tls_parameters_for(browser: BrowserType) -> TlsParameters {
    match browser {
        BrowserType::Chrome | BrowserType::Edge => TlsParameters {
            browser,
            ja3: "771,4866-4865-4867-49196-49195-52393,0-11-10-35-13-45-16-43,29-23-24,0".into(),
            http2: true,
            grease: true,
            cipher_suites: strings(&[
                "TLS_AES_128_GCM_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_CHACHA20_POLY1305_SHA256",
            ]),
            signature_algorithms: strings(&[
                "ecdsa_secp256r1_sha256",
                "rsa_pss_rsae_sha256",
                "rsa_pkcs1_sha256",
                "ecdsa_secp384r1_sha384",
                "rsa_pss_rsae_sha384",
                "rsa_pkcs1_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha512",
            ]),
            supported_versions: strings(&["GREASE", "1.3", "1.2"]),
            key_share_curves: strings(&["GREASE", "x25519"]),
            alpn_protocols: strings(&["h2", "http/1.1"]),
            cert_compression: Some("brotli".into()),
            record_size_limit: None,
            extensions: strings(&["extended_master_secret", "renegotiation_info"]),
        },
        BrowserType::Firefox => TlsParameters {
            browser,
            ja3: "771,4866-4865-4867-49196-49200,0-11-10-35-13-27,23-24,0".into(),
            http2: true,
            grease: false,
            cipher_suites: strings(&[
                "TLS_AES_128_GCM_SHA256",
                "TLS_CHACHA20_POLY1305_SHA256",
                "TLS_AES_256_GCM_SHA384",
            ]),
            signature_algorithms: strings(&[
                "ecdsa_secp256r1_sha256",
                "ecdsa_secp384r1_sha384",
                "ecdsa_secp521r1_sha512",
                "rsa_pss_rsae_sha256",
                "rsa_pss_rsae_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha256",
            ]),
            supported_versions: strings(&["1.3", "1.2"]),
            key_share_curves: strings(&["x25519", "secp256r1"]),
            alpn_protocols: strings(&["h2", "http/1.1"]),
            cert_compression: None,
            record_size_limit: Some(16385),
            extensions: strings(&["extended_master_secret", "renegotiation_info"]),
        },
        BrowserType::Safari => TlsParameters {
            browser,
            ja3: "771,4865-4866-4867-49195-49196,0-11-10-35-13-16,29-23-24,0".into(),
            http2: true,
            grease: true,
            cipher_suites: strings(&[
                "TLS_AES_128_GCM_SHA256",
                "TLS_AES_256_GCM_SHA384",
                "TLS_CHACHA20_POLY1305_SHA256",
            ]),
            signature_algorithms: strings(&[
                "ecdsa_secp256r1_sha256",
                "rsa_pss_rsae_sha256",
                "rsa_pkcs1_sha256",
                "ecdsa_secp384r1_sha384",
            ]),
            supported_versions: strings(&["GREASE", "1.3", "1.2"]),
            key_share_curves: strings(&["GREASE", "x25519"]),
            alpn_protocols: strings(&["h2", "http/1.1"]),
            cert_compression: Some("zlib".into()),
            record_size_limit: None,
            extensions: strings(&["extended_master_secret"]),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromium_family_shares_parameters() {
        let chrome = tls_parameters_for(BrowserType::Chrome);
        let edge = tls_parameters_for(BrowserType::Edge);
        assert_eq!(chrome.ja3, edge.ja3);
        assert_eq!(edge.browser, BrowserType::Edge);
        assert!(chrome.grease);
        assert!(!tls_parameters_for(BrowserType::Firefox).grease);
    }
}
