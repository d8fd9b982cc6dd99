//! Needs a local Chrome and network access: `cargo test -- --ignored`.

use std::env;

use cloudbridge_rs::{CloudBridge, EngineKind, EngineMode};

#[tokio::test]
#[ignore]
async fn fetches_page_through_real_browser() {
    let target = env::var("CLOUDBRIDGE_TARGET").unwrap_or_else(|_| "https://example.com/".into());
    let bridge = CloudBridge::builder()
        .with_engine_mode(EngineMode::DevTools)
        .headless(true)
        .with_fingerprint("chrome_120")
        .build()
        .unwrap();
    assert_eq!(bridge.engine_kind(), EngineKind::DevTools);

    let response = bridge.get(&target).await.unwrap();
    assert!(response.is_success(), "status {}", response.status());
    let info = bridge.session_info(&target).await.unwrap().unwrap();
    assert!(info.valid);
    assert!(!info.headers.is_empty());

    bridge.close().await;
}
