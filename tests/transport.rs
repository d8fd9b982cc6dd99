use std::collections::HashMap;
use std::time::Duration;

use cloudbridge_rs::{
    CloudBridgeConfig, ReqwestTransport, RequestOptions, TransportEngine, TransportError,
};
use http::Method;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn url(server: &MockServer, route: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), route)).unwrap()
}

fn transport() -> ReqwestTransport {
    let config = CloudBridgeConfig {
        timeout_secs: 5,
        ..CloudBridgeConfig::default()
    };
    ReqwestTransport::from_config(&config).unwrap()
}

#[tokio::test]
async fn sends_harvested_cookies_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .and(header("cookie", "__cf_bm=bm; cf_clearance=token"))
        .and(header("user-agent", "harvested-agent/1.0"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(1)
        .mount(&server)
        .await;

    let mut transport = transport();
    transport.apply_cookies(&HashMap::from([
        ("cf_clearance".to_string(), "token".to_string()),
        ("__cf_bm".to_string(), "bm".to_string()),
    ]));
    transport.apply_headers(&HashMap::from([(
        "user-agent".to_string(),
        "harvested-agent/1.0".to_string(),
    )]));

    let response = transport
        .execute(&RequestOptions::get(url(&server, "/page")))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");
    assert_eq!(transport.headers().len(), 10);
}

#[tokio::test]
async fn set_cookie_refreshes_cookie_map() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200).insert_header("set-cookie", "cf_clearance=fresh; Path=/"),
        )
        .mount(&server)
        .await;

    let mut transport = transport();
    transport.apply_cookies(&HashMap::from([(
        "cf_clearance".to_string(),
        "stale".to_string(),
    )]));

    let response = transport
        .execute(&RequestOptions::get(url(&server, "/login")))
        .await
        .unwrap();
    assert_eq!(response.cookies.get("cf_clearance").map(String::as_str), Some("fresh"));
    assert_eq!(
        transport.cookies().get("cf_clearance").map(String::as_str),
        Some("fresh")
    );
}

#[tokio::test]
async fn deflate_bodies_are_decoded() {
    // zlib stream holding "hello world" in a single stored block.
    let mut compressed = vec![0x78, 0x01, 0x01, 0x0b, 0x00, 0xf4, 0xff];
    compressed.extend_from_slice(b"hello world");
    compressed.extend_from_slice(&[0x1a, 0x0b, 0x04, 0x5d]);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/compressed"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "deflate")
                .set_body_bytes(compressed),
        )
        .mount(&server)
        .await;

    let mut transport = transport();
    let response = transport
        .execute(&RequestOptions::get(url(&server, "/compressed")))
        .await
        .unwrap();
    assert_eq!(response.text(), "hello world");
}

#[tokio::test]
async fn challenge_page_is_reported() {
    let server = MockServer::start().await;
    let body = r#"<html><head><title>Just a moment...</title></head>
        <body><div id="cf-please-wait">Checking your browser</div></body></html>"#;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("server", "cloudflare")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let mut transport = transport();
    let err = transport
        .execute(&RequestOptions::get(url(&server, "/")))
        .await
        .unwrap_err();
    match &err {
        TransportError::ChallengeDetected { status, .. } => assert_eq!(*status, 503),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().to_lowercase().contains("cloudflare"));
}

#[tokio::test]
async fn plain_errors_are_returned_as_responses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let mut transport = transport();
    let response = transport
        .execute(&RequestOptions::get(url(&server, "/nothing")))
        .await
        .unwrap();
    assert_eq!(response.status, 404);
    assert!(!response.is_success());
}

#[tokio::test]
async fn sends_query_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/items"))
        .and(query_param("page", "2"))
        .and(body_json(json!({ "name": "widget" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 7 })))
        .expect(1)
        .mount(&server)
        .await;

    let mut transport = transport();
    let request = RequestOptions::new(Method::POST, url(&server, "/api/items"))
        .with_query("page", "2")
        .with_json(json!({ "name": "widget" }))
        .with_timeout(Duration::from_secs(2));
    let response = transport.execute(&request).await.unwrap();
    assert_eq!(response.status, 201);
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["id"], 7);
}

#[tokio::test]
async fn redirects_can_be_left_unfollowed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .mount(&server)
        .await;

    let mut transport = transport();
    let manual = transport
        .execute(&RequestOptions::get(url(&server, "/old")).with_follow_redirects(false))
        .await
        .unwrap();
    assert_eq!(manual.status, 302);

    let followed = transport
        .execute(&RequestOptions::get(url(&server, "/old")))
        .await
        .unwrap();
    assert_eq!(followed.status, 200);
    assert_eq!(followed.url.path(), "/new");
}

#[tokio::test]
async fn transport_is_usable_after_close() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut transport = transport();
    transport.close().await;
    transport.close().await;
    let response = transport
        .execute(&RequestOptions::get(url(&server, "/")))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
}
