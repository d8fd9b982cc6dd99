use std::collections::HashMap;
use std::fs;

use cloudbridge_rs::SessionStore;
use cloudbridge_rs::modules::state::{SessionFile, SessionFileError};
use tempfile::tempdir;
use url::Url;

fn pairs(items: &[(&str, &str)]) -> HashMap<String, String> {
    items
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[test]
fn single_origin_file_restores_session() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("single.json");
    let url = Url::parse("https://example.com/account").unwrap();
    let cookies = pairs(&[("cf_clearance", "abc"), ("__cf_bm", "def")]);
    let headers = pairs(&[("User-Agent", "Mozilla/5.0"), ("Accept-Language", "en-US")]);

    let mut store = SessionStore::default();
    store.update(&url, cookies.clone(), headers.clone());
    store.save(&path, Some(&url)).unwrap();

    let contents = fs::read_to_string(&path).unwrap();
    assert!(matches!(
        SessionFile::from_json_str(&contents).unwrap(),
        SessionFile::Single(_)
    ));

    let mut fresh = SessionStore::default();
    let loaded = fresh.load(&path).unwrap();
    assert_eq!(loaded, vec![url.clone()]);
    assert_eq!(fresh.cookies(&url), Some(&cookies));
    assert_eq!(fresh.headers(&url), Some(&headers));
    assert!(fresh.has_valid_session(&url));
}

#[test]
fn multi_origin_file_restores_every_session() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("multi.json");
    let shop = Url::parse("https://shop.example.com/").unwrap();
    let api = Url::parse("http://api.example.com:8080/v1").unwrap();

    let mut store = SessionStore::default();
    store.update(&shop, pairs(&[("cf_clearance", "shop")]), pairs(&[("User-Agent", "a")]));
    store.update(&api, pairs(&[("cf_clearance", "api")]), pairs(&[("User-Agent", "b")]));
    store.save(&path, None).unwrap();

    let mut fresh = SessionStore::default();
    let loaded = fresh.load(&path).unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(fresh.len(), 2);
    for url in [&shop, &api] {
        assert_eq!(fresh.cookies(url), store.cookies(url));
        assert_eq!(fresh.headers(url), store.headers(url));
    }
}

#[test]
fn loading_merges_into_existing_sessions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("merge.json");
    let saved = Url::parse("https://saved.example.com/").unwrap();
    let local = Url::parse("https://local.example.com/").unwrap();

    let mut store = SessionStore::default();
    store.update(&saved, pairs(&[("a", "1")]), HashMap::new());
    store.save(&path, None).unwrap();

    let mut other = SessionStore::default();
    other.update(&local, pairs(&[("b", "2")]), HashMap::new());
    other.load(&path).unwrap();
    assert!(other.has_valid_session(&saved));
    assert!(other.has_valid_session(&local));
}

#[test]
fn missing_and_malformed_files_are_errors() {
    let dir = tempdir().unwrap();
    let mut store = SessionStore::default();

    let missing = store.load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(missing, SessionFileError::Io { .. }));

    let malformed = dir.path().join("broken.json");
    fs::write(&malformed, "[1, 2, 3]").unwrap();
    assert!(matches!(
        store.load(&malformed).unwrap_err(),
        SessionFileError::InvalidFormat(_)
    ));

    let unknown = Url::parse("https://nowhere.example.com/").unwrap();
    assert!(matches!(
        store.save(dir.path().join("none.json"), Some(&unknown)),
        Err(SessionFileError::MissingSession(_))
    ));
}
