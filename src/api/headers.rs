//! Request header construction
//!
//! The upstream expects browser-parity headers on both API families. The
//! fixed sets below mirror what the web client sends; the two dynamic
//! headers (per-request transaction id, regional forwarding) are
//! feature-flagged so a run can drop back to minimal requests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::api::session::SessionStore;

/// Public web-client bearer token; identical for every cookie session.
const BEARER_TOKEN: &str = "AAAAAAAAAAAAAAAAAAAAANRILgAAAAAAnNwIzUejRCOuH5E6I8xnZz4puTs%3D1Zv7ttfk8LF81IUq16cHjhLTvJu4FA33AGWWjCpTnA";

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:139.0) Gecko/20100101 Firefox/139.0";

/// Curated pool for the regional forwarding header.
const FORWARDED_FOR_POOL: &[&str] = &[
    "103.116.12.41",
    "146.70.98.22",
    "185.220.101.7",
    "193.32.126.214",
    "206.217.205.118",
];

/// Dynamic-header feature flags, resolved from configuration once at
/// client construction.
#[derive(Debug, Clone, Copy)]
pub struct HeaderOptions {
    /// Emit a per-request `x-client-transaction-id`.
    pub transaction_id: bool,
    /// Emit `x-xp-forwarded-for` from the curated pool.
    pub forwarded_for: bool,
}

/// Headers for GraphQL GET calls.
pub fn graphql_headers(session: &SessionStore, options: HeaderOptions) -> HeaderMap {
    let mut headers = common_headers(session, options);
    insert(&mut headers, "content-type", "application/json");
    insert(&mut headers, "sec-fetch-dest", "empty");
    insert(&mut headers, "sec-fetch-mode", "cors");
    insert(&mut headers, "sec-fetch-site", "same-origin");
    headers
}

/// Headers for REST form-encoded POST calls (mutating: CSRF mirrored).
pub fn rest_headers(session: &SessionStore, options: HeaderOptions, origin: &str) -> HeaderMap {
    let mut headers = common_headers(session, options);
    insert(
        &mut headers,
        "content-type",
        "application/x-www-form-urlencoded",
    );
    insert_value(&mut headers, "origin", origin);
    insert_value(&mut headers, "referer", &format!("{}/home", origin));
    headers
}

fn common_headers(session: &SessionStore, options: HeaderOptions) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_value(
        &mut headers,
        "authorization",
        &format!("Bearer {}", BEARER_TOKEN),
    );
    insert_value(&mut headers, "x-csrf-token", session.csrf_token());
    insert(&mut headers, "x-twitter-auth-type", "OAuth2Session");
    insert(&mut headers, "x-twitter-active-user", "yes");
    insert(&mut headers, "user-agent", USER_AGENT);
    insert(&mut headers, "accept", "*/*");
    insert(&mut headers, "accept-language", "en-US,en;q=0.7");
    insert(&mut headers, "dnt", "1");
    insert_value(&mut headers, "cookie", &session.cookie_header());

    if options.transaction_id {
        insert_value(&mut headers, "x-client-transaction-id", &transaction_id());
    }
    if options.forwarded_for {
        let ip = FORWARDED_FOR_POOL[rand::thread_rng().gen_range(0..FORWARDED_FOR_POOL.len())];
        insert(&mut headers, "x-xp-forwarded-for", ip);
    }

    headers
}

/// Opaque short random token for the transaction-id header.
pub fn transaction_id() -> String {
    let mut bytes = [0u8; 18];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &'static str) {
    headers.insert(
        HeaderName::from_static(name),
        HeaderValue::from_static(value),
    );
}

fn insert_value(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    } else {
        tracing::warn!(header = name, "dropping header with non-ASCII value");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn test_session() -> SessionStore {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"name": "ct0", "value": "csrf-token-value", "domain": ".x.com"}},
                {{"name": "auth_token", "value": "auth-token-value", "domain": ".x.com"}}
            ]"#
        )
        .unwrap();
        // Keep the tempfile alive past load by leaking it into the path;
        // the store only re-reads on reload.
        let session = SessionStore::load(file.path()).unwrap();
        drop(file);
        session
    }

    const ALL_ON: HeaderOptions = HeaderOptions {
        transaction_id: true,
        forwarded_for: true,
    };
    const ALL_OFF: HeaderOptions = HeaderOptions {
        transaction_id: false,
        forwarded_for: false,
    };

    #[test]
    fn graphql_headers_carry_csrf_mirror_and_cookies() {
        let headers = graphql_headers(&test_session(), ALL_OFF);
        assert_eq!(
            headers.get("x-csrf-token").unwrap(),
            "csrf-token-value"
        );
        let cookie = headers.get("cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("ct0=csrf-token-value"));
        assert!(cookie.contains("auth_token=auth-token-value"));
        assert!(headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Bearer "));
    }

    #[test]
    fn dynamic_headers_follow_flags() {
        let off = graphql_headers(&test_session(), ALL_OFF);
        assert!(off.get("x-client-transaction-id").is_none());
        assert!(off.get("x-xp-forwarded-for").is_none());

        let on = graphql_headers(&test_session(), ALL_ON);
        assert!(on.get("x-client-transaction-id").is_some());
        let ip = on.get("x-xp-forwarded-for").unwrap().to_str().unwrap();
        assert!(FORWARDED_FOR_POOL.contains(&ip));
    }

    #[test]
    fn rest_headers_are_form_encoded_with_origin() {
        let headers = rest_headers(&test_session(), ALL_OFF, "https://x.com");
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(headers.get("origin").unwrap(), "https://x.com");
        assert_eq!(headers.get("referer").unwrap(), "https://x.com/home");
    }

    #[test]
    fn transaction_ids_are_unique_and_url_safe() {
        let a = transaction_id();
        let b = transaction_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 24); // 18 bytes, unpadded base64
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
