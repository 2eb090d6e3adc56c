use common_auth::JwksFetcher;
use httpmock::prelude::*;

#[tokio::test]
async fn unusable_entries_are_skipped_not_fatal() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(200).json_body(serde_json::json!({
            "keys": [
                {"kid": "ec-key", "kty": "EC", "alg": "ES256"},
                {"kid": "broken-rsa", "kty": "RSA", "alg": "RS256"},
                {"kty": "RSA", "n": "abc", "e": "AQAB"}
            ]
        }));
    });

    let fetcher = JwksFetcher::new(server.url("/keys"));
    // Every entry is unusable (wrong kty, missing components, missing kid)
    // but the fetch itself succeeds.
    let keys = fetcher.fetch().await.unwrap();
    assert!(keys.is_empty());
}

#[tokio::test]
async fn http_failure_is_an_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(503);
    });

    let fetcher = JwksFetcher::new(server.url("/keys"));
    assert!(fetcher.fetch().await.is_err());
}

#[tokio::test]
async fn malformed_document_is_an_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(200).body("not json");
    });

    let fetcher = JwksFetcher::new(server.url("/keys"));
    assert!(fetcher.fetch().await.is_err());
}
