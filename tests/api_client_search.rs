use std::sync::Arc;
use std::time::Duration;

use crawl_worker::api_client::ApiClient;
use crawl_worker::auth::{Authenticator, UnavailableBrowserCapture};
use crawl_worker::models::ItemStatus;
use httpmock::prelude::*;

fn stub_authenticator() -> Arc<Authenticator> {
    Arc::new(Authenticator::new(Box::new(UnavailableBrowserCapture), 30))
}

#[tokio::test]
async fn search_parses_items_and_drops_empty_ids() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v2/entities:search");
        then.status(200).json_body(serde_json::json!({
            "items": [
                {"id": "a1", "name": "Figure", "price": 3000, "thumbnail": "a1.jpg"},
                {"id": "", "name": "dropped", "price": 1},
            ],
            "meta": {"numFound": 2}
        }));
    });

    let authenticator = stub_authenticator();
    let client = ApiClient::with_search_url(authenticator, server.url("/v2/entities:search"));

    let result = client.search("hololive", ItemStatus::OnSale, None).await.unwrap();
    mock.assert();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].source_id, "a1");
    assert_eq!(result.items[0].price, 3000);
    assert_eq!(result.items[0].image_url, "a1.jpg");
}

#[tokio::test]
async fn rate_limited_response_is_classified_and_reported_to_authenticator() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST);
        then.status(429);
    });

    let authenticator = stub_authenticator();
    let client = ApiClient::with_search_url(authenticator.clone(), server.url("/v2/entities:search"));

    let err = client.search("k", ItemStatus::OnSale, None).await.unwrap_err();
    assert!(matches!(err, crawl_worker::error::ApiError::RateLimited));
    assert_eq!(authenticator.snapshot().await.consecutive_failures, 1);
}

#[tokio::test]
async fn search_all_pages_follows_next_page_token_then_stops() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).matches(|req| {
            !req.body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).contains("\"pageToken\":\"p2\""))
                .unwrap_or(false)
        });
        then.status(200).json_body(serde_json::json!({
            "items": [{"id": "page1-item", "name": "x", "price": 1}],
            "meta": {"nextPageToken": "p2", "numFound": 2}
        }));
    });
    server.mock(|when, then| {
        when.method(POST).matches(|req| {
            req.body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).contains("\"pageToken\":\"p2\""))
                .unwrap_or(false)
        });
        then.status(200).json_body(serde_json::json!({
            "items": [{"id": "page2-item", "name": "y", "price": 2}],
            "meta": {"numFound": 2}
        }));
    });

    let authenticator = stub_authenticator();
    let client = ApiClient::with_search_url(authenticator, server.url("/v2/entities:search"));

    let (items, pages) = client
        .search_all_pages("k", ItemStatus::OnSale, 5, Duration::from_millis(1))
        .await
        .unwrap();

    assert_eq!(pages, 2);
    assert_eq!(items.len(), 2);
}
