use lotus_cloud::{ApiErrorClass, CloudClient, RecordFilter};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_blob_includes_bearer_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/blobs"))
        .and(query_param("key", "journal/2024-05-01"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "key": "journal/2024-05-01",
            "size": 12,
            "md5": "5d41402abc4b2a76b9719d911017c592",
            "modified": "2024-05-01T09:00:00Z"
        })))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let blob = client.get_blob("journal/2024-05-01").await.unwrap();

    assert_eq!(blob.size, Some(12));
    assert_eq!(
        blob.md5.as_deref(),
        Some("5d41402abc4b2a76b9719d911017c592")
    );
}

#[tokio::test]
async fn missing_blob_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/blobs"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such blob"))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_blob("journal/2024-05-02").await.unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn throttled_response_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/blobs/upload"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .get_upload_link("journal/2024-05-01", true)
        .await
        .unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert!(err.is_retryable());
    assert_eq!(err.retry_after_secs(), Some(7));
}

#[tokio::test]
async fn get_upload_link_sends_overwrite_flag() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/blobs/upload"))
        .and(query_param("key", "habits/log"))
        .and(query_param("overwrite", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://upload.example/habits-log",
            "method": "PUT",
            "templated": false
        })))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client.get_upload_link("habits/log", true).await.unwrap();

    assert_eq!(link.href.as_str(), "https://upload.example/habits-log");
    assert_eq!(link.method, "PUT");
}

#[tokio::test]
async fn get_download_link_returns_href() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/blobs/download"))
        .and(query_param("key", "journal/2024-05-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://download.example/journal-2024-05-01",
            "method": "GET"
        })))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client.get_download_link("journal/2024-05-01").await.unwrap();

    assert_eq!(
        link.href.as_str(),
        "https://download.example/journal-2024-05-01"
    );
    assert!(!link.templated);
}

#[tokio::test]
async fn list_records_applies_filter() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/records"))
        .and(query_param("identifier", "task-42"))
        .and(query_param("limit", "10"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_records": {
                "limit": 10,
                "offset": 0,
                "total": 1,
                "items": [
                    {
                        "record_name": "rec-a",
                        "identifier": "task-42",
                        "payload": "aW5r",
                        "created": "2024-05-01T08:00:00Z",
                        "modified": "2024-05-01T09:00:00Z"
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let filter = RecordFilter {
        identifier: Some("task-42".into()),
        updated_since: None,
    };
    let page = client.list_records(&filter, Some(10), Some(0)).await.unwrap();

    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].record_name, "rec-a");
    assert_eq!(page.items[0].payload, b"ink");
}

#[tokio::test]
async fn list_records_all_follows_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/records"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_records": {
                "limit": 1,
                "offset": 0,
                "total": 2,
                "items": [
                    {"record_name": "rec-a", "identifier": "a", "created": "2024-05-01T08:00:00Z", "modified": "2024-05-01T08:00:00Z"}
                ]
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/records"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_records": {
                "limit": 1,
                "offset": 1,
                "total": 2,
                "items": [
                    {"record_name": "rec-b", "identifier": null, "created": "2024-05-01T08:00:00Z", "modified": "2024-05-01T08:00:00Z"}
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let items = client
        .list_records_all(&RecordFilter::default(), 1)
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[1].record_name, "rec-b");
    assert!(items[1].identifier.is_none());
    assert!(items[1].payload.is_empty());
}

#[tokio::test]
async fn list_records_without_envelope_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let client = CloudClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .list_records(&RecordFilter::default(), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, lotus_cloud::CloudError::MissingItems));
}
