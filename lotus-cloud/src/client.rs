use std::time::SystemTime;

use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("api response missing record items")]
    MissingItems,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Server-side filter for record listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub identifier: Option<String>,
    /// RFC 3339 timestamp; only records updated at or after it are listed.
    pub updated_since: Option<String>,
}

#[derive(Clone)]
pub struct CloudClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl CloudClient {
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, CloudError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn get_blob(&self, key: &str) -> Result<BlobInfo, CloudError> {
        let mut url = self.endpoint("/v1/blobs")?;
        url.query_pairs_mut().append_pair("key", key);
        self.get_json(url).await
    }

    pub async fn get_download_link(&self, key: &str) -> Result<TransferLink, CloudError> {
        let mut url = self.endpoint("/v1/blobs/download")?;
        url.query_pairs_mut().append_pair("key", key);
        self.get_json(url).await
    }

    pub async fn get_upload_link(
        &self,
        key: &str,
        overwrite: bool,
    ) -> Result<TransferLink, CloudError> {
        let mut url = self.endpoint("/v1/blobs/upload")?;
        url.query_pairs_mut()
            .append_pair("key", key)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        self.get_json(url).await
    }

    pub async fn list_records(
        &self,
        filter: &RecordFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<RecordPage, CloudError> {
        let mut url = self.endpoint("/v1/records")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(identifier) = &filter.identifier {
                query.append_pair("identifier", identifier);
            }
            if let Some(since) = &filter.updated_since {
                query.append_pair("updated_since", since);
            }
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        let payload: RecordPageResponse = self.get_json(url).await?;
        payload.records.ok_or(CloudError::MissingItems)
    }

    pub async fn list_records_all(
        &self,
        filter: &RecordFilter,
        page_size: u32,
    ) -> Result<Vec<RecordEntry>, CloudError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_records(filter, Some(page_size), Some(offset))
                .await?;
            let fetched = page.items.len() as u32;
            offset = offset.saturating_add(fetched);
            let total = page.total;
            items.extend(page.items);
            if offset >= total || fetched == 0 {
                break;
            }
        }
        Ok(items)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, CloudError> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, CloudError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            Err(CloudError::Api {
                status,
                body,
                retry_after,
            })
        }
    }
}

impl CloudError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            CloudError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    /// Network failures and throttling/5xx responses are worth another try.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Request(err) => !err.is_builder() && !err.is_decode(),
            CloudError::Api { .. } => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
            CloudError::Url(_) | CloudError::MissingItems => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            CloudError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .map(|d| d.as_secs())
            .unwrap_or(0),
    )
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BlobInfo {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RecordEntry {
    pub record_name: String,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default, with = "base64_payload")]
    pub payload: Vec<u8>,
    pub created: String,
    pub modified: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RecordPage {
    pub items: Vec<RecordEntry>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize, Serialize)]
struct RecordPageResponse {
    #[serde(rename = "_records")]
    records: Option<RecordPage>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
    #[serde(default)]
    pub templated: bool,
}

mod base64_payload {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
