//! REST client for the entity read endpoints.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use strata_cache::{
    EntityTypesResponse, ListQuery, ListResponse, RemoteSource, SyncPage, SyncQuery,
};
use strata_core::{EntityInstance, EntityLink, RemoteError, StrataError, StrataResult};
use tracing::debug;

use crate::config::{AuthConfig, ClientConfig};

pub const ENTITY_TYPES_PATH: &str = "/api/v1/entity-types";
pub const ENTITY_INSTANCES_PATH: &str = "/api/v1/entity-instances";
pub const ENTITY_LINKS_PATH: &str = "/api/v1/entity-links";

#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    #[error("HTTP error calling {endpoint}: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {message}")]
    Status {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("Unexpected response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Config error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ApiClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl From<ApiClientError> for StrataError {
    fn from(err: ApiClientError) -> Self {
        match err {
            ApiClientError::Http { endpoint, source } => match source.status() {
                Some(status) => RemoteError::RequestFailed {
                    endpoint,
                    status: status.as_u16(),
                    message: source.to_string(),
                },
                None => RemoteError::Transport {
                    endpoint,
                    reason: source.to_string(),
                },
            }
            .into(),
            ApiClientError::Status {
                endpoint,
                status,
                message,
            } => RemoteError::RequestFailed {
                endpoint,
                status,
                message,
            }
            .into(),
            ApiClientError::InvalidResponse { endpoint, reason } => {
                RemoteError::InvalidResponse { endpoint, reason }.into()
            }
            ApiClientError::WebSocket(e) => RemoteError::Transport {
                endpoint: "push-channel".to_string(),
                reason: e.to_string(),
            }
            .into(),
            ApiClientError::Config(reason) => strata_core::ConfigError::InvalidValue {
                field: "api".to_string(),
                value: String::new(),
                reason,
            }
            .into(),
        }
    }
}

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

#[derive(Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiClientError::Config(e.to_string()))?;

        let auth_header = build_auth_headers(&config.auth)?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(path, params = query.len(), "GET");
        let response = self
            .client
            .get(url)
            .headers(self.auth_header.clone())
            .query(query)
            .send()
            .await
            .map_err(|source| ApiClientError::Http {
                endpoint: path.to_string(),
                source,
            })?;
        parse_response(path, response).await
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(
    path: &str,
    response: reqwest::Response,
) -> Result<T, ApiClientError> {
    let status = response.status();
    let text = response.text().await.map_err(|source| ApiClientError::Http {
        endpoint: path.to_string(),
        source,
    })?;
    if status.is_success() {
        return serde_json::from_str(&text).map_err(|e| ApiClientError::InvalidResponse {
            endpoint: path.to_string(),
            reason: e.to_string(),
        });
    }
    Err(status_error(path, status.as_u16(), &text))
}

fn status_error(path: &str, status: u16, body: &str) -> ApiClientError {
    let message = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(api_error) => format!("{}: {}", api_error.code, api_error.message),
        Err(_) => body.to_string(),
    };
    ApiClientError::Status {
        endpoint: path.to_string(),
        status,
        message,
    }
}

/// Query parameters of a sync page request.
pub fn sync_params(query: &SyncQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("limit", query.limit.to_string()),
        ("offset", query.offset.to_string()),
    ];
    if let Some(since) = query.since {
        params.push(("since", since.to_rfc3339()));
    }
    params
}

/// Query parameters of a list request.
pub fn list_params(query: &ListQuery) -> Vec<(&'static str, String)> {
    let mut params = Vec::with_capacity(4);
    if let Some(parent) = query.parent() {
        params.push(("parent_code", parent.entity_code));
        params.push(("parent_id", parent.entity_id));
    }
    params.push(("limit", query.limit.to_string()));
    params.push(("offset", query.offset.to_string()));
    params
}

/// Path of the per-type list endpoint.
pub fn list_path(entity_code: &str) -> Result<String, ApiClientError> {
    let valid = !entity_code.is_empty()
        && entity_code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(ApiClientError::Config(format!(
            "invalid entity code {:?}",
            entity_code
        )));
    }
    Ok(format!("/api/v1/{}", entity_code))
}

#[async_trait]
impl RemoteSource for RestClient {
    async fn fetch_entity_types(&self) -> StrataResult<EntityTypesResponse> {
        Ok(self.get_json(ENTITY_TYPES_PATH, &[]).await?)
    }

    async fn fetch_entity_instances(
        &self,
        query: SyncQuery,
    ) -> StrataResult<SyncPage<EntityInstance>> {
        Ok(self
            .get_json(ENTITY_INSTANCES_PATH, &sync_params(&query))
            .await?)
    }

    async fn fetch_entity_links(&self, query: SyncQuery) -> StrataResult<SyncPage<EntityLink>> {
        Ok(self.get_json(ENTITY_LINKS_PATH, &sync_params(&query)).await?)
    }

    async fn list_entities(
        &self,
        entity_code: &str,
        query: &ListQuery,
    ) -> StrataResult<ListResponse> {
        let path = list_path(entity_code)?;
        Ok(self.get_json(&path, &list_params(query)).await?)
    }
}

pub fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ApiClientError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| ApiClientError::Config(e.to_string()))?,
        );
    }
    if let Some(jwt) = &auth.jwt {
        let value = format!("Bearer {}", jwt);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value).map_err(|e| ApiClientError::Config(e.to_string()))?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use strata_core::EntityRef;

    #[test]
    fn test_sync_params_include_since_only_for_delta() {
        let full = SyncQuery {
            since: None,
            limit: 500,
            offset: 0,
        };
        assert_eq!(
            sync_params(&full),
            vec![("limit", "500".to_string()), ("offset", "0".to_string())]
        );

        let since = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let delta = SyncQuery {
            since: Some(since),
            ..full
        };
        let params = sync_params(&delta);
        assert_eq!(params[2], ("since", "2026-03-01T09:00:00+00:00".to_string()));
    }

    #[test]
    fn test_list_params_with_parent() {
        let query = ListQuery::under(&EntityRef::new("project", "P1"), 25, 50);
        assert_eq!(
            list_params(&query),
            vec![
                ("parent_code", "project".to_string()),
                ("parent_id", "P1".to_string()),
                ("limit", "25".to_string()),
                ("offset", "50".to_string()),
            ]
        );
        assert_eq!(list_params(&ListQuery::new(10, 0)).len(), 2);
    }

    #[test]
    fn test_list_path_rejects_unsafe_codes() {
        assert_eq!(list_path("task").unwrap(), "/api/v1/task");
        assert!(list_path("").is_err());
        assert!(list_path("../admin").is_err());
        assert!(list_path("task?x=1").is_err());
    }

    #[test]
    fn test_auth_headers() {
        let headers = build_auth_headers(&AuthConfig {
            api_key: Some("key-123".to_string()),
            jwt: Some("token".to_string()),
        })
        .expect("headers should build");
        assert_eq!(headers["x-api-key"], "key-123");
        assert_eq!(headers["authorization"], "Bearer token");

        let invalid = build_auth_headers(&AuthConfig {
            api_key: Some("bad\nkey".to_string()),
            jwt: None,
        });
        assert!(matches!(invalid, Err(ApiClientError::Config(_))));
    }

    #[test]
    fn test_status_error_uses_api_error_body() {
        let err = status_error(
            ENTITY_LINKS_PATH,
            503,
            r#"{"code":"UNAVAILABLE","message":"try later"}"#,
        );
        let strata: StrataError = err.into();
        assert!(strata.is_transient());
        match strata {
            StrataError::Remote(RemoteError::RequestFailed {
                status, message, ..
            }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "UNAVAILABLE: try later");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_invalid_response_is_not_transient() {
        let strata: StrataError = ApiClientError::InvalidResponse {
            endpoint: ENTITY_TYPES_PATH.to_string(),
            reason: "missing field `data`".to_string(),
        }
        .into();
        assert!(!strata.is_transient());
    }
}
