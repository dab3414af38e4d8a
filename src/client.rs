//! LiteLLM management API client.
//!
//! [`OrganizationApi`] is the seam the resources are written against; every
//! handler receives it explicitly. [`LiteLlmClient`] is the reqwest-backed
//! implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::membership::{AddMembersRequest, DeleteMemberRequest, UpdateMemberRequest};

pub(crate) const ENDPOINT_ORGANIZATION_NEW: &str = "/organization/new";
pub(crate) const ENDPOINT_ORGANIZATION_INFO: &str = "/organization/info";
pub(crate) const ENDPOINT_ORGANIZATION_UPDATE: &str = "/organization/update";
pub(crate) const ENDPOINT_ORGANIZATION_DELETE: &str = "/organization/delete";
pub(crate) const ENDPOINT_MEMBER_ADD: &str = "/organization/member_add";
pub(crate) const ENDPOINT_MEMBER_UPDATE: &str = "/organization/member_update";
pub(crate) const ENDPOINT_MEMBER_DELETE: &str = "/organization/member_delete";

const API_KEY_HEADER: &str = "x-api-key";

/// Body of `/organization/new` and `/organization/update`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrganizationRequest {
    /// Organization id; generated client-side on create.
    pub organization_id: String,
    /// Human readable name.
    pub organization_alias: String,
    /// Free-form string metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    /// Models members may use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    /// Spend limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<f64>,
    /// Budget reset period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_duration: Option<String>,
    /// Tokens per minute limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm_limit: Option<i64>,
    /// Requests per minute limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm_limit: Option<i64>,
    /// Whether the organization is blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
}

/// An organization as reported by `/organization/info`.
///
/// Every field is optional; callers fall back to configured values.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OrganizationInfo {
    /// Organization id.
    #[serde(default)]
    pub organization_id: Option<String>,
    /// Human readable name.
    #[serde(default)]
    pub organization_alias: Option<String>,
    /// Free-form string metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, Value>>,
    /// Models members may use.
    #[serde(default)]
    pub models: Option<Vec<String>>,
    /// Spend limit.
    #[serde(default)]
    pub max_budget: Option<f64>,
    /// Budget reset period.
    #[serde(default)]
    pub budget_duration: Option<String>,
    /// Tokens per minute limit.
    #[serde(default)]
    pub tpm_limit: Option<i64>,
    /// Requests per minute limit.
    #[serde(default)]
    pub rpm_limit: Option<i64>,
    /// Whether the organization is blocked.
    #[serde(default)]
    pub blocked: Option<bool>,
}

/// Operations the resources need from the LiteLLM API.
///
/// Responses of mutating calls are returned as opaque JSON for logging.
#[async_trait]
pub trait OrganizationApi: Send + Sync {
    /// `POST /organization/new`.
    async fn create_organization(&self, request: &OrganizationRequest) -> Result<Value, ProviderError>;

    /// `POST /organization/info`. `Ok(None)` when the organization does not exist.
    async fn organization_info(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationInfo>, ProviderError>;

    /// `POST /organization/update`.
    async fn update_organization(&self, request: &OrganizationRequest) -> Result<Value, ProviderError>;

    /// `DELETE /organization/delete`.
    async fn delete_organization(&self, organization_id: &str) -> Result<Value, ProviderError>;

    /// `POST /organization/member_add`.
    async fn add_members(&self, request: &AddMembersRequest) -> Result<Value, ProviderError>;

    /// `PATCH /organization/member_update`.
    async fn update_member(&self, request: &UpdateMemberRequest) -> Result<Value, ProviderError>;

    /// `DELETE /organization/member_delete`.
    async fn delete_member(&self, request: &DeleteMemberRequest) -> Result<Value, ProviderError>;
}

/// HTTP client for a LiteLLM proxy.
#[derive(Debug, Clone)]
pub struct LiteLlmClient {
    http: reqwest::Client,
    api_base: String,
}

impl LiteLlmClient {
    /// Build a client from provider configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let mut api_key = HeaderValue::from_str(&config.api_key).map_err(|_| {
            ProviderError::Configuration("api_key contains invalid header characters".to_string())
        })?;
        api_key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, api_key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|e| ProviderError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        if config.insecure_skip_verify {
            warn!(api_base = %config.api_base, "TLS certificate verification is disabled");
        }

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    /// The base URL requests are sent to.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_base, endpoint)
    }

    async fn send<B>(&self, method: Method, endpoint: &str, body: &B) -> Result<Response, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
    {
        debug!(method = %method, endpoint, "Sending LiteLLM request");
        self.http
            .request(method, self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)
    }

    async fn send_json<B>(&self, method: Method, endpoint: &str, body: &B) -> Result<Value, ProviderError>
    where
        B: Serialize + ?Sized + Sync,
    {
        let response = self.send(method, endpoint, body).await?;
        read_body(response).await
    }
}

#[async_trait]
impl OrganizationApi for LiteLlmClient {
    async fn create_organization(&self, request: &OrganizationRequest) -> Result<Value, ProviderError> {
        self.send_json(Method::POST, ENDPOINT_ORGANIZATION_NEW, request).await
    }

    async fn organization_info(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationInfo>, ProviderError> {
        let body = serde_json::json!({ "organizations": [organization_id] });
        let response = self.send(Method::POST, ENDPOINT_ORGANIZATION_INFO, &body).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let organizations = match read_body(response).await? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            single @ Value::Object(_) => vec![single],
            other => {
                return Err(ProviderError::InvalidRequest(format!(
                    "unexpected organization info response: {}",
                    other
                )))
            },
        };

        match organizations.into_iter().next() {
            Some(first) => Ok(Some(serde_json::from_value(first)?)),
            None => Ok(None),
        }
    }

    async fn update_organization(&self, request: &OrganizationRequest) -> Result<Value, ProviderError> {
        self.send_json(Method::POST, ENDPOINT_ORGANIZATION_UPDATE, request).await
    }

    async fn delete_organization(&self, organization_id: &str) -> Result<Value, ProviderError> {
        let body = serde_json::json!({ "organization_ids": [organization_id] });
        self.send_json(Method::DELETE, ENDPOINT_ORGANIZATION_DELETE, &body).await
    }

    async fn add_members(&self, request: &AddMembersRequest) -> Result<Value, ProviderError> {
        self.send_json(Method::POST, ENDPOINT_MEMBER_ADD, request).await
    }

    async fn update_member(&self, request: &UpdateMemberRequest) -> Result<Value, ProviderError> {
        self.send_json(Method::PATCH, ENDPOINT_MEMBER_UPDATE, request).await
    }

    async fn delete_member(&self, request: &DeleteMemberRequest) -> Result<Value, ProviderError> {
        self.send_json(Method::DELETE, ENDPOINT_MEMBER_DELETE, request).await
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::DeadlineExceeded(err.to_string())
    } else {
        ProviderError::Http(err)
    }
}

/// Read a response body, turning non-success statuses into errors.
///
/// An empty body is `null`; a body that is not JSON is returned as a string.
async fn read_body(response: Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let text = response.text().await.map_err(map_transport_error)?;

    if !status.is_success() {
        return Err(ProviderError::from_status(status.as_u16(), text));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
