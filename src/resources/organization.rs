//! `litellm_organization`: a budget and quota scoped group of users.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{OrganizationApi, OrganizationInfo, OrganizationRequest};
use crate::error::ProviderError;
use crate::schema::{Attribute, AttributeType, Schema};

/// Configured and observed state of an organization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Organization {
    /// Organization id, assigned on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
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
    /// Budget reset period, e.g. `30d`.
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

impl Organization {
    fn require_id(&self) -> Result<&str, ProviderError> {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::InvalidRequest("organization state has no id".to_string()))
    }

    fn request(&self, organization_id: &str) -> OrganizationRequest {
        OrganizationRequest {
            organization_id: organization_id.to_string(),
            organization_alias: self.organization_alias.clone(),
            metadata: self.metadata.clone(),
            models: self.models.clone(),
            max_budget: self.max_budget,
            budget_duration: self.budget_duration.clone(),
            tpm_limit: self.tpm_limit,
            rpm_limit: self.rpm_limit,
            blocked: self.blocked,
        }
    }

    /// Overlay fields reported by the API; anything the API omits keeps its configured value.
    fn merge(&self, info: OrganizationInfo) -> Self {
        Self {
            id: self.id.clone(),
            organization_alias: info
                .organization_alias
                .unwrap_or_else(|| self.organization_alias.clone()),
            metadata: info
                .metadata
                .map(stringify_metadata)
                .or_else(|| self.metadata.clone()),
            models: info.models.or_else(|| self.models.clone()),
            max_budget: info.max_budget.or(self.max_budget),
            budget_duration: info.budget_duration.or_else(|| self.budget_duration.clone()),
            tpm_limit: info.tpm_limit.or(self.tpm_limit),
            rpm_limit: info.rpm_limit.or(self.rpm_limit),
            blocked: info.blocked.or(self.blocked),
        }
    }
}

fn stringify_metadata(metadata: serde_json::Map<String, Value>) -> BTreeMap<String, String> {
    metadata
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => (key, s),
            other => (key, other.to_string()),
        })
        .collect()
}

/// Schema of `litellm_organization`.
pub fn schema() -> Schema {
    Schema::v0()
        .with_attribute("id", Attribute::computed_string())
        .with_attribute(
            "organization_alias",
            Attribute::required_string().with_description("Human readable organization name"),
        )
        .with_attribute(
            "metadata",
            Attribute::optional(AttributeType::map(AttributeType::String)),
        )
        .with_attribute(
            "models",
            Attribute::optional(AttributeType::list(AttributeType::String)),
        )
        .with_attribute("max_budget", Attribute::optional_float64())
        .with_attribute("budget_duration", Attribute::optional_string())
        .with_attribute("tpm_limit", Attribute::optional_int64())
        .with_attribute("rpm_limit", Attribute::optional_int64())
        .with_attribute("blocked", Attribute::optional_bool())
}

/// Create an organization under a freshly generated id, then read it back.
pub async fn create(
    api: &dyn OrganizationApi,
    planned: &Organization,
) -> Result<Organization, ProviderError> {
    let organization_id = Uuid::new_v4().to_string();
    let request = planned.request(&organization_id);
    debug!(payload = ?request, "Create organization request");

    api.create_organization(&request).await?;
    info!(organization_id = %organization_id, "Organization created");

    let created = Organization {
        id: Some(organization_id.clone()),
        ..planned.clone()
    };
    read(api, &created).await?.ok_or_else(|| {
        ProviderError::NotFound(format!("organization {} missing after create", organization_id))
    })
}

/// Refresh state from the API. `Ok(None)` means the organization is gone.
pub async fn read(
    api: &dyn OrganizationApi,
    current: &Organization,
) -> Result<Option<Organization>, ProviderError> {
    let organization_id = current.require_id()?;
    debug!(organization_id, "Reading organization");

    match api.organization_info(organization_id).await? {
        Some(info) => Ok(Some(current.merge(info))),
        None => {
            warn!(organization_id, "Organization not found, removing from state");
            Ok(None)
        },
    }
}

/// Push the planned settings, then read them back.
pub async fn update(
    api: &dyn OrganizationApi,
    prior: &Organization,
    planned: &Organization,
) -> Result<Organization, ProviderError> {
    let organization_id = prior.require_id()?.to_string();
    let request = planned.request(&organization_id);
    debug!(payload = ?request, "Update organization request");

    api.update_organization(&request).await?;
    info!(organization_id = %organization_id, "Organization updated");

    let updated = Organization {
        id: Some(organization_id.clone()),
        ..planned.clone()
    };
    read(api, &updated).await?.ok_or_else(|| {
        ProviderError::NotFound(format!("organization {} missing after update", organization_id))
    })
}

/// Delete the organization.
pub async fn delete(api: &dyn OrganizationApi, current: &Organization) -> Result<(), ProviderError> {
    let organization_id = current.require_id()?;
    api.delete_organization(organization_id).await?;
    info!(organization_id, "Organization deleted");
    Ok(())
}

/// Adopt an existing organization by id.
pub async fn import(api: &dyn OrganizationApi, organization_id: &str) -> Result<Organization, ProviderError> {
    let stub = Organization {
        id: Some(organization_id.to_string()),
        ..Default::default()
    };
    read(api, &stub)
        .await?
        .ok_or_else(|| ProviderError::NotFound(format!("organization {}", organization_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApiCall, RecordingApi};
    use crate::validation::validate;
    use serde_json::json;

    fn research() -> Organization {
        Organization {
            organization_alias: "research".into(),
            max_budget: Some(100.0),
            budget_duration: Some("30d".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_schema_accepts_config() {
        let config = json!({
            "organization_alias": "research",
            "metadata": {"team": "ml"},
            "models": ["gpt-4o"],
            "max_budget": 100.0,
            "tpm_limit": 1000,
            "blocked": false
        });
        assert!(validate(&schema(), &config).is_empty());
        assert_eq!(validate(&schema(), &json!({"max_budget": 1})).len(), 1);
    }

    #[tokio::test]
    async fn test_create_generates_id_and_reads_back() {
        let api = RecordingApi::new();

        let created = create(&api, &research()).await.unwrap();
        let id = created.id.clone().unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(created.organization_alias, "research");
        assert_eq!(created.max_budget, Some(100.0));

        let calls = api.calls();
        assert!(matches!(&calls[0], ApiCall::CreateOrganization(r) if r.organization_id == id));
        assert!(matches!(&calls[1], ApiCall::OrganizationInfo(i) if *i == id));
    }

    #[tokio::test]
    async fn test_read_prefers_api_values() {
        let api = RecordingApi::new();
        let created = create(&api, &research()).await.unwrap();
        api.set_organization_info(
            created.id.as_deref().unwrap(),
            OrganizationInfo {
                organization_alias: Some("renamed".into()),
                metadata: Some(
                    json!({"team": "ml", "tier": 2})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                ),
                ..Default::default()
            },
        );

        let refreshed = read(&api, &created).await.unwrap().unwrap();
        assert_eq!(refreshed.organization_alias, "renamed");
        assert_eq!(refreshed.max_budget, Some(100.0));
        let metadata = refreshed.metadata.unwrap();
        assert_eq!(metadata["team"], "ml");
        assert_eq!(metadata["tier"], "2");
    }

    #[tokio::test]
    async fn test_read_missing_organization() {
        let api = RecordingApi::new();
        let stale = Organization {
            id: Some("gone".into()),
            ..research()
        };
        assert!(read(&api, &stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_requires_id() {
        let api = RecordingApi::new();
        let err = read(&api, &research()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_update_keeps_id() {
        let api = RecordingApi::new();
        let created = create(&api, &research()).await.unwrap();
        let planned = Organization {
            rpm_limit: Some(60),
            ..research()
        };

        let updated = update(&api, &created, &planned).await.unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.rpm_limit, Some(60));
        assert!(api
            .calls()
            .iter()
            .any(|c| matches!(c, ApiCall::UpdateOrganization(r) if r.rpm_limit == Some(60))));
    }

    #[tokio::test]
    async fn test_delete_and_import() {
        let api = RecordingApi::new();
        let created = create(&api, &research()).await.unwrap();
        let id = created.id.clone().unwrap();

        let imported = import(&api, &id).await.unwrap();
        assert_eq!(imported.organization_alias, "research");

        delete(&api, &created).await.unwrap();
        assert!(matches!(api.calls().last(), Some(ApiCall::DeleteOrganization(i)) if *i == id));
        assert!(import(&api, &id).await.unwrap_err().is_not_found());
    }
}
