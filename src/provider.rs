//! The provider service.
//!
//! [`ProviderService`] is the host-facing surface: schema, configuration,
//! validation, plan, and CRUD over JSON state. [`LiteLlmProvider`] implements
//! it by decoding state into the typed models in [`crate::resources`] and
//! dispatching on the resource type name.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{LiteLlmClient, OrganizationApi};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::resources::{
    self, organization, organization_member, organization_member_add, ORGANIZATION,
    ORGANIZATION_MEMBER, ORGANIZATION_MEMBER_ADD,
};
use crate::schema::{Attribute, Diagnostic, ProviderSchema, Schema};
use crate::types::{diff_attributes, ImportedResource, PlanResult, ProviderMetadata};
use crate::validation::validate;

/// Operations a host drives a provider through.
///
/// State crosses this boundary as JSON objects shaped by the resource
/// schemas. Destroy is planned by passing `Value::Null` as the proposed state.
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Schemas for the provider configuration and every resource.
    fn schema(&self) -> ProviderSchema;

    /// Resource type names, derived from the schema by default.
    fn metadata(&self) -> ProviderMetadata {
        let mut resources: Vec<String> = self.schema().resources.into_keys().collect();
        resources.sort();
        ProviderMetadata { resources }
    }

    /// Check provider configuration without applying it.
    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = config;
        Ok(vec![])
    }

    /// Apply provider configuration. Error diagnostics leave the provider unconfigured.
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError>;

    /// Release resources held by the provider.
    async fn stop(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Check a resource configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Migrate state written under an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Compute the changes needed to move from `prior_state` to `proposed_state`.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        config: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a resource and return its new state.
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError>;

    /// Refresh a resource. `Value::Null` means it no longer exists.
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError>;

    /// Update a resource in place and return its new state.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError>;

    /// Adopt an existing object by id.
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let _ = id;
        Err(ProviderError::Unimplemented(format!(
            "import is not supported for {}",
            resource_type
        )))
    }
}

/// LiteLLM organization and membership provider.
///
/// Holds the API handle installed by [`ProviderService::configure`], or one
/// injected up front with [`LiteLlmProvider::with_api`].
#[derive(Default)]
pub struct LiteLlmProvider {
    api: RwLock<Option<Arc<dyn OrganizationApi>>>,
}

impl LiteLlmProvider {
    /// Create an unconfigured provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider bound to an existing API implementation.
    pub fn with_api(api: Arc<dyn OrganizationApi>) -> Self {
        Self {
            api: RwLock::new(Some(api)),
        }
    }

    async fn api(&self) -> Result<Arc<dyn OrganizationApi>, ProviderError> {
        self.api.read().await.clone().ok_or_else(|| {
            ProviderError::FailedPrecondition("provider has not been configured".to_string())
        })
    }

    fn resource_schema(resource_type: &str) -> Result<Schema, ProviderError> {
        match resource_type {
            ORGANIZATION => Ok(organization::schema()),
            ORGANIZATION_MEMBER => Ok(organization_member::schema()),
            ORGANIZATION_MEMBER_ADD => Ok(organization_member_add::schema()),
            other => Err(unknown(other)),
        }
    }
}

/// Schema of the provider configuration block.
pub fn provider_config_schema() -> Schema {
    Schema::v0()
        .with_attribute(
            "api_base",
            Attribute::optional_string().with_description("Base URL of the LiteLLM proxy"),
        )
        .with_attribute(
            "api_key",
            Attribute::optional_string()
                .sensitive()
                .with_description("Master or admin key"),
        )
        .with_attribute("insecure_skip_verify", Attribute::optional_bool())
        .with_attribute("timeout_secs", Attribute::optional_int64())
}

fn unknown(resource_type: &str) -> ProviderError {
    ProviderError::UnknownResource(resource_type.to_string())
}

fn decode<T: DeserializeOwned>(state: Value) -> Result<T, ProviderError> {
    Ok(serde_json::from_value(state)?)
}

fn encode<T: Serialize>(model: &T) -> Result<Value, ProviderError> {
    Ok(serde_json::to_value(model)?)
}

fn config_diagnostics(config: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = validate(&provider_config_schema(), config);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return diagnostics;
    }
    if let Err(e) = ProviderConfig::from_value(config) {
        diagnostics.push(Diagnostic::error("Invalid provider configuration").with_detail(e.message()));
    }
    diagnostics
}

/// Membership arrays compare as sets; element order is not a change.
fn same_membership(prior: &Value, proposed: &Value) -> bool {
    match (
        decode::<organization_member_add::OrganizationMemberAdd>(prior.clone()),
        decode::<organization_member_add::OrganizationMemberAdd>(proposed.clone()),
    ) {
        (Ok(prior), Ok(proposed)) => prior.membership() == proposed.membership(),
        _ => false,
    }
}

#[async_trait::async_trait]
impl ProviderService for LiteLlmProvider {
    fn schema(&self) -> ProviderSchema {
        resources::all().into_iter().fold(
            ProviderSchema::new().with_provider_config(provider_config_schema()),
            |schema, (name, resource)| schema.with_resource(name, resource),
        )
    }

    #[instrument(skip(self, config))]
    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = config_diagnostics(&config);
        debug!(diagnostics = diagnostics.len(), "Provider config validated");
        Ok(diagnostics)
    }

    #[instrument(skip(self, config))]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = config_diagnostics(&config);
        if diagnostics.iter().any(Diagnostic::is_error) {
            warn!(diagnostics = diagnostics.len(), "Configure completed with errors");
            return Ok(diagnostics);
        }

        let config = ProviderConfig::from_value(&config)?;
        let client = LiteLlmClient::new(&config)?;
        info!(api_base = %client.api_base(), "Provider configured");
        *self.api.write().await = Some(Arc::new(client));
        Ok(diagnostics)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.api.write().await.take();
        info!("Provider stopped");
        Ok(())
    }

    #[instrument(skip(self, config))]
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let diagnostics = match resource_type {
            ORGANIZATION_MEMBER => organization_member::validate_config(&config),
            ORGANIZATION_MEMBER_ADD => organization_member_add::validate_config(&config),
            other => validate(&Self::resource_schema(other)?, &config),
        };
        if diagnostics.iter().any(Diagnostic::is_error) {
            warn!(diagnostics = diagnostics.len(), "Resource config has errors");
        }
        Ok(diagnostics)
    }

    #[instrument(skip(self, state))]
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        let schema = Self::resource_schema(resource_type)?;
        if version > schema.version {
            return Err(ProviderError::FailedPrecondition(format!(
                "state version {} is newer than schema version {}",
                version, schema.version
            )));
        }
        Ok(state)
    }

    #[instrument(skip(self, prior_state, proposed_state, _config))]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let schema = Self::resource_schema(resource_type)?;

        let Some(prior) = prior_state.filter(|v| !v.is_null()) else {
            if proposed_state.is_null() {
                return Ok(PlanResult::no_change(Value::Null));
            }
            let changes = diff_attributes(&Value::Null, &proposed_state, &["id"]);
            debug!(changes = changes.len(), "Planned create");
            return Ok(PlanResult::with_changes(proposed_state, changes, false));
        };

        if proposed_state.is_null() {
            let changes = diff_attributes(&prior, &Value::Null, &[]);
            debug!(changes = changes.len(), "Planned destroy");
            return Ok(PlanResult::with_changes(Value::Null, changes, false));
        }

        let mut changes = diff_attributes(&prior, &proposed_state, &["id"]);
        if resource_type == ORGANIZATION_MEMBER_ADD && same_membership(&prior, &proposed_state) {
            changes.retain(|c| c.path != "member");
        }
        if changes.is_empty() {
            return Ok(PlanResult::no_change(prior));
        }

        let force_new = schema.force_new_attributes();
        let requires_replace = changes.iter().any(|c| force_new.contains(&c.path.as_str()));

        let mut planned = proposed_state;
        if !requires_replace {
            if let (Some(map), Some(id)) = (planned.as_object_mut(), prior.get("id")) {
                map.insert("id".to_string(), id.clone());
            }
        }

        debug!(changes = changes.len(), requires_replace, "Planned update");
        Ok(PlanResult::with_changes(planned, changes, requires_replace))
    }

    #[instrument(skip(self, planned_state))]
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        let api = self.api().await?;
        let api = api.as_ref();
        let result = match resource_type {
            ORGANIZATION => encode(&organization::create(api, &decode(planned_state)?).await?),
            ORGANIZATION_MEMBER => {
                encode(&organization_member::create(api, &decode(planned_state)?).await?)
            },
            ORGANIZATION_MEMBER_ADD => {
                encode(&organization_member_add::create(api, &decode(planned_state)?).await?)
            },
            other => Err(unknown(other)),
        };
        if let Err(e) = &result {
            error!(error = %e, "Create failed");
        }
        result
    }

    #[instrument(skip(self, current_state))]
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value, ProviderError> {
        match resource_type {
            ORGANIZATION => {
                let api = self.api().await?;
                match organization::read(api.as_ref(), &decode(current_state)?).await? {
                    Some(refreshed) => encode(&refreshed),
                    None => Ok(Value::Null),
                }
            },
            ORGANIZATION_MEMBER => encode(&organization_member::read(&decode(current_state)?)?),
            ORGANIZATION_MEMBER_ADD => {
                encode(&organization_member_add::read(&decode(current_state)?))
            },
            other => Err(unknown(other)),
        }
    }

    #[instrument(skip(self, prior_state, planned_state))]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let api = self.api().await?;
        let api = api.as_ref();
        let result = match resource_type {
            ORGANIZATION => encode(
                &organization::update(api, &decode(prior_state)?, &decode(planned_state)?).await?,
            ),
            ORGANIZATION_MEMBER => {
                encode(&organization_member::update(api, &decode(planned_state)?).await?)
            },
            ORGANIZATION_MEMBER_ADD => encode(
                &organization_member_add::update(api, &decode(prior_state)?, &decode(planned_state)?)
                    .await?,
            ),
            other => Err(unknown(other)),
        };
        if let Err(e) = &result {
            error!(error = %e, "Update failed");
        }
        result
    }

    #[instrument(skip(self, current_state))]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let api = self.api().await?;
        let api = api.as_ref();
        let result = match resource_type {
            ORGANIZATION => organization::delete(api, &decode(current_state)?).await,
            ORGANIZATION_MEMBER => organization_member::delete(api, &decode(current_state)?).await,
            ORGANIZATION_MEMBER_ADD => {
                organization_member_add::delete(api, &decode(current_state)?).await
            },
            other => Err(unknown(other)),
        };
        if let Err(e) = &result {
            error!(error = %e, "Delete failed");
        }
        result
    }

    #[instrument(skip(self))]
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        match resource_type {
            ORGANIZATION => {
                let api = self.api().await?;
                let imported = organization::import(api.as_ref(), id).await?;
                info!(id, "Organization imported");
                Ok(vec![ImportedResource::new(ORGANIZATION, encode(&imported)?)])
            },
            ORGANIZATION_MEMBER | ORGANIZATION_MEMBER_ADD => Err(ProviderError::Unimplemented(
                format!("import is not supported for {}", resource_type),
            )),
            other => Err(unknown(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        assert_error_contains, assert_plan_changes_attribute, assert_plan_creates,
        assert_plan_no_changes, assert_plan_replaces, assert_plan_updates_in_place, ApiCall,
        ProviderTester, RecordingApi,
    };
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tester(api: &RecordingApi) -> ProviderTester<LiteLlmProvider> {
        ProviderTester::new(LiteLlmProvider::with_api(Arc::new(api.clone())))
    }

    #[test]
    fn test_metadata_lists_resources() {
        let provider = LiteLlmProvider::new();
        assert_eq!(
            provider.metadata().resources,
            vec![ORGANIZATION, ORGANIZATION_MEMBER, ORGANIZATION_MEMBER_ADD]
        );
        let schema = provider.schema();
        assert!(schema.provider.block.attributes["api_key"].flags.sensitive);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_rejects_crud() {
        let tester = ProviderTester::new(LiteLlmProvider::new());
        let err = tester
            .create(ORGANIZATION, json!({"organization_alias": "research"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let api = RecordingApi::new();
        let tester = tester(&api);
        let err = tester.create("litellm_team", json!({})).await.unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(ref t) if t == "litellm_team"));
        assert!(tester.plan_create("litellm_team", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_configure_reports_missing_settings() {
        let provider = LiteLlmProvider::new();
        let diagnostics = provider
            .validate_provider_config(json!({"api_base": "localhost:4000", "api_key": "sk"}))
            .await
            .unwrap();
        assert_error_contains(&diagnostics, "Invalid provider configuration");

        let diagnostics = provider
            .configure(json!({"api_base": 4000}))
            .await
            .unwrap();
        assert!(diagnostics.iter().any(Diagnostic::is_error));
    }

    #[tokio::test]
    async fn test_configure_talks_to_proxy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/organization/member_add"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let tester = ProviderTester::new(LiteLlmProvider::new());
        tester
            .configure(json!({"api_base": server.uri(), "api_key": "sk-test"}))
            .await
            .unwrap();

        let state = tester
            .create(
                ORGANIZATION_MEMBER,
                json!({"organization_id": "org-1", "user_id": "u1", "role": "org_admin"}),
            )
            .await
            .unwrap();
        assert_eq!(state["id"], "org-1:u1");

        tester.stop().await.unwrap();
        assert!(tester.read(ORGANIZATION, json!({"id": "org-1"})).await.is_err());
    }

    #[tokio::test]
    async fn test_organization_lifecycle() {
        let api = RecordingApi::new();
        let tester = tester(&api);

        let state = tester
            .lifecycle_crud(
                ORGANIZATION,
                json!({"organization_alias": "research", "max_budget": 100.0}),
                json!({"organization_alias": "research", "max_budget": 250.0}),
            )
            .await
            .unwrap();
        assert_eq!(state["max_budget"], 250.0);
        assert!(matches!(api.calls().last(), Some(ApiCall::DeleteOrganization(_))));
    }

    #[tokio::test]
    async fn test_read_vanished_organization_is_null() {
        let api = RecordingApi::new();
        let state = tester(&api)
            .read(ORGANIZATION, json!({"id": "gone", "organization_alias": "x"}))
            .await
            .unwrap();
        assert!(state.is_null());
    }

    #[tokio::test]
    async fn test_plan_member_role_change_in_place() {
        let api = RecordingApi::new();
        let prior = json!({
            "id": "org-1:u1", "organization_id": "org-1", "user_id": "u1", "role": "internal_user"
        });
        let proposed = json!({"organization_id": "org-1", "user_id": "u1", "role": "org_admin"});

        let plan = tester(&api)
            .plan_update(ORGANIZATION_MEMBER, prior, proposed)
            .await
            .unwrap();
        assert_plan_updates_in_place(&plan);
        assert_plan_changes_attribute(&plan, "role");
        assert_eq!(plan.planned_state["id"], "org-1:u1");
    }

    #[tokio::test]
    async fn test_plan_member_user_change_replaces() {
        let api = RecordingApi::new();
        let prior = json!({
            "id": "org-1:u1", "organization_id": "org-1", "user_id": "u1", "role": "internal_user"
        });
        let proposed = json!({"organization_id": "org-1", "user_id": "u2", "role": "internal_user"});

        let plan = tester(&api)
            .plan_update(ORGANIZATION_MEMBER, prior, proposed)
            .await
            .unwrap();
        assert_plan_replaces(&plan);
        assert!(plan.planned_state.get("id").is_none());
    }

    #[tokio::test]
    async fn test_plan_member_add_ignores_order() {
        let api = RecordingApi::new();
        let prior = json!({
            "id": "org-1",
            "organization_id": "org-1",
            "member": [
                {"user_id": "u1", "role": "internal_user"},
                {"user_id": "u2", "role": "org_admin"}
            ]
        });
        let proposed = json!({
            "organization_id": "org-1",
            "member": [
                {"user_id": "u2", "role": "org_admin"},
                {"user_id": "u1", "role": "internal_user"}
            ]
        });

        let plan = tester(&api)
            .plan_update(ORGANIZATION_MEMBER_ADD, prior, proposed)
            .await
            .unwrap();
        assert_plan_no_changes(&plan);
    }

    #[tokio::test]
    async fn test_member_add_lifecycle() {
        let api = RecordingApi::new();
        let tester = tester(&api);

        let created = tester
            .lifecycle_create(
                ORGANIZATION_MEMBER_ADD,
                json!({
                    "organization_id": "org-1",
                    "member": [
                        {"user_id": "u1", "role": "internal_user"},
                        {"user_email": "b@example.com", "role": "internal_user"}
                    ]
                }),
            )
            .await
            .unwrap();
        assert_eq!(created["id"], "org-1");

        let updated = tester
            .lifecycle_update(
                ORGANIZATION_MEMBER_ADD,
                created,
                json!({
                    "organization_id": "org-1",
                    "member": [{"user_id": "u1", "role": "org_admin"}]
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated["member"].as_array().map(Vec::len), Some(1));

        let calls = api.calls();
        assert!(matches!(&calls[0], ApiCall::AddMembers(r) if r.member.len() == 2));
        assert!(
            matches!(&calls[1], ApiCall::DeleteMember(r) if r.user_email.as_deref() == Some("b@example.com"))
        );
        assert!(matches!(&calls[2], ApiCall::UpdateMember(r) if r.user_id.as_deref() == Some("u1")));
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn test_plan_create() {
        let api = RecordingApi::new();
        let plan = tester(&api)
            .plan_create(ORGANIZATION, json!({"organization_alias": "research"}))
            .await
            .unwrap();
        assert_plan_creates(&plan);
        assert_plan_changes_attribute(&plan, "organization_alias");
    }

    #[tokio::test]
    async fn test_validate_member_add_config() {
        let api = RecordingApi::new();
        let err = tester(&api)
            .validate_resource_config(
                ORGANIZATION_MEMBER_ADD,
                json!({"organization_id": "org-1", "member": [{"role": "org_admin"}]}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no identity"));
    }

    #[tokio::test]
    async fn test_member_with_empty_user_id_is_rejected() {
        let api = RecordingApi::new();
        let tester = tester(&api);
        let config = json!({"organization_id": "org-1", "user_id": "", "role": "org_admin"});

        let err = tester
            .validate_resource_config(ORGANIZATION_MEMBER, config.clone())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user_id"));

        let err = tester.create(ORGANIZATION_MEMBER, config).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_import() {
        let api = RecordingApi::new();
        let tester = tester(&api);
        let created = tester
            .create(ORGANIZATION, json!({"organization_alias": "research"}))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let imported = tester.import_resource(ORGANIZATION, &id).await.unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].state["organization_alias"], "research");

        let err = tester
            .import_resource(ORGANIZATION_MEMBER, "org-1:u1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unimplemented(_)));
    }

    #[tokio::test]
    async fn test_upgrade_rejects_future_version() {
        let api = RecordingApi::new();
        let tester = tester(&api);
        let state = json!({"organization_id": "org-1", "member": []});
        assert_eq!(
            tester
                .upgrade_resource_state(ORGANIZATION_MEMBER_ADD, 0, state.clone())
                .await
                .unwrap(),
            state
        );
        assert!(tester
            .upgrade_resource_state(ORGANIZATION_MEMBER_ADD, 3, state)
            .await
            .is_err());
    }
}
