//! Test support.
//!
//! [`RecordingApi`] is an in-memory [`OrganizationApi`] that records every
//! call and can be told to fail specific operations. [`ProviderTester`]
//! drives a [`ProviderService`] through the same sequences a host would.
//!
//! ```
//! use std::sync::Arc;
//! use litellm_provider::provider::LiteLlmProvider;
//! use litellm_provider::testing::{ApiCall, ProviderTester, RecordingApi};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let api = RecordingApi::new();
//! let tester = ProviderTester::new(LiteLlmProvider::with_api(Arc::new(api.clone())));
//!
//! let state = tester
//!     .lifecycle_create(
//!         "litellm_organization_member_add",
//!         json!({"organization_id": "org-1", "member": [{"user_id": "u1", "role": "org_admin"}]}),
//!     )
//!     .await
//!     .unwrap();
//!
//! assert_eq!(state["id"], "org-1");
//! assert!(matches!(api.calls()[0], ApiCall::AddMembers(_)));
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::client::{OrganizationApi, OrganizationInfo, OrganizationRequest};
use crate::error::ProviderError;
use crate::membership::{AddMembersRequest, DeleteMemberRequest, UpdateMemberRequest};
use crate::provider::ProviderService;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::types::{ImportedResource, PlanResult};

/// A call received by [`RecordingApi`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    /// `create_organization`.
    CreateOrganization(OrganizationRequest),
    /// `organization_info` with the requested id.
    OrganizationInfo(String),
    /// `update_organization`.
    UpdateOrganization(OrganizationRequest),
    /// `delete_organization` with the requested id.
    DeleteOrganization(String),
    /// `add_members`.
    AddMembers(AddMembersRequest),
    /// `update_member`.
    UpdateMember(UpdateMemberRequest),
    /// `delete_member`.
    DeleteMember(DeleteMemberRequest),
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<ApiCall>,
    organizations: HashMap<String, OrganizationInfo>,
    fail_adds: bool,
    fail_updates: bool,
    fail_deletes_for: HashSet<String>,
}

/// In-memory [`OrganizationApi`].
///
/// Organizations are stored so create, update, info and delete behave like a
/// proxy would. Member calls only succeed or fail; they are not stored.
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RecordingApi {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingApi {
    /// Create an empty API that accepts every call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `add_members` call fail.
    pub fn fail_adds(self) -> Self {
        self.state().fail_adds = true;
        self
    }

    /// Make every `update_member` call fail.
    pub fn fail_updates(self) -> Self {
        self.state().fail_updates = true;
        self
    }

    /// Make `delete_member` fail for a user id or email.
    pub fn fail_deletes_for(self, identity: impl Into<String>) -> Self {
        self.state().fail_deletes_for.insert(identity.into());
        self
    }

    /// Replace what `organization_info` reports for an id.
    pub fn set_organization_info(&self, organization_id: &str, info: OrganizationInfo) {
        self.state()
            .organizations
            .insert(organization_id.to_string(), info);
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state().calls.clone()
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ApiCall) -> MutexGuard<'_, Recorded> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }
}

fn injected(operation: &str) -> ProviderError {
    ProviderError::Unavailable(format!("injected {} failure", operation))
}

fn info_from_request(request: &OrganizationRequest) -> OrganizationInfo {
    OrganizationInfo {
        organization_id: Some(request.organization_id.clone()),
        organization_alias: Some(request.organization_alias.clone()),
        metadata: request.metadata.as_ref().map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect()
        }),
        models: request.models.clone(),
        max_budget: request.max_budget,
        budget_duration: request.budget_duration.clone(),
        tpm_limit: request.tpm_limit,
        rpm_limit: request.rpm_limit,
        blocked: request.blocked,
    }
}

#[async_trait]
impl OrganizationApi for RecordingApi {
    async fn create_organization(&self, request: &OrganizationRequest) -> Result<Value, ProviderError> {
        let mut state = self.record(ApiCall::CreateOrganization(request.clone()));
        if state.organizations.contains_key(&request.organization_id) {
            return Err(ProviderError::AlreadyExists(request.organization_id.clone()));
        }
        state
            .organizations
            .insert(request.organization_id.clone(), info_from_request(request));
        Ok(serde_json::json!({ "organization_id": request.organization_id }))
    }

    async fn organization_info(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationInfo>, ProviderError> {
        let state = self.record(ApiCall::OrganizationInfo(organization_id.to_string()));
        Ok(state.organizations.get(organization_id).cloned())
    }

    async fn update_organization(&self, request: &OrganizationRequest) -> Result<Value, ProviderError> {
        let mut state = self.record(ApiCall::UpdateOrganization(request.clone()));
        match state.organizations.get_mut(&request.organization_id) {
            Some(info) => {
                *info = info_from_request(request);
                Ok(Value::Null)
            },
            None => Err(ProviderError::NotFound(request.organization_id.clone())),
        }
    }

    async fn delete_organization(&self, organization_id: &str) -> Result<Value, ProviderError> {
        let mut state = self.record(ApiCall::DeleteOrganization(organization_id.to_string()));
        match state.organizations.remove(organization_id) {
            Some(_) => Ok(Value::Null),
            None => Err(ProviderError::NotFound(organization_id.to_string())),
        }
    }

    async fn add_members(&self, request: &AddMembersRequest) -> Result<Value, ProviderError> {
        let state = self.record(ApiCall::AddMembers(request.clone()));
        if state.fail_adds {
            return Err(injected("add"));
        }
        Ok(Value::Null)
    }

    async fn update_member(&self, request: &UpdateMemberRequest) -> Result<Value, ProviderError> {
        let state = self.record(ApiCall::UpdateMember(request.clone()));
        if state.fail_updates {
            return Err(injected("update"));
        }
        Ok(Value::Null)
    }

    async fn delete_member(&self, request: &DeleteMemberRequest) -> Result<Value, ProviderError> {
        let state = self.record(ApiCall::DeleteMember(request.clone()));
        let blocked = [&request.user_id, &request.user_email]
            .into_iter()
            .flatten()
            .any(|identity| state.fail_deletes_for.contains(identity));
        if blocked {
            return Err(injected("delete"));
        }
        Ok(Value::Null)
    }
}

/// Drives a [`ProviderService`] the way a host would.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Wrap a provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The provider schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Validate provider configuration; error diagnostics become [`TestError::Diagnostics`].
    pub async fn validate_provider_config(&self, config: Value) -> Result<(), TestError> {
        check_diagnostics(self.provider.validate_provider_config(config).await?)
    }

    /// Configure the provider; error diagnostics become [`TestError::Diagnostics`].
    pub async fn configure(&self, config: Value) -> Result<(), TestError> {
        check_diagnostics(self.provider.configure(config).await?)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        self.provider.stop().await
    }

    /// Validate a resource configuration; error diagnostics become [`TestError::Diagnostics`].
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<(), TestError> {
        check_diagnostics(
            self.provider
                .validate_resource_config(resource_type, config)
                .await?,
        )
    }

    /// Plan a create.
    pub async fn plan_create(&self, resource_type: &str, proposed: Value) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, None, proposed.clone(), proposed)
            .await
    }

    /// Plan an update from `prior` to `proposed`.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior: Value,
        proposed: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior), proposed.clone(), proposed)
            .await
    }

    /// Plan a destroy.
    pub async fn plan_delete(&self, resource_type: &str, prior: Value) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior), Value::Null, Value::Null)
            .await
    }

    /// Create a resource.
    pub async fn create(&self, resource_type: &str, planned: Value) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned).await
    }

    /// Read a resource.
    pub async fn read(&self, resource_type: &str, current: Value) -> Result<Value, ProviderError> {
        self.provider.read(resource_type, current).await
    }

    /// Update a resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior: Value,
        planned: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.update(resource_type, prior, planned).await
    }

    /// Delete a resource.
    pub async fn delete(&self, resource_type: &str, current: Value) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current).await
    }

    /// Import a resource by id.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Upgrade state from `version`.
    pub async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: u64,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .upgrade_resource_state(resource_type, version, state)
            .await
    }

    /// Plan, create, then read back.
    pub async fn lifecycle_create(&self, resource_type: &str, config: Value) -> Result<Value, ProviderError> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// Plan, update in place, then read back.
    ///
    /// Fails with [`ProviderError::FailedPrecondition`] if the plan requires replacement.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior: Value,
        proposed: Value,
    ) -> Result<Value, ProviderError> {
        let plan = self.plan_update(resource_type, prior.clone(), proposed).await?;
        if plan.requires_replace {
            return Err(ProviderError::FailedPrecondition(format!(
                "{} change requires replacement",
                resource_type
            )));
        }
        let updated = self.update(resource_type, prior, plan.planned_state).await?;
        self.read(resource_type, updated).await
    }

    /// Plan a destroy, then delete.
    pub async fn lifecycle_delete(&self, resource_type: &str, current: Value) -> Result<(), ProviderError> {
        self.plan_delete(resource_type, current.clone()).await?;
        self.delete(resource_type, current).await
    }

    /// Create, update, then delete. Returns the state after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial: Value,
        updated: Value,
    ) -> Result<Value, ProviderError> {
        let created = self.lifecycle_create(resource_type, initial).await?;
        let updated = self.lifecycle_update(resource_type, created, updated).await?;
        self.lifecycle_delete(resource_type, updated.clone()).await?;
        Ok(updated)
    }
}

/// Failure of a [`ProviderTester`] call that reports diagnostics.
#[derive(Debug, Error)]
pub enum TestError {
    /// Error diagnostics were returned.
    #[error("{}", format_diagnostics(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The call itself failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut out = format!("{} error diagnostic(s):", diagnostics.len());
    for d in diagnostics {
        out.push_str("\n  ");
        out.push_str(&d.summary);
        if let Some(detail) = &d.detail {
            out.push_str(": ");
            out.push_str(detail);
        }
        if let Some(attribute) = &d.attribute {
            out.push_str(&format!(" (at {})", attribute));
        }
    }
    out
}

fn check_diagnostics(diagnostics: Vec<Diagnostic>) -> Result<(), TestError> {
    let errors: Vec<_> = diagnostics.into_iter().filter(Diagnostic::is_error).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

fn changed_paths(plan: &PlanResult) -> Vec<&str> {
    plan.changes.iter().map(|c| c.path.as_str()).collect()
}

/// Assert the plan creates: it has changes and does not replace.
pub fn assert_plan_creates(plan: &PlanResult) {
    assert!(!plan.changes.is_empty(), "expected a create plan, got no changes");
    assert!(!plan.requires_replace, "expected a create plan, got a replacement");
}

/// Assert the plan has no changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "expected no changes, got {:?}",
        changed_paths(plan)
    );
}

/// Assert the plan requires replacement.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "expected replacement, changes were {:?}",
        changed_paths(plan)
    );
}

/// Assert the plan updates in place.
pub fn assert_plan_updates_in_place(plan: &PlanResult) {
    assert!(!plan.changes.is_empty(), "expected an update, got no changes");
    assert!(
        !plan.requires_replace,
        "expected an in-place update, changes {:?} force replacement",
        changed_paths(plan)
    );
}

/// Assert the plan changes `path`.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "expected '{}' to change, changes were {:?}",
        path,
        changed_paths(plan)
    );
}

/// Assert some error diagnostic's summary contains `substring`.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    assert!(
        diagnostics
            .iter()
            .any(|d| d.is_error() && d.summary.contains(substring)),
        "expected an error containing '{}', got {:?}",
        substring,
        diagnostics.iter().map(|d| &d.summary).collect::<Vec<_>>()
    );
}
