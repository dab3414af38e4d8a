//! `litellm_organization_member_add`: the full membership of an organization
//! managed as one declarative set.
//!
//! Create adds every member in one request. Update diffs the recorded set
//! against the planned one with [`reconcile`] and applies the result. The
//! resource id is the organization id.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::OrganizationApi;
use crate::error::ProviderError;
use crate::membership::{self, add_all, delete_all, reconcile, Member, MembershipSet, Role};
use crate::schema::{Attribute, Block, Diagnostic, NestedBlock, Schema};
use crate::validation::validate;

/// State of a bulk organization membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMemberAdd {
    /// Equal to `organization_id` once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Owning organization. Changing it replaces the resource.
    pub organization_id: String,
    /// Desired members.
    #[serde(default)]
    pub member: Vec<Member>,
}

impl OrganizationMemberAdd {
    /// The members as a keyed set. Members without a key are dropped.
    pub fn membership(&self) -> MembershipSet {
        self.member.iter().cloned().collect()
    }
}

/// Schema of `litellm_organization_member_add`.
pub fn schema() -> Schema {
    Schema::v0()
        .with_attribute("id", Attribute::computed_string())
        .with_attribute("organization_id", Attribute::required_string().with_force_new())
        .with_block(
            "member",
            NestedBlock::set(
                Block::new()
                    .with_attribute("user_id", Attribute::optional_string())
                    .with_attribute("user_email", Attribute::optional_string())
                    .with_attribute(
                        "role",
                        Attribute::required_string().with_allowed_values(Role::names()),
                    ),
            )
            .with_min_items(1),
        )
}

/// Schema validation plus member identity checks.
///
/// A member with neither `user_id` nor `user_email` is an error; two members
/// sharing an identity produce a warning since only the last one is applied.
pub fn validate_config(config: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = validate(&schema(), config);

    let Some(members) = config.get("member").and_then(Value::as_array) else {
        return diagnostics;
    };

    let mut seen = HashSet::new();
    for (i, raw) in members.iter().enumerate() {
        let path = format!("member.{}", i);
        let non_empty = |field: &str| {
            raw.get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let user_id = non_empty("user_id");
        let user_email = non_empty("user_email");

        let key = match (&user_id, &user_email) {
            (Some(id), _) => format!("id:{}", id),
            (None, Some(email)) => format!("email:{}", email),
            (None, None) => {
                diagnostics.push(
                    Diagnostic::error(format!("Member '{}' has no identity", path))
                        .with_detail("Set user_id, user_email, or both")
                        .with_attribute(path),
                );
                continue;
            },
        };

        if !seen.insert(key.clone()) {
            diagnostics.push(
                Diagnostic::warning(format!("Duplicate member {}", key))
                    .with_detail("Only the last entry with this identity is applied")
                    .with_attribute(path),
            );
        }
    }

    diagnostics
}

/// Add every member in one request.
pub async fn create(
    api: &dyn OrganizationApi,
    planned: &OrganizationMemberAdd,
) -> Result<OrganizationMemberAdd, ProviderError> {
    if let Some(request) = add_all(&planned.organization_id, &planned.membership()) {
        debug!(payload = ?request, "Create organization members request");
        let response = api.add_members(&request).await?;
        debug!(response = %response, "Create organization members response");
    }

    info!(
        organization_id = %planned.organization_id,
        members = planned.member.len(),
        "Organization members added"
    );
    Ok(OrganizationMemberAdd {
        id: Some(planned.organization_id.clone()),
        ..planned.clone()
    })
}

/// Return the recorded state unchanged.
pub fn read(current: &OrganizationMemberAdd) -> OrganizationMemberAdd {
    current.clone()
}

/// Reconcile the recorded membership with the planned one.
///
/// On failure, operations already applied stay applied and the error
/// reports how far the plan got.
pub async fn update(
    api: &dyn OrganizationApi,
    prior: &OrganizationMemberAdd,
    planned: &OrganizationMemberAdd,
) -> Result<OrganizationMemberAdd, ProviderError> {
    if prior.organization_id != planned.organization_id {
        return Err(ProviderError::FailedPrecondition(format!(
            "organization_id changed from {} to {}; the resource must be replaced",
            prior.organization_id, planned.organization_id
        )));
    }

    let plan = reconcile(
        &planned.organization_id,
        &prior.membership(),
        &planned.membership(),
    );
    debug!(
        organization_id = %plan.organization_id,
        to_delete = plan.to_delete.len(),
        to_update = plan.to_update.len(),
        to_add = plan.to_add.len(),
        "Membership reconciliation planned"
    );
    membership::apply(api, &plan).await?;

    Ok(OrganizationMemberAdd {
        id: Some(planned.organization_id.clone()),
        ..planned.clone()
    })
}

/// Remove every recorded member, one request each.
pub async fn delete(
    api: &dyn OrganizationApi,
    current: &OrganizationMemberAdd,
) -> Result<(), ProviderError> {
    let requests = delete_all(&current.organization_id, &current.membership());
    let deleted = membership::apply_deletes(api, &requests).await?;
    info!(
        organization_id = %current.organization_id,
        deleted,
        "Organization members removed"
    );
    Ok(())
}
