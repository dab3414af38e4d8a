//! `litellm_organization_member`: a single membership.
//!
//! The resource id is `organization_id:user_id`. LiteLLM has no endpoint that
//! returns one membership record, so read returns the last applied state and
//! out-of-band changes are not detected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::client::OrganizationApi;
use crate::error::ProviderError;
use crate::membership::{
    AddMembersRequest, DeleteMemberRequest, Member, MemberEntry, Role, UpdateMemberRequest,
};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::types::deserialize_non_empty;
use crate::validation::validate;

/// State of a single organization membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationMember {
    /// Composite id `organization_id:user_id`, assigned on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Owning organization.
    pub organization_id: String,
    /// LiteLLM user id.
    pub user_id: String,
    /// User email.
    #[serde(
        default,
        deserialize_with = "deserialize_non_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_email: Option<String>,
    /// Role within the organization.
    pub role: Role,
}

impl OrganizationMember {
    /// The composite id for this membership.
    pub fn composite_id(&self) -> String {
        format!("{}:{}", self.organization_id, self.user_id)
    }

    fn member(&self) -> Member {
        Member::new(Some(self.user_id.clone()), self.user_email.clone(), self.role)
    }

    /// Reject memberships the API would receive without an identity.
    fn check_identity(&self) -> Result<(), ProviderError> {
        if self.organization_id.is_empty() {
            return Err(ProviderError::Validation(
                "organization_id must not be empty".to_string(),
            ));
        }
        if self.user_id.is_empty() {
            return Err(ProviderError::Validation(
                "user_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The recorded id must name this membership.
    fn check_recorded_id(&self) -> Result<(), ProviderError> {
        let Some(id) = self.id.as_deref() else {
            return Ok(());
        };
        let (organization_id, user_id) = parse_id(id)?;
        if organization_id != self.organization_id || user_id != self.user_id {
            return Err(ProviderError::InvalidRequest(format!(
                "recorded id '{}' does not match {}",
                id,
                self.composite_id()
            )));
        }
        Ok(())
    }
}

/// Split a composite id into `(organization_id, user_id)`.
pub fn parse_id(id: &str) -> Result<(&str, &str), ProviderError> {
    match id.split_once(':') {
        Some((org, user)) if !org.is_empty() && !user.is_empty() => Ok((org, user)),
        _ => Err(ProviderError::InvalidRequest(format!(
            "expected id in the form organization_id:user_id, got '{}'",
            id
        ))),
    }
}

/// Schema of `litellm_organization_member`.
pub fn schema() -> Schema {
    Schema::v0()
        .with_attribute("id", Attribute::computed_string())
        .with_attribute("organization_id", Attribute::required_string().with_force_new())
        .with_attribute("user_id", Attribute::required_string().with_force_new())
        .with_attribute("user_email", Attribute::optional_string())
        .with_attribute(
            "role",
            Attribute::required_string().with_allowed_values(Role::names()),
        )
}

/// Validate a raw config: schema checks plus non-empty identity fields.
pub fn validate_config(config: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = validate(&schema(), config);

    for field in ["organization_id", "user_id"] {
        if config.get(field).and_then(Value::as_str) == Some("") {
            diagnostics.push(
                Diagnostic::error(format!("Attribute '{}' must not be empty", field))
                    .with_attribute(field),
            );
        }
    }

    diagnostics
}

/// Add the member to its organization.
pub async fn create(
    api: &dyn OrganizationApi,
    planned: &OrganizationMember,
) -> Result<OrganizationMember, ProviderError> {
    planned.check_identity()?;
    let member = planned.member();
    let request = AddMembersRequest {
        organization_id: planned.organization_id.clone(),
        member: vec![MemberEntry {
            role: member.role,
            user_id: member.user_id().map(str::to_string),
            user_email: member.user_email().map(str::to_string),
        }],
    };
    debug!(payload = ?request, "Create organization member request");

    let response = api.add_members(&request).await?;
    debug!(response = %response, "Create organization member response");

    let created = OrganizationMember {
        id: Some(planned.composite_id()),
        ..planned.clone()
    };
    info!(id = %created.composite_id(), "Organization member created");
    Ok(created)
}

/// Return the recorded state unchanged once its id checks out.
pub fn read(current: &OrganizationMember) -> Result<OrganizationMember, ProviderError> {
    current.check_recorded_id()?;
    debug!(id = %current.composite_id(), "Reading organization member");
    Ok(current.clone())
}

/// Change the member's role or email.
pub async fn update(
    api: &dyn OrganizationApi,
    planned: &OrganizationMember,
) -> Result<OrganizationMember, ProviderError> {
    planned.check_identity()?;
    let request = UpdateMemberRequest::for_member(&planned.organization_id, &planned.member());
    debug!(payload = ?request, "Update organization member request");

    let response = api.update_member(&request).await?;
    debug!(response = %response, "Update organization member response");

    info!(id = %planned.composite_id(), "Organization member updated");
    Ok(OrganizationMember {
        id: Some(planned.composite_id()),
        ..planned.clone()
    })
}

/// Remove the member from its organization.
pub async fn delete(
    api: &dyn OrganizationApi,
    current: &OrganizationMember,
) -> Result<(), ProviderError> {
    current.check_recorded_id()?;
    let request = DeleteMemberRequest::for_member(&current.organization_id, &current.member());
    debug!(payload = ?request, "Delete organization member request");

    api.delete_member(&request).await?;
    info!(id = %current.composite_id(), "Organization member deleted");
    Ok(())
}
