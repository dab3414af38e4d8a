//! Declarative organization membership.
//!
//! A membership is described as a set of [`Member`]s keyed by [`MemberKey`].
//! [`reconcile`] compares the previously applied set against the desired set
//! and returns a [`ReconcilePlan`] holding the minimal delete, update and add
//! requests. [`apply`] then executes a plan against an [`OrganizationApi`].
//!
//! ```
//! use litellm_provider::membership::{reconcile, Member, MembershipSet, Role};
//!
//! let old: MembershipSet = [Member::with_id("u1", Role::InternalUser)].into_iter().collect();
//! let new: MembershipSet = [
//!     Member::with_id("u1", Role::OrgAdmin),
//!     Member::with_id("u2", Role::InternalUser),
//! ]
//! .into_iter()
//! .collect();
//!
//! let plan = reconcile("org-1", &old, &new);
//! assert!(plan.to_delete.is_empty());
//! assert_eq!(plan.to_update.len(), 1);
//! assert_eq!(plan.to_add.len(), 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::client::OrganizationApi;
use crate::error::ProviderError;
use crate::types::deserialize_non_empty;

/// Role of a user within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Administrator of the organization.
    OrgAdmin,
    /// Regular member.
    InternalUser,
    /// Read-only member.
    InternalUserViewer,
}

impl Role {
    /// Every role, in wire order.
    pub const ALL: [Role; 3] = [Role::OrgAdmin, Role::InternalUser, Role::InternalUserViewer];

    /// The wire name of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::OrgAdmin => "org_admin",
            Role::InternalUser => "internal_user",
            Role::InternalUserViewer => "internal_user_viewer",
        }
    }

    /// The wire names of every role.
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(Role::as_str).collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| {
                ProviderError::Validation(format!(
                    "invalid role '{}', expected one of: {}",
                    s,
                    Self::names().join(", ")
                ))
            })
    }
}

/// A user's association with an organization.
///
/// Empty strings for `user_id` or `user_email` are treated as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// LiteLLM user id.
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub user_id: Option<String>,
    /// User email address.
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub user_email: Option<String>,
    /// Role granted within the organization.
    pub role: Role,
}

impl Member {
    /// Create a member from optional identifying fields.
    pub fn new(user_id: Option<String>, user_email: Option<String>, role: Role) -> Self {
        Self {
            user_id: user_id.filter(|s| !s.is_empty()),
            user_email: user_email.filter(|s| !s.is_empty()),
            role,
        }
    }

    /// Create a member identified by user id.
    pub fn with_id(user_id: impl Into<String>, role: Role) -> Self {
        Self::new(Some(user_id.into()), None, role)
    }

    /// Create a member identified by email.
    pub fn with_email(user_email: impl Into<String>, role: Role) -> Self {
        Self::new(None, Some(user_email.into()), role)
    }

    /// The user id, if set and non-empty.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|s| !s.is_empty())
    }

    /// The user email, if set and non-empty.
    pub fn user_email(&self) -> Option<&str> {
        self.user_email.as_deref().filter(|s| !s.is_empty())
    }

    /// The identity this member is diffed under, or `None` when neither
    /// `user_id` nor `user_email` is set.
    pub fn key(&self) -> Option<MemberKey> {
        MemberKey::derive(self.user_id(), self.user_email())
    }

    fn entry(&self) -> MemberEntry {
        MemberEntry {
            role: self.role,
            user_id: self.user_id().map(str::to_string),
            user_email: self.user_email().map(str::to_string),
        }
    }
}

/// Identity of a member. A user id takes precedence over an email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberKey {
    /// Keyed by `user_id`.
    Id(String),
    /// Keyed by `user_email`.
    Email(String),
}

impl MemberKey {
    fn derive(user_id: Option<&str>, user_email: Option<&str>) -> Option<Self> {
        match (user_id, user_email) {
            (Some(id), _) if !id.is_empty() => Some(Self::Id(id.to_string())),
            (_, Some(email)) if !email.is_empty() => Some(Self::Email(email.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{}", id),
            Self::Email(email) => write!(f, "email:{}", email),
        }
    }
}

/// A set of members keyed by [`MemberKey`].
///
/// Members without a key are dropped on insertion. When two members share a
/// key the last one inserted wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet {
    members: HashMap<MemberKey, Member>,
}

impl MembershipSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a member. Returns `false` if the member has no key and was dropped.
    pub fn insert(&mut self, member: Member) -> bool {
        match member.key() {
            Some(key) => {
                self.members.insert(key, member);
                true
            },
            None => false,
        }
    }

    /// Look up a member by key.
    pub fn get(&self, key: &MemberKey) -> Option<&Member> {
        self.members.get(key)
    }

    /// Whether a member with this key is present.
    pub fn contains_key(&self, key: &MemberKey) -> bool {
        self.members.contains_key(key)
    }

    /// Number of keyed members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate over `(key, member)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&MemberKey, &Member)> {
        self.members.iter()
    }

    /// Iterate over members in unspecified order.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }
}

impl FromIterator<Member> for MembershipSet {
    fn from_iter<I: IntoIterator<Item = Member>>(iter: I) -> Self {
        let mut set = Self::new();
        for member in iter {
            set.insert(member);
        }
        set
    }
}

/// A member entry inside an add-members request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Role to grant.
    pub role: Role,
    /// User id, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// User email, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl MemberEntry {
    fn identity(&self) -> String {
        identity(self.user_id.as_deref(), self.user_email.as_deref())
    }
}

/// Body of `POST /organization/member_add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMembersRequest {
    /// Owning organization.
    pub organization_id: String,
    /// Members to add.
    pub member: Vec<MemberEntry>,
}

/// Body of `PATCH /organization/member_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMemberRequest {
    /// Owning organization.
    pub organization_id: String,
    /// New role.
    pub role: Role,
    /// User id, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// User email, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl UpdateMemberRequest {
    /// Build an update request for a member.
    pub fn for_member(organization_id: impl Into<String>, member: &Member) -> Self {
        Self {
            organization_id: organization_id.into(),
            role: member.role,
            user_id: member.user_id().map(str::to_string),
            user_email: member.user_email().map(str::to_string),
        }
    }

    fn identity(&self) -> String {
        identity(self.user_id.as_deref(), self.user_email.as_deref())
    }
}

/// Body of `DELETE /organization/member_delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMemberRequest {
    /// Owning organization.
    pub organization_id: String,
    /// User id, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// User email, omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl DeleteMemberRequest {
    /// Build a delete request for a member.
    pub fn for_member(organization_id: impl Into<String>, member: &Member) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: member.user_id().map(str::to_string),
            user_email: member.user_email().map(str::to_string),
        }
    }

    fn identity(&self) -> String {
        identity(self.user_id.as_deref(), self.user_email.as_deref())
    }
}

fn identity(user_id: Option<&str>, user_email: Option<&str>) -> String {
    MemberKey::derive(user_id, user_email)
        .map(|key| key.to_string())
        .unwrap_or_else(|| "<unidentified>".to_string())
}

/// The operations needed to move an organization from one membership to another.
///
/// The lists are disjoint by member key. Order within each list is unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Organization the plan applies to.
    pub organization_id: String,
    /// Members to remove.
    pub to_delete: Vec<DeleteMemberRequest>,
    /// Members whose role changes.
    pub to_update: Vec<UpdateMemberRequest>,
    /// Members to add, sent as a single request.
    pub to_add: Vec<MemberEntry>,
}

impl ReconcilePlan {
    /// Whether the plan contains no operations.
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_update.is_empty() && self.to_add.is_empty()
    }

    /// The add-members request for this plan, if anything is added.
    pub fn add_request(&self) -> Option<AddMembersRequest> {
        if self.to_add.is_empty() {
            None
        } else {
            Some(AddMembersRequest {
                organization_id: self.organization_id.clone(),
                member: self.to_add.clone(),
            })
        }
    }
}

/// Diff the previously applied membership against the desired one.
///
/// Total over its inputs and free of side effects.
pub fn reconcile(organization_id: &str, old: &MembershipSet, new: &MembershipSet) -> ReconcilePlan {
    let to_delete = old
        .iter()
        .filter(|(key, _)| !new.contains_key(key))
        .map(|(_, member)| DeleteMemberRequest::for_member(organization_id, member))
        .collect();

    let to_update = new
        .iter()
        .filter_map(|(key, member)| old.get(key).map(|prior| (prior, member)))
        .filter(|(prior, member)| attributes_changed(prior, member))
        .map(|(_, member)| UpdateMemberRequest::for_member(organization_id, member))
        .collect();

    let to_add = new
        .iter()
        .filter(|(key, _)| !old.contains_key(key))
        .map(|(_, member)| member.entry())
        .collect();

    ReconcilePlan {
        organization_id: organization_id.to_string(),
        to_delete,
        to_update,
        to_add,
    }
}

/// Only the role is compared; an email change under an unchanged user id is
/// not detected.
fn attributes_changed(old: &Member, new: &Member) -> bool {
    old.role != new.role
}

/// Build a single request adding every member of `desired`.
///
/// Returns `None` for an empty set.
pub fn add_all(organization_id: &str, desired: &MembershipSet) -> Option<AddMembersRequest> {
    if desired.is_empty() {
        return None;
    }
    Some(AddMembersRequest {
        organization_id: organization_id.to_string(),
        member: desired.members().map(Member::entry).collect(),
    })
}

/// Build one delete request per member of `current`.
pub fn delete_all(organization_id: &str, current: &MembershipSet) -> Vec<DeleteMemberRequest> {
    current
        .members()
        .map(|member| DeleteMemberRequest::for_member(organization_id, member))
        .collect()
}

/// The stage of a plan an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    /// Removing members.
    Delete,
    /// Changing member roles.
    Update,
    /// Adding members.
    Add,
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => f.write_str("delete"),
            Self::Update => f.write_str("update"),
            Self::Add => f.write_str("add"),
        }
    }
}

/// Counts of operations applied by [`apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Members removed.
    pub deleted: usize,
    /// Members whose role was changed.
    pub updated: usize,
    /// Members added.
    pub added: usize,
}

/// A plan stopped part way through. Operations already applied are not rolled back.
#[derive(Debug, Error)]
#[error("{phase} of organization member {member} failed after {applied} operation(s) applied: {source}")]
pub struct ApplyError {
    /// Phase the failing operation belonged to.
    pub phase: ApplyPhase,
    /// Identity of the failing member (`id:...`, `email:...`, or a list for adds).
    pub member: String,
    /// Operations that succeeded before the failure.
    pub applied: usize,
    /// The downstream failure.
    #[source]
    pub source: Box<ProviderError>,
}

/// Execute a plan: deletes, then updates, then one add request.
///
/// Stops at the first failure.
pub async fn apply(
    api: &dyn OrganizationApi,
    plan: &ReconcilePlan,
) -> Result<ApplySummary, ApplyError> {
    let mut summary = ApplySummary::default();
    let mut applied = 0;

    for request in &plan.to_delete {
        debug!(payload = ?request, "Delete organization member request");
        if let Err(e) = api.delete_member(request).await {
            error!(member = %request.identity(), error = %e, "Deleting organization member failed");
            return Err(ApplyError {
                phase: ApplyPhase::Delete,
                member: request.identity(),
                applied,
                source: Box::new(e),
            });
        }
        summary.deleted += 1;
        applied += 1;
    }

    for request in &plan.to_update {
        debug!(payload = ?request, "Update organization member request");
        if let Err(e) = api.update_member(request).await {
            error!(member = %request.identity(), error = %e, "Updating organization member failed");
            return Err(ApplyError {
                phase: ApplyPhase::Update,
                member: request.identity(),
                applied,
                source: Box::new(e),
            });
        }
        summary.updated += 1;
        applied += 1;
    }

    if let Some(request) = plan.add_request() {
        debug!(payload = ?request, "Add organization members request");
        match api.add_members(&request).await {
            Ok(response) => {
                debug!(response = %response, "Add organization members response");
                summary.added = request.member.len();
            },
            Err(e) => {
                let members = request
                    .member
                    .iter()
                    .map(MemberEntry::identity)
                    .collect::<Vec<_>>()
                    .join(", ");
                error!(members = %members, error = %e, "Adding organization members failed");
                return Err(ApplyError {
                    phase: ApplyPhase::Add,
                    member: members,
                    applied,
                    source: Box::new(e),
                });
            },
        }
    }

    info!(
        organization_id = %plan.organization_id,
        deleted = summary.deleted,
        updated = summary.updated,
        added = summary.added,
        "Organization membership reconciled"
    );
    Ok(summary)
}

/// Execute delete requests in order, stopping at the first failure.
pub async fn apply_deletes(
    api: &dyn OrganizationApi,
    requests: &[DeleteMemberRequest],
) -> Result<usize, ApplyError> {
    for (applied, request) in requests.iter().enumerate() {
        debug!(payload = ?request, "Delete organization member request");
        if let Err(e) = api.delete_member(request).await {
            error!(member = %request.identity(), error = %e, "Deleting organization member failed");
            return Err(ApplyError {
                phase: ApplyPhase::Delete,
                member: request.identity(),
                applied,
                source: Box::new(e),
            });
        }
    }
    Ok(requests.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApiCall, RecordingApi};
    use proptest::prelude::*;
    use serde_json::json;

    fn set(members: Vec<Member>) -> MembershipSet {
        members.into_iter().collect()
    }

    fn unkeyed(role: Role) -> Member {
        Member::new(Some(String::new()), None, role)
    }

    #[test]
    fn test_member_key() {
        let member = Member::new(Some("u1".into()), Some("u1@example.com".into()), Role::OrgAdmin);
        assert_eq!(member.key(), Some(MemberKey::Id("u1".into())));
        assert_eq!(member.key().map(|k| k.to_string()), Some("id:u1".to_string()));

        let member = Member::new(Some(String::new()), Some("a@example.com".into()), Role::OrgAdmin);
        assert_eq!(
            member.key().map(|k| k.to_string()),
            Some("email:a@example.com".to_string())
        );

        assert_eq!(unkeyed(Role::OrgAdmin).key(), None);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("org_admin".parse::<Role>().unwrap(), Role::OrgAdmin);
        assert_eq!(
            "internal_user_viewer".parse::<Role>().unwrap(),
            Role::InternalUserViewer
        );
        let err = "owner".parse::<Role>().unwrap_err();
        assert!(err.to_string().contains("owner"));
        assert!(err.to_string().contains("internal_user"));
    }

    #[test]
    fn test_member_deserialize_treats_empty_as_absent() {
        let member: Member =
            serde_json::from_value(json!({"user_id": "", "user_email": "a@b.c", "role": "org_admin"}))
                .unwrap();
        assert_eq!(member.user_id, None);
        assert_eq!(member.user_email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn test_set_drops_unkeyed_members() {
        let mut members = MembershipSet::new();
        assert!(!members.insert(unkeyed(Role::InternalUser)));
        assert!(members.insert(Member::with_id("u1", Role::InternalUser)));
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn test_set_last_duplicate_wins() {
        let members = set(vec![
            Member::with_id("u1", Role::InternalUser),
            Member::with_id("u1", Role::OrgAdmin),
        ]);
        assert_eq!(members.len(), 1);
        assert_eq!(
            members.get(&MemberKey::Id("u1".into())).map(|m| m.role),
            Some(Role::OrgAdmin)
        );
    }

    #[test]
    fn test_reconcile_update_and_add() {
        let old = set(vec![Member::with_id("u1", Role::InternalUser)]);
        let new = set(vec![
            Member::with_id("u1", Role::OrgAdmin),
            Member::with_id("u2", Role::InternalUser),
        ]);

        let plan = reconcile("org-1", &old, &new);

        assert!(plan.to_delete.is_empty());
        assert_eq!(
            plan.to_update,
            vec![UpdateMemberRequest {
                organization_id: "org-1".into(),
                role: Role::OrgAdmin,
                user_id: Some("u1".into()),
                user_email: None,
            }]
        );
        assert_eq!(
            plan.to_add,
            vec![MemberEntry {
                role: Role::InternalUser,
                user_id: Some("u2".into()),
                user_email: None,
            }]
        );
    }

    #[test]
    fn test_reconcile_delete_only() {
        let old = set(vec![
            Member::with_id("u1", Role::InternalUser),
            Member::with_id("u2", Role::InternalUser),
        ]);
        let new = set(vec![Member::with_id("u2", Role::InternalUser)]);

        let plan = reconcile("org-1", &old, &new);

        assert_eq!(
            plan.to_delete,
            vec![DeleteMemberRequest {
                organization_id: "org-1".into(),
                user_id: Some("u1".into()),
                user_email: None,
            }]
        );
        assert!(plan.to_update.is_empty());
        assert!(plan.to_add.is_empty());
        assert!(plan.add_request().is_none());
    }

    #[test]
    fn test_reconcile_ignores_email_change_under_same_id() {
        let old = set(vec![Member::new(
            Some("u1".into()),
            Some("old@example.com".into()),
            Role::InternalUser,
        )]);
        let new = set(vec![Member::new(
            Some("u1".into()),
            Some("new@example.com".into()),
            Role::InternalUser,
        )]);

        assert!(reconcile("org-1", &old, &new).is_empty());
    }

    #[test]
    fn test_reconcile_email_keyed_members() {
        let old = set(vec![Member::with_email("a@example.com", Role::InternalUser)]);
        let new = set(vec![Member::with_email("a@example.com", Role::InternalUserViewer)]);

        let plan = reconcile("org-1", &old, &new);
        assert_eq!(plan.to_update.len(), 1);
        assert_eq!(plan.to_update[0].user_email.as_deref(), Some("a@example.com"));
        assert_eq!(plan.to_update[0].user_id, None);
    }

    #[test]
    fn test_add_all() {
        let desired = set(vec![
            Member::with_id("u1", Role::InternalUser),
            Member::with_id("u2", Role::InternalUser),
        ]);

        let request = add_all("org-1", &desired).unwrap();
        assert_eq!(request.organization_id, "org-1");
        let mut ids: Vec<_> = request
            .member
            .iter()
            .filter_map(|m| m.user_id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["u1".to_string(), "u2".to_string()]);

        assert!(add_all("org-1", &MembershipSet::new()).is_none());
    }

    #[test]
    fn test_request_serialization_omits_absent_fields() {
        let request = DeleteMemberRequest {
            organization_id: "org-1".into(),
            user_id: None,
            user_email: Some("a@example.com".into()),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"organization_id": "org-1", "user_email": "a@example.com"})
        );

        let request = AddMembersRequest {
            organization_id: "org-1".into(),
            member: vec![MemberEntry {
                role: Role::OrgAdmin,
                user_id: Some("u1".into()),
                user_email: None,
            }],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"organization_id": "org-1", "member": [{"role": "org_admin", "user_id": "u1"}]})
        );
    }

    #[tokio::test]
    async fn test_apply_runs_delete_update_add_in_order() {
        let api = RecordingApi::new();
        let old = set(vec![
            Member::with_id("gone", Role::InternalUser),
            Member::with_id("kept", Role::InternalUser),
        ]);
        let new = set(vec![
            Member::with_id("kept", Role::OrgAdmin),
            Member::with_id("fresh", Role::InternalUser),
        ]);
        let plan = reconcile("org-1", &old, &new);

        let summary = apply(&api, &plan).await.unwrap();
        assert_eq!(
            summary,
            ApplySummary {
                deleted: 1,
                updated: 1,
                added: 1
            }
        );

        let calls = api.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(&calls[0], ApiCall::DeleteMember(r) if r.user_id.as_deref() == Some("gone")));
        assert!(matches!(&calls[1], ApiCall::UpdateMember(r) if r.role == Role::OrgAdmin));
        assert!(matches!(&calls[2], ApiCall::AddMembers(r) if r.member.len() == 1));
    }

    #[tokio::test]
    async fn test_apply_empty_plan_makes_no_calls() {
        let api = RecordingApi::new();
        let members = set(vec![Member::with_id("u1", Role::InternalUser)]);
        let plan = reconcile("org-1", &members, &members);

        let summary = apply(&api, &plan).await.unwrap();
        assert_eq!(summary, ApplySummary::default());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_stops_at_first_failure() {
        let api = RecordingApi::new().fail_updates();
        let old = set(vec![
            Member::with_id("gone", Role::InternalUser),
            Member::with_id("kept", Role::InternalUser),
        ]);
        let new = set(vec![
            Member::with_id("kept", Role::OrgAdmin),
            Member::with_id("fresh", Role::InternalUser),
        ]);
        let plan = reconcile("org-1", &old, &new);

        let err = apply(&api, &plan).await.unwrap_err();
        assert_eq!(err.phase, ApplyPhase::Update);
        assert_eq!(err.member, "id:kept");
        assert_eq!(err.applied, 1);

        // The add phase never ran.
        assert!(!api
            .calls()
            .iter()
            .any(|call| matches!(call, ApiCall::AddMembers(_))));
    }

    #[tokio::test]
    async fn test_apply_deletes_reports_progress() {
        let api = RecordingApi::new().fail_deletes_for("u2");
        let requests = delete_all(
            "org-1",
            &set(vec![Member::with_id("u2", Role::InternalUser)]),
        );

        let err = apply_deletes(&api, &requests).await.unwrap_err();
        assert_eq!(err.applied, 0);
        assert_eq!(err.member, "id:u2");
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop_oneof![
            Just(Role::OrgAdmin),
            Just(Role::InternalUser),
            Just(Role::InternalUserViewer),
        ]
    }

    /// Members keyed by id, by email, or carrying both.
    fn members_strategy(prefix: &'static str) -> impl Strategy<Value = Vec<Member>> {
        prop::collection::hash_map("[a-z0-9]{1,8}", (0..3u8, role_strategy()), 0..12).prop_map(
            move |m| {
                m.into_iter()
                    .map(|(name, (shape, role))| {
                        let id = format!("{}{}", prefix, name);
                        let email = format!("{}@example.com", id);
                        match shape {
                            0 => Member::new(Some(id), None, role),
                            1 => Member::new(None, Some(email), role),
                            _ => Member::new(Some(id), Some(email), role),
                        }
                    })
                    .collect()
            },
        )
    }

    fn sorted_keys(members: &MembershipSet) -> Vec<String> {
        let mut keys: Vec<String> = members.iter().map(|(key, _)| key.to_string()).collect();
        keys.sort();
        keys
    }

    proptest! {
        #[test]
        fn prop_reconcile_same_set_is_empty(members in members_strategy("u")) {
            let members = set(members);
            prop_assert!(reconcile("org", &members, &members).is_empty());
        }

        #[test]
        fn prop_disjoint_sets_delete_all_and_add_all(
            old in members_strategy("a"),
            new in members_strategy("b"),
        ) {
            let old = set(old);
            let new = set(new);
            let plan = reconcile("org", &old, &new);

            let mut deleted: Vec<String> = plan.to_delete.iter().map(DeleteMemberRequest::identity).collect();
            deleted.sort();
            let mut added: Vec<String> = plan.to_add.iter().map(MemberEntry::identity).collect();
            added.sort();

            prop_assert_eq!(deleted, sorted_keys(&old));
            prop_assert_eq!(added, sorted_keys(&new));
            prop_assert!(plan.to_update.is_empty());
        }

        #[test]
        fn prop_single_role_change_is_single_update(
            members in members_strategy("u").prop_filter("non-empty", |m| !m.is_empty()),
            pick in any::<prop::sample::Index>(),
        ) {
            let old = set(members.clone());
            let mut changed = members;
            let idx = pick.index(changed.len());
            changed[idx].role = match changed[idx].role {
                Role::OrgAdmin => Role::InternalUser,
                _ => Role::OrgAdmin,
            };
            let target = changed[idx].clone();
            let new = set(changed);

            let plan = reconcile("org", &old, &new);
            prop_assert!(plan.to_delete.is_empty());
            prop_assert!(plan.to_add.is_empty());
            prop_assert_eq!(plan.to_update, vec![UpdateMemberRequest::for_member("org", &target)]);
        }

        #[test]
        fn prop_unkeyed_member_never_appears(
            old in members_strategy("u"),
            new in members_strategy("u"),
            role in role_strategy(),
            in_old in any::<bool>(),
        ) {
            let mut old = old;
            let mut new = new;
            if in_old {
                old.push(unkeyed(role));
            } else {
                new.push(unkeyed(role));
            }
            let plan = reconcile("org", &set(old), &set(new));
            prop_assert!(plan.to_delete.iter().all(|r| r.user_id.is_some() || r.user_email.is_some()));
            prop_assert!(plan.to_update.iter().all(|r| r.user_id.is_some() || r.user_email.is_some()));
            prop_assert!(plan.to_add.iter().all(|r| r.user_id.is_some() || r.user_email.is_some()));
        }
    }
}
