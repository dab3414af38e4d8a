//! Resource handlers.
//!
//! Each resource has a typed model, a [`Schema`], and async CRUD functions
//! that take the API handle explicitly. JSON state is only converted to and
//! from the typed models in [`crate::provider`].

pub mod organization;
pub mod organization_member;
pub mod organization_member_add;

use crate::schema::Schema;

/// Resource type name of [`organization`].
pub const ORGANIZATION: &str = "litellm_organization";

/// Resource type name of [`organization_member`].
pub const ORGANIZATION_MEMBER: &str = "litellm_organization_member";

/// Resource type name of [`organization_member_add`].
pub const ORGANIZATION_MEMBER_ADD: &str = "litellm_organization_member_add";

/// Every resource type with its schema.
pub fn all() -> Vec<(&'static str, Schema)> {
    vec![
        (ORGANIZATION, organization::schema()),
        (ORGANIZATION_MEMBER, organization_member::schema()),
        (ORGANIZATION_MEMBER_ADD, organization_member_add::schema()),
    ]
}
