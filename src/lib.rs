//! LiteLLM organization provider
//!
//! Declarative management of LiteLLM organizations and their membership.
//!
//! # Overview
//!
//! - **Resources**: `litellm_organization`, `litellm_organization_member`
//!   (one user), and `litellm_organization_member_add` (a whole membership set)
//! - **Reconciler**: [`membership::reconcile`] diffs two membership sets into
//!   the minimal delete, update and add operations; [`membership::apply`] runs them
//! - **Provider**: [`LiteLlmProvider`] implements [`ProviderService`], the
//!   schema / plan / CRUD surface a host drives
//! - **Client**: [`LiteLlmClient`] speaks the LiteLLM management API over HTTP
//!   behind the [`OrganizationApi`] trait
//! - **Logging**: `tracing` to stderr, filtered by `RUST_LOG`
//!
//! # Quick Start
//!
//! ```no_run
//! use litellm_provider::{LiteLlmProvider, ProviderService};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), litellm_provider::ProviderError> {
//! litellm_provider::init_logging();
//!
//! let provider = LiteLlmProvider::new();
//! provider
//!     .configure(json!({"api_base": "http://localhost:4000", "api_key": "sk-1234"}))
//!     .await?;
//!
//! let state = provider
//!     .create(
//!         "litellm_organization_member_add",
//!         json!({
//!             "organization_id": "org-1",
//!             "member": [
//!                 {"user_id": "u1", "role": "org_admin"},
//!                 {"user_email": "dev@example.com", "role": "internal_user"}
//!             ]
//!         }),
//!     )
//!     .await?;
//! assert_eq!(state["id"], "org-1");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod membership;
pub mod provider;
pub mod resources;
pub mod schema;
pub mod testing;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use client::{LiteLlmClient, OrganizationApi};
pub use config::ProviderConfig;
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use membership::{reconcile, ApplyError, Member, MemberKey, MembershipSet, ReconcilePlan, Role};
pub use provider::{LiteLlmProvider, ProviderService};
pub use schema::ProviderSchema;
pub use types::{AttributeChange, ImportedResource, PlanResult, ProviderMetadata};
pub use validation::validate;

// Re-export async_trait for implementors of `OrganizationApi`
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
