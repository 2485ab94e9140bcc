//! Auth-side storage for milo.
//!
//! - [`DocumentAuthAdapter`]: the auth framework's [`Adapter`](milo_core::Adapter)
//!   over the document store, with typed model and lookup-key dispatch.
//! - [`RoleAugmenter`]: resolves `user.role` on every session handed out.
//! - [`CacheStore`]: TTL key/value store used as the framework's secondary storage.
//! - [`UserDirectory`]: user counts and recent sign-ups for the admin dashboard.

pub mod adapter;
pub mod admin;
pub mod cache;
pub mod model;
pub mod session;

pub use adapter::{DocumentAuthAdapter, SweepReport};
pub use admin::{AdminStats, UserDirectory};
pub use cache::{CacheStats, CacheStore};
pub use model::{AccountLookup, AuthModel, SessionLookup, UserLookup, VerificationLookup};
pub use session::{
    RoleAugmenter, RoleService, SessionTransformer, SessionWithUser, StoreRoleService,
};
