//! Live identity source.
//!
//! [`IdentitySource`] owns an [`crate::Authority`], performs the initial fetch,
//! and keeps a versioned [`crate::Snapshot`] fresh in a background task.

mod builder;
mod error;
#[allow(clippy::module_inception)]
mod source;
mod supervisor;

pub use builder::{IdentitySourceBuilder, ReconnectConfig, RefreshConfig, MIN_RETRY_DELAY};
pub use error::SourceError;
pub use source::{IdentitySource, RotationUpdates};
