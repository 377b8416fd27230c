use crate::authority::AuthorityError;
use crate::material::MaterialError;
use std::time::Duration;
use time::OffsetDateTime;

/// Errors returned by [`crate::IdentitySource`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
    /// The authority could not be reached, or did not answer in time.
    #[error("identity authority unreachable: {0}")]
    AuthorityUnreachable(#[source] AuthorityError),

    /// The authority answered with material that cannot be used.
    #[error("invalid identity material: {0}")]
    InvalidMaterial(#[source] MaterialError),

    /// The current credential is past its `not_after` and no newer one exists.
    #[error("identity credential expired at {not_after}")]
    CredentialExpired {
        /// End of the validity window of the held credential.
        not_after: OffsetDateTime,
    },

    /// The source has been closed.
    #[error("identity source is closed")]
    Closed,

    /// The background task did not stop within the shutdown timeout.
    #[error("identity source shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

impl From<AuthorityError> for SourceError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::MalformedResponse(msg) => {
                SourceError::InvalidMaterial(MaterialError::Malformed(msg))
            }
            other => SourceError::AuthorityUnreachable(other),
        }
    }
}

impl From<MaterialError> for SourceError {
    fn from(err: MaterialError) -> Self {
        SourceError::InvalidMaterial(err)
    }
}

impl SourceError {
    /// `true` for failures a later attempt may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::AuthorityUnreachable(_))
    }
}
