//! A toy `Authenticator`: the bearer token itself is the user id, and the
//! email is derived from it. Good enough to demonstrate the Connection
//! Endpoint's auth flow without pulling in a real OIDC/JWT stack, which
//! is explicitly out of scope for `tmi-service` (spec §1).

use async_trait::async_trait;
use tmi_types::collaborators::{AuthenticatedUser, Authenticator};
use tmi_types::ids::UserId;

/// Accepts any non-empty bearer token as a valid user.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryAuthenticator;

/// The only way [`InMemoryAuthenticator`] can fail: an empty token.
#[derive(Debug, thiserror::Error)]
#[error("bearer token must not be empty")]
pub struct EmptyTokenError;

#[async_trait]
impl Authenticator for InMemoryAuthenticator {
    type Error = EmptyTokenError;

    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, Self::Error> {
        if token.is_empty() {
            return Err(EmptyTokenError);
        }
        Ok(AuthenticatedUser { user_id: UserId::from(token), email: format!("{token}@example.invalid") })
    }
}
