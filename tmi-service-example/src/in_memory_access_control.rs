//! A toy `AccessControl`: every authenticated user gets `Writer` on every
//! threat model, except a configurable set of user ids that are granted
//! `Owner`. Stands in for a real project/membership lookup.

use std::collections::HashSet;
use std::convert::Infallible;

use async_trait::async_trait;
use tmi_types::collaborators::AccessControl;
use tmi_types::ids::{ThreatModelId, UserId};
use tmi_types::presence::Role;

/// Grants `Writer` to everyone and `Owner` to a fixed set of user ids.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccessControl {
    owners: HashSet<UserId>,
}

#[async_trait]
impl AccessControl for InMemoryAccessControl {
    type Error = Infallible;

    async fn role_for(&self, user_id: &UserId, _threat_model_id: ThreatModelId) -> Result<Option<Role>, Self::Error> {
        let role = if self.owners.contains(user_id) { Role::Owner } else { Role::Writer };
        Ok(Some(role))
    }
}
