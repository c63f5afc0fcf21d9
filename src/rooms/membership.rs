use crate::{db::Store, error::ChatError, session::SessionClaim};

/// Whether `claim` may join the room of `group_id`.
///
/// Admins may join any group. Everyone else needs a membership row. This is
/// asked once per join; later revocations go through
/// [`ConnectionRegistry::revoke`](super::registry::ConnectionRegistry::revoke).
pub async fn is_authorized(store: &Store, claim: &SessionClaim, group_id: i64) -> Result<bool, ChatError> {
    if claim.is_admin() {
        return Ok(true);
    }

    Ok(store.is_member(claim.id, group_id).await?)
}
