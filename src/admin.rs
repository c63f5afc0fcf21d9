//! Provisioning endpoints: users, groups and memberships.

use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
    AppResult, AppState,
    auth::Authenticated,
    db::{Group, Role, Store, User},
    error::ChatError,
    rooms::RoomPipeline,
    session::SessionCodec,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/groups", get(list_groups))
        .route("/api/admin/users", post(create_user))
        .route("/api/admin/tokens", post(issue_token))
        .route("/api/admin/groups", post(create_group))
        .route("/api/admin/groups/{group_id}/add", post(add_member))
        .route("/api/admin/groups/{group_id}/members/{user_id}", delete(remove_member))
}

#[derive(Debug, Deserialize)]
pub struct NewUserRequest {
    pub email: String,
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct NewGroupRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct Done {
    pub ok: bool,
}

#[debug_handler(state = AppState)]
pub async fn list_groups(
    State(store): State<Store>,
    Authenticated(claim): Authenticated,
) -> AppResult<Json<Vec<Group>>> {
    Ok(Json(store.groups_for(&claim).await?))
}

#[debug_handler(state = AppState)]
pub async fn create_user(
    State(store): State<Store>,
    caller: Authenticated,

    Json(NewUserRequest { email, role }): Json<NewUserRequest>,
) -> AppResult<Json<User>> {
    caller.require_admin()?;

    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ChatError::Validation(format!("invalid email {email:?}")).into());
    }

    let user = store.create_user(email, role).await.map_err(|err| match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ChatError::Validation(format!("{email} is already registered"))
        }
        other => ChatError::Storage(other),
    })?;

    tracing::info!(user_id = user.id, email = %user.email, role = ?user.role, "user created");
    Ok(Json(user))
}

#[debug_handler(state = AppState)]
pub async fn create_group(
    State(store): State<Store>,
    caller: Authenticated,

    Json(NewGroupRequest { name }): Json<NewGroupRequest>,
) -> AppResult<Json<Group>> {
    caller.require_admin()?;

    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::Validation("group name is required".to_owned()).into());
    }

    let group = store.create_group(name).await.map_err(ChatError::from)?;
    tracing::info!(group_id = group.id, name = %group.name, "group created");
    Ok(Json(group))
}

#[debug_handler(state = AppState)]
pub async fn add_member(
    State(store): State<Store>,
    caller: Authenticated,
    Path(group_id): Path<i64>,

    Json(AddMemberRequest { user_id }): Json<AddMemberRequest>,
) -> AppResult<Json<Done>> {
    caller.require_admin()?;

    store.add_member(user_id, group_id).await.map_err(|err| match err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            ChatError::Validation(format!("unknown user {user_id} or group {group_id}"))
        }
        other => ChatError::Storage(other),
    })?;

    tracing::info!(user_id, group_id, "member added");
    Ok(Json(Done { ok: true }))
}

/// Issues a session token for an existing user. This is how accounts other
/// than the bootstrap admin get their first token.
#[debug_handler(state = AppState)]
pub async fn issue_token(
    State(store): State<Store>,
    State(codec): State<SessionCodec>,
    caller: Authenticated,

    Json(TokenRequest { user_id }): Json<TokenRequest>,
) -> AppResult<Json<IssuedToken>> {
    caller.require_admin()?;

    let user = store
        .user(user_id)
        .await
        .map_err(ChatError::from)?
        .ok_or_else(|| ChatError::Validation(format!("unknown user {user_id}")))?;
    let token = codec.issue(&user)?;

    tracing::info!(user_id, issued_by = caller.0.id, "session token issued");
    Ok(Json(IssuedToken { token, user }))
}

/// Removes the membership and drops the user's live subscriptions to the room.
#[debug_handler(state = AppState)]
pub async fn remove_member(
    State(pipeline): State<RoomPipeline>,
    caller: Authenticated,
    Path((group_id, user_id)): Path<(i64, i64)>,
) -> AppResult<Json<Done>> {
    caller.require_admin()?;

    let (removed, revoked) = pipeline.remove_member(user_id, group_id).await?;

    tracing::info!(user_id, group_id, removed, revoked, "member removed");
    Ok(Json(Done { ok: removed }))
}
