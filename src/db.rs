use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use time::OffsetDateTime;

use crate::session::SessionClaim;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// A row of a group's message log.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    // unique: id
    // ordered by id within group_id
}

#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub group_id: i64,
    pub user_id: i64,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub media_type: Option<String>,
}

/// What the store assigns when a message is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub id: i64,
    pub created_at: OffsetDateTime,
}

/// Durable storage for users, groups, memberships and message logs.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database that lives as long as the pool.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert_message(&self, message: &NewMessage) -> Result<Committed, sqlx::Error> {
        let created_at = OffsetDateTime::now_utc();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO messages (user_id,group_id,content,media_url,media_type,created_at) \
             VALUES (?,?,?,?,?,?) RETURNING id",
        )
        .bind(message.user_id)
        .bind(message.group_id)
        .bind(&message.content)
        .bind(&message.media_url)
        .bind(&message.media_type)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Committed { id, created_at })
    }

    pub async fn is_member(&self, user_id: i64, group_id: i64) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM user_groups WHERE user_id=? AND group_id=?")
                .bind(user_id)
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    pub async fn messages(&self, group_id: i64) -> Result<Vec<Message>, sqlx::Error> {
        sqlx::query_as(
            "SELECT id,user_id,group_id,content,media_url,media_type,created_at \
             FROM messages WHERE group_id=? ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn create_user(&self, email: &str, role: Role) -> Result<User, sqlx::Error> {
        sqlx::query_as("INSERT INTO users (email,role) VALUES (?,?) RETURNING id,email,role")
            .bind(email)
            .bind(role)
            .fetch_one(&self.pool)
            .await
    }

    /// Creates the bootstrap admin if no user owns `email` yet. An existing
    /// user keeps the role it has.
    pub async fn ensure_admin(&self, email: &str) -> Result<User, sqlx::Error> {
        sqlx::query("INSERT INTO users (email,role) VALUES (?,?) ON CONFLICT(email) DO NOTHING")
            .bind(email)
            .bind(Role::Admin)
            .execute(&self.pool)
            .await?;

        sqlx::query_as("SELECT id,email,role FROM users WHERE email=?")
            .bind(email)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT id,email,role FROM users WHERE id=?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn create_group(&self, name: &str) -> Result<Group, sqlx::Error> {
        sqlx::query_as("INSERT INTO groups_tbl (name) VALUES (?) RETURNING id,name")
            .bind(name)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn add_member(&self, user_id: i64, group_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO user_groups (user_id,group_id) VALUES (?,?) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Returns whether a membership was actually removed.
    pub async fn remove_member(&self, user_id: i64, group_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM user_groups WHERE user_id=? AND group_id=?")
            .bind(user_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Groups visible to `claim`: all of them for admins, memberships otherwise.
    pub async fn groups_for(&self, claim: &SessionClaim) -> Result<Vec<Group>, sqlx::Error> {
        if claim.is_admin() {
            sqlx::query_as("SELECT id,name FROM groups_tbl ORDER BY id")
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as(
                "SELECT g.id,g.name FROM groups_tbl g \
                 JOIN user_groups ug ON ug.group_id=g.id \
                 WHERE ug.user_id=? ORDER BY g.id",
            )
            .bind(claim.id)
            .fetch_all(&self.pool)
            .await
        }
    }
}
