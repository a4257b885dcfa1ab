// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite session store.
//!
//! One row per (user, challenge) pair. The `UNIQUE (user_id,
//! challenge_id)` constraint is the serialization point for concurrent
//! start requests: exactly one writer wins the insert.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};

/// A session row tying a user and challenge to an instance.
///
/// `instance_id` holds either a real cluster instance name or a
/// placeholder lock token while provisioning is in flight.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    /// Row id.
    pub id: i64,
    /// Owning user.
    pub user_id: i64,
    /// Challenge the instance serves.
    pub challenge_id: i64,
    /// Instance name or provisioning lock token.
    pub instance_id: String,
    /// Unix seconds the row was created.
    pub created_at: i64,
    /// Unix seconds the row was last updated.
    pub updated_at: i64,
}

/// Open a connection pool against the given SQLite URL.
pub async fn connect(database_url: &str) -> Result<Pool<Sqlite>, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

/// Apply the schema. Idempotent.
pub async fn init(pool: &Pool<Sqlite>) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_str!("../migrations/schema.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Fetch the session row for a (user, challenge) pair, if any.
pub async fn get_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    challenge_id: i64,
) -> Result<Option<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(
        "SELECT id, user_id, challenge_id, instance_id, created_at, updated_at
         FROM instance_sessions
         WHERE user_id = ? AND challenge_id = ?",
    )
    .bind(user_id)
    .bind(challenge_id)
    .fetch_optional(pool)
    .await
}

/// Insert a session row. Returns `false` when the unique constraint on
/// (user_id, challenge_id) already holds a row, without treating that
/// as an error.
pub async fn try_insert_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    challenge_id: i64,
    instance_id: &str,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO instance_sessions (user_id, challenge_id, instance_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(challenge_id)
    .bind(instance_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replace a session row's instance id. Returns `false` when the row no
/// longer exists, e.g. removed by a concurrent stop.
pub async fn update_session_instance(
    pool: &Pool<Sqlite>,
    user_id: i64,
    challenge_id: i64,
    instance_id: &str,
    now: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE instance_sessions SET instance_id = ?, updated_at = ?
         WHERE user_id = ? AND challenge_id = ?",
    )
    .bind(instance_id)
    .bind(now)
    .bind(user_id)
    .bind(challenge_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove the session row for a (user, challenge) pair.
pub async fn delete_session(
    pool: &Pool<Sqlite>,
    user_id: i64,
    challenge_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM instance_sessions WHERE user_id = ? AND challenge_id = ?")
        .bind(user_id)
        .bind(challenge_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fetch this user's session row pointing at the given instance, if any.
pub async fn get_session_by_instance(
    pool: &Pool<Sqlite>,
    user_id: i64,
    instance_id: &str,
) -> Result<Option<SessionRow>, sqlx::Error> {
    sqlx::query_as::<_, SessionRow>(
        "SELECT id, user_id, challenge_id, instance_id, created_at, updated_at
         FROM instance_sessions
         WHERE user_id = ? AND instance_id = ?",
    )
    .bind(user_id)
    .bind(instance_id)
    .fetch_optional(pool)
    .await
}

/// Remove any session row of this user pointing at the given instance.
pub async fn delete_session_by_instance(
    pool: &Pool<Sqlite>,
    user_id: i64,
    instance_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM instance_sessions WHERE user_id = ? AND instance_id = ?")
        .bind(user_id)
        .bind(instance_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete every session row. Returns the number removed.
pub async fn clear_sessions(pool: &Pool<Sqlite>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM instance_sessions")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Cheap connectivity probe for the health endpoint.
pub async fn health_check(pool: &Pool<Sqlite>) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> Pool<Sqlite> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn insert_is_unique_per_user_and_challenge() {
        let pool = test_pool().await;

        assert!(try_insert_session(&pool, 1, 7, "pending-a", 100).await.unwrap());
        assert!(!try_insert_session(&pool, 1, 7, "pending-b", 101).await.unwrap());
        // Different challenge or user still inserts.
        assert!(try_insert_session(&pool, 1, 8, "pending-c", 102).await.unwrap());
        assert!(try_insert_session(&pool, 2, 7, "pending-d", 103).await.unwrap());

        let row = get_session(&pool, 1, 7).await.unwrap().unwrap();
        assert_eq!(row.instance_id, "pending-a");
    }

    #[tokio::test]
    async fn update_and_delete_round_trip() {
        let pool = test_pool().await;

        try_insert_session(&pool, 1, 7, "pending-a", 100).await.unwrap();
        assert!(
            update_session_instance(&pool, 1, 7, "ctf-u1-c7-abc123", 110)
                .await
                .unwrap()
        );
        // No row for this pair, nothing to update.
        assert!(!update_session_instance(&pool, 1, 9, "ctf-u1-c9-abc123", 110)
            .await
            .unwrap());

        let row = get_session(&pool, 1, 7).await.unwrap().unwrap();
        assert_eq!(row.instance_id, "ctf-u1-c7-abc123");
        assert_eq!(row.updated_at, 110);

        delete_session_by_instance(&pool, 1, "ctf-u1-c7-abc123")
            .await
            .unwrap();
        assert!(get_session(&pool, 1, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_sessions_reports_count() {
        let pool = test_pool().await;

        try_insert_session(&pool, 1, 7, "a", 100).await.unwrap();
        try_insert_session(&pool, 2, 7, "b", 100).await.unwrap();
        assert_eq!(clear_sessions(&pool).await.unwrap(), 2);
        assert_eq!(clear_sessions(&pool).await.unwrap(), 0);
    }
}
