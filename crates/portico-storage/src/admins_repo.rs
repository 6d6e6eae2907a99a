use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::password::{hash_password, token_digest, verify_password};
use crate::now;

pub const ADMIN_TOKEN_TTL_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct Admin {
    pub id: String,
    pub username: String,
}

pub async fn count(db: &SqlitePool) -> Result<i64, anyhow::Error> {
    let row = sqlx::query("SELECT COUNT(1) AS n FROM admins")
        .fetch_one(db)
        .await?;
    Ok(row.get::<i64, _>("n"))
}

pub async fn create(
    db: &SqlitePool,
    username: &str,
    password: &str,
) -> Result<Admin, anyhow::Error> {
    let now = now();
    let id = Uuid::new_v4().to_string();
    let password_hash = hash_password(password)?;

    sqlx::query(
        "INSERT INTO admins (id, username, password_hash, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(username)
    .bind(&password_hash)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    Ok(Admin {
        id,
        username: username.to_string(),
    })
}

/// Verify credentials; `None` when the username or password is wrong.
pub async fn authenticate(
    db: &SqlitePool,
    username: &str,
    password: &str,
) -> Result<Option<Admin>, anyhow::Error> {
    let row = sqlx::query("SELECT id, username, password_hash FROM admins WHERE username = ? LIMIT 1")
        .bind(username)
        .fetch_optional(db)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    if !verify_password(password, &row.get::<String, _>("password_hash")) {
        return Ok(None);
    }
    Ok(Some(Admin {
        id: row.get::<String, _>("id"),
        username: row.get::<String, _>("username"),
    }))
}

pub async fn change_password(
    db: &SqlitePool,
    admin_id: &str,
    new_password: &str,
) -> Result<(), anyhow::Error> {
    let password_hash = hash_password(new_password)?;
    sqlx::query("UPDATE admins SET password_hash = ?, updated_at = ? WHERE id = ?")
        .bind(&password_hash)
        .bind(now())
        .bind(admin_id)
        .execute(db)
        .await?;
    // Other sessions of this admin are no longer trusted.
    sqlx::query("DELETE FROM admin_tokens WHERE admin_id = ?")
        .bind(admin_id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn create_token(db: &SqlitePool, admin_id: &str) -> Result<(String, i64), anyhow::Error> {
    let token = crate::password::random_token(32);
    let now = now();
    let expires_at = now + ADMIN_TOKEN_TTL_SECS;

    sqlx::query(
        "INSERT INTO admin_tokens (token_hash, admin_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(token_digest(&token))
    .bind(admin_id)
    .bind(now)
    .bind(expires_at)
    .execute(db)
    .await?;

    Ok((token, expires_at))
}

pub async fn admin_for_token(
    db: &SqlitePool,
    token: &str,
) -> Result<Option<Admin>, anyhow::Error> {
    let row = sqlx::query(
        r#"
        SELECT a.id, a.username, t.expires_at
        FROM admin_tokens t JOIN admins a ON a.id = t.admin_id
        WHERE t.token_hash = ? LIMIT 1
        "#,
    )
    .bind(token_digest(token))
    .fetch_optional(db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    if row.get::<i64, _>("expires_at") <= now() {
        return Ok(None);
    }
    Ok(Some(Admin {
        id: row.get::<String, _>("id"),
        username: row.get::<String, _>("username"),
    }))
}

pub async fn delete_token(db: &SqlitePool, token: &str) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM admin_tokens WHERE token_hash = ?")
        .bind(token_digest(token))
        .execute(db)
        .await?;
    Ok(())
}

pub async fn prune_expired_tokens(db: &SqlitePool) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("DELETE FROM admin_tokens WHERE expires_at <= ?")
        .bind(now())
        .execute(db)
        .await?;
    Ok(result.rows_affected())
}
