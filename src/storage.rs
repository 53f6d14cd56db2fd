use crate::entities;
use crate::errors::FulcrumError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use migration::MigratorTrait;
use rand::RngCore;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub client_name: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub username: String,
    pub password_hash: String,
    pub email: Option<String>,
    pub email_verified: i64,
    pub created_at: i64,
    pub enabled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub client_id: String,
    pub subject: String,
    pub scope: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub subject: String,
    pub scope: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: i64,
    pub parent_token: Option<String>, // For token rotation tracking
}

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, FulcrumError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

// Client functions

pub async fn create_client(
    db: &DatabaseConnection,
    client_name: Option<String>,
) -> Result<Client, FulcrumError> {
    let client_id = random_id();
    let client_secret = random_id();
    let created_at = Utc::now().timestamp();

    let client = entities::client::ActiveModel {
        client_id: Set(client_id.clone()),
        client_secret: Set(client_secret.clone()),
        client_name: Set(client_name.clone()),
        created_at: Set(created_at),
    };

    client.insert(db).await?;

    Ok(Client {
        client_id,
        client_secret,
        client_name,
        created_at,
    })
}

pub async fn get_client(
    db: &DatabaseConnection,
    client_id: &str,
) -> Result<Option<Client>, FulcrumError> {
    let model = entities::Client::find_by_id(client_id.to_string())
        .one(db)
        .await?;

    Ok(model.map(|m| Client {
        client_id: m.client_id,
        client_secret: m.client_secret,
        client_name: m.client_name,
        created_at: m.created_at,
    }))
}

// User functions

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    email: Option<String>,
) -> Result<User, FulcrumError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = Utc::now().timestamp();

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| FulcrumError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject.clone()),
        username: Set(username.to_string()),
        password_hash: Set(password_hash.clone()),
        email: Set(email.clone()),
        email_verified: Set(0),
        created_at: Set(created_at),
        enabled: Set(1),
    };

    user.insert(db).await?;

    Ok(User {
        subject,
        username: username.to_string(),
        password_hash,
        email,
        email_verified: 0,
        created_at,
        enabled: 1,
    })
}

fn user_from_model(model: entities::user::Model) -> User {
    User {
        subject: model.subject,
        username: model.username,
        password_hash: model.password_hash,
        email: model.email,
        email_verified: model.email_verified,
        created_at: model.created_at,
        enabled: model.enabled,
    }
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<User>, FulcrumError> {
    use entities::user::{Column, Entity};

    let model = Entity::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?;
    Ok(model.map(user_from_model))
}

pub async fn get_user_by_subject(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Option<User>, FulcrumError> {
    let model = entities::User::find_by_id(subject.to_string()).one(db).await?;
    Ok(model.map(user_from_model))
}

/// Returns the subject when the username exists, is enabled and the password
/// matches its Argon2 hash.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<Option<String>, FulcrumError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_username(db, username).await? {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| FulcrumError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user.subject))
    } else {
        Ok(None)
    }
}

pub async fn set_user_enabled(
    db: &DatabaseConnection,
    subject: &str,
    enabled: bool,
) -> Result<(), FulcrumError> {
    use entities::user::{Column, Entity};

    Entity::update_many()
        .col_expr(Column::Enabled, Expr::value(if enabled { 1 } else { 0 }))
        .filter(Column::Subject.eq(subject))
        .exec(db)
        .await?;
    Ok(())
}

// Access token functions

pub async fn issue_access_token(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
    scope: &str,
    ttl_secs: i64,
) -> Result<AccessToken, FulcrumError> {
    let token = random_id();
    let now = Utc::now().timestamp();
    let expires_at = now + ttl_secs;

    let access_token = entities::access_token::ActiveModel {
        token: Set(token.clone()),
        client_id: Set(client_id.to_string()),
        subject: Set(subject.to_string()),
        scope: Set(scope.to_string()),
        created_at: Set(now),
        expires_at: Set(expires_at),
        revoked: Set(0),
    };

    access_token.insert(db).await?;

    Ok(AccessToken {
        token,
        client_id: client_id.to_string(),
        subject: subject.to_string(),
        scope: scope.to_string(),
        created_at: now,
        expires_at,
        revoked: 0,
    })
}

/// Active (unrevoked, unexpired) access token.
pub async fn get_access_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<AccessToken>, FulcrumError> {
    let Some(model) = entities::AccessToken::find_by_id(token.to_string())
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    let now = Utc::now().timestamp();
    if model.revoked != 0 || now >= model.expires_at {
        return Ok(None);
    }

    Ok(Some(AccessToken {
        token: model.token,
        client_id: model.client_id,
        subject: model.subject,
        scope: model.scope,
        created_at: model.created_at,
        expires_at: model.expires_at,
        revoked: model.revoked,
    }))
}

pub async fn cleanup_expired_access_tokens(db: &DatabaseConnection) -> Result<u64, FulcrumError> {
    use entities::access_token::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

// Refresh token functions

pub async fn issue_refresh_token(
    db: &DatabaseConnection,
    client_id: &str,
    subject: &str,
    scope: &str,
    ttl_secs: i64,
    parent_token: Option<String>,
) -> Result<RefreshToken, FulcrumError> {
    let token = random_id();
    let now = Utc::now().timestamp();
    let expires_at = now + ttl_secs;

    let refresh_token = entities::refresh_token::ActiveModel {
        token: Set(token.clone()),
        client_id: Set(client_id.to_string()),
        subject: Set(subject.to_string()),
        scope: Set(scope.to_string()),
        created_at: Set(now),
        expires_at: Set(expires_at),
        revoked: Set(0),
        parent_token: Set(parent_token.clone()),
    };

    refresh_token.insert(db).await?;

    Ok(RefreshToken {
        token,
        client_id: client_id.to_string(),
        subject: subject.to_string(),
        scope: scope.to_string(),
        created_at: now,
        expires_at,
        revoked: 0,
        parent_token,
    })
}

/// Active (unrevoked, unexpired) refresh token.
pub async fn get_refresh_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<RefreshToken>, FulcrumError> {
    let Some(model) = entities::RefreshToken::find_by_id(token.to_string())
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    let now = Utc::now().timestamp();
    if model.revoked != 0 || now >= model.expires_at {
        return Ok(None);
    }

    Ok(Some(RefreshToken {
        token: model.token,
        client_id: model.client_id,
        subject: model.subject,
        scope: model.scope,
        created_at: model.created_at,
        expires_at: model.expires_at,
        revoked: model.revoked,
        parent_token: model.parent_token,
    }))
}

/// Revoke a refresh token. Returns `false` if it was already revoked, so only
/// one of two concurrent rotations can win.
pub async fn revoke_refresh_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<bool, FulcrumError> {
    use entities::refresh_token::{Column, Entity};

    let result = Entity::update_many()
        .col_expr(Column::Revoked, Expr::value(1))
        .filter(Column::Token.eq(token))
        .filter(Column::Revoked.eq(0))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Revoke `old_token` and issue its successor. `None` when `old_token` was
/// already spent.
pub async fn rotate_refresh_token(
    db: &DatabaseConnection,
    old_token: &str,
    client_id: &str,
    subject: &str,
    scope: &str,
    ttl_secs: i64,
) -> Result<Option<RefreshToken>, FulcrumError> {
    if !revoke_refresh_token(db, old_token).await? {
        return Ok(None);
    }

    let next = issue_refresh_token(
        db,
        client_id,
        subject,
        scope,
        ttl_secs,
        Some(old_token.to_string()),
    )
    .await?;
    Ok(Some(next))
}

pub async fn cleanup_expired_refresh_tokens(db: &DatabaseConnection) -> Result<u64, FulcrumError> {
    use entities::refresh_token::{Column, Entity};

    let now = Utc::now().timestamp();
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}
