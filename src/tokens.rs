use crate::device::record::parse_scopes;
use crate::errors::FulcrumError;
use crate::jwks::JwksManager;
use crate::settings::{Settings, Tokens};
use crate::storage;
use async_trait::async_trait;
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use josekit::jwt::JwtPayload;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::time::{Duration, UNIX_EPOCH};

/// Successful token endpoint response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSet {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Issued(TokenSet),
    /// Unknown, expired, revoked or foreign refresh token.
    InvalidGrant,
    /// Requested scope exceeds the original grant.
    InvalidScope,
}

/// Mints tokens for an approved grant.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &[String],
        auth_time: Option<i64>,
    ) -> Result<TokenSet, FulcrumError>;

    /// `requested_scopes = None` keeps the original grant's scopes.
    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        requested_scopes: Option<&[String]>,
    ) -> Result<RefreshOutcome, FulcrumError>;
}

/// Opaque access/refresh tokens in the database and RS256 ID tokens.
#[derive(Clone)]
pub struct JwtTokenIssuer {
    db: DatabaseConnection,
    jwks: JwksManager,
    issuer: String,
    ttl: Tokens,
}

impl JwtTokenIssuer {
    pub fn new(db: DatabaseConnection, jwks: JwksManager, settings: &Settings) -> Self {
        Self {
            db,
            jwks,
            issuer: settings.issuer(),
            ttl: settings.tokens.clone(),
        }
    }

    fn build_id_token(
        &self,
        client_id: &str,
        subject: &str,
        auth_time: Option<i64>,
        access_token: &str,
    ) -> Result<String, FulcrumError> {
        let now = Utc::now().timestamp();

        let mut payload = JwtPayload::new();
        payload.set_issuer(&self.issuer);
        payload.set_subject(subject);
        payload.set_audience(vec![client_id]);
        payload.set_issued_at(&(UNIX_EPOCH + Duration::from_secs(now.max(0) as u64)));
        payload.set_claim("exp", Some(json!(now + self.ttl.id_token_ttl_secs)))?;

        if let Some(at) = auth_time {
            payload.set_claim("auth_time", Some(json!(at)))?;
        }

        payload.set_claim("at_hash", Some(Value::String(at_hash(access_token))))?;

        self.jwks.sign_jwt_rs256(&payload)
    }

    async fn mint(
        &self,
        subject: &str,
        client_id: &str,
        scope: &str,
        auth_time: Option<i64>,
        refresh_token: String,
    ) -> Result<TokenSet, FulcrumError> {
        let access = storage::issue_access_token(
            &self.db,
            client_id,
            subject,
            scope,
            self.ttl.access_token_ttl_secs,
        )
        .await?;

        let id_token = if scope.split_whitespace().any(|s| s == "openid") {
            Some(self.build_id_token(client_id, subject, auth_time, &access.token)?)
        } else {
            None
        };

        Ok(TokenSet {
            access_token: access.token,
            token_type: "Bearer".to_string(),
            expires_in: self.ttl.access_token_ttl_secs,
            refresh_token: Some(refresh_token),
            id_token,
            scope: scope.to_string(),
        })
    }
}

/// Left-most 128 bits of SHA-256 over the access token, base64url.
pub fn at_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    Base64UrlUnpadded::encode_string(&digest[..16])
}

#[async_trait]
impl TokenIssuer for JwtTokenIssuer {
    async fn issue(
        &self,
        subject: &str,
        client_id: &str,
        scopes: &[String],
        auth_time: Option<i64>,
    ) -> Result<TokenSet, FulcrumError> {
        let scope = scopes.join(" ");
        let refresh = storage::issue_refresh_token(
            &self.db,
            client_id,
            subject,
            &scope,
            self.ttl.refresh_token_ttl_secs,
            None,
        )
        .await?;

        self.mint(subject, client_id, &scope, auth_time, refresh.token)
            .await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        requested_scopes: Option<&[String]>,
    ) -> Result<RefreshOutcome, FulcrumError> {
        let Some(current) = storage::get_refresh_token(&self.db, refresh_token).await? else {
            return Ok(RefreshOutcome::InvalidGrant);
        };
        if current.client_id != client_id {
            return Ok(RefreshOutcome::InvalidGrant);
        }

        let granted = parse_scopes(&current.scope);
        let scope = match requested_scopes {
            Some(requested) if !requested.is_empty() => {
                if !requested.iter().all(|s| granted.contains(s)) {
                    return Ok(RefreshOutcome::InvalidScope);
                }
                requested.join(" ")
            }
            _ => current.scope.clone(),
        };

        // The successor keeps the original grant so a narrowed refresh can
        // later widen back to it.
        let Some(next) = storage::rotate_refresh_token(
            &self.db,
            refresh_token,
            client_id,
            &current.subject,
            &current.scope,
            self.ttl.refresh_token_ttl_secs,
        )
        .await?
        else {
            return Ok(RefreshOutcome::InvalidGrant);
        };

        let tokens = self
            .mint(&current.subject, client_id, &scope, None, next.token)
            .await?;
        Ok(RefreshOutcome::Issued(tokens))
    }
}

/// Claims for `/userinfo`, gated by the access token's scope.
pub fn userinfo_claims(user: &storage::User, scope: &str) -> Map<String, Value> {
    let scopes = parse_scopes(scope);
    let mut claims = Map::new();
    claims.insert("sub".to_string(), Value::String(user.subject.clone()));

    if scopes.iter().any(|s| s == "profile") {
        claims.insert(
            "preferred_username".to_string(),
            Value::String(user.username.clone()),
        );
        claims.insert("name".to_string(), Value::String(user.username.clone()));
    }

    if scopes.iter().any(|s| s == "email") {
        if let Some(email) = &user.email {
            claims.insert("email".to_string(), Value::String(email.clone()));
            claims.insert(
                "email_verified".to_string(),
                Value::Bool(user.email_verified != 0),
            );
        }
    }

    claims
}
