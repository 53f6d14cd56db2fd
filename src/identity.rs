use crate::errors::FulcrumError;
use crate::storage;
use async_trait::async_trait;
use sea_orm::DatabaseConnection;

/// Checks end-user credentials on the verification page.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Subject for valid credentials, `None` when denied.
    async fn authenticate(&self, user_id: &str, secret: &str)
        -> Result<Option<String>, FulcrumError>;
}

/// Local users table with Argon2 password hashes.
#[derive(Clone)]
pub struct DbIdentityVerifier {
    db: DatabaseConnection,
}

impl DbIdentityVerifier {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityVerifier for DbIdentityVerifier {
    async fn authenticate(
        &self,
        user_id: &str,
        secret: &str,
    ) -> Result<Option<String>, FulcrumError> {
        if user_id.is_empty() || secret.is_empty() {
            return Ok(None);
        }
        storage::verify_user_password(&self.db, user_id, secret).await
    }
}
