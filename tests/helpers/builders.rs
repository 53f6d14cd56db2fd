use fulcrum::storage;
use sea_orm::DatabaseConnection;

/// Builder for creating test users
pub struct UserBuilder {
    username: String,
    password: String,
    email: Option<String>,
    enabled: bool,
}

impl UserBuilder {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            password: "password123".to_string(),
            email: None,
            enabled: true,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::User {
        let mut user = storage::create_user(db, &self.username, &self.password, self.email)
            .await
            .expect("Failed to create test user");

        if !self.enabled {
            storage::set_user_enabled(db, &user.subject, false)
                .await
                .expect("Failed to disable test user");
            user.enabled = 0;
        }

        user
    }
}

/// Builder for creating test OAuth clients
pub struct ClientBuilder {
    client_name: Option<String>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            client_name: Some("Test Device".to_string()),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.client_name = Some(name.to_string());
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> storage::Client {
        storage::create_client(db, self.client_name)
            .await
            .expect("Failed to create test client")
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
