pub mod access_token;
pub mod client;
pub mod device_authorization;
pub mod job_execution;
pub mod refresh_token;
pub mod user;
pub mod user_code_attempt;

pub use access_token::Entity as AccessToken;
pub use client::Entity as Client;
pub use device_authorization::Entity as DeviceAuthorization;
pub use job_execution::Entity as JobExecution;
pub use refresh_token::Entity as RefreshToken;
pub use user::Entity as User;
pub use user_code_attempt::Entity as UserCodeAttempt;
