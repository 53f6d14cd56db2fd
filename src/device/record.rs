use crate::entities;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Redeemed,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Approved => "approved",
            DeviceStatus::Denied => "denied",
            DeviceStatus::Expired => "expired",
            DeviceStatus::Redeemed => "redeemed",
        }
    }

    /// Unknown strings read from storage count as expired so a corrupt row can
    /// never be redeemed.
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => DeviceStatus::Pending,
            "approved" => DeviceStatus::Approved,
            "denied" => DeviceStatus::Denied,
            "redeemed" => DeviceStatus::Redeemed,
            _ => DeviceStatus::Expired,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the client proved its identity when it started the authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
}

impl ClientAuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientAuthMethod::ClientSecretBasic => "client_secret_basic",
            ClientAuthMethod::ClientSecretPost => "client_secret_post",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "client_secret_basic" => Some(ClientAuthMethod::ClientSecretBasic),
            "client_secret_post" => Some(ClientAuthMethod::ClientSecretPost),
            _ => None,
        }
    }
}

/// Method plus the client the credential belongs to. The secret itself is
/// never stored on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuthentication {
    pub client_id: String,
    pub method: ClientAuthMethod,
}

/// Requesting device context, shown to the user on the consent page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything needed to insert a new PENDING record.
#[derive(Debug, Clone)]
pub struct NewDeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub client: ClientAuthentication,
    pub client_name: Option<String>,
    pub scopes: Vec<String>,
    pub device_info: Option<DeviceInfo>,
    pub created_at: i64,
    pub expires_at: i64,
    pub poll_interval: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorizationRecord {
    pub id: RecordId,
    pub device_code: String,
    pub user_code: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub scopes: Vec<String>,
    pub client_auth_method: Option<ClientAuthMethod>,
    pub device_info: Option<DeviceInfo>,
    /// Stored status; use [`Self::effective_status`] for decisions.
    pub status: DeviceStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_poll_at: Option<i64>,
    pub poll_interval: i64,
    pub approved_subject: Option<String>,
    pub auth_time: Option<i64>,
    pub redeemed_at: Option<i64>,
}

impl DeviceAuthorizationRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Lazy expiry: past `expires_at` every record reads as EXPIRED whatever
    /// the stored status says.
    pub fn effective_status(&self, now: i64) -> DeviceStatus {
        if self.is_expired(now) {
            DeviceStatus::Expired
        } else {
            self.status
        }
    }

    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    pub fn expires_in(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

impl From<entities::device_authorization::Model> for DeviceAuthorizationRecord {
    fn from(model: entities::device_authorization::Model) -> Self {
        let device_info = model
            .device_info
            .as_deref()
            .and_then(|raw| serde_json::from_str::<DeviceInfo>(raw).ok());

        Self {
            id: RecordId(model.id),
            device_code: model.device_code,
            user_code: model.user_code,
            client_id: model.client_id,
            client_name: model.client_name,
            scopes: parse_scopes(&model.scope),
            client_auth_method: ClientAuthMethod::parse(&model.client_auth_method),
            device_info,
            status: DeviceStatus::parse(&model.status),
            created_at: model.created_at,
            expires_at: model.expires_at,
            last_poll_at: model.last_poll_at,
            poll_interval: model.poll_interval,
            approved_subject: model.approved_subject,
            auth_time: model.auth_time,
            redeemed_at: model.redeemed_at,
        }
    }
}

/// Column changes applied together with a status transition.
///
/// `None` leaves a column untouched. `if_last_poll_at` is an extra
/// precondition: the transition only applies while the stored `last_poll_at`
/// still equals it, which serialises concurrent pollers of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordMutation {
    pub approved_subject: Option<String>,
    pub auth_time: Option<i64>,
    pub last_poll_at: Option<i64>,
    pub poll_interval: Option<i64>,
    pub redeemed_at: Option<i64>,
    pub if_last_poll_at: Option<Option<i64>>,
}

impl RecordMutation {
    pub fn approve(subject: &str, auth_time: i64) -> Self {
        Self {
            approved_subject: Some(subject.to_string()),
            auth_time: Some(auth_time),
            ..Default::default()
        }
    }

    pub fn poll(observed_last_poll_at: Option<i64>, now: i64, interval: i64) -> Self {
        Self {
            last_poll_at: Some(now),
            poll_interval: Some(interval),
            if_last_poll_at: Some(observed_last_poll_at),
            ..Default::default()
        }
    }

    /// Record an early poll without checking who polled last.
    pub fn slow_down(now: i64, interval: i64) -> Self {
        Self {
            last_poll_at: Some(now),
            poll_interval: Some(interval),
            ..Default::default()
        }
    }

    pub fn redeem(now: i64) -> Self {
        Self {
            redeemed_at: Some(now),
            ..Default::default()
        }
    }
}

/// Split a space-delimited scope parameter into an ordered set: first
/// occurrence wins, empty entries dropped.
pub fn parse_scopes(scope: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for s in scope.split_whitespace() {
        if !scopes.iter().any(|existing| existing == s) {
            scopes.push(s.to_string());
        }
    }
    scopes
}
