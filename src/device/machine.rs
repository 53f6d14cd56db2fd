use crate::device::clock::Clock;
use crate::device::codes::{normalize_user_code, CodeGenerator, RandomCodeGenerator};
use crate::device::guard::{Admission, BruteForceGuard};
use crate::device::polling::PollingPolicy;
use crate::device::record::{
    ClientAuthentication, DeviceAuthorizationRecord, DeviceInfo, DeviceStatus,
    NewDeviceAuthorization, RecordId, RecordMutation,
};
use crate::device::store::{DeviceAuthorizationStore, InsertOutcome};
use crate::errors::{DeviceFlowError, FulcrumError};
use crate::settings::Settings;
use crate::tokens::{TokenIssuer, TokenSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Input for a new device authorization, after client authentication.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub client: ClientAuthentication,
    pub client_name: Option<String>,
    pub scopes: Vec<String>,
    pub device_info: Option<DeviceInfo>,
}

/// What the verification page learns from a submitted user_code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCodeLookup {
    /// Not a user_code shape; the guard was not charged.
    InvalidFormat,
    /// No pending, unexpired record under this code.
    NotFound,
    TooManyAttempts { retry_after: i64 },
    Found(DeviceAuthorizationRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Issued(TokenSet),
    Pending,
    Denied,
    /// Expired, already redeemed, or never existed.
    Expired,
}

/// Orchestrates every transition of a device authorization record.
#[derive(Clone)]
pub struct AuthorizationStateMachine {
    store: Arc<dyn DeviceAuthorizationStore>,
    codes: Arc<dyn CodeGenerator>,
    guard: BruteForceGuard,
    polling: PollingPolicy,
    issuer: Arc<dyn TokenIssuer>,
    clock: Arc<dyn Clock>,
    code_ttl_secs: i64,
    code_generation_attempts: u32,
    retention_secs: i64,
}

impl AuthorizationStateMachine {
    pub fn new(
        settings: &Settings,
        store: Arc<dyn DeviceAuthorizationStore>,
        guard: BruteForceGuard,
        issuer: Arc<dyn TokenIssuer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            codes: Arc::new(RandomCodeGenerator),
            guard,
            polling: PollingPolicy::from(&settings.device),
            issuer,
            clock,
            code_ttl_secs: settings.device.code_ttl_secs,
            code_generation_attempts: settings.device.code_generation_attempts.max(1),
            retention_secs: settings.device.retention_secs,
        }
    }

    pub fn with_code_generator(mut self, codes: Arc<dyn CodeGenerator>) -> Self {
        self.codes = codes;
        self
    }

    pub fn store(&self) -> &Arc<dyn DeviceAuthorizationStore> {
        &self.store
    }

    pub fn polling(&self) -> &PollingPolicy {
        &self.polling
    }

    pub fn guard(&self) -> &BruteForceGuard {
        &self.guard
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Create a PENDING record with fresh codes, regenerating on collision.
    pub async fn start(
        &self,
        request: StartRequest,
    ) -> Result<DeviceAuthorizationRecord, DeviceFlowError> {
        let now = self.clock.now();

        for attempt in 1..=self.code_generation_attempts {
            let new = NewDeviceAuthorization {
                device_code: self.codes.device_code(),
                user_code: self.codes.user_code(),
                client: request.client.clone(),
                client_name: request.client_name.clone(),
                scopes: request.scopes.clone(),
                device_info: request.device_info.clone(),
                created_at: now,
                expires_at: now + self.code_ttl_secs,
                poll_interval: self.polling.initial_interval,
            };

            match self.store.insert(new).await? {
                InsertOutcome::Created(record) => {
                    info!(
                        client_id = %record.client_id,
                        record_id = %record.id,
                        interval = record.poll_interval,
                        "Device authorization created"
                    );
                    return Ok(record);
                }
                InsertOutcome::Collision => {
                    warn!(attempt, "user_code collision, regenerating");
                }
            }
        }

        error!(
            attempts = self.code_generation_attempts,
            "Could not allocate a unique user_code"
        );
        Err(DeviceFlowError::CodeSpaceExhausted {
            attempts: self.code_generation_attempts,
        })
    }

    /// Resolve a typed user_code behind the brute-force guard.
    pub async fn resolve_user_code(
        &self,
        context_key: &str,
        raw: &str,
    ) -> Result<UserCodeLookup, FulcrumError> {
        let Some(user_code) = normalize_user_code(raw) else {
            return Ok(UserCodeLookup::InvalidFormat);
        };

        let now = self.clock.now();
        if let Admission::Locked { retry_after } = self.guard.admit(context_key, now).await? {
            return Ok(UserCodeLookup::TooManyAttempts { retry_after });
        }

        match self.store.find_by_user_code(&user_code, now).await? {
            Some(record) => {
                self.guard.reset(context_key).await?;
                Ok(UserCodeLookup::Found(record))
            }
            None => Ok(UserCodeLookup::NotFound),
        }
    }

    /// Resolve the record a consent form refers to. The user_code must match
    /// the record; unlike [`Self::resolve_user_code`] any status is returned
    /// so a repeated submission can be answered idempotently.
    pub async fn resolve_reference(
        &self,
        context_key: &str,
        id: RecordId,
        raw_user_code: &str,
    ) -> Result<UserCodeLookup, FulcrumError> {
        let Some(user_code) = normalize_user_code(raw_user_code) else {
            return Ok(UserCodeLookup::InvalidFormat);
        };

        let now = self.clock.now();
        if let Admission::Locked { retry_after } = self.guard.admit(context_key, now).await? {
            return Ok(UserCodeLookup::TooManyAttempts { retry_after });
        }

        match self.store.find_by_id(id).await? {
            Some(record) if record.user_code == user_code && !record.is_expired(now) => {
                self.guard.reset(context_key).await?;
                Ok(UserCodeLookup::Found(record))
            }
            _ => Ok(UserCodeLookup::NotFound),
        }
    }

    /// PENDING -> APPROVED, binding `subject`. Approving again as the same
    /// subject succeeds without change.
    pub async fn approve(
        &self,
        id: RecordId,
        subject: &str,
        auth_time: i64,
    ) -> Result<(), DeviceFlowError> {
        let now = self.clock.now();
        let moved = self
            .store
            .compare_and_transition(
                id,
                DeviceStatus::Pending,
                DeviceStatus::Approved,
                RecordMutation::approve(subject, auth_time),
                now,
            )
            .await?;

        if moved {
            info!(record_id = %id, "Device authorization approved");
            return Ok(());
        }

        let Some(current) = self.store.find_by_id(id).await? else {
            return Err(DeviceFlowError::NotPending);
        };
        match current.effective_status(now) {
            DeviceStatus::Approved if current.approved_subject.as_deref() == Some(subject) => {
                Ok(())
            }
            DeviceStatus::Approved | DeviceStatus::Denied => {
                warn!(record_id = %id, status = %current.status, "Conflicting approval");
                Err(DeviceFlowError::Conflict)
            }
            DeviceStatus::Pending | DeviceStatus::Expired | DeviceStatus::Redeemed => {
                Err(DeviceFlowError::NotPending)
            }
        }
    }

    /// PENDING -> DENIED. Denying twice is a no-op.
    pub async fn deny(&self, id: RecordId) -> Result<(), DeviceFlowError> {
        let now = self.clock.now();
        let moved = self
            .store
            .compare_and_transition(
                id,
                DeviceStatus::Pending,
                DeviceStatus::Denied,
                RecordMutation::default(),
                now,
            )
            .await?;

        if moved {
            info!(record_id = %id, "Device authorization denied");
            return Ok(());
        }

        let Some(current) = self.store.find_by_id(id).await? else {
            return Err(DeviceFlowError::NotPending);
        };
        match current.effective_status(now) {
            DeviceStatus::Denied => Ok(()),
            DeviceStatus::Approved | DeviceStatus::Redeemed => {
                warn!(record_id = %id, status = %current.status, "Conflicting denial");
                Err(DeviceFlowError::Conflict)
            }
            DeviceStatus::Pending | DeviceStatus::Expired => Err(DeviceFlowError::NotPending),
        }
    }

    /// APPROVED -> REDEEMED, then mint tokens for the bound subject.
    ///
    /// The record stays REDEEMED when the issuer fails; the device has to
    /// start over.
    pub async fn redeem_for_tokens(&self, device_code: &str) -> Result<RedeemOutcome, FulcrumError> {
        let now = self.clock.now();
        let Some(record) = self.store.find_by_device_code(device_code).await? else {
            return Ok(RedeemOutcome::Expired);
        };

        let moved = self
            .store
            .compare_and_transition(
                record.id,
                DeviceStatus::Approved,
                DeviceStatus::Redeemed,
                RecordMutation::redeem(now),
                now,
            )
            .await?;

        if !moved {
            let current = self.store.find_by_id(record.id).await?;
            return Ok(match current.map(|r| r.effective_status(now)) {
                Some(DeviceStatus::Pending) => RedeemOutcome::Pending,
                Some(DeviceStatus::Denied) => RedeemOutcome::Denied,
                _ => RedeemOutcome::Expired,
            });
        }

        let Some(subject) = record.approved_subject.as_deref() else {
            error!(record_id = %record.id, "Approved record without subject");
            return Err(FulcrumError::Other(
                "approved device authorization has no subject".to_string(),
            ));
        };

        match self
            .issuer
            .issue(subject, &record.client_id, &record.scopes, record.auth_time)
            .await
        {
            Ok(tokens) => {
                info!(
                    client_id = %record.client_id,
                    record_id = %record.id,
                    "Device authorization redeemed"
                );
                Ok(RedeemOutcome::Issued(tokens))
            }
            Err(e) => {
                error!(record_id = %record.id, error = %e, "Token issuance failed after redemption");
                Err(e)
            }
        }
    }

    /// Delete records whose retention has elapsed.
    pub async fn reclaim(&self) -> Result<u64, FulcrumError> {
        let now = self.clock.now();
        self.store.reclaim(now, self.retention_secs).await
    }
}
