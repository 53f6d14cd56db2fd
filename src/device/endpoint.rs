use crate::device::machine::{AuthorizationStateMachine, RedeemOutcome};
use crate::device::polling::PollDecision;
use crate::device::record::{DeviceStatus, RecordMutation};
use crate::errors::FulcrumError;
use crate::tokens::TokenSet;
use axum::http::StatusCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Re-reads allowed when another poller changes the record under us.
const MAX_POLL_RACES: usize = 4;

/// OAuth error codes returned by the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorCode {
    AuthorizationPending,
    SlowDown,
    AccessDenied,
    ExpiredToken,
    InvalidGrant,
    InvalidClient,
    InvalidRequest,
    InvalidScope,
    UnsupportedGrantType,
}

impl TokenErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenErrorCode::AuthorizationPending => "authorization_pending",
            TokenErrorCode::SlowDown => "slow_down",
            TokenErrorCode::AccessDenied => "access_denied",
            TokenErrorCode::ExpiredToken => "expired_token",
            TokenErrorCode::InvalidGrant => "invalid_grant",
            TokenErrorCode::InvalidClient => "invalid_client",
            TokenErrorCode::InvalidRequest => "invalid_request",
            TokenErrorCode::InvalidScope => "invalid_scope",
            TokenErrorCode::UnsupportedGrantType => "unsupported_grant_type",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TokenErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            TokenErrorCode::AuthorizationPending => "User has not yet authorized the device",
            TokenErrorCode::SlowDown => "Polling too frequently",
            TokenErrorCode::AccessDenied => "User denied the authorization request",
            TokenErrorCode::ExpiredToken => "device_code expired or invalid",
            TokenErrorCode::InvalidGrant => "Grant is invalid or was already used",
            TokenErrorCode::InvalidClient => "Client authentication failed",
            TokenErrorCode::InvalidRequest => "Request is missing a required parameter",
            TokenErrorCode::InvalidScope => "Requested scope exceeds the original grant",
            TokenErrorCode::UnsupportedGrantType => "grant_type is not supported",
        }
    }
}

/// Result of one device_code poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Tokens(TokenSet),
    AuthorizationPending,
    /// `interval` is the record's interval after the bump.
    SlowDown { interval: i64 },
    AccessDenied,
    ExpiredToken,
}

impl PollOutcome {
    pub fn error_code(&self) -> Option<TokenErrorCode> {
        match self {
            PollOutcome::Tokens(_) => None,
            PollOutcome::AuthorizationPending => Some(TokenErrorCode::AuthorizationPending),
            PollOutcome::SlowDown { .. } => Some(TokenErrorCode::SlowDown),
            PollOutcome::AccessDenied => Some(TokenErrorCode::AccessDenied),
            PollOutcome::ExpiredToken => Some(TokenErrorCode::ExpiredToken),
        }
    }
}

/// Token-endpoint side of the device flow. The caller has already
/// authenticated `client_id`.
#[derive(Clone)]
pub struct DeviceTokenEndpoint {
    machine: Arc<AuthorizationStateMachine>,
}

impl DeviceTokenEndpoint {
    pub fn new(machine: Arc<AuthorizationStateMachine>) -> Self {
        Self { machine }
    }

    pub async fn poll(&self, device_code: &str, client_id: &str) -> Result<PollOutcome, FulcrumError> {
        let store = self.machine.store();

        for _ in 0..MAX_POLL_RACES {
            let now = self.machine.now();

            let Some(record) = store.find_by_device_code(device_code).await? else {
                return Ok(PollOutcome::ExpiredToken);
            };
            // Ownership first, so a foreign client learns nothing about state
            if record.client_id != client_id {
                warn!(client_id = %client_id, "device_code presented by another client");
                return Ok(PollOutcome::ExpiredToken);
            }

            let status = record.effective_status(now);
            match status {
                DeviceStatus::Expired | DeviceStatus::Redeemed => {
                    return Ok(PollOutcome::ExpiredToken)
                }
                DeviceStatus::Denied => return Ok(PollOutcome::AccessDenied),
                DeviceStatus::Pending | DeviceStatus::Approved => {}
            }

            let decision =
                self.machine
                    .polling()
                    .evaluate(record.last_poll_at, record.poll_interval, now);
            let interval = match decision {
                PollDecision::Proceed => record.poll_interval,
                PollDecision::SlowDown { new_interval } => new_interval,
            };

            let recorded = store
                .compare_and_transition(
                    record.id,
                    status,
                    status,
                    RecordMutation::poll(record.last_poll_at, now, interval),
                    now,
                )
                .await?;
            if !recorded {
                debug!(record_id = %record.id, "concurrent poll, re-reading");
                continue;
            }

            if let PollDecision::SlowDown { new_interval } = decision {
                info!(
                    client_id = %client_id,
                    record_id = %record.id,
                    interval = new_interval,
                    "slow_down"
                );
                return Ok(PollOutcome::SlowDown {
                    interval: new_interval,
                });
            }

            if status == DeviceStatus::Pending {
                return Ok(PollOutcome::AuthorizationPending);
            }

            return Ok(match self.machine.redeem_for_tokens(device_code).await? {
                RedeemOutcome::Issued(tokens) => PollOutcome::Tokens(tokens),
                RedeemOutcome::Pending => PollOutcome::AuthorizationPending,
                RedeemOutcome::Denied => PollOutcome::AccessDenied,
                RedeemOutcome::Expired => PollOutcome::ExpiredToken,
            });
        }

        self.contended_slow_down(device_code, client_id).await
    }

    /// Every guarded write lost to another poller of the same code: charge a
    /// slow_down without the last-poll guard so the bump is persisted.
    async fn contended_slow_down(
        &self,
        device_code: &str,
        client_id: &str,
    ) -> Result<PollOutcome, FulcrumError> {
        let store = self.machine.store();

        // An unguarded write only fails when the status moves, which happens
        // at most twice before the record is terminal.
        loop {
            let now = self.machine.now();
            let Some(record) = store.find_by_device_code(device_code).await? else {
                return Ok(PollOutcome::ExpiredToken);
            };

            let status = record.effective_status(now);
            match status {
                DeviceStatus::Expired | DeviceStatus::Redeemed => {
                    return Ok(PollOutcome::ExpiredToken)
                }
                DeviceStatus::Denied => return Ok(PollOutcome::AccessDenied),
                DeviceStatus::Pending | DeviceStatus::Approved => {}
            }

            let interval = self.machine.polling().bump(record.poll_interval);
            if store
                .compare_and_transition(
                    record.id,
                    status,
                    status,
                    RecordMutation::slow_down(now, interval),
                    now,
                )
                .await?
            {
                warn!(
                    client_id = %client_id,
                    record_id = %record.id,
                    interval,
                    "slow_down after contended polls"
                );
                return Ok(PollOutcome::SlowDown { interval });
            }
        }
    }
}
