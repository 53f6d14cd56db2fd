//! OAuth 2.0 Device Authorization Grant (RFC 8628).
//!
//! A record moves PENDING -> APPROVED | DENIED, and APPROVED -> REDEEMED
//! exactly once. Expiry is evaluated lazily against `expires_at`; every
//! status change is a compare-and-transition in the store.

pub mod clock;
pub mod codes;
pub mod endpoint;
pub mod guard;
pub mod machine;
pub mod polling;
pub mod record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use endpoint::{DeviceTokenEndpoint, PollOutcome, TokenErrorCode};
pub use guard::{BruteForceGuard, BruteForcePolicy, SeaAttemptStore};
pub use machine::{AuthorizationStateMachine, RedeemOutcome, StartRequest, UserCodeLookup};
pub use polling::PollingPolicy;
pub use record::{
    ClientAuthMethod, ClientAuthentication, DeviceAuthorizationRecord, DeviceInfo, DeviceStatus,
    RecordId,
};
pub use store::{DeviceAuthorizationStore, SeaDeviceStore};
