use crate::entities;
use crate::errors::FulcrumError;
use crate::settings::BruteForce;
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tracing::warn;

/// Optimistic update attempts before the guard gives up and rejects.
const MAX_CAS_RETRIES: usize = 8;

/// Sliding-window lockout over user_code submissions for one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BruteForcePolicy {
    pub max_failures: u32,
    pub window_secs: i64,
    pub cooldown_secs: i64,
}

impl From<&BruteForce> for BruteForcePolicy {
    fn from(cfg: &BruteForce) -> Self {
        Self {
            max_failures: cfg.max_failures,
            window_secs: cfg.window_secs,
            cooldown_secs: cfg.cooldown_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptState {
    /// Unmatched submissions inside the window, oldest first.
    pub failures: Vec<i64>,
    pub locked_until: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Locked { retry_after: i64 },
}

impl BruteForcePolicy {
    /// Count one more submission at `now` and decide whether it may proceed.
    ///
    /// Every admitted submission is charged up front; a successful match
    /// clears the state afterwards. With `max_failures = N` the first N
    /// submissions are admitted and submission N+1 starts the cooldown.
    pub fn admit(&self, state: &AttemptState, now: i64) -> (AttemptState, Admission) {
        if let Some(until) = state.locked_until {
            if until > now {
                return (state.clone(), Admission::Locked { retry_after: until - now });
            }
        }

        let window_start = now - self.window_secs;
        let mut failures: Vec<i64> = match state.locked_until {
            // cooldown over: start from a clean slate
            Some(until) if until <= now => Vec::new(),
            _ => state
                .failures
                .iter()
                .copied()
                .filter(|t| *t > window_start)
                .collect(),
        };
        failures.push(now);

        if failures.len() > self.max_failures as usize {
            let locked_until = now + self.cooldown_secs;
            (
                AttemptState {
                    failures,
                    locked_until: Some(locked_until),
                },
                Admission::Locked {
                    retry_after: self.cooldown_secs,
                },
            )
        } else {
            (
                AttemptState {
                    failures,
                    locked_until: None,
                },
                Admission::Allowed,
            )
        }
    }
}

/// Stored counter row plus the version its next update must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedAttempts {
    pub state: AttemptState,
    pub version: i64,
}

#[async_trait]
pub trait AttemptCounterStore: Send + Sync {
    async fn load(&self, context_key: &str) -> Result<Option<VersionedAttempts>, FulcrumError>;

    /// Create the row; `false` when another writer created it first.
    async fn insert_if_absent(
        &self,
        context_key: &str,
        state: &AttemptState,
        now: i64,
    ) -> Result<bool, FulcrumError>;

    /// Overwrite the row if its version is still `expected_version`.
    async fn replace_if_version(
        &self,
        context_key: &str,
        expected_version: i64,
        state: &AttemptState,
        now: i64,
    ) -> Result<bool, FulcrumError>;

    async fn delete(&self, context_key: &str) -> Result<(), FulcrumError>;

    /// Remove rows untouched since `before`.
    async fn purge_stale(&self, before: i64) -> Result<u64, FulcrumError>;
}

#[derive(Clone)]
pub struct SeaAttemptStore {
    db: DatabaseConnection,
}

impl SeaAttemptStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AttemptCounterStore for SeaAttemptStore {
    async fn load(&self, context_key: &str) -> Result<Option<VersionedAttempts>, FulcrumError> {
        let Some(row) = entities::UserCodeAttempt::find_by_id(context_key.to_string())
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        let failures: Vec<i64> = serde_json::from_str(&row.failures)?;
        Ok(Some(VersionedAttempts {
            state: AttemptState {
                failures,
                locked_until: row.locked_until,
            },
            version: row.version,
        }))
    }

    async fn insert_if_absent(
        &self,
        context_key: &str,
        state: &AttemptState,
        now: i64,
    ) -> Result<bool, FulcrumError> {
        use entities::user_code_attempt::{ActiveModel, Column, Entity};

        let row = ActiveModel {
            context_key: Set(context_key.to_string()),
            failures: Set(serde_json::to_string(&state.failures)?),
            locked_until: Set(state.locked_until),
            version: Set(0),
            updated_at: Set(now),
        };

        let inserted = Entity::insert(row)
            .on_conflict(OnConflict::column(Column::ContextKey).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;
        Ok(inserted == 1)
    }

    async fn replace_if_version(
        &self,
        context_key: &str,
        expected_version: i64,
        state: &AttemptState,
        now: i64,
    ) -> Result<bool, FulcrumError> {
        use entities::user_code_attempt::{Column, Entity};

        let result = Entity::update_many()
            .col_expr(
                Column::Failures,
                Expr::value(serde_json::to_string(&state.failures)?),
            )
            .col_expr(Column::LockedUntil, Expr::value(state.locked_until))
            .col_expr(Column::Version, Expr::value(expected_version + 1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::ContextKey.eq(context_key))
            .filter(Column::Version.eq(expected_version))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn delete(&self, context_key: &str) -> Result<(), FulcrumError> {
        entities::UserCodeAttempt::delete_by_id(context_key.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn purge_stale(&self, before: i64) -> Result<u64, FulcrumError> {
        use entities::user_code_attempt::{Column, Entity};

        let result = Entity::delete_many()
            .filter(Column::UpdatedAt.lt(before))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

/// Shared brute-force guard in front of user_code lookup.
#[derive(Clone)]
pub struct BruteForceGuard {
    policy: BruteForcePolicy,
    store: Arc<dyn AttemptCounterStore>,
}

impl BruteForceGuard {
    pub fn new(policy: BruteForcePolicy, store: Arc<dyn AttemptCounterStore>) -> Self {
        Self { policy, store }
    }

    pub fn policy(&self) -> &BruteForcePolicy {
        &self.policy
    }

    /// Charge one submission for `context_key` and report whether it may be
    /// looked up. Concurrent callers are serialised by the row version, so
    /// no two of them can both consume the last allowed attempt.
    pub async fn admit(&self, context_key: &str, now: i64) -> Result<Admission, FulcrumError> {
        for _ in 0..MAX_CAS_RETRIES {
            match self.store.load(context_key).await? {
                None => {
                    let (state, verdict) = self.policy.admit(&AttemptState::default(), now);
                    if self.store.insert_if_absent(context_key, &state, now).await? {
                        return Ok(verdict);
                    }
                }
                Some(current) => {
                    let (state, verdict) = self.policy.admit(&current.state, now);
                    if let Admission::Locked { .. } = verdict {
                        if state == current.state {
                            // still cooling down, nothing to write
                            return Ok(verdict);
                        }
                    }
                    if self
                        .store
                        .replace_if_version(context_key, current.version, &state, now)
                        .await?
                    {
                        if let Admission::Locked { retry_after } = verdict {
                            warn!(context = %context_key, retry_after, "user_code entry locked");
                        }
                        return Ok(verdict);
                    }
                }
            }
        }

        warn!(context = %context_key, "attempt counter contention, rejecting submission");
        Ok(Admission::Locked { retry_after: 1 })
    }

    /// Clear the counter after a matching user_code.
    pub async fn reset(&self, context_key: &str) -> Result<(), FulcrumError> {
        self.store.delete(context_key).await
    }

    /// Drop counters idle for longer than a full window plus cooldown.
    pub async fn purge_stale(&self, now: i64) -> Result<u64, FulcrumError> {
        let idle = self.policy.window_secs.max(0) + self.policy.cooldown_secs.max(0);
        self.store.purge_stale(now - idle).await
    }
}
