use crate::device::record::{
    DeviceAuthorizationRecord, DeviceStatus, NewDeviceAuthorization, RecordId, RecordMutation,
};
use crate::entities;
use crate::errors::FulcrumError;
use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, SqlErr,
};

/// Result of inserting a new authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(DeviceAuthorizationRecord),
    /// device_code or active user_code already taken; caller regenerates.
    Collision,
}

/// Persistence for device authorizations.
///
/// Every status change goes through [`Self::compare_and_transition`], which
/// must be atomic per record: of several concurrent callers with the same
/// expected status, at most one observes `true`.
#[async_trait]
pub trait DeviceAuthorizationStore: Send + Sync {
    async fn insert(&self, new: NewDeviceAuthorization) -> Result<InsertOutcome, FulcrumError>;

    async fn find_by_id(&self, id: RecordId)
        -> Result<Option<DeviceAuthorizationRecord>, FulcrumError>;

    async fn find_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError>;

    /// Only PENDING records that have not expired at `now` are returned.
    async fn find_by_user_code(
        &self,
        user_code: &str,
        now: i64,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError>;

    /// Move `id` from `expected` to `new` and apply `mutation`, provided the
    /// stored status is still `expected` and the record is unexpired at `now`.
    async fn compare_and_transition(
        &self,
        id: RecordId,
        expected: DeviceStatus,
        new: DeviceStatus,
        mutation: RecordMutation,
        now: i64,
    ) -> Result<bool, FulcrumError>;

    /// Delete records whose retention has elapsed. Returns the number removed.
    async fn reclaim(&self, now: i64, retention_secs: i64) -> Result<u64, FulcrumError>;
}

#[derive(Clone)]
pub struct SeaDeviceStore {
    db: DatabaseConnection,
}

impl SeaDeviceStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[async_trait]
impl DeviceAuthorizationStore for SeaDeviceStore {
    async fn insert(&self, new: NewDeviceAuthorization) -> Result<InsertOutcome, FulcrumError> {
        let device_info = match &new.device_info {
            Some(info) => Some(serde_json::to_string(info)?),
            None => None,
        };

        let model = entities::device_authorization::ActiveModel {
            device_code: Set(new.device_code),
            user_code: Set(new.user_code),
            client_id: Set(new.client.client_id),
            client_name: Set(new.client_name),
            scope: Set(new.scopes.join(" ")),
            client_auth_method: Set(new.client.method.as_str().to_string()),
            device_info: Set(device_info),
            status: Set(DeviceStatus::Pending.as_str().to_string()),
            created_at: Set(new.created_at),
            expires_at: Set(new.expires_at),
            last_poll_at: Set(None),
            poll_interval: Set(new.poll_interval),
            approved_subject: Set(None),
            auth_time: Set(None),
            redeemed_at: Set(None),
            ..Default::default()
        };

        match model.insert(&self.db).await {
            Ok(created) => Ok(InsertOutcome::Created(created.into())),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Collision),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_by_id(
        &self,
        id: RecordId,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError> {
        let found = entities::DeviceAuthorization::find_by_id(id.0)
            .one(&self.db)
            .await?;
        Ok(found.map(Into::into))
    }

    async fn find_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError> {
        use entities::device_authorization::{Column, Entity};

        let found = Entity::find()
            .filter(Column::DeviceCode.eq(device_code))
            .one(&self.db)
            .await?;
        Ok(found.map(Into::into))
    }

    async fn find_by_user_code(
        &self,
        user_code: &str,
        now: i64,
    ) -> Result<Option<DeviceAuthorizationRecord>, FulcrumError> {
        use entities::device_authorization::{Column, Entity};

        let found = Entity::find()
            .filter(Column::UserCode.eq(user_code))
            .filter(Column::Status.eq(DeviceStatus::Pending.as_str()))
            .filter(Column::ExpiresAt.gt(now))
            .one(&self.db)
            .await?;
        Ok(found.map(Into::into))
    }

    async fn compare_and_transition(
        &self,
        id: RecordId,
        expected: DeviceStatus,
        new: DeviceStatus,
        mutation: RecordMutation,
        now: i64,
    ) -> Result<bool, FulcrumError> {
        use entities::device_authorization::{Column, Entity};

        let mut update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(new.as_str()))
            .filter(Column::Id.eq(id.0))
            .filter(Column::Status.eq(expected.as_str()))
            .filter(Column::ExpiresAt.gt(now));

        if let Some(subject) = mutation.approved_subject {
            update = update.col_expr(Column::ApprovedSubject, Expr::value(Some(subject)));
        }
        if let Some(auth_time) = mutation.auth_time {
            update = update.col_expr(Column::AuthTime, Expr::value(Some(auth_time)));
        }
        if let Some(last_poll_at) = mutation.last_poll_at {
            update = update.col_expr(Column::LastPollAt, Expr::value(Some(last_poll_at)));
        }
        if let Some(interval) = mutation.poll_interval {
            // never lowers the stored interval
            let raised = Expr::case(Column::PollInterval.lt(interval), interval)
                .finally(Expr::col(Column::PollInterval));
            update = update.col_expr(Column::PollInterval, raised.into());
        }
        if let Some(redeemed_at) = mutation.redeemed_at {
            update = update.col_expr(Column::RedeemedAt, Expr::value(Some(redeemed_at)));
        }
        match mutation.if_last_poll_at {
            Some(Some(observed)) => update = update.filter(Column::LastPollAt.eq(observed)),
            Some(None) => update = update.filter(Column::LastPollAt.is_null()),
            None => {}
        }

        let result = update.exec(&self.db).await?;
        Ok(result.rows_affected == 1)
    }

    async fn reclaim(&self, now: i64, retention_secs: i64) -> Result<u64, FulcrumError> {
        use entities::device_authorization::{Column, Entity};

        let cutoff = now - retention_secs;
        let result = Entity::delete_many()
            .filter(
                Condition::any()
                    .add(Column::ExpiresAt.lte(cutoff))
                    .add(
                        Condition::all()
                            .add(Column::Status.eq(DeviceStatus::Redeemed.as_str()))
                            .add(Column::RedeemedAt.lte(cutoff)),
                    ),
            )
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }
}
