//! FailureStore trait definition.

use chrono::{DateTime, Utc};
use parley_types::error::RepositoryError;
use parley_types::failure::FailedMessage;
use uuid::Uuid;

/// Filter for listing failure records.
#[derive(Debug, Clone, Default)]
pub struct FailureFilter {
    pub retried: Option<bool>,
    pub task_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Repository trait for failure records and their retry claims.
pub trait FailureStore: Send + Sync + 'static {
    fn get_failed(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<FailedMessage>, RepositoryError>> + Send;

    /// List failure records, newest first.
    fn list_failed(
        &self,
        filter: &FailureFilter,
    ) -> impl std::future::Future<Output = Result<Vec<FailedMessage>, RepositoryError>> + Send;

    /// Unretried failure records produced by a task, oldest first.
    fn list_unretried_for_task(
        &self,
        task_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<FailedMessage>, RepositoryError>> + Send;

    /// Atomically claim a record for retry.
    ///
    /// Succeeds only if the record is unretried and either unclaimed, its
    /// lease has expired, or it is already held by `token`. Returns whether
    /// the claim is now held by `token`.
    fn try_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Push out the lease of a claim still held by `token`.
    ///
    /// Unlike `try_claim` this never takes over a claim, expired or not.
    /// Returns false when the record was retried or the claim moved on.
    fn renew_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop a claim held by `token`. No-op if the claim moved on.
    fn release_claim(
        &self,
        id: &Uuid,
        token: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn count_unretried(
        &self,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
