//! SettingsRepository trait definition.

use parley_types::error::RepositoryError;
use parley_types::settings::ServiceSettings;
use uuid::Uuid;

/// Repository trait for remote service settings.
///
/// At most one row is active. The aggregator and batch worker read it on
/// every check, so activating new settings takes effect immediately.
pub trait SettingsRepository: Send + Sync + 'static {
    fn create_settings(
        &self,
        settings: &ServiceSettings,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_settings(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ServiceSettings>, RepositoryError>> + Send;

    fn list_settings(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ServiceSettings>, RepositoryError>> + Send;

    /// The currently active settings, if any.
    fn active_settings(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<ServiceSettings>, RepositoryError>> + Send;

    /// Deactivate every row and activate `id`, in one transaction.
    ///
    /// Returns `RepositoryError::NotFound` if `id` does not exist.
    fn activate_settings(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
