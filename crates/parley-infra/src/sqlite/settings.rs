//! SQLite service-settings repository.

use parley_core::repository::SettingsRepository;
use parley_types::error::RepositoryError;
use parley_types::settings::ServiceSettings;
use secrecy::{ExposeSecret, SecretString};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid, query_err};

/// SQLite-backed implementation of `SettingsRepository`.
pub struct SqliteSettingsRepository {
    pool: DatabasePool,
}

impl SqliteSettingsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct SettingsRow {
    id: String,
    name: String,
    base_url: String,
    api_key: String,
    batch_threshold: i64,
    request_timeout_secs: i64,
    user_id: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl SettingsRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            base_url: row.try_get("base_url")?,
            api_key: row.try_get("api_key")?,
            batch_threshold: row.try_get("batch_threshold")?,
            request_timeout_secs: row.try_get("request_timeout_secs")?,
            user_id: row.try_get("user_id")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_settings(self) -> Result<ServiceSettings, RepositoryError> {
        Ok(ServiceSettings {
            id: parse_uuid(&self.id, "settings id")?,
            name: self.name,
            base_url: self.base_url,
            api_key: SecretString::from(self.api_key),
            batch_threshold: self.batch_threshold as u32,
            request_timeout_secs: self.request_timeout_secs as u64,
            user_id: self.user_id,
            is_active: self.is_active,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

impl SettingsRepository for SqliteSettingsRepository {
    async fn create_settings(&self, settings: &ServiceSettings) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        // Creating an active row deactivates the previous one.
        if settings.is_active {
            sqlx::query("UPDATE service_settings SET is_active = 0 WHERE is_active = 1")
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        sqlx::query(
            r#"INSERT INTO service_settings (id, name, base_url, api_key, batch_threshold, request_timeout_secs, user_id, is_active, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(settings.id.to_string())
        .bind(&settings.name)
        .bind(&settings.base_url)
        .bind(settings.api_key.expose_secret())
        .bind(settings.batch_threshold as i64)
        .bind(settings.request_timeout_secs as i64)
        .bind(&settings.user_id)
        .bind(settings.is_active)
        .bind(format_datetime(&settings.created_at))
        .bind(format_datetime(&settings.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)
    }

    async fn get_settings(&self, id: &Uuid) -> Result<Option<ServiceSettings>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM service_settings WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| SettingsRow::from_row(&row).map_err(query_err)?.into_settings())
            .transpose()
    }

    async fn list_settings(&self) -> Result<Vec<ServiceSettings>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM service_settings ORDER BY created_at ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        rows.iter()
            .map(|row| SettingsRow::from_row(row).map_err(query_err)?.into_settings())
            .collect()
    }

    async fn active_settings(&self) -> Result<Option<ServiceSettings>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM service_settings WHERE is_active = 1")
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.map(|row| SettingsRow::from_row(&row).map_err(query_err)?.into_settings())
            .transpose()
    }

    async fn activate_settings(&self, id: &Uuid) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM service_settings WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        if exists.is_none() {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query("UPDATE service_settings SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        sqlx::query("UPDATE service_settings SET is_active = 1, updated_at = ? WHERE id = ?")
            .bind(format_datetime(&chrono::Utc::now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)
    }
}
