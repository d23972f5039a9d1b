// src/storage/registration_store.rs
//! Durable registration records.
//!
//! Registrations live in a single SQLite table. How a second registration for
//! an already known organization is handled depends on the deployment:
//! development and preproduction amend the existing record in place so the
//! flow can be exercised repeatedly with the same test data, while production
//! treats any duplicate email, VAT id or registration id as a hard failure.

use crate::config::RuntimeEnv;
use crate::errors::StoreError;
use crate::models::registration::Registration;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registrations (
    registration_id   TEXT NOT NULL UNIQUE,
    email             TEXT NOT NULL,
    first_name        TEXT NOT NULL,
    last_name         TEXT NOT NULL,
    company_name      TEXT NOT NULL,
    country           TEXT NOT NULL,
    vat_id            TEXT NOT NULL,
    created_at        DATETIME NOT NULL,
    updated_at        DATETIME NOT NULL,
    issuance_at       DATETIME,
    issuance_error    TEXT NOT NULL DEFAULT '',
    notif_email_at    DATETIME,
    notif_email_error TEXT NOT NULL DEFAULT '',
    UNIQUE (email, vat_id)
)";

/// Production also forbids sharing either key on its own.
const STRICT_INDEXES: [&str; 2] = [
    "CREATE UNIQUE INDEX IF NOT EXISTS registrations_email ON registrations (email)",
    "CREATE UNIQUE INDEX IF NOT EXISTS registrations_vat_id ON registrations (vat_id)",
];

const SELECT_COLUMNS: &str = "
SELECT registration_id, email, first_name, last_name, company_name, country, vat_id,
       created_at, updated_at, issuance_at, issuance_error, notif_email_at, notif_email_error
FROM registrations";

/// What to do when a registration for a known `(email, vat_id)` arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Overwrite the existing record, keeping its creation time
    Amend,
    /// Fail with `StoreError::Conflict`
    Reject,
}

impl From<RuntimeEnv> for ConflictPolicy {
    fn from(runtime: RuntimeEnv) -> Self {
        match runtime {
            RuntimeEnv::Development | RuntimeEnv::Preproduction => ConflictPolicy::Amend,
            RuntimeEnv::Production => ConflictPolicy::Reject,
        }
    }
}

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Persists a new registration according to the store's conflict policy.
    /// Timestamps on `registration` are updated to what was stored.
    async fn save_registration(&self, registration: &mut Registration) -> Result<(), StoreError>;

    /// Writes the issuance and notification outcome of a stored registration.
    async fn update_registration_status(
        &self,
        registration: &mut Registration,
    ) -> Result<(), StoreError>;

    async fn get_registration(
        &self,
        vat_id: &str,
        email: &str,
    ) -> Result<Option<Registration>, StoreError>;
}

fn map_write_error(e: sqlx::Error, registration: &Registration) -> StoreError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Conflict(
            format!("email {} / VAT id {}", registration.email, registration.vat_id),
        ),
        _ => StoreError::Backend(e),
    }
}

pub struct SqliteRegistrationStore {
    pool: SqlitePool,
    policy: ConflictPolicy,
}

impl SqliteRegistrationStore {
    /// Connects to `url` and creates the schema if needed.
    pub async fn open(url: &str, policy: ConflictPolicy) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().max_connections(4).connect(url).await?;
        Self::with_pool(pool, policy).await
    }

    /// Private in-memory database, used by tests.
    pub async fn open_in_memory(policy: ConflictPolicy) -> Result<Self, StoreError> {
        // Every connection to `:memory:` is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool, policy).await
    }

    async fn with_pool(pool: SqlitePool, policy: ConflictPolicy) -> Result<Self, StoreError> {
        sqlx::query(SCHEMA).execute(&pool).await?;
        if policy == ConflictPolicy::Reject {
            for index in STRICT_INDEXES {
                sqlx::query(index).execute(&pool).await?;
            }
        }
        Ok(SqliteRegistrationStore { pool, policy })
    }

    async fn insert(&self, registration: &Registration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO registrations (
                registration_id, email, first_name, last_name, company_name, country, vat_id,
                created_at, updated_at, issuance_at, issuance_error, notif_email_at, notif_email_error
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&registration.registration_id)
        .bind(&registration.email)
        .bind(&registration.first_name)
        .bind(&registration.last_name)
        .bind(&registration.company_name)
        .bind(&registration.country)
        .bind(&registration.vat_id)
        .bind(registration.created_at)
        .bind(registration.updated_at)
        .bind(registration.issuance_at)
        .bind(&registration.issuance_error)
        .bind(registration.notif_email_at)
        .bind(&registration.notif_email_error)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, registration))?;
        Ok(())
    }

    async fn amend(&self, registration: &Registration) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE registrations SET
                registration_id = ?, first_name = ?, last_name = ?, company_name = ?, country = ?,
                updated_at = ?, issuance_at = ?, issuance_error = ?,
                notif_email_at = ?, notif_email_error = ?
             WHERE email = ? AND vat_id = ?",
        )
        .bind(&registration.registration_id)
        .bind(&registration.first_name)
        .bind(&registration.last_name)
        .bind(&registration.company_name)
        .bind(&registration.country)
        .bind(registration.updated_at)
        .bind(registration.issuance_at)
        .bind(&registration.issuance_error)
        .bind(registration.notif_email_at)
        .bind(&registration.notif_email_error)
        .bind(&registration.email)
        .bind(&registration.vat_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, registration))?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationStore for SqliteRegistrationStore {
    async fn save_registration(&self, registration: &mut Registration) -> Result<(), StoreError> {
        let now = Utc::now();
        registration.created_at = now;
        registration.updated_at = now;

        match self.policy {
            ConflictPolicy::Reject => self.insert(registration).await,
            ConflictPolicy::Amend => {
                let existing = self
                    .get_registration(&registration.vat_id, &registration.email)
                    .await?;
                match existing {
                    Some(previous) => {
                        info!(
                            "Registration for {} / {} exists as {}, amending",
                            registration.email, registration.vat_id, previous.registration_id
                        );
                        registration.created_at = previous.created_at;
                        self.amend(registration).await
                    }
                    None => self.insert(registration).await,
                }
            }
        }
    }

    async fn update_registration_status(
        &self,
        registration: &mut Registration,
    ) -> Result<(), StoreError> {
        registration.updated_at = Utc::now();
        let result = sqlx::query(
            "UPDATE registrations SET
                updated_at = ?, issuance_at = ?, issuance_error = ?,
                notif_email_at = ?, notif_email_error = ?
             WHERE registration_id = ? AND email = ?",
        )
        .bind(registration.updated_at)
        .bind(registration.issuance_at)
        .bind(&registration.issuance_error)
        .bind(registration.notif_email_at)
        .bind(&registration.notif_email_error)
        .bind(&registration.registration_id)
        .bind(&registration.email)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(registration.registration_id.clone()));
        }
        Ok(())
    }

    async fn get_registration(
        &self,
        vat_id: &str,
        email: &str,
    ) -> Result<Option<Registration>, StoreError> {
        let registration = sqlx::query_as::<_, Registration>(&format!(
            "{} WHERE vat_id = ? AND email = ?",
            SELECT_COLUMNS
        ))
        .bind(vat_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(registration)
    }
}
