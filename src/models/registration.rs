// src/models/registration.rs
//! Registration form and the durable registration record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registration form as posted by the onboarding frontend.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationForm {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub vat_id: String,
    #[serde(default)]
    pub email: String,
    /// Honeypot: hidden in the form, only bots fill it in
    #[serde(default)]
    pub website: String,
}

/// A registration attempt and the outcome of its issuance and notification.
///
/// `registration_id` and the `(email, vat_id)` pair are the external keys
/// other tooling relies on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Registration {
    /// Format: `YYYYMMDD-########`
    pub registration_id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    pub country: String,
    pub vat_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub issuance_at: Option<DateTime<Utc>>,
    /// Empty when the last issuance attempt succeeded
    pub issuance_error: String,
    pub notif_email_at: Option<DateTime<Utc>>,
    /// Empty when the last welcome notification was delivered
    pub notif_email_error: String,
}

impl Registration {
    /// Builds a fresh, not yet persisted record from a validated form.
    pub fn from_form(registration_id: String, form: &RegistrationForm) -> Self {
        let now = Utc::now();
        Registration {
            registration_id,
            email: form.email.clone(),
            first_name: form.first_name.clone(),
            last_name: form.last_name.clone(),
            company_name: form.company_name.clone(),
            country: form.country.clone(),
            vat_id: form.vat_id.clone(),
            created_at: now,
            updated_at: now,
            issuance_at: None,
            issuance_error: String::new(),
            notif_email_at: None,
            notif_email_error: String::new(),
        }
    }
}
