// src/utils/validation.rs
//! Input validation and identifier generation.

use crate::errors::ValidationError;
use crate::models::registration::RegistrationForm;
use crate::utils::countries::is_valid_country;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").expect("email pattern is valid")
});

/// Checks the address format (case-insensitive).
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(&email.to_lowercase())
}

/// Validates a registration form, reporting the first problem found.
pub fn validate_registration(form: &RegistrationForm) -> Result<(), ValidationError> {
    let required = [
        (&form.first_name, "first name"),
        (&form.last_name, "last name"),
        (&form.company_name, "company name"),
        (&form.country, "country"),
    ];
    for (value, field) in required {
        if value.is_empty() {
            return Err(ValidationError::Missing(field));
        }
    }
    if !is_valid_country(&form.country) {
        return Err(ValidationError::InvalidCountry);
    }
    if form.vat_id.is_empty() {
        return Err(ValidationError::Missing("VAT ID"));
    }
    if form.email.is_empty() {
        return Err(ValidationError::Missing("email"));
    }
    if !is_valid_email(&form.email) {
        return Err(ValidationError::InvalidEmail);
    }
    Ok(())
}

/// Generates a 6-digit verification code (000000-999999) from the OS RNG.
pub fn generate_verification_code() -> String {
    let code: u32 = OsRng.gen_range(0..1_000_000);
    format!("{:06}", code)
}

/// Generates a human-legible but unguessable id: `YYYYMMDD-########`.
pub fn generate_registration_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = OsRng.gen_range(0..100_000_000);
    format!("{}-{:08}", now.format("%Y%m%d"), suffix)
}
