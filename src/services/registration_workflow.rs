// src/services/registration_workflow.rs
//! Registration Workflow
//!
//! Drives a submitted registration form through its lifecycle:
//!
//! ```text
//! Received -> Validated -> Persisted -> IssuanceSucceeded | IssuanceFailed -> Notified -> Complete
//! ```
//!
//! Only validation and the initial save can fail the request. Once the
//! registration is stored the user is told it succeeded; issuance and
//! notification problems are recorded on the registration, logged, and
//! reported to the issuer team instead.

use crate::errors::RegistrationError;
use crate::models::credential::{CredentialIssuanceRequest, Mandatee, Mandator, Payload, Power};
use crate::models::registration::{Registration, RegistrationForm};
use crate::services::credential_issuer::CredentialIssuance;
use crate::services::notifier::Notifier;
use crate::storage::registration_store::RegistrationStore;
use crate::utils::validation::{generate_registration_id, validate_registration};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;

pub const CREDENTIAL_SCHEMA: &str = "LEARCredentialEmployee";
pub const OPERATION_MODE_SYNC: &str = "S";
pub const CREDENTIAL_FORMAT: &str = "jwt_vc_json";

/// Lifecycle stages of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Persisted,
    IssuanceSucceeded,
    IssuanceFailed,
    Notified,
    Complete,
}

/// Result of a registration attempt that the user sees as successful.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    /// The honeypot field was filled in; nothing was done
    Discarded,
    Completed {
        registration: Registration,
        /// Stages traversed, in order
        stages: Vec<Stage>,
    },
}

/// Builds the LEAR credential request for a stored registration.
pub fn build_issuance_request(registration: &Registration) -> CredentialIssuanceRequest {
    CredentialIssuanceRequest {
        schema: CREDENTIAL_SCHEMA.to_string(),
        operation_mode: OPERATION_MODE_SYNC.to_string(),
        format: CREDENTIAL_FORMAT.to_string(),
        response_uri: String::new(),
        payload: Payload {
            mandator: Mandator {
                organization_identifier: format!("{}-{}", registration.country, registration.vat_id),
                organization: registration.company_name.clone(),
                country: registration.country.clone(),
                common_name: format!("{} {}", registration.first_name, registration.last_name),
                email_address: registration.email.clone(),
                serial_number: String::new(),
            },
            mandatee: Mandatee {
                first_name: registration.first_name.clone(),
                last_name: registration.last_name.clone(),
                nationality: registration.country.clone(),
                email: registration.email.clone(),
            },
            power: vec![Power {
                kind: "domain".to_string(),
                domain: "DOME".to_string(),
                function: "Onboarding".to_string(),
                action: ["execute", "verify"].into_iter().collect(),
            }],
        },
    }
}

pub struct RegistrationWorkflow {
    store: Arc<dyn RegistrationStore>,
    issuer: Arc<dyn CredentialIssuance>,
    notifier: Arc<dyn Notifier>,
}

impl RegistrationWorkflow {
    pub fn new(
        store: Arc<dyn RegistrationStore>,
        issuer: Arc<dyn CredentialIssuance>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        RegistrationWorkflow {
            store,
            issuer,
            notifier,
        }
    }

    /// Runs a registration form through the whole lifecycle.
    ///
    /// # Errors
    /// - `RegistrationError::Validation` if the form is incomplete or invalid
    /// - `RegistrationError::Store` if the registration could not be saved
    pub async fn register(
        &self,
        form: &RegistrationForm,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        if !form.website.is_empty() {
            info!("Honeypot field filled in, discarding registration for {}", form.email);
            return Ok(RegistrationOutcome::Discarded);
        }
        let mut stages = vec![Stage::Received];

        validate_registration(form)?;
        stages.push(Stage::Validated);

        let mut registration = Registration::from_form(generate_registration_id(Utc::now()), form);
        self.store.save_registration(&mut registration).await?;
        stages.push(Stage::Persisted);
        info!(
            "Saved registration {} for {} / {}",
            registration.registration_id, registration.email, registration.vat_id
        );

        stages.push(self.issue(&mut registration).await);
        stages.push(self.notify(&mut registration).await);
        stages.push(Stage::Complete);

        debug!(
            "Registration {} finished: {:?}",
            registration.registration_id, stages
        );
        Ok(RegistrationOutcome::Completed {
            registration,
            stages,
        })
    }

    async fn issue(&self, registration: &mut Registration) -> Stage {
        let request = build_issuance_request(registration);
        registration.issuance_at = Some(Utc::now());

        match self.issuer.request_credential(&request).await {
            Ok(response) => {
                info!(
                    "Credential issued for registration {} ({} bytes)",
                    registration.registration_id,
                    response.len()
                );
                registration.issuance_error.clear();
                self.persist_status(registration).await;
                Stage::IssuanceSucceeded
            }
            Err(e) => {
                error!(
                    "Credential issuance failed for registration {}: {}",
                    registration.registration_id, e
                );
                registration.issuance_error = e.to_string();
                self.persist_status(registration).await;

                let payload = serde_json::to_string_pretty(&request)
                    .unwrap_or_else(|e| format!("<payload not serializable: {}>", e));
                if let Err(notify_err) = self
                    .notifier
                    .send_issuance_failure(registration, &payload, &registration.issuance_error)
                    .await
                {
                    warn!(
                        "Failed to notify issuer team about registration {}: {}",
                        registration.registration_id, notify_err
                    );
                }
                Stage::IssuanceFailed
            }
        }
    }

    async fn notify(&self, registration: &mut Registration) -> Stage {
        match self.notifier.send_welcome(registration).await {
            Ok(()) => {
                registration.notif_email_at = Some(Utc::now());
                registration.notif_email_error.clear();
            }
            Err(e) => {
                warn!(
                    "Welcome notification failed for registration {}: {}",
                    registration.registration_id, e
                );
                registration.notif_email_error = e.to_string();
            }
        }

        self.persist_status(registration).await;
        Stage::Notified
    }

    /// Best effort: a failed status update is only logged.
    async fn persist_status(&self, registration: &mut Registration) {
        if let Err(e) = self.store.update_registration_status(registration).await {
            error!(
                "Failed to update status of registration {}: {}",
                registration.registration_id, e
            );
        }
    }
}
