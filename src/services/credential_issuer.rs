// src/services/credential_issuer.rs
//! Credential Issuance Client
//!
//! Requests new LEAR credentials from the remote Issuer on behalf of an
//! onboarded organization. Every request is authorized with a fresh bearer
//! token obtained from the Verifier (see [`crate::services::verifier`]).
//!
//! The client owns the service's signing identity and machine credential; both
//! are loaded once at startup and never leave this module.

use crate::config::{IssuerConfig, VerifierConfig};
use crate::errors::{IdentityError, IssuanceError};
use crate::models::credential::CredentialIssuanceRequest;
use crate::services::verifier::VerifierClient;
use crate::wallet::key_management::KeyIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use jsonwebtoken::EncodingKey;
use log::{info, warn};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;

/// Issues credentials for validated registrations.
///
/// The registration workflow only depends on this trait, so tests can swap the
/// HTTP client for a fake.
#[async_trait]
pub trait CredentialIssuance: Send + Sync {
    /// Submits `request` and returns the Issuer's raw response body.
    async fn request_credential(
        &self,
        request: &CredentialIssuanceRequest,
    ) -> Result<Bytes, IssuanceError>;
}

/// Builds the shared HTTP client used for the Verifier and the Issuer.
pub fn build_http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

/// HTTP client for the Issuer's credential issuance endpoint.
pub struct IssuanceClient {
    http: reqwest::Client,
    identity: KeyIdentity,
    signing_key: EncodingKey,
    machine_credential: String,
    verifier: VerifierClient,
    /// Full URL of the Issuer's issuance endpoint
    issuance_endpoint: String,
}

impl IssuanceClient {
    /// Creates a new IssuanceClient
    ///
    /// # Arguments
    /// * `http` - Shared client, carrying the request timeout
    /// * `identity` - Verified signing identity of this service
    /// * `machine_credential` - Credential presented to the Verifier
    /// * `verifier` - Verifier URL and token endpoint
    /// * `issuer` - Issuer endpoint settings
    ///
    /// # Returns
    /// The client, or `IdentityError::InvalidKey` if the key cannot be
    /// converted into an ES256 signing key
    pub fn new(
        http: reqwest::Client,
        identity: KeyIdentity,
        machine_credential: String,
        verifier: &VerifierConfig,
        issuer: &IssuerConfig,
    ) -> Result<Self, IdentityError> {
        let signing_key = identity.encoding_key()?;
        Ok(IssuanceClient {
            verifier: VerifierClient::new(http.clone(), &verifier.url, &verifier.token_endpoint),
            http,
            identity,
            signing_key,
            machine_credential,
            issuance_endpoint: issuer.credential_issuance_path.clone(),
        })
    }

    pub fn did(&self) -> &str {
        self.identity.did()
    }
}

#[async_trait]
impl CredentialIssuance for IssuanceClient {
    async fn request_credential(
        &self,
        request: &CredentialIssuanceRequest,
    ) -> Result<Bytes, IssuanceError> {
        let token = self
            .verifier
            .request_access_token(&self.identity, &self.signing_key, &self.machine_credential)
            .await?;

        let body = serde_json::to_vec(request)?;

        info!(
            "Requesting credential issuance for {} at {}",
            request.payload.mandator.organization_identifier, self.issuance_endpoint
        );
        let response = self
            .http
            .post(&self.issuance_endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !(200..=399).contains(&status) {
            warn!("Issuer answered status {} for {}", status, self.issuance_endpoint);
            return Err(IssuanceError::Rejected { status });
        }

        Ok(response.bytes().await?)
    }
}
