// src/main.rs

//! # Onboarding Service - Main Entry Point
//!
//! Onboards organizations into the DOME ecosystem: verifies the contact email,
//! stores the registration and requests a LEAR credential from the Issuer.
//!
//! ## Architecture Overview
//! 1. **Wallet Layer**: the service's own P-256 `did:key` identity
//! 2. **Services Layer**: verification gate, issuance client, workflow, API
//! 3. **Storage Layer**: SQLite registration records
//!
//! ## Environment Variables
//! - `ONBOARD_ENV`: runtime environment, `dev`, `pre` or `pro` (default: `dev`)
//! - `ONBOARD_CONFIG`: configuration file without extension (default: `config`)
//! - `ONBOARD__*`: overrides for individual configuration keys
//! - `RUST_LOG`: log filter (default: `info`)

use crate::config::{read_secret_file, AppConfig, RuntimeEnv};
use crate::services::api_server::ApiServer;
use crate::services::credential_issuer::{build_http_client, IssuanceClient};
use crate::services::notifier::{MailNotifier, Notifier};
use crate::services::registration_workflow::RegistrationWorkflow;
use crate::services::verification_gate::VerificationGate;
use crate::storage::registration_store::{ConflictPolicy, SqliteRegistrationStore};
use crate::wallet::key_management::KeyIdentity;
use anyhow::Context;
use dotenv::dotenv;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// Module declarations (organized by functional domain)
mod config; // Configuration loading
mod errors; // Error taxonomy
mod models; // Data structures
mod services; // Business logic and API
mod storage; // Registration persistence
mod utils; // Validation helpers
mod wallet; // Signing identity

/// Interval between sweeps of expired verification state.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Main application entry point
///
/// # Initialization Sequence
/// 1. Load environment and configuration
/// 2. Load and verify the signing identity
/// 3. Initialize service components
/// 4. Start the sweeper and the API server
///
/// # Errors
/// Any startup failure (bad configuration, key file for another identity,
/// unreachable database) stops the process.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let runtime: RuntimeEnv = std::env::var("ONBOARD_ENV")
        .unwrap_or_else(|_| RuntimeEnv::Development.to_string())
        .parse()
        .context("ONBOARD_ENV")?;
    let config_path = std::env::var("ONBOARD_CONFIG").unwrap_or_else(|_| "config".to_string());

    let app_config = AppConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    let env_config = app_config.environment(runtime)?;
    info!("Starting onboarding service in {} environment", runtime);

    // The key must belong to the configured did:key, otherwise the Verifier
    // would reject every token request
    let identity = KeyIdentity::load_and_verify(&env_config.private_key_file, &env_config.my_did_key)
        .with_context(|| {
            format!(
                "failed to load private key from {}",
                env_config.private_key_file.display()
            )
        })?;
    info!("Signing identity: {}", identity.did());

    let machine_credential = read_secret_file(&env_config.machine_credential_file)
        .context("failed to load machine credential")?;

    let http = build_http_client(app_config.http_timeout()).context("failed to build HTTP client")?;
    let issuer = IssuanceClient::new(
        http,
        identity,
        machine_credential,
        &env_config.verifier,
        &env_config.issuer,
    )?;
    debug!("Issuance client ready for {}", issuer.did());

    let store = SqliteRegistrationStore::open(&app_config.database_url, ConflictPolicy::from(runtime))
        .await
        .with_context(|| format!("failed to open database {}", app_config.database_url))?;

    let notifier: Arc<dyn Notifier> = Arc::new(
        MailNotifier::new(runtime, &env_config.mail).context("failed to set up mail delivery")?,
    );

    let workflow = Arc::new(RegistrationWorkflow::new(
        Arc::new(store),
        Arc::new(issuer),
        notifier.clone(),
    ));

    let gate = Arc::new(VerificationGate::new());
    let sweeper = gate.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper.sweep();
        }
    });

    let addr: SocketAddr = app_config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", app_config.listen_addr))?;

    let api_server = ApiServer::new(gate, workflow, notifier, app_config.static_dir.clone());
    api_server.run(addr).await.context("API server failed")?;

    Ok(())
}
