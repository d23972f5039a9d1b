pub mod api_server;
pub mod credential_issuer;
pub mod notifier;
pub mod registration_workflow;
pub mod verification_gate;
pub mod verifier;
