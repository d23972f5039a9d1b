// src/services/notifier.rs
//! Outbound notifications.
//!
//! Three messages leave the service: the verification code for an address,
//! the welcome message for a new registration (copied to the CC list) and the
//! diagnostic sent to the issuer team when issuance fails. Delivery is best
//! effort; callers record failures but never surface them to the end user.

use crate::config::{read_secret_file, MailConfig, RuntimeEnv};
use crate::errors::NotifyError;
use crate::models::registration::Registration;
use crate::utils::countries::country_name;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), NotifyError>;

    async fn send_welcome(&self, registration: &Registration) -> Result<(), NotifyError>;

    /// `payload` is the pretty-printed issuance request that failed.
    async fn send_issuance_failure(
        &self,
        registration: &Registration,
        payload: &str,
        error: &str,
    ) -> Result<(), NotifyError>;
}

/// A composed message, independent of the transport.
#[derive(Debug, Clone, PartialEq)]
struct Email {
    to: Vec<String>,
    subject: String,
    body: String,
}

/// SMTP notifier. With SMTP disabled every send is logged and succeeds.
pub struct MailNotifier {
    runtime: RuntimeEnv,
    /// Sender address, the SMTP username
    from: String,
    onboard_team_email: Vec<String>,
    issuer_team_email: Vec<String>,
    cc_list_email: Vec<String>,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl MailNotifier {
    /// Builds the notifier for `runtime` from the environment's mail settings.
    ///
    /// The SMTP password is read from `smtp.password_file` once, here. No
    /// connection is opened until the first message is sent.
    pub fn new(runtime: RuntimeEnv, config: &MailConfig) -> Result<Self, NotifyError> {
        let smtp = &config.smtp;
        let transport = if smtp.enabled {
            let mut builder = if smtp.tls {
                let tls = TlsParameters::new(smtp.host.clone())
                    .map_err(|e| NotifyError::Config(format!("TLS parameters: {}", e)))?;
                if smtp.port == 465 {
                    AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
                        .map_err(|e| NotifyError::Config(e.to_string()))?
                        .port(smtp.port)
                        .tls(Tls::Wrapper(tls))
                } else {
                    AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                        .map_err(|e| NotifyError::Config(e.to_string()))?
                        .port(smtp.port)
                        .tls(Tls::Required(tls))
                }
            } else {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host).port(smtp.port)
            };

            if let Some(path) = &smtp.password_file {
                let password =
                    read_secret_file(path).map_err(|e| NotifyError::Config(e.to_string()))?;
                builder = builder.credentials(Credentials::new(smtp.username.clone(), password));
            }
            Some(builder.build())
        } else {
            info!("SMTP disabled, notifications will only be logged");
            None
        };

        Ok(MailNotifier {
            runtime,
            from: smtp.username.clone(),
            onboard_team_email: config.onboard_team_email.clone(),
            issuer_team_email: config.issuer_team_email.clone(),
            cc_list_email: config.cc_list_email.clone(),
            transport,
        })
    }

    fn verification_email(&self, email: &str, code: &str) -> Email {
        Email {
            to: vec![email.to_string()],
            subject: "DOME Marketplace: your verification code".to_string(),
            body: format!(
                "Your verification code is {}.\n\nIt is valid for 15 minutes. \
                 If you did not request it, you can ignore this message.\n",
                code
            ),
        }
    }

    fn welcome_email(&self, registration: &Registration) -> Email {
        let mut to = vec![registration.email.clone()];
        to.extend(self.cc_list_email.iter().cloned());

        let country = country_name(&registration.country).unwrap_or(registration.country.as_str());
        let contact = self
            .onboard_team_email
            .first()
            .map(|address| format!("\nQuestions? Write to {}.\n", address))
            .unwrap_or_default();

        Email {
            to,
            subject: "Welcome to DOME Marketplace!".to_string(),
            body: format!(
                "Dear {} {},\n\n\
                 Thank you for registering {} in the DOME Marketplace ({}).\n\n\
                 Registration ID: {}\n\
                 Company: {}\n\
                 Country: {}\n\
                 VAT ID: {}\n\
                 Email: {}\n\n\
                 You will receive your LEAR credential shortly.\n{}",
                registration.first_name,
                registration.last_name,
                registration.company_name,
                self.runtime,
                registration.registration_id,
                registration.company_name,
                country,
                registration.vat_id,
                registration.email,
                contact,
            ),
        }
    }

    fn issuance_failure_email(&self, registration: &Registration, payload: &str, error: &str) -> Email {
        Email {
            to: self.issuer_team_email.clone(),
            subject: "DOME: Error in Credential Issuer during customer registration".to_string(),
            body: format!(
                "Credential issuance failed in {} for registration {} ({}, {}).\n\n\
                 Error:\n{}\n\nRequest payload:\n{}\n",
                self.runtime,
                registration.registration_id,
                registration.first_name,
                registration.company_name,
                error,
                payload,
            ),
        }
    }

    fn build_message(&self, email: &Email) -> Result<Message, NotifyError> {
        if email.to.is_empty() {
            return Err(NotifyError::Build("no recipients".into()));
        }

        let mut builder = Message::builder()
            .from(parse_mailbox(&self.from)?)
            .subject(email.subject.clone());
        for address in &email.to {
            builder = builder.to(parse_mailbox(address)?);
        }

        builder
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())
            .map_err(|e| NotifyError::Build(e.to_string()))
    }

    async fn deliver(&self, email: Email) -> Result<(), NotifyError> {
        let transport = match &self.transport {
            Some(transport) => transport,
            None => {
                info!("Mail disabled, not sending {:?} to {:?}", email.subject, email.to);
                return Ok(());
            }
        };

        let message = self.build_message(&email)?;
        transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        debug!("Sent {:?} to {:?}", email.subject, email.to);
        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address.parse::<Mailbox>().map_err(|e| NotifyError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Notifier for MailNotifier {
    async fn send_verification_code(&self, email: &str, code: &str) -> Result<(), NotifyError> {
        self.deliver(self.verification_email(email, code)).await
    }

    async fn send_welcome(&self, registration: &Registration) -> Result<(), NotifyError> {
        self.deliver(self.welcome_email(registration)).await
    }

    async fn send_issuance_failure(
        &self,
        registration: &Registration,
        payload: &str,
        error: &str,
    ) -> Result<(), NotifyError> {
        self.deliver(self.issuance_failure_email(registration, payload, error))
            .await
    }
}
