// src/services/api_server.rs
//! API Server for the Onboarding Service
//!
//! REST interface used by the onboarding frontend. Every API reply uses the
//! same envelope: `{success, message, data?}`.
//!
//! Endpoints:
//! - `POST /api/validate-email`: issue a verification code for an address
//! - `POST /api/verify-code`: check a verification code
//! - `POST /api/register`: submit the registration form
//! - `GET /health`: liveness probe
//!
//! POST endpoints require a non-empty `X-Requested-With` header, which a
//! cross-site form post cannot set. When a static directory is configured,
//! any other path is served from it.

use crate::errors::{GateError, RegistrationError};
use crate::models::registration::RegistrationForm;
use crate::services::notifier::Notifier;
use crate::services::registration_workflow::RegistrationWorkflow;
use crate::services::verification_gate::VerificationGate;
use crate::utils::validation::is_valid_email;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Json, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

const X_REQUESTED_WITH: &str = "x-requested-with";

/// Reply envelope shared by all endpoints.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Request payload for issuing a verification code
#[derive(Deserialize)]
struct ValidateEmailRequest {
    #[serde(default)]
    email: String,
}

/// Request payload for checking a verification code
#[derive(Deserialize)]
struct VerifyCodeRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    code: String,
}

fn reply(status: StatusCode, success: bool, message: &str, data: Option<serde_json::Value>) -> Response {
    (
        status,
        Json(ApiResponse {
            success,
            message: message.to_string(),
            data,
        }),
    )
        .into_response()
}

fn has_csrf_header(headers: &HeaderMap) -> bool {
    headers
        .get(X_REQUESTED_WITH)
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}

fn csrf_failure() -> Response {
    reply(
        StatusCode::FORBIDDEN,
        false,
        "Security check failed: missing CSRF header",
        None,
    )
}

fn invalid_body(rejection: JsonRejection) -> Response {
    debug!("Rejected request body: {}", rejection);
    reply(StatusCode::BAD_REQUEST, false, "Invalid request body", None)
}

/// API server state containing all service dependencies
pub struct ApiServer {
    /// Verification codes and rate limiters
    gate: Arc<VerificationGate>,
    /// Registration lifecycle
    workflow: Arc<RegistrationWorkflow>,
    /// Delivers verification codes
    notifier: Arc<dyn Notifier>,
    /// Pre-generated frontend, served for unmatched paths
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    /// Creates a new instance of the API server
    ///
    /// # Arguments
    /// * `gate` - Shared verification gate, also swept by a background task
    /// * `workflow` - Registration workflow
    /// * `notifier` - Notifier used to deliver verification codes
    /// * `static_dir` - Optional directory with the frontend
    pub fn new(
        gate: Arc<VerificationGate>,
        workflow: Arc<RegistrationWorkflow>,
        notifier: Arc<dyn Notifier>,
        static_dir: Option<PathBuf>,
    ) -> Self {
        ApiServer {
            gate,
            workflow,
            notifier,
            static_dir,
        }
    }

    /// Builds the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                Method::POST,
                Method::GET,
                Method::OPTIONS,
                Method::PUT,
                Method::DELETE,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static(X_REQUESTED_WITH),
                header::AUTHORIZATION,
            ]);

        let mut router = Router::new()
            .route("/api/validate-email", post(Self::validate_email_handler))
            .route("/api/verify-code", post(Self::verify_code_handler))
            .route("/api/register", post(Self::register_handler))
            .route("/health", get(Self::health_handler))
            .with_state(Arc::new(self.clone()));

        if let Some(dir) = &self.static_dir {
            router = router.fallback_service(ServeDir::new(dir));
        }

        router.layer(ServiceBuilder::new().layer(cors))
    }

    /// Starts the API server and begins listening for requests
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (e.g., "0.0.0.0:7777")
    pub async fn run(&self, addr: SocketAddr) -> std::io::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on http://{}", addr);

        // Peer addresses feed the per-address rate limiter
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }

    // =====================
    // Email Verification Handlers
    // =====================

    /// Issues a verification code for an email address
    ///
    /// # Endpoint
    /// POST /api/validate-email
    ///
    /// # Responses
    /// - 200 OK: `data.code` holds the code, which is also sent by email
    /// - 400 Bad Request: Malformed body or invalid address
    /// - 403 Forbidden: Missing `X-Requested-With`
    /// - 429 Too Many Requests: Address or email rate limited
    async fn validate_email_handler(
        State(state): State<Arc<ApiServer>>,
        connect_info: Option<ConnectInfo<SocketAddr>>,
        headers: HeaderMap,
        payload: Result<Json<ValidateEmailRequest>, JsonRejection>,
    ) -> Response {
        let peer = connect_info
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        if !state.gate.allow(peer) {
            return reply(StatusCode::TOO_MANY_REQUESTS, false, "Too many requests", None);
        }

        if !has_csrf_header(&headers) {
            return csrf_failure();
        }
        let Json(request) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return invalid_body(rejection),
        };

        if request.email.is_empty() || !is_valid_email(&request.email) {
            return reply(
                StatusCode::BAD_REQUEST,
                false,
                "A valid email is required",
                None,
            );
        }

        let code = match state.gate.request_code(&request.email) {
            Ok(code) => code,
            Err(GateError::RateLimited) => {
                info!("Verification code requests for {} rate limited", request.email);
                return reply(
                    StatusCode::TOO_MANY_REQUESTS,
                    false,
                    "Too many requests. Please wait a few minutes.",
                    None,
                );
            }
        };

        if let Err(e) = state
            .notifier
            .send_verification_code(&request.email, &code)
            .await
        {
            warn!("Failed to send verification code to {}: {}", request.email, e);
        }

        reply(
            StatusCode::OK,
            true,
            "Validation code sent to your email",
            Some(json!({ "code": code })),
        )
    }

    /// Checks a verification code, consuming it on success
    ///
    /// # Endpoint
    /// POST /api/verify-code
    ///
    /// # Responses
    /// - 200 OK: Code matched
    /// - 400 Bad Request: Malformed body, unknown or wrong code
    /// - 403 Forbidden: Missing `X-Requested-With`
    async fn verify_code_handler(
        State(state): State<Arc<ApiServer>>,
        headers: HeaderMap,
        payload: Result<Json<VerifyCodeRequest>, JsonRejection>,
    ) -> Response {
        if !has_csrf_header(&headers) {
            return csrf_failure();
        }
        let Json(request) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return invalid_body(rejection),
        };

        if !state.gate.verify_code(&request.email, &request.code) {
            return reply(
                StatusCode::BAD_REQUEST,
                false,
                "Invalid verification code",
                None,
            );
        }
        reply(StatusCode::OK, true, "Email verified successfully", None)
    }

    // =====================
    // Registration Handlers
    // =====================

    /// Submits the registration form
    ///
    /// # Endpoint
    /// POST /api/register
    ///
    /// # Responses
    /// - 200 OK: Registration stored (issuance outcome is not reported)
    /// - 400 Bad Request: Malformed body or validation failure
    /// - 403 Forbidden: Missing `X-Requested-With`
    /// - 500 Internal Server Error: Registration could not be saved
    async fn register_handler(
        State(state): State<Arc<ApiServer>>,
        headers: HeaderMap,
        payload: Result<Json<RegistrationForm>, JsonRejection>,
    ) -> Response {
        if !has_csrf_header(&headers) {
            return csrf_failure();
        }
        let Json(form) = match payload {
            Ok(payload) => payload,
            Err(rejection) => return invalid_body(rejection),
        };

        match state.workflow.register(&form).await {
            Ok(_) => reply(StatusCode::OK, true, "Registration successful", None),
            Err(RegistrationError::Validation(e)) => {
                reply(StatusCode::BAD_REQUEST, false, &e.to_string(), None)
            }
            Err(RegistrationError::Store(e)) => {
                warn!("Failed to save registration for {}: {}", form.email, e);
                reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    false,
                    "Failed to save registration",
                    Some(json!(e.to_string())),
                )
            }
        }
    }

    /// Liveness probe
    ///
    /// # Endpoint
    /// GET /health
    async fn health_handler() -> Response {
        reply(StatusCode::OK, true, "ok", None)
    }
}

impl Clone for ApiServer {
    /// Creates a clone of the ApiServer with shared service references
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            workflow: self.workflow.clone(),
            notifier: self.notifier.clone(),
            static_dir: self.static_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MailConfig, RuntimeEnv};
    use crate::errors::IssuanceError;
    use crate::models::credential::CredentialIssuanceRequest;
    use crate::services::credential_issuer::CredentialIssuance;
    use crate::services::notifier::MailNotifier;
    use crate::storage::registration_store::{
        ConflictPolicy, RegistrationStore, SqliteRegistrationStore,
    };
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bytes::Bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    struct AcceptingIssuer;

    #[async_trait]
    impl CredentialIssuance for AcceptingIssuer {
        async fn request_credential(
            &self,
            _request: &CredentialIssuanceRequest,
        ) -> Result<Bytes, IssuanceError> {
            Ok(Bytes::from_static(b"eyJcredential"))
        }
    }

    async fn test_app() -> (Router, Arc<SqliteRegistrationStore>) {
        let store = Arc::new(
            SqliteRegistrationStore::open_in_memory(ConflictPolicy::Reject)
                .await
                .unwrap(),
        );
        let notifier: Arc<dyn Notifier> =
            Arc::new(MailNotifier::new(RuntimeEnv::Development, &MailConfig::default()).unwrap());
        let workflow = Arc::new(RegistrationWorkflow::new(
            store.clone(),
            Arc::new(AcceptingIssuer),
            notifier.clone(),
        ));
        let server = ApiServer::new(Arc::new(VerificationGate::new()), workflow, notifier, None);
        (server.router(), store)
    }

    fn post_json(uri: &str, body: &str, peer: [u8; 4]) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-requested-with", "XMLHttpRequest")
            .body(Body::from(body.to_string()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
        request
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_missing_csrf_header_is_forbidden() {
        let (app, _) = test_app().await;
        for uri in ["/api/validate-email", "/api/verify-code", "/api/register"] {
            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"email":"ana@example.com"}"#))
                .unwrap();
            let (status, body) = call(&app, request).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
            assert_eq!(body["success"], false);
        }
    }

    #[tokio::test]
    async fn test_email_verification_round() {
        let (app, _) = test_app().await;

        let (status, body) = call(
            &app,
            post_json("/api/validate-email", r#"{"email":"ana@example.com"}"#, [10, 0, 0, 1]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let code = body["data"]["code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);

        let verify = json!({"email": "ana@example.com", "code": code}).to_string();
        let (status, body) = call(&app, post_json("/api/verify-code", &verify, [10, 0, 0, 1])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Email verified successfully");
        assert!(body.get("data").is_none());

        // Consumed
        let (status, body) = call(&app, post_json("/api/verify-code", &verify, [10, 0, 0, 1])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid verification code");
    }

    #[tokio::test]
    async fn test_validate_email_rejects_bad_input() {
        let (app, _) = test_app().await;

        let (status, body) =
            call(&app, post_json("/api/validate-email", "{not json", [10, 0, 0, 2])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid request body");

        let (status, body) = call(
            &app,
            post_json("/api/validate-email", r#"{"email":"ana@"}"#, [10, 0, 0, 2]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "A valid email is required");
    }

    #[tokio::test]
    async fn test_email_rate_limit() {
        let (app, _) = test_app().await;
        let body = r#"{"email":"ana@example.com"}"#;

        for (i, last_octet) in (1..=3u8).enumerate() {
            let (status, _) =
                call(&app, post_json("/api/validate-email", body, [10, 0, 1, last_octet])).await;
            assert_eq!(status, StatusCode::OK, "attempt {}", i + 1);
        }
        let (status, response) =
            call(&app, post_json("/api/validate-email", body, [10, 0, 1, 4])).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response["message"], "Too many requests. Please wait a few minutes.");
    }

    #[tokio::test]
    async fn test_address_rate_limit() {
        let (app, _) = test_app().await;

        for i in 0..5 {
            let body = json!({ "email": format!("user{}@example.com", i) }).to_string();
            let (status, _) =
                call(&app, post_json("/api/validate-email", &body, [192, 168, 0, 7])).await;
            assert_eq!(status, StatusCode::OK);
        }

        let body = r#"{"email":"user5@example.com"}"#;
        let (status, response) =
            call(&app, post_json("/api/validate-email", body, [192, 168, 0, 7])).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response["message"], "Too many requests");

        // Other addresses have their own bucket
        let (status, _) = call(&app, post_json("/api/validate-email", body, [192, 168, 0, 8])).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register() {
        let (app, store) = test_app().await;
        let form = json!({
            "firstName": "Ana",
            "lastName": "Ruiz",
            "companyName": "Acme",
            "country": "ES",
            "vatId": "B12345678",
            "email": "ana@example.com",
            "website": ""
        })
        .to_string();

        let (status, body) = call(&app, post_json("/api/register", &form, [10, 0, 0, 3])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "message": "Registration successful"}));

        let stored = store
            .get_registration("B12345678", "ana@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.issuance_error.is_empty());

        // Production store rejects the duplicate
        let (status, body) = call(&app, post_json("/api/register", &form, [10, 0, 0, 3])).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "Failed to save registration");
    }

    #[tokio::test]
    async fn test_register_validation_and_honeypot() {
        let (app, store) = test_app().await;

        let missing = json!({"firstName": "Ana", "country": "ES"}).to_string();
        let (status, body) = call(&app, post_json("/api/register", &missing, [10, 0, 0, 4])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "last name is required");

        let bot = json!({
            "firstName": "Bot",
            "lastName": "Net",
            "companyName": "Spam",
            "country": "ES",
            "vatId": "B00000000",
            "email": "bot@example.com",
            "website": "http://spam.example"
        })
        .to_string();
        let (status, body) = call(&app, post_json("/api/register", &bot, [10, 0, 0, 4])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Registration successful");
        assert!(store
            .get_registration("B00000000", "bot@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_health_and_cors() {
        let (app, _) = test_app().await;

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "message": "ok"}));

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/api/register")
            .header("origin", "https://onboarding.example.org")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "x-requested-with")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(preflight).await.unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "*"
        );
    }
}
