// src/services/verifier.rs
//! Access token exchange with the Verifier.
//!
//! The Verifier issues bearer tokens through an OAuth2 `client_credentials`
//! grant. The client authenticates with a signed JWT assertion
//! (`private_key_jwt` style) that embeds a Verifiable Presentation of the
//! service's machine credential, so the token is bound both to the credential
//! and to the key behind our `did:key`.
//!
//! # Process Flow
//! 1. Wrap the machine credential in a VP JWT signed with our key (`vp_token`)
//! 2. Wrap the `vp_token` in a client assertion JWT signed with the same key
//! 3. POST the form-encoded grant to the token endpoint
//! 4. Return the `access_token` from the JSON response

use crate::errors::TokenError;
use crate::wallet::key_management::KeyIdentity;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use log::{debug, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Validity of the VP and the client assertion.
const ASSERTION_LIFETIME_SECS: i64 = 300;

const VC_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";

#[derive(Serialize, Deserialize, Debug)]
struct Presentation {
    #[serde(rename = "@context")]
    context: Vec<String>,
    #[serde(rename = "type")]
    kind: Vec<String>,
    holder: String,
    #[serde(rename = "verifiableCredential")]
    verifiable_credential: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct PresentationClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    nbf: i64,
    exp: i64,
    jti: String,
    vp: Presentation,
}

#[derive(Serialize, Deserialize, Debug)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
    jti: String,
    vp_token: String,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    client_assertion_type: &'a str,
    client_assertion: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

fn random_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Client for the Verifier's token endpoint.
#[derive(Clone)]
pub struct VerifierClient {
    http: reqwest::Client,
    /// Verifier base URL, used as the JWT audience
    verifier_url: String,
    token_endpoint: String,
}

impl VerifierClient {
    pub fn new(http: reqwest::Client, verifier_url: &str, token_endpoint: &str) -> Self {
        VerifierClient {
            http,
            verifier_url: verifier_url.to_string(),
            token_endpoint: token_endpoint.to_string(),
        }
    }

    /// Exchanges the machine credential for a short-lived access token.
    ///
    /// # Errors
    /// - `TokenError::Signing` if the assertion cannot be signed
    /// - `TokenError::Transport` on connection failures or timeouts
    /// - `TokenError::Rejected` on a non-2xx answer
    /// - `TokenError::Malformed` if the answer carries no access token
    pub async fn request_access_token(
        &self,
        identity: &KeyIdentity,
        signing_key: &EncodingKey,
        machine_credential: &str,
    ) -> Result<String, TokenError> {
        let assertion = self.client_assertion(
            identity,
            signing_key,
            machine_credential,
            Utc::now().timestamp(),
        )?;

        debug!("Requesting access token from {}", self.token_endpoint);
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&TokenRequest {
                grant_type: "client_credentials",
                client_id: identity.did(),
                client_assertion_type: CLIENT_ASSERTION_TYPE,
                client_assertion: &assertion,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Verifier rejected token request: {}", status);
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        if token.access_token.is_empty() {
            return Err(TokenError::Malformed("missing access_token".into()));
        }
        Ok(token.access_token)
    }

    /// Builds the signed client assertion for `now` (seconds since epoch).
    fn client_assertion(
        &self,
        identity: &KeyIdentity,
        signing_key: &EncodingKey,
        machine_credential: &str,
        now: i64,
    ) -> Result<String, TokenError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(identity.key_id());

        let did = identity.did().to_string();
        let vp_claims = PresentationClaims {
            iss: did.clone(),
            sub: did.clone(),
            aud: self.verifier_url.clone(),
            iat: now,
            nbf: now,
            exp: now + ASSERTION_LIFETIME_SECS,
            jti: random_jti(),
            vp: Presentation {
                context: vec![VC_CONTEXT.to_string()],
                kind: vec!["VerifiablePresentation".to_string()],
                holder: did.clone(),
                verifiable_credential: vec![machine_credential.trim().to_string()],
            },
        };
        let vp_token = encode(&header, &vp_claims, signing_key)?;

        let assertion_claims = AssertionClaims {
            iss: did.clone(),
            sub: did,
            aud: self.verifier_url.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
            jti: random_jti(),
            vp_token,
        };
        Ok(encode(&header, &assertion_claims, signing_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};
    use p256::SecretKey;
    use rand::rngs::OsRng;
    use serde::de::DeserializeOwned;

    fn identity() -> (KeyIdentity, EncodingKey) {
        let identity = KeyIdentity::from_secret_key(SecretKey::random(&mut OsRng));
        let key = identity.encoding_key().unwrap();
        (identity, key)
    }

    /// Checks the ES256 signature and returns header and claims.
    fn open_jwt<T: DeserializeOwned>(token: &str, identity: &KeyIdentity) -> (Header, T) {
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let signature_bytes = base64::decode_config(parts[2], base64::URL_SAFE_NO_PAD).unwrap();
        let signature = Signature::from_slice(&signature_bytes).unwrap();
        let signed = format!("{}.{}", parts[0], parts[1]);
        VerifyingKey::from(identity.public_key())
            .verify(signed.as_bytes(), &signature)
            .expect("signature must verify with the identity key");

        let header = jsonwebtoken::decode_header(token).unwrap();
        let claims_json = base64::decode_config(parts[1], base64::URL_SAFE_NO_PAD).unwrap();
        (header, serde_json::from_slice(&claims_json).unwrap())
    }

    #[test]
    fn test_client_assertion_structure() {
        let (identity, key) = identity();
        let client = VerifierClient::new(
            reqwest::Client::new(),
            "https://verifier.example.org",
            "https://verifier.example.org/oidc/token",
        );

        let assertion = client
            .client_assertion(&identity, &key, "eyJmachine.credential.jwt\n", 1_700_000_000)
            .unwrap();

        let (header, claims): (Header, AssertionClaims) = open_jwt(&assertion, &identity);
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.kid, Some(identity.key_id()));
        assert_eq!(claims.iss, identity.did());
        assert_eq!(claims.sub, identity.did());
        assert_eq!(claims.aud, "https://verifier.example.org");
        assert_eq!(claims.exp - claims.iat, ASSERTION_LIFETIME_SECS);

        let (_, vp): (Header, PresentationClaims) = open_jwt(&claims.vp_token, &identity);
        assert_eq!(vp.vp.holder, identity.did());
        assert_eq!(vp.vp.kind, vec!["VerifiablePresentation".to_string()]);
        assert_eq!(
            vp.vp.verifiable_credential,
            vec!["eyJmachine.credential.jwt".to_string()]
        );
        assert_ne!(vp.jti, claims.jti);
    }

    #[tokio::test]
    async fn test_token_exchange_success() {
        let mut server = mockito::Server::new_async().await;
        let (identity, key) = identity();

        let mock = server
            .mock("POST", "/oidc/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), identity.did().into()),
                Matcher::UrlEncoded("client_assertion_type".into(), CLIENT_ASSERTION_TYPE.into()),
                Matcher::Regex("client_assertion=ey".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok-123","token_type":"Bearer","expires_in":3600}"#)
            .create_async()
            .await;

        let client = VerifierClient::new(
            reqwest::Client::new(),
            &server.url(),
            &format!("{}/oidc/token", server.url()),
        );
        let token = client
            .request_access_token(&identity, &key, "machine-credential")
            .await
            .unwrap();

        assert_eq!(token, "tok-123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_exchange_rejected() {
        let mut server = mockito::Server::new_async().await;
        let (identity, key) = identity();

        server
            .mock("POST", "/oidc/token")
            .with_status(401)
            .with_body("invalid_client")
            .create_async()
            .await;

        let client = VerifierClient::new(
            reqwest::Client::new(),
            &server.url(),
            &format!("{}/oidc/token", server.url()),
        );
        let err = client
            .request_access_token(&identity, &key, "machine-credential")
            .await
            .unwrap_err();

        match err {
            TokenError::Rejected { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid_client");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_token_exchange_without_token_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let (identity, key) = identity();

        server
            .mock("POST", "/oidc/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let client = VerifierClient::new(
            reqwest::Client::new(),
            &server.url(),
            &format!("{}/oidc/token", server.url()),
        );
        let err = client
            .request_access_token(&identity, &key, "machine-credential")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_token_exchange_unreachable() {
        let (identity, key) = identity();
        let client = VerifierClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "http://127.0.0.1:9/oidc/token",
        );
        let err = client
            .request_access_token(&identity, &key, "machine-credential")
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Transport(_)));
    }
}
