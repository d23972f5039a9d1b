// src/wallet/key_management.rs
//! Signing identity of the onboarding service.
//!
//! The service authenticates to the Verifier with a P-256 key whose public
//! half is published as a `did:key`. This module loads the raw private key,
//! derives the identifier and checks it against the configured one, so that
//! a key file deployed for the wrong identity stops the service at startup.
//!
//! Uses the following primitives:
//! - NIST P-256 curve (via `p256` crate)
//! - multicodec `p256-pub` tag (`0x80 0x24`) and base58btc (via `bs58`)

use crate::errors::IdentityError;
use jsonwebtoken::EncodingKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePrivateKey;
use p256::{PublicKey, SecretKey};
use std::fmt;
use std::path::Path;

/// Varint encoding of the `p256-pub` multicodec.
const P256_MULTICODEC: [u8; 2] = [0x80, 0x24];

/// `did:key` method prefix including the base58btc multibase marker.
const DID_KEY_PREFIX: &str = "did:key:z";

/// Derives the `did:key` identifier of a P-256 public key.
///
/// # Arguments
/// * `public_key_bytes` - SEC1 encoded public key (compressed or uncompressed)
///
/// # Returns
/// `did:key:z<base58btc(0x80 0x24 || compressed point)>`
pub fn derive_identifier(public_key_bytes: &[u8]) -> Result<String, IdentityError> {
    let public_key = PublicKey::from_sec1_bytes(public_key_bytes)
        .map_err(|e| IdentityError::InvalidKey(format!("invalid public key: {}", e)))?;
    Ok(did_key_of(&public_key))
}

fn did_key_of(public_key: &PublicKey) -> String {
    // 33 bytes: 0x02 (even Y) or 0x03 (odd Y) followed by X
    let compressed = public_key.to_encoded_point(true);

    let mut multicodec = Vec::with_capacity(P256_MULTICODEC.len() + compressed.len());
    multicodec.extend_from_slice(&P256_MULTICODEC);
    multicodec.extend_from_slice(compressed.as_bytes());

    format!("{}{}", DID_KEY_PREFIX, bs58::encode(multicodec).into_string())
}

/// The service's private key together with its derived `did:key`.
#[derive(Clone)]
pub struct KeyIdentity {
    secret_key: SecretKey,
    did: String,
}

impl KeyIdentity {
    /// Wraps an existing secret key.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let did = did_key_of(&secret_key.public_key());
        KeyIdentity { secret_key, did }
    }

    /// Parses a raw hex encoded scalar.
    ///
    /// Surrounding whitespace and a `0x`/`0X` prefix are ignored.
    pub fn from_hex(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        let hex_key = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        let scalar = hex::decode(hex_key)
            .map_err(|e| IdentityError::InvalidKey(format!("not a hex string: {}", e)))?;
        if scalar.len() != 32 {
            return Err(IdentityError::InvalidKey(format!(
                "expected a 32 byte scalar, got {} bytes",
                scalar.len()
            )));
        }

        let secret_key = SecretKey::from_slice(&scalar)
            .map_err(|_| IdentityError::InvalidKey("scalar out of range for P-256".into()))?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// Reads the key file at `path` and checks that it belongs to `expected_did`.
    ///
    /// # Errors
    /// - `IdentityError::Io` if the file cannot be read
    /// - `IdentityError::InvalidKey` if it does not hold a valid scalar
    /// - `IdentityError::Mismatch` if the derived identifier differs
    pub fn load_and_verify(path: &Path, expected_did: &str) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_hex(&raw)?.verify(expected_did)
    }

    /// Fails with `IdentityError::Mismatch` unless the identity is `expected_did`.
    pub fn verify(self, expected_did: &str) -> Result<Self, IdentityError> {
        if self.did != expected_did {
            return Err(IdentityError::Mismatch {
                expected: expected_did.to_string(),
                derived: self.did,
            });
        }
        Ok(self)
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Verification method id used as JWT `kid`: `<did>#<method-specific-id>`.
    pub fn key_id(&self) -> String {
        let fragment = self.did.trim_start_matches("did:key:");
        format!("{}#{}", self.did, fragment)
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret_key.public_key()
    }

    /// ES256 signing key for `jsonwebtoken`.
    pub fn encoding_key(&self) -> Result<EncodingKey, IdentityError> {
        let der = self
            .secret_key
            .to_pkcs8_der()
            .map_err(|e| IdentityError::InvalidKey(format!("PKCS#8 encoding failed: {}", e)))?;
        Ok(EncodingKey::from_ec_der(der.as_bytes()))
    }
}

impl fmt::Debug for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyIdentity").field("did", &self.did).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use std::collections::HashSet;

    const SCALAR_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn test_generator_point_known_answer() {
        // Scalar 1 yields the curve generator, whose Y coordinate is odd
        let identity = KeyIdentity::from_hex(SCALAR_ONE).unwrap();
        let encoded = identity.did().strip_prefix("did:key:z").unwrap();
        let decoded = bs58::decode(encoded).into_vec().unwrap();

        assert_eq!(
            hex::encode(decoded),
            "8024036b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296"
        );
    }

    #[test]
    fn test_derivation_is_deterministic_and_injective() {
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let secret = SecretKey::random(&mut OsRng);
            let first = KeyIdentity::from_secret_key(secret.clone());
            let second = KeyIdentity::from_secret_key(secret);
            assert_eq!(first.did(), second.did());
            assert!(seen.insert(first.did().to_string()), "identifier collision");
        }
    }

    #[test]
    fn test_identifier_layout() {
        let identity = KeyIdentity::from_secret_key(SecretKey::random(&mut OsRng));
        assert!(identity.did().starts_with("did:key:zDn"));

        let decoded = bs58::decode(&identity.did()["did:key:z".len()..])
            .into_vec()
            .unwrap();
        assert_eq!(decoded.len(), 35);
        assert_eq!(&decoded[..2], &P256_MULTICODEC);

        let uncompressed = identity.public_key().to_encoded_point(false);
        let y_is_odd = uncompressed.as_bytes()[64] % 2 == 1;
        assert_eq!(decoded[2], if y_is_odd { 0x03 } else { 0x02 });
        assert_eq!(&decoded[3..], &uncompressed.as_bytes()[1..33]);
    }

    #[test]
    fn test_derive_identifier_accepts_both_encodings() {
        let identity = KeyIdentity::from_secret_key(SecretKey::random(&mut OsRng));
        let public_key = identity.public_key();

        let from_uncompressed =
            derive_identifier(public_key.to_encoded_point(false).as_bytes()).unwrap();
        let from_compressed =
            derive_identifier(public_key.to_encoded_point(true).as_bytes()).unwrap();

        assert_eq!(from_uncompressed, identity.did());
        assert_eq!(from_compressed, identity.did());
        assert!(derive_identifier(&[0x04, 0x01]).is_err());
    }

    #[test]
    fn test_from_hex_prefix_and_whitespace() {
        let plain = KeyIdentity::from_hex(SCALAR_ONE).unwrap();
        let prefixed = KeyIdentity::from_hex(&format!("0x{}\n", SCALAR_ONE)).unwrap();
        let upper = KeyIdentity::from_hex(&format!("0X{}", SCALAR_ONE)).unwrap();
        assert_eq!(plain.did(), prefixed.did());
        assert_eq!(plain.did(), upper.did());
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(matches!(
            KeyIdentity::from_hex("zz"),
            Err(IdentityError::InvalidKey(_))
        ));
        assert!(matches!(
            KeyIdentity::from_hex("0xabcd"),
            Err(IdentityError::InvalidKey(_))
        ));
        assert!(matches!(
            KeyIdentity::from_hex(&"00".repeat(32)),
            Err(IdentityError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_load_and_verify() {
        let path = std::env::temp_dir().join(format!("{}-onboard-key.hex", std::process::id()));
        std::fs::write(&path, format!("0x{}", SCALAR_ONE)).unwrap();
        let expected = KeyIdentity::from_hex(SCALAR_ONE).unwrap().did().to_string();

        let identity = KeyIdentity::load_and_verify(&path, &expected).unwrap();
        assert_eq!(identity.did(), expected);

        let other = KeyIdentity::from_secret_key(SecretKey::random(&mut OsRng));
        match KeyIdentity::load_and_verify(&path, other.did()) {
            Err(IdentityError::Mismatch { expected, derived }) => {
                assert_eq!(expected, other.did());
                assert_eq!(derived, identity.did());
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        std::fs::remove_file(&path).ok();
        assert!(matches!(
            KeyIdentity::load_and_verify(&path, &expected),
            Err(IdentityError::Io(_))
        ));
    }

    #[test]
    fn test_key_id_and_encoding_key() {
        let identity = KeyIdentity::from_hex(SCALAR_ONE).unwrap();
        let kid = identity.key_id();
        let (did, fragment) = kid.split_once('#').unwrap();
        assert_eq!(did, identity.did());
        assert!(fragment.starts_with("zDn"));
        assert!(identity.encoding_key().is_ok());
    }
}
