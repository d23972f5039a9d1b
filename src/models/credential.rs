// src/models/credential.rs
//! Credential issuance request sent to the Issuer.
//!
//! Describes a LEAR (Legal Entity Appointed Representative) mandate: the
//! organization granting the mandate (`mandator`), the natural person
//! receiving it (`mandatee`) and the powers delegated to them.
//!
//! Empty string fields are omitted from the wire form.

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Body of a credential issuance request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CredentialIssuanceRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,

    /// `S` for synchronous issuance
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_mode: String,

    /// Example: "jwt_vc_json"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response_uri: String,

    pub payload: Payload,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub mandator: Mandator,
    pub mandatee: Mandatee,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub power: Vec<Power>,
}

/// Organization granting the mandate.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mandator {
    /// Example: "ES-B12345678"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization_identifier: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub organization: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    /// Legal representative signing for the organization
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub common_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email_address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
}

/// Natural person receiving the mandate.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mandatee {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nationality: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

/// A delegated power, e.g. `Onboarding` in the `DOME` domain.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Power {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Actions::is_empty")]
    pub action: Actions,
}

/// The `action` claim: one or more tokens.
///
/// A single token is written as a bare string, several as an array. Both
/// forms are accepted when reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actions(pub Vec<String>);

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for Actions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Actions(iter.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Actions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [single] => serializer.serialize_str(single),
            many => many.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Actions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ActionsVisitor;

        impl<'de> Visitor<'de> for ActionsVisitor {
            type Value = Actions;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or an array of strings")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Actions, E> {
                Ok(Actions(vec![value.to_string()]))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Actions, A::Error> {
                let mut actions = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(action) = seq.next_element::<String>()? {
                    actions.push(action);
                }
                Ok(Actions(actions))
            }
        }

        deserializer.deserialize_any(ActionsVisitor)
    }
}
