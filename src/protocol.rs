//! Wire vocabulary shared with out-of-process agents.
//!
//! Requests and responses are [`AgentPayload`]s: an action plus extras. A
//! response always carries `result_code`; the remaining extras depend on the
//! action and on the code. On the socket transport each payload travels inside
//! a [`ProtocolEnvelope`] tagged with the request's correlation id.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::types::{AgentOutcome, AgentPayload, InteractionDescriptor};

pub const PROTOCOL_VERSION: u32 = 1;

pub const MSG_AGENT_REQUEST: &str = "agent_request";
pub const MSG_AGENT_RESPONSE: &str = "agent_response";

pub const ACTION_SELECT_KEY: &str = "select_key";
pub const ACTION_PUBLIC_KEY: &str = "public_key";
pub const ACTION_SIGN: &str = "sign";

pub const EXTRA_RESULT_CODE: &str = "result_code";
pub const EXTRA_ERROR: &str = "error";
pub const EXTRA_INTERACTION: &str = "interaction";
pub const EXTRA_KEY_ID: &str = "key_id";
pub const EXTRA_KEY_DESCRIPTION: &str = "key_description";
pub const EXTRA_PUBLIC_KEY: &str = "public_key";
pub const EXTRA_ALGORITHM: &str = "algorithm";
pub const EXTRA_CHALLENGE: &str = "challenge";
pub const EXTRA_HASH_ALGORITHM: &str = "hash_algorithm";
pub const EXTRA_SIGNATURE: &str = "signature";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEnvelope<T> {
    pub v: u32,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub payload: T,
}

impl<T> ProtocolEnvelope<T> {
    pub fn new(msg_type: &str, request_id: Option<String>, payload: T) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            msg_type: msg_type.to_string(),
            request_id,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Error,
    Success,
    UserInteractionRequired,
}

impl ResultCode {
    pub fn as_i64(self) -> i64 {
        match self {
            ResultCode::Error => 0,
            ResultCode::Success => 1,
            ResultCode::UserInteractionRequired => 2,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0 => Some(ResultCode::Error),
            1 => Some(ResultCode::Success),
            2 => Some(ResultCode::UserInteractionRequired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Hash algorithms a signing request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Accepts JCA style names (`SHA-256`) and SSH signature names (`rsa-sha2-256`).
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "SHA-1" | "SHA1" | "SSH-RSA" => Ok(HashAlgorithm::Sha1),
            "SHA-256" | "SHA256" | "RSA-SHA2-256" => Ok(HashAlgorithm::Sha256),
            "SHA-384" | "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA-512" | "SHA512" | "RSA-SHA2-512" => Ok(HashAlgorithm::Sha512),
            _ => Err(AgentError::AlgorithmUnsupported(name.to_string())),
        }
    }

    pub fn agent_code(self) -> i64 {
        match self {
            HashAlgorithm::Sha1 => 1,
            HashAlgorithm::Sha256 => 2,
            HashAlgorithm::Sha384 => 3,
            HashAlgorithm::Sha512 => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }
}

/// Key algorithms an agent may report for a public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Dsa,
    Ecdsa,
    Eddsa,
}

impl KeyAlgorithm {
    pub fn from_agent_code(code: i64) -> Result<Self> {
        match code {
            0 => Ok(KeyAlgorithm::Rsa),
            1 => Ok(KeyAlgorithm::Dsa),
            2 => Ok(KeyAlgorithm::Ecdsa),
            3 => Ok(KeyAlgorithm::Eddsa),
            other => Err(AgentError::AlgorithmUnsupported(format!(
                "key algorithm code {other}"
            ))),
        }
    }

    pub fn agent_code(self) -> i64 {
        match self {
            KeyAlgorithm::Rsa => 0,
            KeyAlgorithm::Dsa => 1,
            KeyAlgorithm::Ecdsa => 2,
            KeyAlgorithm::Eddsa => 3,
        }
    }

    /// Key type name used when the key is later decoded for authentication.
    pub fn key_type(self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "RSA",
            KeyAlgorithm::Dsa => "DSA",
            KeyAlgorithm::Ecdsa => "EC",
            KeyAlgorithm::Eddsa => "Ed25519",
        }
    }

    pub fn matches(self, algorithm: &ssh_key::Algorithm) -> bool {
        matches!(
            (self, algorithm),
            (KeyAlgorithm::Rsa, ssh_key::Algorithm::Rsa { .. })
                | (KeyAlgorithm::Dsa, ssh_key::Algorithm::Dsa)
                | (KeyAlgorithm::Ecdsa, ssh_key::Algorithm::Ecdsa { .. })
                | (KeyAlgorithm::Eddsa, ssh_key::Algorithm::Ed25519)
        )
    }
}

pub fn select_key_request() -> AgentPayload {
    AgentPayload::new(ACTION_SELECT_KEY)
}

pub fn public_key_request(key_id: &str) -> AgentPayload {
    AgentPayload::new(ACTION_PUBLIC_KEY).with_extra(EXTRA_KEY_ID, key_id)
}

pub fn sign_request(key_id: &str, challenge: &[u8], hash: HashAlgorithm) -> AgentPayload {
    AgentPayload::new(ACTION_SIGN)
        .with_extra(EXTRA_KEY_ID, key_id)
        .with_extra(EXTRA_CHALLENGE, encode_bytes(challenge))
        .with_extra(EXTRA_HASH_ALGORITHM, hash.agent_code())
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Decode a base64 extra. `Ok(None)` when the key is absent.
pub fn decode_bytes(payload: &AgentPayload, key: &str) -> Result<Option<Vec<u8>>> {
    let Some(value) = payload.extra(key) else {
        return Ok(None);
    };
    let encoded = value
        .as_str()
        .ok_or_else(|| AgentError::protocol(format!("{key} is not a string")))?;
    B64.decode(encoded)
        .map(Some)
        .map_err(|e| AgentError::protocol(format!("base64 decode {key}: {e}")))
}

/// Map a raw agent response onto the outcome contract.
pub fn interpret_response(response: AgentPayload) -> AgentOutcome {
    let Some(raw_code) = response.extra(EXTRA_RESULT_CODE) else {
        return AgentOutcome::Failure(AgentError::protocol("response has no result_code"));
    };
    let Some(code) = raw_code.as_i64().and_then(ResultCode::from_i64) else {
        return AgentOutcome::Failure(AgentError::protocol(format!(
            "unknown result_code {raw_code}"
        )));
    };

    match code {
        ResultCode::Success => AgentOutcome::Success(response),
        ResultCode::Error => {
            let body = response
                .extra(EXTRA_ERROR)
                .cloned()
                .and_then(|value| serde_json::from_value::<AgentErrorBody>(value).ok())
                .unwrap_or(AgentErrorBody {
                    code: -1,
                    message: "agent reported an unspecified error".to_string(),
                });
            AgentOutcome::Failure(AgentError::Agent {
                code: body.code,
                message: body.message,
            })
        }
        ResultCode::UserInteractionRequired => match response.extra(EXTRA_INTERACTION) {
            Some(value @ Value::Object(_)) => {
                match serde_json::from_value::<InteractionDescriptor>(value.clone()) {
                    Ok(descriptor) => AgentOutcome::InteractionRequired(descriptor),
                    Err(error) => AgentOutcome::Failure(AgentError::protocol(format!(
                        "malformed interaction descriptor: {error}"
                    ))),
                }
            }
            _ => AgentOutcome::Failure(AgentError::protocol(
                "interaction required without an interaction descriptor",
            )),
        },
    }
}
