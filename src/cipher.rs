//! Per-value encryption and the `ENC[...]` envelope.
//!
//! Format: `ENC[AES256_GCM,data:<b64>,iv:<b64>,tag:<b64>,type:<str|int|float|bool>]`
//!
//! The AAD passed in is the value's key path, so a ciphertext copied to a
//! different path no longer authenticates.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;

use crate::crypto::{self, NONCE_LEN, TAG_LEN};
use crate::error::{Result, SealError};
use crate::keys::DataKey;
use crate::tree::Scalar;

const CIPHER_NAME: &str = "AES256_GCM";

fn envelope_regex() -> &'static Regex {
    static ENVELOPE: OnceLock<Regex> = OnceLock::new();
    ENVELOPE.get_or_init(|| {
        Regex::new(r"^ENC\[AES256_GCM,data:(.+),iv:(.+),tag:(.+),type:(.+)\]$")
            .unwrap_or_else(|e| panic!("envelope pattern is a valid regex: {e}"))
    })
}

/// The plaintext type recorded in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Str,
    Int,
    Float,
    Bool,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Str => "str",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
        }
    }

    fn of(scalar: &Scalar) -> Result<Self> {
        match scalar {
            Scalar::String(_) => Ok(ValueType::Str),
            Scalar::Int(_) => Ok(ValueType::Int),
            Scalar::Float(_) => Ok(ValueType::Float),
            Scalar::Bool(_) => Ok(ValueType::Bool),
            Scalar::Null => Err(SealError::UnsupportedValue("null cannot be encrypted".into())),
        }
    }
}

impl FromStr for ValueType {
    type Err = SealError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "str" => Ok(ValueType::Str),
            "int" => Ok(ValueType::Int),
            "float" => Ok(ValueType::Float),
            "bool" => Ok(ValueType::Bool),
            other => Err(SealError::MalformedEnvelope(format!("unknown type '{other}'"))),
        }
    }
}

/// A parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    pub data: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub value_type: ValueType,
}

impl EncryptedValue {
    /// Parse an envelope string. Fails closed on anything unexpected.
    pub fn parse(envelope: &str) -> Result<Self> {
        let captures = envelope_regex()
            .captures(envelope)
            .ok_or_else(|| SealError::MalformedEnvelope("input does not match the envelope format".into()))?;

        let data = decode_field("data", &captures[1])?;
        let iv = decode_field("iv", &captures[2])?;
        let tag = decode_field("tag", &captures[3])?;
        let value_type = captures[4].parse::<ValueType>()?;

        let iv: [u8; NONCE_LEN] = iv.try_into().map_err(|iv: Vec<u8>| {
            SealError::MalformedEnvelope(format!("iv is {} bytes, expected {NONCE_LEN}", iv.len()))
        })?;
        let tag: [u8; TAG_LEN] = tag.try_into().map_err(|tag: Vec<u8>| {
            SealError::MalformedEnvelope(format!("tag is {} bytes, expected {TAG_LEN}", tag.len()))
        })?;

        Ok(Self {
            data,
            iv,
            tag,
            value_type,
        })
    }
}

impl fmt::Display for EncryptedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ENC[{CIPHER_NAME},data:{},iv:{},tag:{},type:{}]",
            STANDARD.encode(&self.data),
            STANDARD.encode(self.iv),
            STANDARD.encode(self.tag),
            self.value_type.as_str()
        )
    }
}

fn decode_field(name: &str, field: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(field)
        .map_err(|e| SealError::MalformedEnvelope(format!("invalid base64 in {name}: {e}")))
}

/// Cheap check for whether a string is shaped like an envelope.
pub fn is_envelope(value: &str) -> bool {
    envelope_regex().is_match(value)
}

/// Encrypt a scalar, binding it to `aad`.
///
/// The empty string is returned unchanged.
pub fn encrypt(scalar: &Scalar, key: &DataKey, aad: &str) -> Result<String> {
    let value_type = ValueType::of(scalar)?;
    if let Scalar::String(s) = scalar {
        if s.is_empty() {
            return Ok(String::new());
        }
    }
    let plaintext = scalar
        .to_bytes()
        .ok_or_else(|| SealError::UnsupportedValue("null cannot be encrypted".into()))?;

    let sealed = crypto::seal(key.as_bytes(), &plaintext, aad.as_bytes())?;
    let envelope = EncryptedValue {
        data: sealed.ciphertext,
        iv: sealed.nonce,
        tag: sealed.tag,
        value_type,
    };
    Ok(envelope.to_string())
}

/// Decrypt an envelope produced by [`encrypt`] under the same `aad`.
///
/// An empty string decrypts to an empty string. A tag or AAD mismatch is
/// reported as `AuthenticationFailure` naming the path.
pub fn decrypt(envelope: &str, key: &DataKey, aad: &str) -> Result<Scalar> {
    if envelope.is_empty() {
        return Ok(Scalar::String(String::new()));
    }
    let parsed = EncryptedValue::parse(envelope)?;
    let plaintext = crypto::open(
        key.as_bytes(),
        &parsed.iv,
        &parsed.data,
        &parsed.tag,
        aad.as_bytes(),
    )
    .map_err(|err| match err {
        SealError::DecryptionFailure => SealError::AuthenticationFailure {
            path: aad.trim_end_matches(':').to_string(),
        },
        other => other,
    })?;

    let text = String::from_utf8(plaintext)
        .map_err(|_| SealError::UnsupportedValue("decrypted value is not valid UTF-8".into()))?;

    match parsed.value_type {
        ValueType::Str => Ok(Scalar::String(text)),
        ValueType::Int => text
            .parse::<i64>()
            .map(Scalar::Int)
            .map_err(|e| SealError::UnsupportedValue(format!("invalid int '{text}': {e}"))),
        ValueType::Float => text
            .parse::<f64>()
            .map(Scalar::Float)
            .map_err(|e| SealError::UnsupportedValue(format!("invalid float '{text}': {e}"))),
        ValueType::Bool => parse_bool(&text).map(Scalar::Bool),
    }
}

fn parse_bool(text: &str) -> Result<bool> {
    match text {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(SealError::UnsupportedValue(format!("invalid bool '{other}'"))),
    }
}
