use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_DEVICE_ID_LEN: usize = 128;
const MAX_DEVICE_NAME_LEN: usize = 120;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn try_new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("device id cannot be empty".into());
        }
        if trimmed.len() > MAX_DEVICE_ID_LEN {
            return Err(format!("device id exceeds {MAX_DEVICE_ID_LEN} characters"));
        }
        if trimmed.chars().any(|c| c.is_control() || c == '/') {
            return Err("device id contains invalid characters".into());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_new(value)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

/// Human readable device label; falls back to the id when blank.
pub fn normalize_device_name(name: &str, id: &DeviceId) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_DEVICE_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        id.to_string()
    } else {
        cleaned.to_string()
    }
}

/// A P-256 public key kept in its raw `X || Y` form (64 bytes), base64 encoded.
///
/// Accepts the raw form, SEC1 uncompressed (65 bytes) and SEC1 compressed
/// (33 bytes) encodings, in standard or URL-safe base64.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevicePublicKey(String);

impl DevicePublicKey {
    pub fn parse(encoded: &str) -> Result<Self, String> {
        let trimmed = encoded.trim();
        let bytes = BASE64_STANDARD
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed.trim_end_matches('=')))
            .map_err(|err| format!("public key is not valid base64: {err}"))?;
        let key = decode_point(&bytes)?;
        Ok(Self::from_public_key(&key))
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        let point = key.to_encoded_point(false);
        // Drop the 0x04 SEC1 tag; the remainder is X || Y.
        Self(BASE64_STANDARD.encode(&point.as_bytes()[1..]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_public_key(&self) -> Result<PublicKey, String> {
        let bytes = BASE64_STANDARD
            .decode(&self.0)
            .map_err(|err| format!("stored public key is corrupt: {err}"))?;
        decode_point(&bytes)
    }
}

fn decode_point(bytes: &[u8]) -> Result<PublicKey, String> {
    let sec1 = match bytes.len() {
        64 => {
            let mut tagged = Vec::with_capacity(65);
            tagged.push(0x04);
            tagged.extend_from_slice(bytes);
            tagged
        }
        33 | 65 => bytes.to_vec(),
        other => return Err(format!("unexpected public key length {other}")),
    };
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| "public key is not a valid P-256 point".into())
}

impl fmt::Debug for DevicePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(12).collect();
        write!(f, "DevicePublicKey({prefix}…)")
    }
}

impl fmt::Display for DevicePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DevicePublicKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DevicePublicKey> for String {
    fn from(value: DevicePublicKey) -> Self {
        value.0
    }
}
