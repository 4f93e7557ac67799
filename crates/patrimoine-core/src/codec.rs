//! Column codecs applied at the persistence boundary.
//!
//! A codec turns a plain value into an opaque text blob for an encrypted
//! column and back. `None` maps to SQL `NULL` without touching the cipher.
//! A blob that is present but fails to authenticate or parse is reported as
//! [`DataCorruptionError`](crate::DataCorruptionError) carrying the field
//! name; it is never replaced with a default.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use zeroize::Zeroizing;

use crate::cipher::{self, FIELD_AAD};
use crate::corruption::{self, json_type_name, DecodeFault};
use crate::error::Result;
use crate::keys::KeyProvider;
use crate::store::Component;

// ── Cipher ──────────────────────────────────────────────────────────────────

/// Authenticated encryption bound to a key provider.
///
/// Encryption always uses the provider's active key. Decryption tries the
/// active key first, then every retired key the provider still holds.
#[derive(Clone)]
pub struct FieldCipher {
    provider: Arc<dyn KeyProvider>,
}

impl FieldCipher {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn KeyProvider> {
        &self.provider
    }

    pub fn seal_bytes(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let key = self.provider.active_key()?;
        cipher::seal(key.key(), plaintext, aad)
    }

    /// The outer result reports provider failures, the inner one decode
    /// faults.
    pub fn open_bytes(
        &self,
        envelope: &[u8],
        aad: &[u8],
    ) -> Result<std::result::Result<Zeroizing<Vec<u8>>, DecodeFault>> {
        let active = self.provider.active_key()?;
        match cipher::open(active.key(), envelope, aad) {
            Err(DecodeFault::Authentication) => {}
            other => return Ok(other),
        }
        for retired in self.provider.retired_keys() {
            if let Ok(plaintext) = cipher::open(retired.key(), envelope, aad) {
                debug!(version = retired.version, "decrypted with archived key");
                return Ok(Ok(plaintext));
            }
        }
        Ok(Err(DecodeFault::Authentication))
    }

    pub fn seal_text(&self, plaintext: &str) -> Result<String> {
        let envelope = self.seal_bytes(plaintext.as_bytes(), FIELD_AAD)?;
        Ok(URL_SAFE.encode(envelope))
    }

    pub fn open_text(&self, blob: &str) -> Result<std::result::Result<String, DecodeFault>> {
        if blob.is_empty() {
            return Ok(Err(DecodeFault::Missing));
        }
        let envelope = match URL_SAFE.decode(blob) {
            Ok(bytes) => bytes,
            Err(e) => return Ok(Err(DecodeFault::Encoding(e))),
        };
        Ok(self
            .open_bytes(&envelope, FIELD_AAD)?
            .and_then(|pt| String::from_utf8(pt.to_vec()).map_err(DecodeFault::from)))
    }
}

// ── Codec contract ──────────────────────────────────────────────────────────

pub trait FieldCodec {
    type Value;

    fn encode(&self, value: Option<&Self::Value>) -> Result<Option<String>>;

    fn decode(&self, field: &str, blob: Option<&str>) -> Result<Option<Self::Value>>;
}

fn decode_with<T>(
    cipher: &FieldCipher,
    field: &str,
    blob: Option<&str>,
    parse: impl FnOnce(String) -> std::result::Result<T, DecodeFault>,
) -> Result<Option<T>> {
    let Some(blob) = blob else {
        return Ok(None);
    };
    let attempt = cipher.open_text(blob)?.and_then(parse);
    Ok(corruption::resolve(field, attempt)?)
}

fn parse_json(text: String) -> std::result::Result<serde_json::Value, DecodeFault> {
    serde_json::from_str(&text).map_err(DecodeFault::Json)
}

// ── String ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StringCodec {
    cipher: FieldCipher,
}

impl StringCodec {
    pub fn new(cipher: FieldCipher) -> Self {
        Self { cipher }
    }
}

impl FieldCodec for StringCodec {
    type Value = String;

    fn encode(&self, value: Option<&String>) -> Result<Option<String>> {
        value.map(|v| self.cipher.seal_text(v)).transpose()
    }

    fn decode(&self, field: &str, blob: Option<&str>) -> Result<Option<String>> {
        decode_with(&self.cipher, field, blob, Ok)
    }
}

// ── JSON document ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JsonCodec {
    cipher: FieldCipher,
}

impl JsonCodec {
    pub fn new(cipher: FieldCipher) -> Self {
        Self { cipher }
    }
}

impl FieldCodec for JsonCodec {
    type Value = serde_json::Value;

    fn encode(&self, value: Option<&serde_json::Value>) -> Result<Option<String>> {
        value
            .map(|v| {
                let text = serde_json::to_string(v)?;
                self.cipher.seal_text(&text)
            })
            .transpose()
    }

    fn decode(&self, field: &str, blob: Option<&str>) -> Result<Option<serde_json::Value>> {
        decode_with(&self.cipher, field, blob, parse_json)
    }
}

// ── Mapping ─────────────────────────────────────────────────────────────────

/// JSON object root decoded into a `BTreeMap<String, V>`.
pub struct MapCodec<V> {
    cipher: FieldCipher,
    _value: PhantomData<fn() -> V>,
}

impl<V> MapCodec<V> {
    pub fn new(cipher: FieldCipher) -> Self {
        Self {
            cipher,
            _value: PhantomData,
        }
    }
}

impl<V> Clone for MapCodec<V> {
    fn clone(&self) -> Self {
        Self::new(self.cipher.clone())
    }
}

impl<V: Serialize + DeserializeOwned> FieldCodec for MapCodec<V> {
    type Value = BTreeMap<String, V>;

    fn encode(&self, value: Option<&Self::Value>) -> Result<Option<String>> {
        value
            .map(|v| {
                let text = serde_json::to_string(v)?;
                self.cipher.seal_text(&text)
            })
            .transpose()
    }

    fn decode(&self, field: &str, blob: Option<&str>) -> Result<Option<Self::Value>> {
        decode_with(&self.cipher, field, blob, |text| {
            let root = parse_json(text)?;
            if !root.is_object() {
                return Err(DecodeFault::Shape {
                    expected: "object",
                    found: json_type_name(&root),
                });
            }
            serde_json::from_value(root).map_err(DecodeFault::Schema)
        })
    }
}

// ── Sequence ────────────────────────────────────────────────────────────────

/// JSON array root decoded into a `Vec<V>`.
pub struct ListCodec<V> {
    cipher: FieldCipher,
    _value: PhantomData<fn() -> V>,
}

impl<V> ListCodec<V> {
    pub fn new(cipher: FieldCipher) -> Self {
        Self {
            cipher,
            _value: PhantomData,
        }
    }
}

impl<V> Clone for ListCodec<V> {
    fn clone(&self) -> Self {
        Self::new(self.cipher.clone())
    }
}

impl<V: Serialize + DeserializeOwned> FieldCodec for ListCodec<V> {
    type Value = Vec<V>;

    fn encode(&self, value: Option<&Self::Value>) -> Result<Option<String>> {
        value
            .map(|v| {
                let text = serde_json::to_string(v)?;
                self.cipher.seal_text(&text)
            })
            .transpose()
    }

    fn decode(&self, field: &str, blob: Option<&str>) -> Result<Option<Self::Value>> {
        decode_with(&self.cipher, field, blob, |text| {
            let root = parse_json(text)?;
            if !root.is_array() {
                return Err(DecodeFault::Shape {
                    expected: "array",
                    found: json_type_name(&root),
                });
            }
            serde_json::from_value(root).map_err(DecodeFault::Schema)
        })
    }
}

// ── Bundle ──────────────────────────────────────────────────────────────────

/// The codec set used by the store, all sharing one key provider.
#[derive(Clone)]
pub struct Codecs {
    pub string: StringCodec,
    pub json: JsonCodec,
    /// Category or region to percentage.
    pub allocation: MapCodec<f64>,
    pub components: ListCodec<Component>,
}

impl Codecs {
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        let cipher = FieldCipher::new(provider);
        Self {
            string: StringCodec::new(cipher.clone()),
            json: JsonCodec::new(cipher.clone()),
            allocation: MapCodec::new(cipher.clone()),
            components: ListCodec::new(cipher),
        }
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.string.cipher
    }
}

// ── Lazy attribute ──────────────────────────────────────────────────────────

/// An encrypted attribute as loaded from a row. Decoded only when opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    field: &'static str,
    blob: Option<String>,
}

impl Sealed {
    pub fn new(field: &'static str, blob: Option<String>) -> Self {
        Self { field, blob }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn blob(&self) -> Option<&str> {
        self.blob.as_deref()
    }

    pub fn is_absent(&self) -> bool {
        self.blob.is_none()
    }

    pub fn open<C: FieldCodec>(&self, codec: &C) -> Result<Option<C::Value>> {
        codec.decode(self.field, self.blob.as_deref())
    }
}
