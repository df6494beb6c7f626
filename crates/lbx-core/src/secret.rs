//! Decrypted item values.
//!
//! The plaintext inside an item's ciphertext is the JSON encoding of one of
//! the shapes below. Which shape is decided by the item's [`ItemType`], never
//! by sniffing the payload.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::ItemType;

/// Free-form user annotations attached to any secret.
pub type Meta = BTreeMap<String, String>;

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Password {
    #[serde(default)]
    pub meta: Meta,
    pub login: String,
    pub password: String,
}

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Card {
    #[serde(default)]
    pub meta: Meta,
    pub holder: String,
    pub expires: String,
    pub number: String,
    pub csc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Text {
    #[serde(default)]
    pub meta: Meta,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Binary {
    #[serde(default)]
    pub meta: Meta,
    pub filename: String,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Closed set of decodable secret shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretValue {
    Password(Password),
    Card(Card),
    Text(Text),
    Binary(Binary),
}

impl SecretValue {
    pub fn item_type(&self) -> ItemType {
        match self {
            SecretValue::Password(_) => ItemType::Password,
            SecretValue::Card(_) => ItemType::Card,
            SecretValue::Text(_) => ItemType::Text,
            SecretValue::Binary(_) => ItemType::Binary,
        }
    }

    pub fn meta(&self) -> &Meta {
        match self {
            SecretValue::Password(v) => &v.meta,
            SecretValue::Card(v) => &v.meta,
            SecretValue::Text(v) => &v.meta,
            SecretValue::Binary(v) => &v.meta,
        }
    }

    /// Serialize the inner shape. The discriminant travels separately as the item type.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let bytes = match self {
            SecretValue::Password(v) => serde_json::to_vec(v)?,
            SecretValue::Card(v) => serde_json::to_vec(v)?,
            SecretValue::Text(v) => serde_json::to_vec(v)?,
            SecretValue::Binary(v) => serde_json::to_vec(v)?,
        };
        Ok(bytes)
    }

    /// Decode plaintext according to the item type.
    pub fn decode(item_type: ItemType, bytes: &[u8]) -> CoreResult<Self> {
        match item_type {
            ItemType::Password => Ok(SecretValue::Password(serde_json::from_slice(bytes)?)),
            ItemType::Card => Ok(SecretValue::Card(serde_json::from_slice(bytes)?)),
            ItemType::Text => Ok(SecretValue::Text(serde_json::from_slice(bytes)?)),
            ItemType::Binary => Ok(SecretValue::Binary(serde_json::from_slice(bytes)?)),
            ItemType::BinaryLarge => Err(CoreError::UnsupportedItemType(item_type)),
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Password")
            .field("meta", &self.meta)
            .field("login", &self.login)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("meta", &self.meta)
            .field("holder", &self.holder)
            .field("expires", &self.expires)
            .field("number", &"[REDACTED]")
            .field("csc", &"[REDACTED]")
            .finish()
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_uses_item_type() {
        let value = SecretValue::Text(Text {
            meta: Meta::new(),
            text: "remember the milk".into(),
        });
        let bytes = value.encode().unwrap();

        assert_eq!(SecretValue::decode(ItemType::Text, &bytes).unwrap(), value);
        // A text payload does not satisfy the password shape.
        assert!(SecretValue::decode(ItemType::Password, &bytes).is_err());
    }

    #[test]
    fn test_binary_large_is_not_decodable() {
        let err = SecretValue::decode(ItemType::BinaryLarge, b"{}").unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedItemType(ItemType::BinaryLarge)));
    }

    #[test]
    fn test_binary_payload_is_base64() {
        let value = SecretValue::Binary(Binary {
            meta: Meta::new(),
            filename: "id_rsa".into(),
            data: vec![0, 159, 255],
        });
        let json = String::from_utf8(value.encode().unwrap()).unwrap();
        assert!(json.contains("\"AJ//\""), "got {json}");
        assert_eq!(
            SecretValue::decode(ItemType::Binary, json.as_bytes()).unwrap(),
            value
        );
    }

    #[test]
    fn test_missing_meta_defaults_empty() {
        let decoded =
            SecretValue::decode(ItemType::Password, br#"{"login":"me","password":"pw"}"#)
                .unwrap();
        assert!(decoded.meta().is_empty());
        assert_eq!(decoded.item_type(), ItemType::Password);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let card = Card {
            number: "4111111111111111".into(),
            csc: "123".into(),
            ..Default::default()
        };
        let out = format!("{card:?}");
        assert!(!out.contains("4111"));
        assert!(!out.contains("123"));
    }
}
