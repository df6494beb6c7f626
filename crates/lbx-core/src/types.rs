use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::proto;

/// Kind of secret held by a vault item.
///
/// The discriminant values are part of the wire format and the local schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum ItemType {
    Password = 1,
    Card = 2,
    Text = 3,
    Binary = 4,
    BinaryLarge = 5,
}

impl ItemType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemType::Password => "password",
            ItemType::Card => "card",
            ItemType::Text => "text",
            ItemType::Binary => "binary",
            ItemType::BinaryLarge => "binary_large",
        }
    }
}

impl TryFrom<i32> for ItemType {
    type Error = CoreError;

    fn try_from(value: i32) -> CoreResult<Self> {
        match value {
            1 => Ok(ItemType::Password),
            2 => Ok(ItemType::Card),
            3 => Ok(ItemType::Text),
            4 => Ok(ItemType::Binary),
            5 => Ok(ItemType::BinaryLarge),
            other => Err(CoreError::UnknownItemType(other)),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single secret as stored locally, on the server, and on the wire.
///
/// `value` is always ciphertext. `server_updated_at` is the last version the
/// server acknowledged and doubles as the expected version on writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultItem {
    pub id: String,
    pub name: String,
    pub item_type: ItemType,
    pub value: Vec<u8>,
    pub server_updated_at: i64,
    pub client_updated_at: i64,
    pub is_deleted: bool,
}

impl VaultItem {
    /// An item is dirty while it carries a local edit the server has not acknowledged.
    pub fn is_dirty(&self) -> bool {
        self.client_updated_at != self.server_updated_at
    }
}

impl TryFrom<proto::VaultItem> for VaultItem {
    type Error = CoreError;

    fn try_from(item: proto::VaultItem) -> CoreResult<Self> {
        Ok(VaultItem {
            item_type: ItemType::try_from(item.item_type)?,
            id: item.id,
            name: item.name,
            value: item.value,
            server_updated_at: item.server_updated_at,
            client_updated_at: item.client_updated_at,
            is_deleted: item.is_deleted,
        })
    }
}

impl From<VaultItem> for proto::VaultItem {
    fn from(item: VaultItem) -> Self {
        proto::VaultItem {
            id: item.id,
            name: item.name,
            item_type: item.item_type.as_i32(),
            value: item.value,
            server_updated_at: item.server_updated_at,
            client_updated_at: item.client_updated_at,
            is_deleted: item.is_deleted,
        }
    }
}

/// Current wall-clock time in unix microseconds.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Next local edit stamp for an item: strictly after `previous` and never
/// equal to `server_updated_at`, so a fresh edit always reads as dirty.
pub fn next_client_stamp(previous: i64, server_updated_at: i64) -> i64 {
    let mut stamp = now_micros().max(previous + 1);
    if stamp == server_updated_at {
        stamp += 1;
    }
    stamp
}

/// Syntactic email check. No DNS lookups.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> VaultItem {
        VaultItem {
            id: "a".into(),
            name: "mail".into(),
            item_type: ItemType::Password,
            value: vec![1, 2, 3],
            server_updated_at: 150,
            client_updated_at: 150,
            is_deleted: false,
        }
    }

    #[test]
    fn test_item_type_discriminants() {
        for kind in [
            ItemType::Password,
            ItemType::Card,
            ItemType::Text,
            ItemType::Binary,
            ItemType::BinaryLarge,
        ] {
            assert_eq!(ItemType::try_from(kind.as_i32()).unwrap(), kind);
        }
        assert!(matches!(
            ItemType::try_from(0),
            Err(CoreError::UnknownItemType(0))
        ));
        assert!(ItemType::try_from(6).is_err());
    }

    #[test]
    fn test_dirty_flag() {
        let mut it = item();
        assert!(!it.is_dirty());
        it.client_updated_at = 160;
        assert!(it.is_dirty());
    }

    #[test]
    fn test_proto_rejects_unknown_type() {
        let mut wire: proto::VaultItem = item().into();
        wire.item_type = 42;
        assert!(VaultItem::try_from(wire).is_err());
    }

    #[test]
    fn test_next_stamp_is_dirty_and_monotonic() {
        let far_future = now_micros() + 10_000_000;
        let stamp = next_client_stamp(far_future, far_future + 1);
        assert_eq!(stamp, far_future + 2);

        let stamp = next_client_stamp(100, 100);
        assert!(stamp > 100);
    }

    #[test]
    fn test_email_syntax() {
        assert!(is_valid_email("a@x.com"));
        assert!(is_valid_email("first.last+tag@mail.example.org"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email("a@@x.com"));
        assert!(!is_valid_email("a b@x.com"));
        assert!(!is_valid_email("a@x..com"));
        assert!(!is_valid_email(&format!("{}@x.com", "a".repeat(65))));
    }
}
