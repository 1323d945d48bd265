//! Core chain types shared by the dispatch and confirmation components

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error produced when parsing a hex-encoded fixed-size value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hex value {input:?}: expected {expected} bytes")]
pub struct ParseHexError {
    pub input: String,
    pub expected: usize,
}

fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], ParseHexError> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw).map_err(|_| ParseHexError {
        input: s.to_string(),
        expected: N,
    })?;
    bytes.try_into().map_err(|_| ParseHexError {
        input: s.to_string(),
        expected: N,
    })
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_fixed::<$len>(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// 20-byte account address
    Address,
    20
);

fixed_bytes!(
    /// 32-byte transaction or block hash
    TxHash,
    32
);

/// A transaction that has already been built and signed by the caller.
///
/// The dispatch core never decodes `raw`; it only needs the sender, nonce and
/// hash to route confirmations back to the right ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub from: Address,
    pub nonce: u64,
    pub hash: TxHash,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
    /// Transferred value in wei, used for optimistic balance tracking
    #[serde(default)]
    pub value: u128,
}

/// Transaction as observed inside a fetched block body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: u128,
}

/// Full block body with transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub hash: TxHash,
    pub parent_hash: TxHash,
    pub transactions: Vec<BlockTransaction>,
}

/// Post-inclusion record for a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub block_hash: TxHash,
    pub success: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub blob_gas_used: u64,
    pub blob_gas_price: u128,
    pub logs: usize,
}

impl Receipt {
    /// Total fee paid by the sender, including blob gas
    pub fn total_fee(&self) -> u128 {
        let execution = (self.gas_used as u128).saturating_mul(self.effective_gas_price);
        let blob = (self.blob_gas_used as u128).saturating_mul(self.blob_gas_price);
        execution.saturating_add(blob)
    }
}

pub(crate) mod hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_round_trip() {
        let addr = Address::new([0xab; 20]);
        let text = addr.to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.len(), 42);
        assert_eq!(text.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn test_hash_rejects_wrong_length() {
        let err = "0x1234".parse::<TxHash>().unwrap_err();
        assert_eq!(err.expected, 32);
    }

    #[test]
    fn test_signed_transaction_json() {
        let json = format!(
            r#"{{"from":"0x{}","nonce":7,"hash":"0x{}","raw":"0x02f8"}}"#,
            "11".repeat(20),
            "22".repeat(32)
        );
        let tx: SignedTransaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.raw, vec![0x02, 0xf8]);
        assert_eq!(tx.value, 0);
    }

    #[test]
    fn test_receipt_total_fee_includes_blob_gas() {
        let receipt = Receipt {
            tx_hash: TxHash::default(),
            block_number: 1,
            block_hash: TxHash::default(),
            success: true,
            gas_used: 21_000,
            effective_gas_price: 10,
            blob_gas_used: 131_072,
            blob_gas_price: 2,
            logs: 0,
        };
        assert_eq!(receipt.total_fee(), 210_000 + 262_144);
    }
}
