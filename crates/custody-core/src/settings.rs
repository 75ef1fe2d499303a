//! Runtime key/value settings, read fresh on every job run.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::CustodyError;
use crate::types::WalletAddress;

pub const MIN_FREE_ADDRESS: &str = "min_free_address";
pub const BLOCK_CONFIRM_NUM: &str = "block_confirm_num";
pub const COLD_WALLET_ADDRESS: &str = "cold_wallet_address";
pub const HOT_WALLET_ADDRESS: &str = "hot_wallet_address";
pub const TO_USER_FEE_RATE: &str = "to_user_fee_rate";
pub const TO_COLD_FEE_RATE: &str = "to_cold_fee_rate";

pub trait Settings: Send + Sync {
    fn get_int(&self, key: &str) -> Option<i64>;

    fn get_str(&self, key: &str) -> Option<String>;

    fn set_int(&self, key: &str, value: i64);

    fn set_str(&self, key: &str, value: &str);
}

/// A non-negative integer setting.
pub fn require_u64(settings: &dyn Settings, key: &str) -> Result<u64, CustodyError> {
    let value = settings
        .get_int(key)
        .ok_or_else(|| CustodyError::MissingSetting(key.to_string()))?;
    u64::try_from(value).map_err(|_| CustodyError::InvalidSetting {
        key: key.to_string(),
        reason: format!("{value} is negative"),
    })
}

/// A non-empty address setting.
pub fn require_address(settings: &dyn Settings, key: &str) -> Result<WalletAddress, CustodyError> {
    match settings.get_str(key) {
        Some(value) if !value.is_empty() => Ok(WalletAddress::new(value)),
        Some(_) => Err(CustodyError::InvalidSetting {
            key: key.to_string(),
            reason: "empty".into(),
        }),
        None => Err(CustodyError::MissingSetting(key.to_string())),
    }
}

/// In-process settings table.
#[derive(Debug, Default)]
pub struct MemorySettings {
    ints: RwLock<HashMap<String, i64>>,
    strs: RwLock<HashMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_int(self, key: &str, value: i64) -> Self {
        self.set_int(key, value);
        self
    }

    pub fn with_str(self, key: &str, value: &str) -> Self {
        self.set_str(key, value);
        self
    }
}

impl Settings for MemorySettings {
    fn get_int(&self, key: &str) -> Option<i64> {
        self.ints.read().get(key).copied()
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.strs.read().get(key).cloned()
    }

    fn set_int(&self, key: &str, value: i64) {
        self.ints.write().insert(key.to_string(), value);
    }

    fn set_str(&self, key: &str, value: &str) {
        self.strs.write().insert(key.to_string(), value.to_string());
    }
}
