use chain_btc::address::generate_key;
use tracing::{debug, info};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::settings::{require_u64, MIN_FREE_ADDRESS};
use crate::types::{AddressKey, WalletAddress};

/// Keeps enough unassigned receiving addresses on hand.
pub struct AddressPool {
    ctx: CustodyContext,
}

impl AddressPool {
    pub fn new(ctx: CustodyContext) -> Self {
        Self { ctx }
    }

    /// Top the pool up to the `min_free_address` setting.
    pub fn ensure_free_addresses(&self) -> Result<usize, CustodyError> {
        let min_free = require_u64(self.ctx.settings.as_ref(), MIN_FREE_ADDRESS)?;
        self.ensure_free(min_free)
    }

    /// Generate `min_free - free` new keys and store them sealed, in one
    /// insert-if-absent write. Returns how many were inserted.
    pub fn ensure_free(&self, min_free: u64) -> Result<usize, CustodyError> {
        let free = self.ctx.store.count_free_addresses()?;
        if free >= min_free {
            debug!(free, min_free, "address pool is full");
            return Ok(0);
        }

        let missing = min_free - free;
        let mut keys = Vec::with_capacity(missing as usize);
        for _ in 0..missing {
            let generated = generate_key(self.ctx.network);
            keys.push(AddressKey {
                address: WalletAddress::from(generated.address),
                encrypted_key: self.ctx.cipher.seal(&generated.wif)?,
                use_tag: 0,
            });
        }

        let inserted = self.ctx.store.insert_address_keys(keys)?;
        info!(inserted, free, min_free, "address pool replenished");
        Ok(inserted)
    }
}
