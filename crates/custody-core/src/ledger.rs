use std::sync::Arc;

use bitcoin::{OutPoint, Txid};

use crate::error::CustodyError;
use crate::store::{Store, StoreError};
use crate::types::{SpendRef, Utxo, UtxoKind, WalletAddress};

/// Output selection and status changes over the store.
///
/// Nothing is cached: each call reads the store, so two jobs working on
/// different output kinds never see stale state from each other.
#[derive(Clone)]
pub struct UtxoLedger {
    store: Arc<dyn Store>,
}

impl UtxoLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Spendable outputs of `kind` in ledger order.
    pub fn select_spendable(
        &self,
        kind: UtxoKind,
        limit: usize,
    ) -> Result<Vec<Utxo>, CustodyError> {
        Ok(self.store.spendable_utxos(kind, None, limit)?)
    }

    /// Spendable outputs of `kind` held by one of `addresses`.
    pub fn select_spendable_at(
        &self,
        kind: UtxoKind,
        addresses: &[WalletAddress],
        limit: usize,
    ) -> Result<Vec<Utxo>, CustodyError> {
        Ok(self.store.spendable_utxos(kind, Some(addresses), limit)?)
    }

    /// Claim `outpoints` as the inputs of `spend_txid`, input index following
    /// slice order. All or nothing.
    pub fn mark_used(&self, outpoints: &[OutPoint], spend_txid: Txid) -> Result<(), CustodyError> {
        let claims = spend_claims(outpoints, spend_txid);
        self.store.mark_utxos_used(&claims)?;
        Ok(())
    }

    /// Record that `outpoint` was spent on chain by input `spend_index` of
    /// `spend_txid`.
    pub fn mark_confirmed(
        &self,
        outpoint: OutPoint,
        spend_txid: Txid,
        spend_index: u32,
    ) -> Result<(), CustodyError> {
        let spend = SpendRef {
            txid: spend_txid,
            index: spend_index,
        };
        if self.store.confirm_spends(&[(outpoint, spend)])? == 0 {
            let known = !self.store.utxos_by_outpoints(&[outpoint])?.is_empty();
            if !known {
                return Err(StoreError::NotFound(format!("utxo {outpoint}")).into());
            }
        }
        Ok(())
    }
}

/// Pair each outpoint with its input position in `spend_txid`.
pub fn spend_claims(outpoints: &[OutPoint], spend_txid: Txid) -> Vec<(OutPoint, SpendRef)> {
    outpoints
        .iter()
        .enumerate()
        .map(|(index, outpoint)| {
            (
                *outpoint,
                SpendRef {
                    txid: spend_txid,
                    index: index as u32,
                },
            )
        })
        .collect()
}
