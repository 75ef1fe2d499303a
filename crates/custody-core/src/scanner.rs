//! Base-layer block ingestion.
//!
//! Blocks are processed one height at a time behind a confirmation lag. Every
//! row derived from a block is written in the same commit that advances the
//! cursor, so a failure anywhere leaves the cursor where it was and the height
//! is simply scanned again.

use std::collections::{BTreeSet, HashMap, HashSet};

use bitcoin::{OutPoint, Txid};
use chain_btc::omni;
use tracing::{debug, info};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::rpc::{TxOutput, VerboseTx};
use crate::settings::{require_u64, BLOCK_CONFIRM_NUM};
use crate::store::BlockCommit;
use crate::types::{
    AddressKey, CursorKind, DepositRecord, DepositStatus, SpendRef, Utxo, UtxoKind, UtxoStatus,
    WalletAddress,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// First height attempted.
    pub from: u64,
    /// Cursor after the run.
    pub to: u64,
    pub blocks: u64,
    pub utxos: usize,
    pub deposits: usize,
    pub spends: usize,
}

pub struct ChainScanner {
    ctx: CustodyContext,
}

/// An addressed output found in a block.
struct FoundOutput<'a> {
    tx: &'a VerboseTx,
    out: &'a TxOutput,
    address: WalletAddress,
    is_token_tx: bool,
}

impl ChainScanner {
    pub fn new(ctx: CustodyContext) -> Self {
        Self { ctx }
    }

    /// Ingest every height up to `tip - block_confirm_num`.
    ///
    /// Heights committed before an error stay committed; the failing height is
    /// retried on the next run.
    pub fn scan(&self) -> Result<ScanReport, CustodyError> {
        let depth = require_u64(self.ctx.settings.as_ref(), BLOCK_CONFIRM_NUM)?;
        let cursor = self
            .ctx
            .store
            .cursor(CursorKind::Base)?
            .ok_or_else(|| CustodyError::MissingCursor(CursorKind::Base.to_string()))?;
        let tip = self.ctx.node.get_block_count()?;
        let last = tip.saturating_sub(depth);

        let mut report = ScanReport {
            from: cursor + 1,
            to: cursor,
            ..Default::default()
        };
        if cursor >= last {
            debug!(cursor, tip, depth, "no confirmed blocks to scan");
            return Ok(report);
        }

        let token_hot = self.token_hot_addresses()?;
        for height in cursor + 1..=last {
            let commit = self.scan_block(height, &token_hot)?;
            let stats = self.ctx.store.commit_block(commit)?;
            debug!(
                height,
                utxos = stats.utxos,
                deposits = stats.deposits,
                spends = stats.spends,
                "block committed"
            );

            report.to = height;
            report.blocks += 1;
            report.utxos += stats.utxos;
            report.deposits += stats.deposits;
            report.spends += stats.spends;
        }

        info!(
            from = report.from,
            to = report.to,
            utxos = report.utxos,
            deposits = report.deposits,
            "chain scan complete"
        );
        Ok(report)
    }

    fn token_hot_addresses(&self) -> Result<HashSet<WalletAddress>, CustodyError> {
        Ok(self
            .ctx
            .store
            .token_configs()?
            .into_iter()
            .map(|t| t.hot_address)
            .collect())
    }

    /// Derive everything one block contributes. Reads only; nothing is
    /// written until the returned commit is applied.
    pub fn scan_block(
        &self,
        height: u64,
        token_hot: &HashSet<WalletAddress>,
    ) -> Result<BlockCommit, CustodyError> {
        let hash = self.ctx.node.get_block_hash(height)?;
        let block = self.ctx.node.get_block_verbose(&hash)?;

        let mut observed_spends: Vec<(OutPoint, SpendRef)> = Vec::new();
        let mut found: Vec<FoundOutput<'_>> = Vec::new();
        let mut addresses = BTreeSet::new();

        for tx in &block.transactions {
            for (index, input) in tx.vin.iter().enumerate() {
                if let Some(prev) = input.prev_outpoint() {
                    observed_spends.push((
                        prev,
                        SpendRef {
                            txid: tx.txid,
                            index: index as u32,
                        },
                    ));
                }
            }

            let is_token_tx = tx.has_token_marker();
            for out in &tx.vout {
                let Some(address) = out.script_pub_key.single_address() else {
                    continue;
                };
                let address = WalletAddress::from(address);
                addresses.insert(address.clone());
                found.push(FoundOutput {
                    tx,
                    out,
                    address,
                    is_token_tx,
                });
            }
        }

        let addresses: Vec<WalletAddress> = addresses.into_iter().collect();
        let keys: HashMap<WalletAddress, AddressKey> = self
            .ctx
            .store
            .address_keys(&addresses)?
            .into_iter()
            .map(|k| (k.address.clone(), k))
            .collect();

        let mut senders: HashMap<Txid, VerboseTx> = HashMap::new();
        let mut utxos = Vec::new();
        let mut deposits = Vec::new();

        for item in &found {
            let Some(key) = keys.get(&item.address) else {
                continue;
            };

            let kind = if token_hot.contains(&item.address) {
                UtxoKind::TokenHot
            } else if item.is_token_tx
                && self.is_token_recipient(item.tx, &item.address, &mut senders)?
            {
                UtxoKind::TokenDeposit
            } else if key.is_hot() {
                UtxoKind::Hot
            } else {
                UtxoKind::Deposit
            };

            let outpoint = OutPoint::new(item.tx.txid, item.out.n);
            let value = item.out.value.to_sat();

            if let Some(product_id) = key.product_id() {
                if !item.is_token_tx {
                    deposits.push(DepositRecord {
                        id: 0,
                        product_id,
                        block_hash: block.hash,
                        outpoint,
                        address: item.address.clone(),
                        value,
                        status: DepositStatus::Pending,
                    });
                }
            }

            utxos.push(Utxo {
                id: 0,
                outpoint,
                address: item.address.clone(),
                value,
                script: item.out.script_pub_key.script()?,
                block_hash: block.hash,
                kind,
                status: UtxoStatus::Seen,
                spend: None,
            });
        }

        // Only spends of outputs we own matter: ones already stored and ones
        // created earlier in this same block.
        let prev: Vec<OutPoint> = observed_spends.iter().map(|(op, _)| *op).collect();
        let mut owned: HashSet<OutPoint> = self
            .ctx
            .store
            .utxos_by_outpoints(&prev)?
            .into_iter()
            .map(|u| u.outpoint)
            .collect();
        owned.extend(utxos.iter().map(|u| u.outpoint));
        observed_spends.retain(|(op, _)| owned.contains(op));

        Ok(BlockCommit {
            expected_cursor: height - 1,
            height,
            utxos,
            deposits,
            spends: observed_spends,
        })
    }

    /// Whether `address` is the token recipient of `tx`: the reference output
    /// resolved against the sender traced through the first input with an
    /// address.
    fn is_token_recipient(
        &self,
        tx: &VerboseTx,
        address: &WalletAddress,
        senders: &mut HashMap<Txid, VerboseTx>,
    ) -> Result<bool, CustodyError> {
        let sender = self.trace_sender(tx, senders)?;
        let reference = omni::reference_output(
            tx.vout.iter().map(|o| o.script_pub_key.single_address()),
            sender.as_deref().unwrap_or(""),
        );
        Ok(reference == Some(address.as_str()))
    }

    fn trace_sender(
        &self,
        tx: &VerboseTx,
        senders: &mut HashMap<Txid, VerboseTx>,
    ) -> Result<Option<String>, CustodyError> {
        for input in &tx.vin {
            let Some(prev) = input.prev_outpoint() else {
                continue;
            };
            if !senders.contains_key(&prev.txid) {
                let funding = self.ctx.node.get_raw_transaction_verbose(&prev.txid)?;
                debug!(txid = %prev.txid, "fetched token sender transaction");
                senders.insert(prev.txid, funding);
            }
            let address = senders
                .get(&prev.txid)
                .and_then(|funding| funding.output(prev.vout))
                .and_then(|out| out.script_pub_key.single_address());
            if let Some(address) = address {
                return Ok(Some(address.to_string()));
            }
        }
        Ok(None)
    }
}
