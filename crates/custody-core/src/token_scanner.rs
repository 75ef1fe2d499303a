//! Token-layer transfer ingestion, on its own cursor.

use std::collections::HashMap;

use bitcoin::amount::{Amount, Denomination};
use tracing::{debug, info};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::rpc::TokenTx;
use crate::settings::{require_u64, BLOCK_CONFIRM_NUM};
use crate::store::TokenBlockCommit;
use crate::types::{CursorKind, SweepStatus, TokenConfig, TokenTransferRecord, WalletAddress};

/// Simple send, as numbered by the token layer.
const SIMPLE_SEND_TYPE: u32 = 0;

/// Parse a divisible token amount such as `"12.5"` into 8-decimal units.
pub fn parse_token_amount(text: &str) -> Result<u64, CustodyError> {
    Amount::from_str_in(text.trim(), Denomination::Bitcoin)
        .map(|a| a.to_sat())
        .map_err(|e| CustodyError::InvalidAmount(format!("{text:?}: {e}")))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenScanReport {
    pub from: u64,
    pub to: u64,
    pub blocks: u64,
    pub transfers: usize,
}

pub struct TokenScanner {
    ctx: CustodyContext,
}

impl TokenScanner {
    pub fn new(ctx: CustodyContext) -> Self {
        Self { ctx }
    }

    pub fn scan(&self) -> Result<TokenScanReport, CustodyError> {
        let depth = require_u64(self.ctx.settings.as_ref(), BLOCK_CONFIRM_NUM)?;
        let cursor = self
            .ctx
            .store
            .cursor(CursorKind::Token)?
            .ok_or_else(|| CustodyError::MissingCursor(CursorKind::Token.to_string()))?;
        let last = self.ctx.node.get_block_count()?.saturating_sub(depth);

        let mut report = TokenScanReport {
            from: cursor + 1,
            to: cursor,
            ..Default::default()
        };
        if cursor >= last {
            return Ok(report);
        }

        let tokens: HashMap<u32, TokenConfig> = self
            .ctx
            .store
            .token_configs()?
            .into_iter()
            .map(|t| (t.token_index, t))
            .collect();

        for height in cursor + 1..=last {
            let transfers = self.scan_height(height, &tokens)?;
            let inserted = self.ctx.store.commit_token_block(TokenBlockCommit {
                expected_cursor: height - 1,
                height,
                transfers,
            })?;
            debug!(height, inserted, "token block committed");
            report.to = height;
            report.blocks += 1;
            report.transfers += inserted;
        }

        info!(
            from = report.from,
            to = report.to,
            transfers = report.transfers,
            "token scan complete"
        );
        Ok(report)
    }

    fn scan_height(
        &self,
        height: u64,
        tokens: &HashMap<u32, TokenConfig>,
    ) -> Result<Vec<TokenTransferRecord>, CustodyError> {
        let mut candidates: Vec<(TokenTx, &TokenConfig, WalletAddress)> = Vec::new();
        for txid in self.ctx.node.list_block_transactions(height)? {
            let tx = self.ctx.node.get_token_transaction(&txid)?;
            if tx.type_int != SIMPLE_SEND_TYPE || !tx.valid || tx.confirmations == 0 {
                continue;
            }
            let Some(token) = tokens.get(&tx.property_id) else {
                continue;
            };
            let Some(to) = tx.reference_address.clone() else {
                continue;
            };
            candidates.push((tx, token, WalletAddress::from(to)));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let addresses: Vec<WalletAddress> = candidates.iter().map(|(_, _, a)| a.clone()).collect();
        let ours: HashMap<WalletAddress, i64> = self
            .ctx
            .store
            .address_keys(&addresses)?
            .into_iter()
            .map(|k| (k.address, k.use_tag))
            .collect();

        let mut transfers = Vec::new();
        for (tx, token, to) in candidates {
            if !ours.get(&to).is_some_and(|tag| *tag >= 0) {
                continue;
            }
            let block_hash = tx.block_hash.ok_or_else(|| {
                CustodyError::ChainData(format!("confirmed token tx {} has no block", tx.txid))
            })?;
            transfers.push(TokenTransferRecord {
                id: 0,
                token_index: token.token_index,
                token_symbol: token.symbol.clone(),
                block_hash,
                txid: tx.txid,
                from: WalletAddress::from(tx.sending_address),
                to,
                amount: parse_token_amount(&tx.amount)?,
                block_time: tx.block_time,
                sweep_status: SweepStatus::Pending,
            });
        }
        Ok(transfers)
    }
}
