//! Sweeps of deposit outputs to cold storage.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::slice;

use bitcoin::{OutPoint, Txid};
use chain_btc::estimate::SizeEstimator;
use chain_btc::transaction::{build_sweep_tx, build_token_tx, BuiltTx, DUST_LIMIT};
use chain_btc::BtcError;
use tracing::{debug, info, warn};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::ledger::{spend_claims, UtxoLedger};
use crate::settings::{require_address, require_u64, COLD_WALLET_ADDRESS, TO_COLD_FEE_RATE};
use crate::store::BuiltTxCommit;
use crate::types::{
    attach_built, SendRecord, SendRelation, TokenConfig, TokenTransferRecord, Utxo, UtxoKind,
    WalletAddress,
};

/// Most inputs in one consolidation transaction.
pub const CONSOLIDATION_CHUNK: usize = 5_000;

/// Most outputs loaded per address into a token sweep pool.
const POOL_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub transactions: Vec<Txid>,
    pub inputs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSweepReport {
    pub transactions: Vec<Txid>,
    /// Address/token pairs left for a later run.
    pub deferred: usize,
}

pub struct ConsolidationEngine {
    ctx: CustodyContext,
    ledger: UtxoLedger,
    estimator: SizeEstimator,
    chunk: usize,
}

impl ConsolidationEngine {
    pub fn new(ctx: CustodyContext) -> Self {
        let ledger = UtxoLedger::new(ctx.store.clone());
        Self {
            ctx,
            ledger,
            estimator: SizeEstimator::default(),
            chunk: CONSOLIDATION_CHUNK,
        }
    }

    /// Use smaller chunks. Values above [`CONSOLIDATION_CHUNK`] are clamped.
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.clamp(1, CONSOLIDATION_CHUNK);
        self
    }

    /// Sweep every spendable deposit output to the cold wallet, one committed
    /// transaction per chunk.
    pub fn sweep_deposits(&self) -> Result<SweepReport, CustodyError> {
        let settings = self.ctx.settings.as_ref();
        let cold = require_address(settings, COLD_WALLET_ADDRESS)?;
        let fee_rate = require_u64(settings, TO_COLD_FEE_RATE)?;

        let mut report = SweepReport::default();
        loop {
            let chunk = self.ledger.select_spendable(UtxoKind::Deposit, self.chunk)?;
            if chunk.is_empty() {
                break;
            }

            let keys = self.ctx.key_ring(chunk.iter().map(|u| &u.address))?;
            let inputs = keys.spend_inputs(&chunk)?;
            let built = match build_sweep_tx(&inputs, cold.as_str(), fee_rate, self.ctx.network) {
                Ok(built) => built,
                Err(e @ (BtcError::DustOutput { .. } | BtcError::InsufficientFunds { .. })) => {
                    warn!(
                        inputs = chunk.len(),
                        error = %e,
                        "deposit outputs do not cover the sweep fee"
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let mut sends: Vec<SendRecord> = chunk
                .iter()
                .map(|u| {
                    SendRecord::new(
                        SendRelation::Consolidation(u.id),
                        built.txid,
                        u.address.clone(),
                        cold.clone(),
                        u.value,
                    )
                })
                .collect();
            attach_built(&mut sends, &built);
            let outpoints: Vec<OutPoint> = chunk.iter().map(|u| u.outpoint).collect();
            self.ctx.store.commit_built_tx(BuiltTxCommit {
                claims: spend_claims(&outpoints, built.txid),
                sends,
                ..Default::default()
            })?;

            info!(
                txid = %built.txid,
                inputs = chunk.len(),
                swept = built.output_value(),
                fee = built.fee,
                "deposit sweep built"
            );
            report.transactions.push(built.txid);
            report.inputs += chunk.len();
            if chunk.len() < self.chunk {
                break;
            }
        }
        Ok(report)
    }

    /// Move received tokens from deposit addresses to each token's cold
    /// address. One token output is spent per transaction; the base-layer fee
    /// comes from the token's hot address.
    pub fn sweep_tokens(&self) -> Result<TokenSweepReport, CustodyError> {
        let fee_rate = require_u64(self.ctx.settings.as_ref(), TO_COLD_FEE_RATE)?;
        let tokens: HashMap<u32, TokenConfig> = self
            .ctx
            .store
            .token_configs()?
            .into_iter()
            .map(|t| (t.token_index, t))
            .collect();

        let mut groups: BTreeMap<(WalletAddress, u32), Vec<TokenTransferRecord>> = BTreeMap::new();
        for record in self.ctx.store.pending_token_transfers()? {
            groups
                .entry((record.to.clone(), record.token_index))
                .or_default()
                .push(record);
        }

        let mut token_pools: HashMap<WalletAddress, VecDeque<Utxo>> = HashMap::new();
        let mut fee_pools: HashMap<WalletAddress, VecDeque<Utxo>> = HashMap::new();
        let mut report = TokenSweepReport::default();

        for ((address, token_index), records) in groups {
            let token = tokens
                .get(&token_index)
                .ok_or(CustodyError::MissingTokenConfig(token_index))?;
            let amount: u64 = records.iter().map(|r| r.amount).sum();
            if amount < token.sweep_min_amount {
                debug!(%address, token_index, amount, "token balance below sweep minimum");
                continue;
            }

            if !token_pools.contains_key(&address) {
                let utxos = self.ledger.select_spendable_at(
                    UtxoKind::TokenDeposit,
                    slice::from_ref(&address),
                    POOL_LIMIT,
                )?;
                token_pools.insert(address.clone(), utxos.into());
            }
            if !fee_pools.contains_key(&token.hot_address) {
                let utxos = self.ledger.select_spendable_at(
                    UtxoKind::TokenHot,
                    slice::from_ref(&token.hot_address),
                    POOL_LIMIT,
                )?;
                fee_pools.insert(token.hot_address.clone(), utxos.into());
            }

            let Some(token_utxo) = token_pools.get(&address).and_then(|p| p.front()).cloned()
            else {
                warn!(%address, token_index, "no token output to sweep");
                report.deferred += 1;
                continue;
            };
            let fee_pool = fee_pools
                .get(&token.hot_address)
                .map(|p| p.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();

            match self.build_token_sweep(token, &token_utxo, &fee_pool, amount, fee_rate)? {
                Some((built, fee_inputs)) => {
                    let fee_utxos = &fee_pool[..fee_inputs];
                    self.commit_token_sweep(token, &token_utxo, fee_utxos, &records, &built)?;
                    if let Some(pool) = token_pools.get_mut(&address) {
                        pool.pop_front();
                    }
                    if let Some(pool) = fee_pools.get_mut(&token.hot_address) {
                        pool.drain(..fee_inputs);
                    }
                    info!(
                        txid = %built.txid,
                        %address,
                        token = %token.symbol,
                        amount,
                        fee_inputs,
                        "token sweep built"
                    );
                    report.transactions.push(built.txid);
                }
                None => {
                    warn!(
                        %address,
                        token = %token.symbol,
                        "token hot wallet cannot cover the sweep fee"
                    );
                    report.deferred += 1;
                }
            }
        }
        Ok(report)
    }

    /// Pick fee inputs and sign. `None` when `fee_pool` runs out first.
    fn build_token_sweep(
        &self,
        token: &TokenConfig,
        token_utxo: &Utxo,
        fee_pool: &[Utxo],
        amount: u64,
        fee_rate: u64,
    ) -> Result<Option<(BuiltTx, usize)>, CustodyError> {
        let mut used = 0;
        let mut total = token_utxo.value;
        loop {
            let fee = self.estimator.estimate_fee(1 + used, 2, true, fee_rate);
            if total >= DUST_LIMIT.saturating_add(fee) {
                break;
            }
            let Some(next) = fee_pool.get(used) else {
                return Ok(None);
            };
            total += next.value;
            used += 1;
        }

        let keys = self.ctx.key_ring(
            std::iter::once(&token_utxo.address).chain(fee_pool.iter().map(|u| &u.address)),
        )?;
        loop {
            let mut inputs = vec![keys.spend_input(token_utxo)?];
            inputs.extend(keys.spend_inputs(&fee_pool[..used])?);
            match build_token_tx(
                &inputs,
                token.hot_address.as_str(),
                token.cold_address.as_str(),
                token.token_index,
                amount,
                fee_rate,
                self.ctx.network,
            ) {
                Ok(built) => return Ok(Some((built, used))),
                Err(BtcError::InsufficientFunds { .. }) if used < fee_pool.len() => used += 1,
                Err(BtcError::InsufficientFunds { .. }) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn commit_token_sweep(
        &self,
        token: &TokenConfig,
        token_utxo: &Utxo,
        fee_inputs: &[Utxo],
        records: &[TokenTransferRecord],
        built: &BuiltTx,
    ) -> Result<(), CustodyError> {
        let outpoints: Vec<OutPoint> = std::iter::once(token_utxo)
            .chain(fee_inputs)
            .map(|u| u.outpoint)
            .collect();

        let mut sends: Vec<SendRecord> = records
            .iter()
            .map(|r| SendRecord {
                token_index: Some(token.token_index),
                ..SendRecord::new(
                    SendRelation::TokenSweep(r.id),
                    built.txid,
                    r.to.clone(),
                    token.cold_address.clone(),
                    r.amount,
                )
            })
            .collect();
        attach_built(&mut sends, built);

        self.ctx.store.commit_built_tx(BuiltTxCommit {
            claims: spend_claims(&outpoints, built.txid),
            sends,
            withdrawals: Vec::new(),
            swept_transfers: records.iter().map(|r| r.id).collect(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, TokenBlockCommit};
    use crate::testing::{block_hash, funded_utxo, txid, Fixture, NET};
    use crate::types::{CursorKind, SweepStatus, UtxoStatus};
    use bitcoin::Transaction;
    use chain_btc::address::generate_key;
    use chain_btc::omni::decode_payload;

    fn cold(fx: &Fixture) -> String {
        let cold = generate_key(NET).address;
        fx.set_str(COLD_WALLET_ADDRESS, &cold);
        cold
    }

    fn decode(raw: &[u8]) -> Transaction {
        bitcoin::consensus::deserialize(raw).unwrap()
    }

    #[test]
    fn chunk_never_exceeds_ceiling() {
        let fx = Fixture::new();
        let engine = ConsolidationEngine::new(fx.ctx.clone()).with_chunk_size(1_000_000);
        assert_eq!(engine.chunk, CONSOLIDATION_CHUNK);
    }

    #[test]
    fn deposits_are_swept_in_chunks() {
        let fx = Fixture::new();
        let cold = cold(&fx);
        let a = fx.keyed_address(1);
        let b = fx.keyed_address(2);
        for vout in 0..5u32 {
            let owner = if vout % 2 == 0 { &a } else { &b };
            fx.store
                .insert_utxo(funded_utxo(owner, 1, vout, 10_000, UtxoKind::Deposit));
        }

        let report = ConsolidationEngine::new(fx.ctx.clone())
            .with_chunk_size(2)
            .sweep_deposits()
            .unwrap();
        assert_eq!(report.transactions.len(), 3);
        assert_eq!(report.inputs, 5);
        assert!(fx
            .store
            .all_utxos()
            .iter()
            .all(|u| u.status == UtxoStatus::Used));

        let sends = fx.store.all_sends();
        assert_eq!(sends.len(), 5);
        for txid in &report.transactions {
            let siblings: Vec<_> = sends.iter().filter(|s| s.txid == *txid).collect();
            assert!(siblings.len() <= 2);
            assert!(siblings[0].raw_tx.is_some());
            assert!(siblings[1..].iter().all(|s| s.raw_tx.is_none()));

            let tx = decode(siblings[0].raw_tx.as_ref().unwrap());
            let fee = siblings[0].fee.unwrap();
            let swept: u64 = siblings.iter().map(|s| s.amount).sum();
            assert_eq!(tx.output.len(), 1);
            assert_eq!(tx.output[0].value.to_sat() + fee.fee, swept);
            assert_eq!(fee.fee, fee.size * fee.fee_rate);
            assert!(siblings.iter().all(|s| s.to.as_str() == cold));
        }
    }

    #[test]
    fn unaffordable_sweep_changes_nothing() {
        let fx = Fixture::new();
        cold(&fx);
        let a = fx.keyed_address(1);
        fx.store
            .insert_utxo(funded_utxo(&a, 1, 0, 300, UtxoKind::Deposit));

        let report = ConsolidationEngine::new(fx.ctx.clone()).sweep_deposits().unwrap();
        assert!(report.transactions.is_empty());
        assert_eq!(fx.store.all_utxos()[0].status, UtxoStatus::Seen);
        assert!(fx.store.all_sends().is_empty());
    }

    struct TokenSetup {
        fx: Fixture,
        hot: WalletAddress,
        cold: String,
    }

    fn token_setup(hot_values: &[u64], sweep_min_amount: u64) -> TokenSetup {
        let fx = Fixture::new();
        let hot = fx.keyed_address(-1);
        let cold = generate_key(NET).address;
        fx.store.add_token_config(TokenConfig {
            token_index: 31,
            symbol: "USDT".into(),
            hot_address: hot.clone(),
            cold_address: cold.clone().into(),
            sweep_min_amount,
        });
        for (vout, value) in hot_values.iter().enumerate() {
            fx.store
                .insert_utxo(funded_utxo(&hot, 2, vout as u32, *value, UtxoKind::TokenHot));
        }
        fx.store.init_cursor(CursorKind::Token, 0).unwrap();
        TokenSetup { fx, hot, cold }
    }

    /// A token deposit at a new address with one transfer record per amount.
    fn token_deposit(fx: &Fixture, byte: u8, amounts: &[u64]) -> WalletAddress {
        let address = fx.keyed_address(5);
        fx.store
            .insert_utxo(funded_utxo(&address, byte, 0, 546, UtxoKind::TokenDeposit));
        let height = fx.store.cursor(CursorKind::Token).unwrap().unwrap();
        let transfers = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| TokenTransferRecord {
                id: 0,
                token_index: 31,
                token_symbol: "USDT".into(),
                block_hash: block_hash(1),
                txid: txid(byte.wrapping_mul(10).wrapping_add(i as u8)),
                from: "msender".into(),
                to: address.clone(),
                amount: *amount,
                block_time: 0,
                sweep_status: SweepStatus::Pending,
            })
            .collect();
        fx.store
            .commit_token_block(TokenBlockCommit {
                expected_cursor: height,
                height: height + 1,
                transfers,
            })
            .unwrap();
        address
    }

    #[test]
    fn token_sweep_spends_one_token_output() {
        let TokenSetup { fx, hot, cold } = token_setup(&[2_000, 20_000], 0);
        let deposit = token_deposit(&fx, 10, &[300_000_000, 200_000_000]);

        let report = ConsolidationEngine::new(fx.ctx.clone()).sweep_tokens().unwrap();
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(report.deferred, 0);

        let sends = fx.store.all_sends();
        assert_eq!(sends.len(), 2);
        assert!(sends.iter().all(|s| s.token_index == Some(31) && s.from == deposit));

        let tx = decode(sends[0].raw_tx.as_ref().unwrap());
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.input[0].previous_output.txid, txid(10));
        assert_eq!(tx.output.len(), 3);
        assert_eq!(tx.output[0].script_pubkey, crate::testing::script_for(hot.as_str()));
        let payload = decode_payload(&tx.output[1].script_pubkey).unwrap();
        assert_eq!(payload.property_id, 31);
        assert_eq!(payload.amount, 500_000_000);
        assert_eq!(tx.output[2].value.to_sat(), DUST_LIMIT);
        assert_eq!(tx.output[2].script_pubkey, crate::testing::script_for(&cold));

        assert!(fx
            .store
            .all_transfers()
            .iter()
            .all(|r| r.sweep_status == SweepStatus::Swept));
        let hot_utxos: Vec<_> = fx
            .store
            .all_utxos()
            .into_iter()
            .filter(|u| u.kind == UtxoKind::TokenHot)
            .map(|u| u.status)
            .collect();
        assert_eq!(hot_utxos, vec![UtxoStatus::Used, UtxoStatus::Seen]);
    }

    #[test]
    fn exhausted_fee_pool_defers_remaining_pairs() {
        let TokenSetup { fx, .. } = token_setup(&[2_000], 0);
        let first = token_deposit(&fx, 10, &[100]);
        let second = token_deposit(&fx, 11, &[100]);

        let report = ConsolidationEngine::new(fx.ctx.clone()).sweep_tokens().unwrap();
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(report.deferred, 1);

        let pending: Vec<WalletAddress> = fx
            .store
            .pending_token_transfers()
            .unwrap()
            .into_iter()
            .map(|r| r.to)
            .collect();
        assert_eq!(pending.len(), 1);
        assert!(pending[0] == first || pending[0] == second);
    }

    #[test]
    fn small_token_balances_wait() {
        let TokenSetup { fx, .. } = token_setup(&[20_000], 1_000);
        token_deposit(&fx, 10, &[400, 500]);

        let report = ConsolidationEngine::new(fx.ctx.clone()).sweep_tokens().unwrap();
        assert!(report.transactions.is_empty());
        assert_eq!(report.deferred, 0);
        assert_eq!(fx.store.pending_token_transfers().unwrap().len(), 2);
    }

    #[test]
    fn missing_token_output_is_deferred() {
        let TokenSetup { fx, .. } = token_setup(&[20_000], 0);
        let address = token_deposit(&fx, 10, &[100]);
        fx.store
            .mark_utxos_used(&[(
                bitcoin::OutPoint::new(txid(10), 0),
                crate::types::SpendRef {
                    txid: txid(99),
                    index: 0,
                },
            )])
            .unwrap();

        let report = ConsolidationEngine::new(fx.ctx.clone()).sweep_tokens().unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.store.pending_token_transfers().unwrap()[0].to, address);
    }
}
