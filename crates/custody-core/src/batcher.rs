//! Withdrawal batching.
//!
//! Withdrawals are taken strictly in arrival order. Each one is added only if
//! the inputs gathered so far, plus whatever further hot outputs it takes,
//! cover every accepted payment and the estimated fee. The first withdrawal
//! that cannot be covered ends the batch; it and everything after it wait for
//! the next run.

use std::slice;

use bitcoin::{OutPoint, Txid};
use chain_btc::estimate::SizeEstimator;
use chain_btc::transaction::{build_payment_tx, BuiltTx, Payment, DUST_LIMIT, MAX_TX_SIZE};
use chain_btc::BtcError;
use tracing::{debug, error, info, warn};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::ledger::{spend_claims, UtxoLedger};
use crate::settings::{require_address, require_u64, HOT_WALLET_ADDRESS, TO_USER_FEE_RATE};
use crate::store::BuiltTxCommit;
use crate::types::{
    attach_built, SendRecord, SendRelation, UtxoKind, WalletAddress, Withdrawal, WithdrawalStatus,
};

/// Most hot outputs considered for one batch.
pub const MAX_BATCH_INPUTS: usize = 10_000;

/// Why selection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStop {
    /// Every queued withdrawal was accepted.
    QueueDrained,
    OutOfInputs,
    SizeCap,
}

/// Outcome of [`select_batch`]. Counts are prefixes of the slices passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSelection {
    pub accepted: usize,
    pub inputs: usize,
    pub input_value: u64,
    pub output_value: u64,
    pub estimated_size: u64,
    pub stop: BatchStop,
}

/// Greedy, order-preserving selection over withdrawal `amounts` and spendable
/// input `values`, both in priority order.
///
/// The estimate for each attempt counts the accepted payments, the candidate
/// and one change output. Inputs pulled for a candidate that is then rejected
/// are not part of the result.
pub fn select_batch(
    amounts: &[u64],
    values: &[u64],
    fee_rate: u64,
    estimator: &SizeEstimator,
) -> BatchSelection {
    let mut accepted = BatchSelection {
        accepted: 0,
        inputs: 0,
        input_value: 0,
        output_value: 0,
        estimated_size: 0,
        stop: BatchStop::QueueDrained,
    };
    let mut inputs = 0;
    let mut input_value = 0u64;

    for &amount in amounts {
        let outputs = accepted.accepted + 2;
        let output_value = accepted.output_value.saturating_add(amount);
        loop {
            let size = estimator.estimate(inputs, outputs, false);
            if size > MAX_TX_SIZE {
                accepted.stop = BatchStop::SizeCap;
                return accepted;
            }
            let required = output_value.saturating_add(size.saturating_mul(fee_rate));
            if input_value >= required {
                accepted.accepted += 1;
                accepted.inputs = inputs;
                accepted.input_value = input_value;
                accepted.output_value = output_value;
                accepted.estimated_size = size;
                break;
            }
            let Some(&next) = values.get(inputs) else {
                accepted.stop = BatchStop::OutOfInputs;
                return accepted;
            };
            inputs += 1;
            input_value = input_value.saturating_add(next);
        }
    }
    accepted
}

/// A batch committed and waiting for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub txid: Txid,
    pub withdrawals: Vec<u64>,
    pub inputs: usize,
    pub size: u64,
    pub fee: u64,
    pub send_ids: Vec<u64>,
}

pub struct WithdrawalBatcher {
    ctx: CustodyContext,
    ledger: UtxoLedger,
    estimator: SizeEstimator,
}

impl WithdrawalBatcher {
    pub fn new(ctx: CustodyContext) -> Self {
        let ledger = UtxoLedger::new(ctx.store.clone());
        Self {
            ctx,
            ledger,
            estimator: SizeEstimator::default(),
        }
    }

    pub fn with_estimator(mut self, estimator: SizeEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Build, sign and commit one batch. `Ok(None)` when nothing could be
    /// batched this run.
    pub fn run(&self) -> Result<Option<BatchOutcome>, CustodyError> {
        let settings = self.ctx.settings.as_ref();
        let hot = require_address(settings, HOT_WALLET_ADDRESS)?;
        let fee_rate = require_u64(settings, TO_USER_FEE_RATE)?;

        let mut queue = self.ctx.store.withdrawals_with_status(WithdrawalStatus::Init)?;
        if let Some(pos) = queue.iter().position(|w| w.amount < DUST_LIMIT) {
            error!(
                withdrawal = queue[pos].id,
                amount = queue[pos].amount,
                "withdrawal below the dust limit blocks the queue"
            );
            queue.truncate(pos);
        }
        if queue.is_empty() {
            debug!("no withdrawals to batch");
            return Ok(None);
        }

        let utxos =
            self.ledger
                .select_spendable_at(UtxoKind::Hot, slice::from_ref(&hot), MAX_BATCH_INPUTS)?;
        let amounts: Vec<u64> = queue.iter().map(|w| w.amount).collect();
        let values: Vec<u64> = utxos.iter().map(|u| u.value).collect();
        let selection = select_batch(&amounts, &values, fee_rate, &self.estimator);
        if selection.accepted == 0 {
            info!(
                queued = queue.len(),
                available = utxos.len(),
                stop = ?selection.stop,
                "hot wallet cannot cover the next withdrawal"
            );
            return Ok(None);
        }
        queue.truncate(selection.accepted);

        let keys = self.ctx.key_ring(utxos.iter().map(|u| &u.address))?;
        let mut used = selection.inputs;
        let built = loop {
            let inputs = keys.spend_inputs(&utxos[..used])?;
            let payments = payments_for(&queue);
            match build_payment_tx(&inputs, &payments, hot.as_str(), fee_rate, self.ctx.network) {
                Ok(built) => break built,
                // Dust change would be lost to the fee, so it is treated like
                // a shortfall: more inputs, or fewer withdrawals.
                Err(e @ (BtcError::InsufficientFunds { .. } | BtcError::DustChange { .. })) => {
                    if used < utxos.len() {
                        used += 1;
                        debug!(error = %e, inputs = used, "pulling another hot output");
                    } else if let Some(dropped) = queue.pop() {
                        warn!(
                            withdrawal = dropped.id,
                            error = %e,
                            "dropping withdrawal from the batch"
                        );
                        if queue.is_empty() {
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        let outpoints: Vec<OutPoint> = utxos[..used].iter().map(|u| u.outpoint).collect();
        let outcome = self.commit(&hot, &queue, &outpoints, &built)?;
        info!(
            txid = %outcome.txid,
            withdrawals = outcome.withdrawals.len(),
            inputs = outcome.inputs,
            size = outcome.size,
            fee = outcome.fee,
            "withdrawal batch built"
        );
        Ok(Some(outcome))
    }

    fn commit(
        &self,
        hot: &WalletAddress,
        batch: &[Withdrawal],
        outpoints: &[OutPoint],
        built: &BuiltTx,
    ) -> Result<BatchOutcome, CustodyError> {
        let mut sends: Vec<SendRecord> = batch
            .iter()
            .map(|w| {
                SendRecord::new(
                    SendRelation::Withdrawal(w.id),
                    built.txid,
                    hot.clone(),
                    w.to_address.clone(),
                    w.amount,
                )
            })
            .collect();
        attach_built(&mut sends, built);

        // Payments come first in the transaction, so vout follows queue order.
        let withdrawals = batch
            .iter()
            .enumerate()
            .map(|(vout, w)| (w.id, format!("{}_{}", built.txid, vout)))
            .collect();

        let send_ids = self.ctx.store.commit_built_tx(BuiltTxCommit {
            claims: spend_claims(outpoints, built.txid),
            sends,
            withdrawals,
            swept_transfers: Vec::new(),
        })?;

        Ok(BatchOutcome {
            txid: built.txid,
            withdrawals: batch.iter().map(|w| w.id).collect(),
            inputs: outpoints.len(),
            size: built.size,
            fee: built.fee,
            send_ids,
        })
    }
}

fn payments_for(batch: &[Withdrawal]) -> Vec<Payment> {
    batch
        .iter()
        .map(|w| Payment {
            address: w.to_address.to_string(),
            value: w.amount,
        })
        .collect()
}
