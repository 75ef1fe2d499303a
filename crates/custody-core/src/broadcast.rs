//! Submission and confirmation tracking of built transactions.
//!
//! A transaction is submitted with the exact bytes stored when it was built.
//! The node reporting it as already known counts as success, so a retry after
//! a lost commit settles the records exactly once.

use std::collections::HashMap;

use bitcoin::Txid;
use tracing::{debug, error, info, warn};

use crate::context::CustodyContext;
use crate::error::CustodyError;
use crate::notify::{product_map, withdrawal_notification};
use crate::store::{ConfirmedCommit, SentCommit};
use crate::types::{Notification, NotifyEvent, SendRecord, SendRelation, SendStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: Vec<Txid>,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmReport {
    pub confirmed: Vec<Txid>,
    pub waiting: usize,
}

/// Records grouped by txid, in order of first appearance.
fn group_by_txid(records: Vec<SendRecord>) -> Vec<(Txid, Vec<SendRecord>)> {
    let mut index: HashMap<Txid, usize> = HashMap::new();
    let mut groups: Vec<(Txid, Vec<SendRecord>)> = Vec::new();
    for record in records {
        match index.get(&record.txid) {
            Some(&i) => groups[i].1.push(record),
            None => {
                index.insert(record.txid, groups.len());
                groups.push((record.txid, vec![record]));
            }
        }
    }
    groups
}

fn withdrawal_ids(records: &[SendRecord]) -> impl Iterator<Item = u64> + '_ {
    records.iter().filter_map(|r| match r.relation {
        SendRelation::Withdrawal(id) => Some(id),
        _ => None,
    })
}

pub struct BroadcastTracker {
    ctx: CustodyContext,
}

impl BroadcastTracker {
    pub fn new(ctx: CustodyContext) -> Self {
        Self { ctx }
    }

    /// Submit every built transaction not yet sent.
    pub fn broadcast_pending(&self) -> Result<BroadcastReport, CustodyError> {
        let pending = self.ctx.store.sends_with_status(SendStatus::Init)?;
        let mut report = BroadcastReport::default();
        let mut commit = SentCommit::default();

        for (txid, records) in group_by_txid(pending) {
            let Some(raw) = records.iter().find_map(|r| r.raw_tx.as_ref()) else {
                debug!(%txid, "no signed bytes for transaction");
                continue;
            };
            match self.ctx.node.send_raw_transaction(&hex::encode(raw)) {
                Ok(accepted) => {
                    if accepted != txid {
                        warn!(%txid, %accepted, "node reported a different txid");
                    }
                    info!(%txid, records = records.len(), "transaction broadcast");
                }
                Err(e) if e.is_already_known() => {
                    info!(%txid, "transaction already known to the node");
                }
                Err(e) => {
                    warn!(%txid, error = %e, "broadcast failed, will retry");
                    report.failed += 1;
                    continue;
                }
            }
            commit.sends.extend(records.iter().map(|r| r.id));
            commit.withdrawals.extend(withdrawal_ids(&records));
            report.sent.push(txid);
        }

        if commit.sends.is_empty() {
            return Ok(report);
        }
        commit.notifications =
            self.withdrawal_notifications(&commit.withdrawals, NotifyEvent::WithdrawalSent)?;
        self.ctx.store.commit_sent(commit)?;
        Ok(report)
    }

    /// Advance sent transactions that have at least one confirmation.
    pub fn confirm_sent(&self) -> Result<ConfirmReport, CustodyError> {
        let sent = self.ctx.store.sends_with_status(SendStatus::Sent)?;
        let mut report = ConfirmReport::default();
        let mut commit = ConfirmedCommit::default();

        for (txid, records) in group_by_txid(sent) {
            let confirmations = match self.ctx.node.get_raw_transaction_verbose(&txid) {
                Ok(tx) => tx.confirmations,
                Err(e) => {
                    warn!(%txid, error = %e, "confirmation lookup failed");
                    report.waiting += 1;
                    continue;
                }
            };
            if confirmations == 0 {
                report.waiting += 1;
                continue;
            }
            debug!(%txid, confirmations, "transaction confirmed");
            commit.sends.extend(records.iter().map(|r| r.id));
            commit.withdrawals.extend(withdrawal_ids(&records));
            report.confirmed.push(txid);
        }

        if commit.sends.is_empty() {
            return Ok(report);
        }
        commit.notifications =
            self.withdrawal_notifications(&commit.withdrawals, NotifyEvent::WithdrawalConfirmed)?;
        self.ctx.store.commit_confirmed(commit)?;
        info!(confirmed = report.confirmed.len(), waiting = report.waiting, "sends confirmed");
        Ok(report)
    }

    fn withdrawal_notifications(
        &self,
        ids: &[u64],
        event: NotifyEvent,
    ) -> Result<Vec<Notification>, CustodyError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let withdrawals = self.ctx.store.withdrawals(ids)?;
        let products = product_map(&self.ctx, withdrawals.iter().map(|w| w.product_id))?;

        let mut notifications = Vec::with_capacity(withdrawals.len());
        for withdrawal in &withdrawals {
            match products.get(&withdrawal.product_id) {
                Some(product) => {
                    notifications.push(withdrawal_notification(product, withdrawal, event)?)
                }
                None => error!(
                    withdrawal = withdrawal.id,
                    product = withdrawal.product_id,
                    "withdrawal for unknown product, not notified"
                ),
            }
        }
        Ok(notifications)
    }
}
