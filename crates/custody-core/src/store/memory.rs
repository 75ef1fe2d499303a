use std::collections::{BTreeMap, HashMap, HashSet};

use bitcoin::{OutPoint, Txid};
use parking_lot::Mutex;
use tracing::error;

use super::{
    BlockCommit, BlockCommitStats, BuiltTxCommit, ConfirmedCommit, DepositNotifyCommit,
    SentCommit, Store, StoreError, TokenBlockCommit,
};
use crate::types::{
    AddressKey, CursorKind, DepositRecord, DepositStatus, Notification, NotifyEvent, NotifyItem,
    Product, ProductId, SendRecord, SendStatus, SpendRef, SweepStatus, TokenConfig,
    TokenTransferRecord, Utxo, UtxoKind, UtxoStatus, WalletAddress, Withdrawal, WithdrawalStatus,
};

/// In-memory [`Store`]. One mutex guards all tables, so each commit is
/// validated completely before anything is written.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    keys: BTreeMap<WalletAddress, AddressKey>,
    cursors: HashMap<CursorKind, u64>,
    utxos: Vec<Utxo>,
    utxo_index: HashMap<OutPoint, usize>,
    deposits: Vec<DepositRecord>,
    deposit_index: HashSet<OutPoint>,
    transfers: Vec<TokenTransferRecord>,
    transfer_index: HashSet<Txid>,
    withdrawals: Vec<Withdrawal>,
    sends: Vec<SendRecord>,
    products: HashMap<ProductId, Product>,
    tokens: Vec<TokenConfig>,
    notifications: Vec<Notification>,
    notification_index: HashSet<(NotifyEvent, NotifyItem)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, product: Product) {
        self.inner.lock().products.insert(product.id, product);
    }

    pub fn add_token_config(&self, token: TokenConfig) {
        let mut t = self.inner.lock();
        t.tokens.retain(|existing| existing.token_index != token.token_index);
        t.tokens.push(token);
    }

    /// Queue a withdrawal at `Init`. Returns its id.
    pub fn add_withdrawal(
        &self,
        product_id: ProductId,
        serial: &str,
        to_address: &str,
        amount: u64,
    ) -> u64 {
        let mut t = self.inner.lock();
        let id = t.withdrawals.len() as u64 + 1;
        t.withdrawals.push(Withdrawal {
            id,
            product_id,
            serial: serial.to_string(),
            to_address: WalletAddress::from(to_address),
            amount,
            status: WithdrawalStatus::Init,
            tx_reference: None,
        });
        id
    }

    /// Insert an output directly, bypassing block ingestion. Returns its id,
    /// or `None` if the outpoint is already stored.
    pub fn insert_utxo(&self, utxo: Utxo) -> Option<u64> {
        self.inner.lock().insert_utxo(utxo)
    }

    pub fn all_utxos(&self) -> Vec<Utxo> {
        self.inner.lock().utxos.clone()
    }

    pub fn all_deposits(&self) -> Vec<DepositRecord> {
        self.inner.lock().deposits.clone()
    }

    pub fn all_transfers(&self) -> Vec<TokenTransferRecord> {
        self.inner.lock().transfers.clone()
    }

    pub fn all_withdrawals(&self) -> Vec<Withdrawal> {
        self.inner.lock().withdrawals.clone()
    }

    pub fn all_sends(&self) -> Vec<SendRecord> {
        self.inner.lock().sends.clone()
    }

    pub fn all_address_keys(&self) -> Vec<AddressKey> {
        self.inner.lock().keys.values().cloned().collect()
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        let t = self.inner.lock();
        t.utxo_index.get(outpoint).map(|&i| t.utxos[i].clone())
    }
}

impl Tables {
    /// Returns the new id, or `None` when the outpoint is already stored.
    fn insert_utxo(&mut self, mut utxo: Utxo) -> Option<u64> {
        if self.utxo_index.contains_key(&utxo.outpoint) {
            return None;
        }
        let id = self.utxos.len() as u64 + 1;
        utxo.id = id;
        self.utxo_index.insert(utxo.outpoint, self.utxos.len());
        self.utxos.push(utxo);
        Some(id)
    }

    fn check_cursor(&self, kind: CursorKind, expected: u64, height: u64) -> Result<(), StoreError> {
        let found = self.cursors.get(&kind).copied();
        if found != Some(expected) || height != expected + 1 {
            return Err(StoreError::CursorConflict {
                kind,
                expected: Some(expected),
                found,
            });
        }
        Ok(())
    }

    fn check_claims(&self, claims: &[(OutPoint, SpendRef)]) -> Result<(), StoreError> {
        let mut seen = HashSet::with_capacity(claims.len());
        for (outpoint, _) in claims {
            let index = self
                .utxo_index
                .get(outpoint)
                .ok_or_else(|| StoreError::NotFound(format!("utxo {outpoint}")))?;
            if self.utxos[*index].status != UtxoStatus::Seen || !seen.insert(*outpoint) {
                return Err(StoreError::AlreadySpent(*outpoint));
            }
        }
        Ok(())
    }

    fn apply_claims(&mut self, claims: &[(OutPoint, SpendRef)]) {
        for (outpoint, spend) in claims {
            if let Some(&index) = self.utxo_index.get(outpoint) {
                let utxo = &mut self.utxos[index];
                utxo.status = UtxoStatus::Used;
                utxo.spend = Some(*spend);
            }
        }
    }

    /// Move an output to `Confirmed`. An existing spend reference is kept.
    fn apply_spend(&mut self, outpoint: &OutPoint, spend: SpendRef) -> bool {
        let Some(&index) = self.utxo_index.get(outpoint) else {
            return false;
        };
        let utxo = &mut self.utxos[index];
        match utxo.status {
            UtxoStatus::Confirmed => false,
            UtxoStatus::Seen => {
                utxo.status = UtxoStatus::Confirmed;
                utxo.spend = Some(spend);
                true
            }
            UtxoStatus::Used => {
                if let Some(claimed) = utxo.spend {
                    if claimed.txid != spend.txid {
                        error!(
                            %outpoint,
                            claimed = %claimed.txid,
                            observed = %spend.txid,
                            "output spent by a transaction other than the one that claimed it"
                        );
                    }
                }
                utxo.status = UtxoStatus::Confirmed;
                true
            }
        }
    }

    fn withdrawal_index(&self, id: u64, status: WithdrawalStatus) -> Result<usize, StoreError> {
        let index = id
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|&i| i < self.withdrawals.len())
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal {id}")))?;
        if self.withdrawals[index].status != status {
            return Err(StoreError::StatusConflict(format!(
                "withdrawal {id} is {:?}, expected {status:?}",
                self.withdrawals[index].status
            )));
        }
        Ok(index)
    }

    fn send_index(&self, id: u64, status: SendStatus) -> Result<usize, StoreError> {
        let index = id
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|&i| i < self.sends.len())
            .ok_or_else(|| StoreError::NotFound(format!("send {id}")))?;
        if self.sends[index].status != status {
            return Err(StoreError::StatusConflict(format!(
                "send {id} is {:?}, expected {status:?}",
                self.sends[index].status
            )));
        }
        Ok(index)
    }

    fn check_withdrawals(
        &self,
        ids: &[u64],
        status: WithdrawalStatus,
    ) -> Result<Vec<usize>, StoreError> {
        ids.iter()
            .map(|&id| self.withdrawal_index(id, status))
            .collect()
    }

    fn insert_notifications(&mut self, notifications: Vec<Notification>) {
        for mut notification in notifications {
            if !self
                .notification_index
                .insert((notification.event, notification.item))
            {
                continue;
            }
            notification.id = self.notifications.len() as u64 + 1;
            self.notifications.push(notification);
        }
    }
}

impl Store for MemoryStore {
    fn count_free_addresses(&self) -> Result<u64, StoreError> {
        let t = self.inner.lock();
        Ok(t.keys.values().filter(|k| k.is_free()).count() as u64)
    }

    fn insert_address_keys(&self, keys: Vec<AddressKey>) -> Result<usize, StoreError> {
        let mut t = self.inner.lock();
        let mut inserted = 0;
        for key in keys {
            if !t.keys.contains_key(&key.address) {
                t.keys.insert(key.address.clone(), key);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn address_keys(&self, addresses: &[WalletAddress]) -> Result<Vec<AddressKey>, StoreError> {
        let t = self.inner.lock();
        Ok(addresses
            .iter()
            .filter_map(|address| t.keys.get(address).cloned())
            .collect())
    }

    fn cursor(&self, kind: CursorKind) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().cursors.get(&kind).copied())
    }

    fn init_cursor(&self, kind: CursorKind, height: u64) -> Result<(), StoreError> {
        self.inner.lock().cursors.entry(kind).or_insert(height);
        Ok(())
    }

    fn utxos_by_outpoints(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>, StoreError> {
        let t = self.inner.lock();
        Ok(outpoints
            .iter()
            .filter_map(|outpoint| t.utxo_index.get(outpoint).map(|&i| t.utxos[i].clone()))
            .collect())
    }

    fn spendable_utxos(
        &self,
        kind: UtxoKind,
        addresses: Option<&[WalletAddress]>,
        limit: usize,
    ) -> Result<Vec<Utxo>, StoreError> {
        let t = self.inner.lock();
        Ok(t.utxos
            .iter()
            .filter(|u| u.kind == kind && u.status == UtxoStatus::Seen)
            .filter(|u| addresses.map_or(true, |list| list.contains(&u.address)))
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_utxos_used(&self, claims: &[(OutPoint, SpendRef)]) -> Result<(), StoreError> {
        let mut t = self.inner.lock();
        t.check_claims(claims)?;
        t.apply_claims(claims);
        Ok(())
    }

    fn confirm_spends(&self, spends: &[(OutPoint, SpendRef)]) -> Result<usize, StoreError> {
        let mut t = self.inner.lock();
        let mut changed = 0;
        for (outpoint, spend) in spends {
            if t.apply_spend(outpoint, *spend) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn commit_block(&self, commit: BlockCommit) -> Result<BlockCommitStats, StoreError> {
        let mut t = self.inner.lock();
        t.check_cursor(CursorKind::Base, commit.expected_cursor, commit.height)?;

        let mut stats = BlockCommitStats::default();
        for utxo in commit.utxos {
            if t.insert_utxo(utxo).is_some() {
                stats.utxos += 1;
            }
        }
        for mut deposit in commit.deposits {
            if !t.deposit_index.insert(deposit.outpoint) {
                continue;
            }
            deposit.id = t.deposits.len() as u64 + 1;
            t.deposits.push(deposit);
            stats.deposits += 1;
        }
        for (outpoint, spend) in &commit.spends {
            if t.apply_spend(outpoint, *spend) {
                stats.spends += 1;
            }
        }

        t.cursors.insert(CursorKind::Base, commit.height);
        Ok(stats)
    }

    fn commit_token_block(&self, commit: TokenBlockCommit) -> Result<usize, StoreError> {
        let mut t = self.inner.lock();
        t.check_cursor(CursorKind::Token, commit.expected_cursor, commit.height)?;

        let mut inserted = 0;
        for mut transfer in commit.transfers {
            if !t.transfer_index.insert(transfer.txid) {
                continue;
            }
            transfer.id = t.transfers.len() as u64 + 1;
            t.transfers.push(transfer);
            inserted += 1;
        }

        t.cursors.insert(CursorKind::Token, commit.height);
        Ok(inserted)
    }

    fn token_configs(&self) -> Result<Vec<TokenConfig>, StoreError> {
        Ok(self.inner.lock().tokens.clone())
    }

    fn products(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError> {
        let t = self.inner.lock();
        Ok(ids.iter().filter_map(|id| t.products.get(id).cloned()).collect())
    }

    fn withdrawals_with_status(
        &self,
        status: WithdrawalStatus,
    ) -> Result<Vec<Withdrawal>, StoreError> {
        let t = self.inner.lock();
        Ok(t.withdrawals
            .iter()
            .filter(|w| w.status == status)
            .cloned()
            .collect())
    }

    fn withdrawals(&self, ids: &[u64]) -> Result<Vec<Withdrawal>, StoreError> {
        let t = self.inner.lock();
        Ok(t.withdrawals
            .iter()
            .filter(|w| ids.contains(&w.id))
            .cloned()
            .collect())
    }

    fn pending_token_transfers(&self) -> Result<Vec<TokenTransferRecord>, StoreError> {
        let t = self.inner.lock();
        Ok(t.transfers
            .iter()
            .filter(|r| r.sweep_status == SweepStatus::Pending)
            .cloned()
            .collect())
    }

    fn commit_built_tx(&self, commit: BuiltTxCommit) -> Result<Vec<u64>, StoreError> {
        let mut t = self.inner.lock();

        t.check_claims(&commit.claims)?;
        let withdrawal_ids: Vec<u64> = commit.withdrawals.iter().map(|(id, _)| *id).collect();
        let withdrawal_indexes = t.check_withdrawals(&withdrawal_ids, WithdrawalStatus::Init)?;
        let mut transfer_indexes = Vec::with_capacity(commit.swept_transfers.len());
        for id in &commit.swept_transfers {
            let index = t
                .transfers
                .iter()
                .position(|r| r.id == *id)
                .ok_or_else(|| StoreError::NotFound(format!("token transfer {id}")))?;
            if t.transfers[index].sweep_status != SweepStatus::Pending {
                return Err(StoreError::StatusConflict(format!(
                    "token transfer {id} already swept"
                )));
            }
            transfer_indexes.push(index);
        }

        t.apply_claims(&commit.claims);
        for (index, (_, reference)) in withdrawal_indexes.into_iter().zip(commit.withdrawals) {
            let withdrawal = &mut t.withdrawals[index];
            withdrawal.status = WithdrawalStatus::Built;
            withdrawal.tx_reference = Some(reference);
        }
        for index in transfer_indexes {
            t.transfers[index].sweep_status = SweepStatus::Swept;
        }
        let mut ids = Vec::with_capacity(commit.sends.len());
        for mut send in commit.sends {
            send.id = t.sends.len() as u64 + 1;
            send.status = SendStatus::Init;
            ids.push(send.id);
            t.sends.push(send);
        }
        Ok(ids)
    }

    fn sends_with_status(&self, status: SendStatus) -> Result<Vec<SendRecord>, StoreError> {
        let t = self.inner.lock();
        Ok(t.sends.iter().filter(|s| s.status == status).cloned().collect())
    }

    fn commit_sent(&self, commit: SentCommit) -> Result<(), StoreError> {
        let mut t = self.inner.lock();
        let send_indexes = commit
            .sends
            .iter()
            .map(|&id| t.send_index(id, SendStatus::Init))
            .collect::<Result<Vec<_>, _>>()?;
        let withdrawal_indexes = t.check_withdrawals(&commit.withdrawals, WithdrawalStatus::Built)?;

        for index in send_indexes {
            t.sends[index].status = SendStatus::Sent;
        }
        for index in withdrawal_indexes {
            t.withdrawals[index].status = WithdrawalStatus::Sent;
        }
        t.insert_notifications(commit.notifications);
        Ok(())
    }

    fn commit_confirmed(&self, commit: ConfirmedCommit) -> Result<(), StoreError> {
        let mut t = self.inner.lock();
        let send_indexes = commit
            .sends
            .iter()
            .map(|&id| t.send_index(id, SendStatus::Sent))
            .collect::<Result<Vec<_>, _>>()?;
        let withdrawal_indexes = t.check_withdrawals(&commit.withdrawals, WithdrawalStatus::Sent)?;

        for index in send_indexes {
            t.sends[index].status = SendStatus::Confirmed;
        }
        for index in withdrawal_indexes {
            t.withdrawals[index].status = WithdrawalStatus::Confirmed;
        }
        t.insert_notifications(commit.notifications);
        Ok(())
    }

    fn pending_deposits(&self) -> Result<Vec<DepositRecord>, StoreError> {
        let t = self.inner.lock();
        Ok(t.deposits
            .iter()
            .filter(|d| d.status == DepositStatus::Pending)
            .cloned()
            .collect())
    }

    fn commit_deposit_notifications(
        &self,
        commit: DepositNotifyCommit,
    ) -> Result<(), StoreError> {
        let mut t = self.inner.lock();
        let mut indexes = Vec::with_capacity(commit.deposits.len());
        for id in &commit.deposits {
            let index = t
                .deposits
                .iter()
                .position(|d| d.id == *id)
                .ok_or_else(|| StoreError::NotFound(format!("deposit {id}")))?;
            if t.deposits[index].status != DepositStatus::Pending {
                return Err(StoreError::StatusConflict(format!(
                    "deposit {id} already notified"
                )));
            }
            indexes.push(index);
        }

        for index in indexes {
            t.deposits[index].status = DepositStatus::Notified;
        }
        t.insert_notifications(commit.notifications);
        Ok(())
    }

    fn notifications(&self) -> Result<Vec<Notification>, StoreError> {
        Ok(self.inner.lock().notifications.clone())
    }
}
