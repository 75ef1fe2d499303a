//! Durable store interface.
//!
//! Every `commit_*` call is all-or-nothing: either every row in the commit is
//! written or the store is left exactly as before. Inserts are
//! insert-if-absent on the entity's natural key; claims and status changes are
//! conditional on the current status.

mod memory;

pub use memory::MemoryStore;

use bitcoin::OutPoint;
use thiserror::Error;

use crate::types::{
    AddressKey, CursorKind, DepositRecord, Notification, Product, ProductId, SendRecord,
    SendStatus, SpendRef, TokenConfig, TokenTransferRecord, Utxo, UtxoKind, WalletAddress,
    Withdrawal, WithdrawalStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("output {0} is already spent")]
    AlreadySpent(OutPoint),

    #[error("{kind} cursor moved: expected {expected:?}, found {found:?}")]
    CursorConflict {
        kind: CursorKind,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("status conflict: {0}")]
    StatusConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend: {0}")]
    Backend(String),
}

/// Rows derived from one base-layer block.
#[derive(Debug, Clone, Default)]
pub struct BlockCommit {
    /// Cursor value the scan started from; the commit fails if it moved.
    pub expected_cursor: u64,
    pub height: u64,
    pub utxos: Vec<Utxo>,
    pub deposits: Vec<DepositRecord>,
    /// Spends observed in the block, applied to already stored outputs.
    pub spends: Vec<(OutPoint, SpendRef)>,
}

/// What a block commit actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCommitStats {
    pub utxos: usize,
    pub deposits: usize,
    pub spends: usize,
}

/// Token transfers found at one height.
#[derive(Debug, Clone, Default)]
pub struct TokenBlockCommit {
    pub expected_cursor: u64,
    pub height: u64,
    pub transfers: Vec<TokenTransferRecord>,
}

/// A freshly built transaction and everything it settles.
#[derive(Debug, Clone, Default)]
pub struct BuiltTxCommit {
    /// Outputs spent by the transaction, claimed `Seen -> Used`.
    pub claims: Vec<(OutPoint, SpendRef)>,
    pub sends: Vec<SendRecord>,
    /// Withdrawals moved `Init -> Built`, with their `tx_reference`.
    pub withdrawals: Vec<(u64, String)>,
    /// Token transfer records moved `Pending -> Swept`.
    pub swept_transfers: Vec<u64>,
}

/// Result of a successful broadcast.
#[derive(Debug, Clone, Default)]
pub struct SentCommit {
    pub sends: Vec<u64>,
    pub withdrawals: Vec<u64>,
    pub notifications: Vec<Notification>,
}

/// Sends observed with at least one confirmation.
#[derive(Debug, Clone, Default)]
pub struct ConfirmedCommit {
    pub sends: Vec<u64>,
    pub withdrawals: Vec<u64>,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Default)]
pub struct DepositNotifyCommit {
    pub deposits: Vec<u64>,
    pub notifications: Vec<Notification>,
}

pub trait Store: Send + Sync {
    // Address keys.

    fn count_free_addresses(&self) -> Result<u64, StoreError>;

    /// Insert-if-absent by address. Returns the number inserted.
    fn insert_address_keys(&self, keys: Vec<AddressKey>) -> Result<usize, StoreError>;

    /// Keys for whichever of `addresses` are known.
    fn address_keys(&self, addresses: &[WalletAddress]) -> Result<Vec<AddressKey>, StoreError>;

    // Cursors.

    fn cursor(&self, kind: CursorKind) -> Result<Option<u64>, StoreError>;

    /// Create the cursor at `height` if it does not exist yet.
    fn init_cursor(&self, kind: CursorKind, height: u64) -> Result<(), StoreError>;

    // Outputs.

    fn utxos_by_outpoints(&self, outpoints: &[OutPoint]) -> Result<Vec<Utxo>, StoreError>;

    /// `Seen` outputs of `kind`, in insertion order, optionally restricted to
    /// `addresses`.
    fn spendable_utxos(
        &self,
        kind: UtxoKind,
        addresses: Option<&[WalletAddress]>,
        limit: usize,
    ) -> Result<Vec<Utxo>, StoreError>;

    /// Claim every outpoint `Seen -> Used` or fail with nothing changed.
    fn mark_utxos_used(&self, claims: &[(OutPoint, SpendRef)]) -> Result<(), StoreError>;

    /// Record observed spends, moving outputs to `Confirmed`. Unknown
    /// outpoints are ignored. Returns how many outputs changed.
    fn confirm_spends(&self, spends: &[(OutPoint, SpendRef)]) -> Result<usize, StoreError>;

    // Chain ingestion.

    fn commit_block(&self, commit: BlockCommit) -> Result<BlockCommitStats, StoreError>;

    /// Returns the number of transfer records inserted.
    fn commit_token_block(&self, commit: TokenBlockCommit) -> Result<usize, StoreError>;

    // Reference data.

    fn token_configs(&self) -> Result<Vec<TokenConfig>, StoreError>;

    fn products(&self, ids: &[ProductId]) -> Result<Vec<Product>, StoreError>;

    // Withdrawals, transfers and sends.

    /// Withdrawals at `status`, in arrival order.
    fn withdrawals_with_status(
        &self,
        status: WithdrawalStatus,
    ) -> Result<Vec<Withdrawal>, StoreError>;

    fn withdrawals(&self, ids: &[u64]) -> Result<Vec<Withdrawal>, StoreError>;

    fn pending_token_transfers(&self) -> Result<Vec<TokenTransferRecord>, StoreError>;

    /// Returns the ids assigned to the new send records, in order.
    fn commit_built_tx(&self, commit: BuiltTxCommit) -> Result<Vec<u64>, StoreError>;

    /// Send records at `status`, in id order.
    fn sends_with_status(&self, status: SendStatus) -> Result<Vec<SendRecord>, StoreError>;

    fn commit_sent(&self, commit: SentCommit) -> Result<(), StoreError>;

    fn commit_confirmed(&self, commit: ConfirmedCommit) -> Result<(), StoreError>;

    // Deposits and notifications.

    fn pending_deposits(&self) -> Result<Vec<DepositRecord>, StoreError>;

    fn commit_deposit_notifications(&self, commit: DepositNotifyCommit)
        -> Result<(), StoreError>;

    fn notifications(&self) -> Result<Vec<Notification>, StoreError>;
}
