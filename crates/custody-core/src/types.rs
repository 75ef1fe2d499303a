use std::fmt;

use bitcoin::{BlockHash, OutPoint, ScriptBuf, Txid};
use chain_btc::transaction::BuiltTx;
use serde::{Deserialize, Serialize};

/// A base-layer address as rendered by the node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WalletAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WalletAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Product (integrator) identifier. Also the positive range of `use_tag`.
pub type ProductId = i64;

/// A custodial address and its sealed private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressKey {
    pub address: WalletAddress,
    /// Hex of `nonce || AES-256-GCM(wif)`.
    pub encrypted_key: String,
    /// `0` free, `> 0` assigned to that product, `< 0` hot wallet.
    pub use_tag: i64,
}

impl AddressKey {
    pub fn is_free(&self) -> bool {
        self.use_tag == 0
    }

    pub fn is_hot(&self) -> bool {
        self.use_tag < 0
    }

    /// The owning product, for assigned deposit addresses.
    pub fn product_id(&self) -> Option<ProductId> {
        (self.use_tag > 0).then_some(self.use_tag)
    }
}

/// Accounting treatment of an owned output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtxoKind {
    /// Customer deposit, swept to cold storage.
    Deposit,
    /// Hot wallet funds, used for withdrawals.
    Hot,
    /// Base-layer output carrying a token balance into a deposit address.
    TokenDeposit,
    /// Output at a token hot address, spent as fee input of token sweeps.
    TokenHot,
}

/// Lifecycle of an owned output.
///
/// `Seen` outputs are spendable. `Used` means a transaction built here claims
/// the output and has not been observed on chain yet. `Confirmed` means a block
/// containing the spend was ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtxoStatus {
    Seen,
    Used,
    Confirmed,
}

impl UtxoStatus {
    /// Forward-only transitions: `Seen -> Used -> Confirmed`, or
    /// `Seen -> Confirmed` when the spend was made elsewhere.
    pub fn can_advance_to(self, next: UtxoStatus) -> bool {
        matches!(
            (self, next),
            (UtxoStatus::Seen, UtxoStatus::Used)
                | (UtxoStatus::Seen, UtxoStatus::Confirmed)
                | (UtxoStatus::Used, UtxoStatus::Confirmed)
        )
    }
}

/// The input that spends an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpendRef {
    pub txid: Txid,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Insertion order, assigned by the store.
    pub id: u64,
    pub outpoint: OutPoint,
    pub address: WalletAddress,
    pub value: u64,
    pub script: ScriptBuf,
    pub block_hash: BlockHash,
    pub kind: UtxoKind,
    pub status: UtxoStatus,
    /// Set once, never changed afterwards.
    pub spend: Option<SpendRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositStatus {
    Pending,
    Notified,
}

/// A confirmed deposit to a product's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositRecord {
    pub id: u64,
    pub product_id: ProductId,
    pub block_hash: BlockHash,
    pub outpoint: OutPoint,
    pub address: WalletAddress,
    pub value: u64,
    pub status: DepositStatus,
}

impl DepositRecord {
    /// `"{txid}_{vout}"`, the reference integrators see.
    pub fn tx_hash(&self) -> String {
        format!("{}_{}", self.outpoint.txid, self.outpoint.vout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepStatus {
    Pending,
    Swept,
}

/// A token-layer transfer into one of our addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransferRecord {
    pub id: u64,
    pub token_index: u32,
    pub token_symbol: String,
    pub block_hash: BlockHash,
    pub txid: Txid,
    pub from: WalletAddress,
    pub to: WalletAddress,
    /// Indivisible units, 8 decimals.
    pub amount: u64,
    pub block_time: i64,
    pub sweep_status: SweepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Init,
    Built,
    Sent,
    Confirmed,
}

impl WithdrawalStatus {
    /// Each status has exactly one successor.
    pub fn next(self) -> Option<WithdrawalStatus> {
        match self {
            WithdrawalStatus::Init => Some(WithdrawalStatus::Built),
            WithdrawalStatus::Built => Some(WithdrawalStatus::Sent),
            WithdrawalStatus::Sent => Some(WithdrawalStatus::Confirmed),
            WithdrawalStatus::Confirmed => None,
        }
    }
}

/// A withdrawal requested by a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    /// Arrival order.
    pub id: u64,
    pub product_id: ProductId,
    pub serial: String,
    pub to_address: WalletAddress,
    pub amount: u64,
    pub status: WithdrawalStatus,
    /// `"{txid}_{vout}"` of the paying output once built.
    pub tx_reference: Option<String>,
}

/// What a send record pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendRelation {
    Withdrawal(u64),
    /// A swept deposit output, by UTXO id.
    Consolidation(u64),
    /// A swept token transfer, by record id.
    TokenSweep(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeInfo {
    pub size: u64,
    pub fee_rate: u64,
    pub fee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    Init,
    Sent,
    Confirmed,
}

/// One logical payment inside a built transaction. Only the first record per
/// txid carries `raw_tx` and `fee`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRecord {
    pub id: u64,
    pub relation: SendRelation,
    pub token_index: Option<u32>,
    pub txid: Txid,
    pub from: WalletAddress,
    pub to: WalletAddress,
    pub amount: u64,
    pub raw_tx: Option<Vec<u8>>,
    pub fee: Option<FeeInfo>,
    pub status: SendStatus,
}

impl SendRecord {
    /// An `Init` record for one payment inside `txid`.
    pub fn new(
        relation: SendRelation,
        txid: Txid,
        from: WalletAddress,
        to: WalletAddress,
        amount: u64,
    ) -> Self {
        Self {
            id: 0,
            relation,
            token_index: None,
            txid,
            from,
            to,
            amount,
            raw_tx: None,
            fee: None,
            status: SendStatus::Init,
        }
    }
}

/// Put the signed bytes and fee of `built` on the first record only.
pub fn attach_built(sends: &mut [SendRecord], built: &BuiltTx) {
    if let Some(first) = sends.first_mut() {
        first.raw_tx = Some(built.raw.clone());
        first.fee = Some(FeeInfo {
            size: built.size,
            fee_rate: built.fee_rate,
            fee: built.fee,
        });
    }
}

/// An integrator that owns deposit addresses and receives notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: ProductId,
    pub app_name: String,
    pub callback_url: String,
    /// Shared HMAC secret for notification signatures.
    pub secret: String,
}

/// A token-layer asset this wallet accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    /// Omni property id.
    pub token_index: u32,
    pub symbol: String,
    pub hot_address: WalletAddress,
    pub cold_address: WalletAddress,
    /// Pending transfers at one address must add up to this before a sweep.
    pub sweep_min_amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyEvent {
    DepositConfirmed,
    WithdrawalSent,
    WithdrawalConfirmed,
}

impl NotifyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyEvent::DepositConfirmed => "deposit_confirmed",
            NotifyEvent::WithdrawalSent => "withdrawal_sent",
            NotifyEvent::WithdrawalConfirmed => "withdrawal_confirmed",
        }
    }
}

/// The entity a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyItem {
    Deposit(u64),
    Withdrawal(u64),
}

/// An outbox row. Delivery is done elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub product_id: ProductId,
    pub event: NotifyEvent,
    pub item: NotifyItem,
    pub callback_url: String,
    /// Signed JSON body.
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CursorKind {
    /// Base-layer block ingestion.
    Base,
    /// Token-layer transfer ingestion.
    Token,
}

impl fmt::Display for CursorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorKind::Base => write!(f, "base"),
            CursorKind::Token => write!(f, "token"),
        }
    }
}
