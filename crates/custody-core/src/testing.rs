//! Fixtures shared by the unit tests: a scripted node, an in-memory store and
//! keys sealed with a fixed cipher.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Transaction, Txid};
use chain_btc::address::{generate_key, parse_address};
use chain_btc::BtcNetwork;
use crypto_utils::KeyCipher;
use parking_lot::Mutex;

use crate::context::CustodyContext;
use crate::rpc::{NodeRpc, RpcError, ScriptPubKey, TokenTx, TxInput, TxOutput, VerboseBlock, VerboseTx};
use crate::settings::{self, MemorySettings, Settings};
use crate::store::{MemoryStore, Store};
use crate::types::{AddressKey, Utxo, UtxoKind, UtxoStatus, WalletAddress};

pub const NET: BtcNetwork = BtcNetwork::Regtest;

pub fn txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

pub fn outpoint(byte: u8, vout: u32) -> OutPoint {
    OutPoint::new(txid(byte), vout)
}

pub fn block_hash(height: u64) -> BlockHash {
    let mut bytes = [0xbb; 32];
    bytes[..8].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

/// Output with an empty script, for bookkeeping-only tests.
pub fn utxo(byte: u8, vout: u32, address: &str, value: u64, kind: UtxoKind) -> Utxo {
    Utxo {
        id: 0,
        outpoint: outpoint(byte, vout),
        address: address.into(),
        value,
        script: ScriptBuf::new(),
        block_hash: block_hash(1),
        kind,
        status: UtxoStatus::Seen,
        spend: None,
    }
}

/// Output paying the real script of `address`, spendable by its key.
pub fn funded_utxo(address: &WalletAddress, byte: u8, vout: u32, value: u64, kind: UtxoKind) -> Utxo {
    Utxo {
        script: script_for(address.as_str()),
        ..utxo(byte, vout, address.as_str(), value, kind)
    }
}

pub fn script_for(address: &str) -> ScriptBuf {
    parse_address(address, NET)
        .map(|a| a.script_pubkey())
        .unwrap_or_default()
}

pub fn vin(byte: u8, vout: u32) -> TxInput {
    TxInput {
        txid: Some(txid(byte)),
        vout: Some(vout),
        coinbase: None,
    }
}

pub fn coinbase_vin() -> TxInput {
    TxInput {
        txid: None,
        vout: None,
        coinbase: Some("03".into()),
    }
}

pub fn vout_to(address: &str, value: u64, n: u32) -> TxOutput {
    TxOutput {
        value: Amount::from_sat(value),
        n,
        script_pub_key: ScriptPubKey {
            hex: script_for(address).to_hex_string(),
            address: Some(address.to_string()),
            addresses: Vec::new(),
        },
    }
}

pub fn marker_vout(n: u32, property_id: u32, amount: u64) -> TxOutput {
    let script = chain_btc::omni::encode_simple_send(property_id, amount).unwrap();
    TxOutput {
        value: Amount::ZERO,
        n,
        script_pub_key: ScriptPubKey {
            hex: script.to_hex_string(),
            address: None,
            addresses: Vec::new(),
        },
    }
}

pub fn verbose_tx(byte: u8, vin: Vec<TxInput>, vout: Vec<TxOutput>) -> VerboseTx {
    VerboseTx {
        txid: txid(byte),
        vin,
        vout,
        confirmations: 0,
    }
}

pub fn token_tx(byte: u8, from: &str, to: &str, property_id: u32, amount: &str) -> TokenTx {
    TokenTx {
        txid: txid(byte),
        sending_address: from.to_string(),
        reference_address: Some(to.to_string()),
        type_int: 0,
        valid: true,
        confirmations: 1,
        property_id,
        amount: amount.to_string(),
        block_hash: Some(block_hash(1)),
        block_time: 1_600_000_000,
    }
}

#[derive(Default)]
struct Chain {
    blocks: Vec<VerboseBlock>,
    txs: HashMap<Txid, VerboseTx>,
    confirmations: HashMap<Txid, u64>,
    token_blocks: HashMap<u64, Vec<Txid>>,
    token_txs: HashMap<Txid, TokenTx>,
    failing_blocks: Vec<u64>,
    failing_txs: Vec<Txid>,
    broadcast_script: VecDeque<Result<(), RpcError>>,
    broadcasts: Vec<String>,
}

/// A node whose chain and responses are set up by the test.
pub struct FakeNode {
    chain: Mutex<Chain>,
}

impl FakeNode {
    /// A chain holding only an empty block at height 0.
    pub fn new() -> Self {
        let node = Self {
            chain: Mutex::new(Chain::default()),
        };
        node.push_block(Vec::new());
        node
    }

    /// Append a block. Returns its height.
    pub fn push_block(&self, txs: Vec<VerboseTx>) -> u64 {
        let mut chain = self.chain.lock();
        let height = chain.blocks.len() as u64;
        for tx in &txs {
            chain.txs.insert(tx.txid, tx.clone());
        }
        chain.blocks.push(VerboseBlock {
            hash: block_hash(height),
            height,
            transactions: txs,
        });
        height
    }

    /// Make a transaction known to `getrawtransaction` without a block.
    pub fn add_tx(&self, tx: VerboseTx) {
        self.chain.lock().txs.insert(tx.txid, tx);
    }

    pub fn add_token_tx(&self, height: u64, tx: TokenTx) {
        let mut chain = self.chain.lock();
        chain.token_blocks.entry(height).or_default().push(tx.txid);
        chain.token_txs.insert(tx.txid, tx);
    }

    pub fn fail_block(&self, height: u64) {
        self.chain.lock().failing_blocks.push(height);
    }

    pub fn heal_block(&self, height: u64) {
        self.chain.lock().failing_blocks.retain(|h| *h != height);
    }

    pub fn fail_tx(&self, txid: Txid) {
        self.chain.lock().failing_txs.push(txid);
    }

    pub fn set_confirmations(&self, txid: Txid, confirmations: u64) {
        self.chain.lock().confirmations.insert(txid, confirmations);
    }

    /// Queue the outcome of the next broadcast. Unscripted broadcasts succeed.
    pub fn script_broadcast(&self, result: Result<(), RpcError>) {
        self.chain.lock().broadcast_script.push_back(result);
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.chain.lock().broadcasts.clone()
    }
}

impl NodeRpc for FakeNode {
    fn get_block_count(&self) -> Result<u64, RpcError> {
        Ok(self.chain.lock().blocks.len() as u64 - 1)
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, RpcError> {
        let chain = self.chain.lock();
        if chain.failing_blocks.contains(&height) {
            return Err(RpcError::Transport(format!("timeout at {height}")));
        }
        chain
            .blocks
            .get(height as usize)
            .map(|b| b.hash)
            .ok_or_else(|| RpcError::Rejected {
                code: -8,
                message: "Block height out of range".into(),
            })
    }

    fn get_block_verbose(&self, hash: &BlockHash) -> Result<VerboseBlock, RpcError> {
        let chain = self.chain.lock();
        chain
            .blocks
            .iter()
            .find(|b| b.hash == *hash)
            .cloned()
            .ok_or_else(|| RpcError::Rejected {
                code: -5,
                message: "Block not found".into(),
            })
    }

    fn get_raw_transaction_verbose(&self, txid: &Txid) -> Result<VerboseTx, RpcError> {
        let chain = self.chain.lock();
        if chain.failing_txs.contains(txid) {
            return Err(RpcError::Transport(format!("timeout fetching {txid}")));
        }
        let mut tx = chain.txs.get(txid).cloned().ok_or_else(|| RpcError::Rejected {
            code: -5,
            message: "No such mempool or blockchain transaction".into(),
        })?;
        tx.confirmations = chain.confirmations.get(txid).copied().unwrap_or(0);
        Ok(tx)
    }

    fn send_raw_transaction(&self, raw_hex: &str) -> Result<Txid, RpcError> {
        let mut chain = self.chain.lock();
        chain.broadcasts.push(raw_hex.to_string());
        if let Some(Err(e)) = chain.broadcast_script.pop_front() {
            return Err(e);
        }
        let tx: Transaction = hex::decode(raw_hex)
            .ok()
            .and_then(|bytes| bitcoin::consensus::deserialize(&bytes).ok())
            .ok_or_else(|| RpcError::Rejected {
                code: -22,
                message: "TX decode failed".into(),
            })?;
        Ok(tx.compute_txid())
    }

    fn list_block_transactions(&self, height: u64) -> Result<Vec<Txid>, RpcError> {
        let chain = self.chain.lock();
        if chain.failing_blocks.contains(&height) {
            return Err(RpcError::Transport(format!("timeout at {height}")));
        }
        Ok(chain.token_blocks.get(&height).cloned().unwrap_or_default())
    }

    fn get_token_transaction(&self, txid: &Txid) -> Result<TokenTx, RpcError> {
        self.chain
            .lock()
            .token_txs
            .get(txid)
            .cloned()
            .ok_or_else(|| RpcError::Rejected {
                code: -5,
                message: "No information available about transaction".into(),
            })
    }
}

/// A context wired to a fake node, an in-memory store and in-memory settings.
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub settings: Arc<MemorySettings>,
    pub node: Arc<FakeNode>,
    pub ctx: CustodyContext,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(
            MemorySettings::new()
                .with_int(settings::BLOCK_CONFIRM_NUM, 0)
                .with_int(settings::TO_USER_FEE_RATE, 1)
                .with_int(settings::TO_COLD_FEE_RATE, 1),
        );
        let node = Arc::new(FakeNode::new());
        let ctx = CustodyContext::new(
            NET,
            store.clone(),
            settings.clone(),
            node.clone(),
            Arc::new(KeyCipher::new([7u8; 32])),
        );
        Self {
            store,
            settings,
            node,
            ctx,
        }
    }

    /// Generate a key, seal it and store it with `use_tag`.
    pub fn keyed_address(&self, use_tag: i64) -> WalletAddress {
        let generated = generate_key(NET);
        let address = WalletAddress::from(generated.address.clone());
        self.store
            .insert_address_keys(vec![AddressKey {
                address: address.clone(),
                encrypted_key: self.ctx.cipher.seal(&generated.wif).unwrap(),
                use_tag,
            }])
            .unwrap();
        address
    }

    pub fn set_str(&self, key: &str, value: &str) {
        self.settings.set_str(key, value);
    }

    pub fn set_int(&self, key: &str, value: i64) {
        self.settings.set_int(key, value);
    }
}
