//! End-to-end settlement through the public API: a deposit is scanned,
//! notified and swept while a withdrawal is batched, broadcast and confirmed.
//!
//! The node is a small in-process chain. Broadcast transactions sit in a
//! mempool until `mine` puts them into a block, so the scanner sees our own
//! spends and change outputs the way it would on a real node.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::{Address, BlockHash, Network, Transaction, Txid};
use chain_btc::address::{generate_key, parse_address};
use chain_btc::BtcNetwork;
use crypto_utils::KeyCipher;
use parking_lot::Mutex;

use custody_core::notify::verify_body;
use custody_core::rpc::{ScriptPubKey, TokenTx, TxInput, TxOutput, VerboseBlock, VerboseTx};
use custody_core::settings::{
    BLOCK_CONFIRM_NUM, COLD_WALLET_ADDRESS, HOT_WALLET_ADDRESS, MIN_FREE_ADDRESS,
    TO_COLD_FEE_RATE, TO_USER_FEE_RATE,
};
use custody_core::types::{
    AddressKey, CursorKind, DepositStatus, NotifyEvent, Product, SendStatus, UtxoKind, UtxoStatus,
    WalletAddress, WithdrawalStatus,
};
use custody_core::{
    Custodian, CustodyContext, JobName, JobRun, MemorySettings, MemoryStore, NodeRpc, RpcError,
    Store,
};

const NET: BtcNetwork = BtcNetwork::Regtest;
const SECRET: &str = "product-secret";

fn output(address: &str, value: u64, n: u32) -> TxOutput {
    let script = parse_address(address, NET).unwrap().script_pubkey();
    TxOutput {
        value: bitcoin::Amount::from_sat(value),
        n,
        script_pub_key: ScriptPubKey {
            hex: script.to_hex_string(),
            address: Some(address.to_string()),
            addresses: Vec::new(),
        },
    }
}

/// The node's verbose view of a transaction we broadcast.
fn verbose(tx: &Transaction) -> VerboseTx {
    VerboseTx {
        txid: tx.compute_txid(),
        vin: tx
            .input
            .iter()
            .map(|i| TxInput {
                txid: Some(i.previous_output.txid),
                vout: Some(i.previous_output.vout),
                coinbase: None,
            })
            .collect(),
        vout: tx
            .output
            .iter()
            .enumerate()
            .map(|(n, o)| TxOutput {
                value: o.value,
                n: n as u32,
                script_pub_key: ScriptPubKey {
                    hex: o.script_pubkey.to_hex_string(),
                    address: Address::from_script(&o.script_pubkey, Network::Regtest)
                        .ok()
                        .map(|a| a.to_string()),
                    addresses: Vec::new(),
                },
            })
            .collect(),
        confirmations: 0,
    }
}

fn hash_at(height: u64) -> BlockHash {
    let mut bytes = [0x5a; 32];
    bytes[..8].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

#[derive(Default)]
struct Chain {
    blocks: Vec<VerboseBlock>,
    heights: HashMap<Txid, u64>,
    mempool: Vec<VerboseTx>,
}

struct LocalNode {
    chain: Mutex<Chain>,
}

impl LocalNode {
    fn new() -> Self {
        let node = Self {
            chain: Mutex::new(Chain::default()),
        };
        node.mine(Vec::new());
        node
    }

    /// Append a block with `txs` and whatever is in the mempool.
    fn mine(&self, txs: Vec<VerboseTx>) -> u64 {
        let mut chain = self.chain.lock();
        let height = chain.blocks.len() as u64;
        let mut included = std::mem::take(&mut chain.mempool);
        included.extend(txs);
        for tx in &included {
            chain.heights.insert(tx.txid, height);
        }
        chain.blocks.push(VerboseBlock {
            hash: hash_at(height),
            height,
            transactions: included,
        });
        height
    }

    fn mempool_len(&self) -> usize {
        self.chain.lock().mempool.len()
    }
}

fn not_found() -> RpcError {
    RpcError::Rejected {
        code: -5,
        message: "not found".into(),
    }
}

impl NodeRpc for LocalNode {
    fn get_block_count(&self) -> Result<u64, RpcError> {
        Ok(self.chain.lock().blocks.len() as u64 - 1)
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, RpcError> {
        let chain = self.chain.lock();
        chain.blocks.get(height as usize).map(|b| b.hash).ok_or_else(not_found)
    }

    fn get_block_verbose(&self, hash: &BlockHash) -> Result<VerboseBlock, RpcError> {
        let chain = self.chain.lock();
        chain.blocks.iter().find(|b| b.hash == *hash).cloned().ok_or_else(not_found)
    }

    fn get_raw_transaction_verbose(&self, txid: &Txid) -> Result<VerboseTx, RpcError> {
        let chain = self.chain.lock();
        if let Some(tx) = chain.mempool.iter().find(|t| t.txid == *txid) {
            return Ok(tx.clone());
        }
        let height = *chain.heights.get(txid).ok_or_else(not_found)?;
        let tip = chain.blocks.len() as u64 - 1;
        let mut tx = chain.blocks[height as usize]
            .transactions
            .iter()
            .find(|t| t.txid == *txid)
            .cloned()
            .ok_or_else(not_found)?;
        tx.confirmations = tip - height + 1;
        Ok(tx)
    }

    fn send_raw_transaction(&self, raw_hex: &str) -> Result<Txid, RpcError> {
        let tx: Transaction = hex::decode(raw_hex)
            .ok()
            .and_then(|bytes| bitcoin::consensus::deserialize(&bytes).ok())
            .ok_or_else(|| RpcError::Rejected {
                code: -22,
                message: "TX decode failed".into(),
            })?;
        let txid = tx.compute_txid();
        let mut chain = self.chain.lock();
        if chain.heights.contains_key(&txid) || chain.mempool.iter().any(|t| t.txid == txid) {
            return Err(RpcError::Rejected {
                code: -27,
                message: "transaction already in block chain".into(),
            });
        }
        chain.mempool.push(verbose(&tx));
        Ok(txid)
    }

    fn list_block_transactions(&self, _height: u64) -> Result<Vec<Txid>, RpcError> {
        Ok(Vec::new())
    }

    fn get_token_transaction(&self, _txid: &Txid) -> Result<TokenTx, RpcError> {
        Err(not_found())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    node: Arc<LocalNode>,
    custodian: Custodian,
    deposit: WalletAddress,
    hot: WalletAddress,
    cold: String,
    user: String,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let node = Arc::new(LocalNode::new());
        let cipher = Arc::new(KeyCipher::new([3u8; 32]));

        let sealed = |use_tag: i64| {
            let key = generate_key(NET);
            let address = WalletAddress::from(key.address.clone());
            let row = AddressKey {
                address: address.clone(),
                encrypted_key: cipher.seal(&key.wif).unwrap(),
                use_tag,
            };
            (address, row)
        };
        let (deposit, deposit_key) = sealed(5);
        let (hot, hot_key) = sealed(-1);
        store.insert_address_keys(vec![deposit_key, hot_key]).unwrap();

        let cold = generate_key(NET).address.clone();
        let user = generate_key(NET).address.clone();
        let settings = Arc::new(
            MemorySettings::new()
                .with_int(BLOCK_CONFIRM_NUM, 1)
                .with_int(MIN_FREE_ADDRESS, 3)
                .with_int(TO_USER_FEE_RATE, 2)
                .with_int(TO_COLD_FEE_RATE, 1)
                .with_str(HOT_WALLET_ADDRESS, hot.as_str())
                .with_str(COLD_WALLET_ADDRESS, &cold),
        );

        store.add_product(Product {
            id: 5,
            app_name: "exchange".into(),
            callback_url: "https://exchange.example/notify".into(),
            secret: SECRET.into(),
        });
        store.init_cursor(CursorKind::Base, 0).unwrap();

        let ctx = CustodyContext::new(NET, store.clone(), settings, node.clone(), cipher);
        Self {
            store,
            node,
            custodian: Custodian::new(ctx, None),
            deposit,
            hot,
            cold,
            user,
        }
    }

    fn run(&self, job: JobName) {
        assert_eq!(self.custodian.run(job).unwrap(), JobRun::Completed);
    }

    fn events(&self) -> Vec<NotifyEvent> {
        self.store
            .notifications()
            .unwrap()
            .into_iter()
            .map(|n| n.event)
            .collect()
    }
}

#[test]
fn deposit_and_withdrawal_settle_end_to_end() {
    let h = Harness::new();

    h.run(JobName::AddressPool);
    assert_eq!(h.store.count_free_addresses().unwrap(), 3);

    // Someone pays the deposit address and funds the hot wallet.
    let funding = VerboseTx {
        txid: Txid::from_byte_array([0x11; 32]),
        vin: vec![TxInput {
            txid: Some(Txid::from_byte_array([0x01; 32])),
            vout: Some(0),
            coinbase: None,
        }],
        vout: vec![
            output(h.deposit.as_str(), 80_000, 0),
            output(h.hot.as_str(), 500_000, 1),
        ],
        confirmations: 0,
    };
    h.node.mine(vec![funding]);

    // One block deep is not enough.
    h.run(JobName::Scan);
    assert!(h.store.all_utxos().is_empty());

    h.node.mine(Vec::new());
    h.run(JobName::Scan);
    let utxos = h.store.all_utxos();
    assert_eq!(utxos.len(), 2);
    assert!(utxos.iter().any(|u| u.kind == UtxoKind::Deposit && u.value == 80_000));
    assert!(utxos.iter().any(|u| u.kind == UtxoKind::Hot && u.value == 500_000));

    h.run(JobName::NotifyDeposits);
    let deposits = h.store.all_deposits();
    assert_eq!(deposits.len(), 1);
    assert_eq!(deposits[0].status, DepositStatus::Notified);
    let outbox = h.store.notifications().unwrap();
    assert_eq!(outbox[0].event, NotifyEvent::DepositConfirmed);
    assert!(verify_body(&outbox[0].body, SECRET));
    let body: serde_json::Value = serde_json::from_str(&outbox[0].body).unwrap();
    assert_eq!(body["amount"], "0.00080000");
    assert_eq!(body["address"], h.deposit.as_str());

    // A withdrawal and the deposit sweep are built in the same cycle.
    let withdrawal = h.store.add_withdrawal(5, "w-1", &h.user, 120_000);
    h.run(JobName::Withdraw);
    h.run(JobName::SweepDeposits);
    assert!(h.store.all_utxos().iter().all(|u| u.status == UtxoStatus::Used));
    assert_eq!(h.store.all_withdrawals()[0].status, WithdrawalStatus::Built);

    h.run(JobName::Broadcast);
    assert_eq!(h.node.mempool_len(), 2);
    assert_eq!(h.store.all_withdrawals()[0].status, WithdrawalStatus::Sent);

    // Nothing confirms while the transactions are in the mempool.
    h.run(JobName::Confirm);
    assert!(h.store.all_sends().iter().all(|s| s.status == SendStatus::Sent));

    h.node.mine(Vec::new());
    h.run(JobName::Confirm);
    assert!(h.store.all_sends().iter().all(|s| s.status == SendStatus::Confirmed));
    let settled = h.store.withdrawals(&[withdrawal]).unwrap();
    assert_eq!(settled[0].status, WithdrawalStatus::Confirmed);

    assert_eq!(
        h.events(),
        vec![
            NotifyEvent::DepositConfirmed,
            NotifyEvent::WithdrawalSent,
            NotifyEvent::WithdrawalConfirmed,
        ]
    );

    // Scanning our own transactions confirms the spent outputs and picks up
    // the withdrawal change as a new hot output. The cold wallet is not ours.
    h.node.mine(Vec::new());
    h.run(JobName::Scan);
    let utxos = h.store.all_utxos();
    let spent: Vec<_> = utxos.iter().filter(|u| u.status == UtxoStatus::Confirmed).collect();
    assert_eq!(spent.len(), 2);
    assert!(spent.iter().all(|u| u.spend.is_some()));

    let change: Vec<_> = utxos.iter().filter(|u| u.status == UtxoStatus::Seen).collect();
    assert_eq!(change.len(), 1);
    assert_eq!(change[0].kind, UtxoKind::Hot);
    assert!(change[0].value < 500_000 - 120_000);
    assert!(utxos.iter().all(|u| u.address.as_str() != h.cold));
    assert_eq!(h.store.all_deposits().len(), 1);
}

#[test]
fn rerunning_jobs_without_new_work_changes_nothing() {
    let h = Harness::new();
    let funding = VerboseTx {
        txid: Txid::from_byte_array([0x22; 32]),
        vin: Vec::new(),
        vout: vec![output(h.hot.as_str(), 300_000, 0)],
        confirmations: 0,
    };
    h.node.mine(vec![funding]);
    h.node.mine(Vec::new());

    h.store.add_withdrawal(5, "w-1", &h.user, 50_000);
    for job in [JobName::Scan, JobName::Withdraw, JobName::Broadcast] {
        h.run(job);
    }
    let sends = h.store.all_sends();
    assert_eq!(h.node.mempool_len(), 1);

    for job in [
        JobName::Scan,
        JobName::Withdraw,
        JobName::SweepDeposits,
        JobName::Broadcast,
        JobName::NotifyDeposits,
    ] {
        h.run(job);
    }
    assert_eq!(h.store.all_sends(), sends);
    assert_eq!(h.node.mempool_len(), 1);
    assert_eq!(h.events(), vec![NotifyEvent::WithdrawalSent]);
}

#[test]
fn overlapping_run_is_skipped() {
    let h = Harness::new();
    let _held = h.custodian.locks().try_acquire(JobName::Scan).unwrap();
    assert_eq!(h.custodian.run(JobName::Scan).unwrap(), JobRun::Skipped);
    // Other jobs are unaffected.
    h.run(JobName::NotifyDeposits);
}
