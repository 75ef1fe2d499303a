//! Node RPC interface and a blocking JSON-RPC transport for bitcoind with the
//! Omni Core extensions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::NodeConfig;

/// Rejection messages meaning the transaction is already known to the node.
const ALREADY_KNOWN: [&str; 4] = [
    "already in block chain",
    "txn-already-known",
    "txn-already-in-mempool",
    "already in utxo set",
];

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("decode: {0}")]
    Decode(String),
}

impl RpcError {
    /// A broadcast rejected because the node already has the transaction.
    pub fn is_already_known(&self) -> bool {
        match self {
            RpcError::Rejected { message, .. } => {
                ALREADY_KNOWN.iter().any(|needle| message.contains(needle))
            }
            _ => false,
        }
    }
}

/// `getblock <hash> 2`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: BlockHash,
    pub height: u64,
    #[serde(rename = "tx")]
    pub transactions: Vec<VerboseTx>,
}

/// A transaction from `getblock` verbosity 2 or `getrawtransaction <txid> true`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTx {
    pub txid: Txid,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    /// Only present on `getrawtransaction`; zero while in the mempool.
    #[serde(default)]
    pub confirmations: u64,
}

impl VerboseTx {
    /// Whether any output carries the token-layer marker.
    pub fn has_token_marker(&self) -> bool {
        self.vout
            .iter()
            .any(|out| chain_btc::omni::is_token_marker_hex(&out.script_pub_key.hex))
    }

    pub fn output(&self, n: u32) -> Option<&TxOutput> {
        self.vout.iter().find(|out| out.n == n)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub txid: Option<Txid>,
    #[serde(default)]
    pub vout: Option<u32>,
    #[serde(default)]
    pub coinbase: Option<String>,
}

impl TxInput {
    /// The spent outpoint, `None` for coinbase inputs.
    pub fn prev_outpoint(&self) -> Option<OutPoint> {
        if self.coinbase.is_some() {
            return None;
        }
        Some(OutPoint::new(self.txid?, self.vout?))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxOutput {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub value: Amount,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    pub hex: String,
    /// Current nodes.
    #[serde(default)]
    pub address: Option<String>,
    /// Nodes before 22.0.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl ScriptPubKey {
    /// The output's address when it pays exactly one.
    pub fn single_address(&self) -> Option<&str> {
        match (&self.address, self.addresses.as_slice()) {
            (Some(address), _) => Some(address),
            (None, [only]) => Some(only),
            _ => None,
        }
    }

    pub fn script(&self) -> Result<ScriptBuf, RpcError> {
        ScriptBuf::from_hex(&self.hex)
            .map_err(|e| RpcError::Decode(format!("script {}: {e}", self.hex)))
    }
}

/// `omni_gettransaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenTx {
    pub txid: Txid,
    #[serde(rename = "sendingaddress")]
    pub sending_address: String,
    #[serde(rename = "referenceaddress", default)]
    pub reference_address: Option<String>,
    pub type_int: u32,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(rename = "propertyid", default)]
    pub property_id: u32,
    /// Decimal string, e.g. `"12.50000000"`.
    #[serde(default)]
    pub amount: String,
    #[serde(rename = "blockhash", default)]
    pub block_hash: Option<BlockHash>,
    #[serde(rename = "blocktime", default)]
    pub block_time: i64,
}

/// Everything the settlement core asks of the node.
pub trait NodeRpc: Send + Sync {
    fn get_block_count(&self) -> Result<u64, RpcError>;

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, RpcError>;

    fn get_block_verbose(&self, hash: &BlockHash) -> Result<VerboseBlock, RpcError>;

    fn get_raw_transaction_verbose(&self, txid: &Txid) -> Result<VerboseTx, RpcError>;

    fn send_raw_transaction(&self, raw_hex: &str) -> Result<Txid, RpcError>;

    /// Token-layer transactions in the block at `height`.
    fn list_block_transactions(&self, height: u64) -> Result<Vec<Txid>, RpcError>;

    fn get_token_transaction(&self, txid: &Txid) -> Result<TokenTx, RpcError>;
}

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 1.0 over HTTP basic auth.
pub struct JsonRpcClient {
    http: reqwest::blocking::Client,
    url: String,
    user: String,
    password: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(config: &NodeConfig) -> Result<Self, RpcError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(method, id, "rpc call");

        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        // bitcoind answers RPC errors with HTTP 500 and a JSON body, so the
        // status code is not checked before decoding.
        let envelope: RpcEnvelope<T> = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .map_err(|e| RpcError::Transport(format!("{method}: {e}")))?
            .json()
            .map_err(|e| RpcError::Decode(format!("{method}: {e}")))?;

        if let Some(err) = envelope.error {
            return Err(RpcError::Rejected {
                code: err.code,
                message: err.message,
            });
        }
        envelope
            .result
            .ok_or_else(|| RpcError::Decode(format!("{method}: empty result")))
    }
}

impl NodeRpc for JsonRpcClient {
    fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", json!([]))
    }

    fn get_block_hash(&self, height: u64) -> Result<BlockHash, RpcError> {
        self.call("getblockhash", json!([height]))
    }

    fn get_block_verbose(&self, hash: &BlockHash) -> Result<VerboseBlock, RpcError> {
        self.call("getblock", json!([hash.to_string(), 2]))
    }

    fn get_raw_transaction_verbose(&self, txid: &Txid) -> Result<VerboseTx, RpcError> {
        self.call("getrawtransaction", json!([txid.to_string(), true]))
    }

    fn send_raw_transaction(&self, raw_hex: &str) -> Result<Txid, RpcError> {
        self.call("sendrawtransaction", json!([raw_hex]))
    }

    fn list_block_transactions(&self, height: u64) -> Result<Vec<Txid>, RpcError> {
        self.call("omni_listblocktransactions", json!([height]))
    }

    fn get_token_transaction(&self, txid: &Txid) -> Result<TokenTx, RpcError> {
        self.call("omni_gettransaction", json!([txid.to_string()]))
    }
}
