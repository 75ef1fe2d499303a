use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bitcoin::PrivateKey;
use chain_btc::address::decode_wif;
use chain_btc::transaction::SpendInput;
use chain_btc::BtcNetwork;
use crypto_utils::KeyCipher;

use crate::config::CustodyConfig;
use crate::error::CustodyError;
use crate::rpc::{JsonRpcClient, NodeRpc};
use crate::settings::Settings;
use crate::store::Store;
use crate::types::{Utxo, WalletAddress};

/// Shared handles every component is built from. Created once at start-up.
#[derive(Clone)]
pub struct CustodyContext {
    pub network: BtcNetwork,
    pub store: Arc<dyn Store>,
    pub settings: Arc<dyn Settings>,
    pub node: Arc<dyn NodeRpc>,
    pub cipher: Arc<KeyCipher>,
}

impl CustodyContext {
    pub fn new(
        network: BtcNetwork,
        store: Arc<dyn Store>,
        settings: Arc<dyn Settings>,
        node: Arc<dyn NodeRpc>,
        cipher: Arc<KeyCipher>,
    ) -> Self {
        Self {
            network,
            store,
            settings,
            node,
            cipher,
        }
    }

    /// Connect to the configured node and derive the key cipher.
    pub fn from_config(
        config: &CustodyConfig,
        store: Arc<dyn Store>,
        settings: Arc<dyn Settings>,
    ) -> Result<Self, CustodyError> {
        let node = JsonRpcClient::new(&config.node)?;
        let cipher = config.key_cipher()?;
        Ok(Self::new(
            config.network,
            store,
            settings,
            Arc::new(node),
            Arc::new(cipher),
        ))
    }

    /// Decrypt the keys of `addresses`. Any address without a key, or whose
    /// key fails to decrypt, fails the whole call.
    pub fn key_ring<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a WalletAddress>,
    ) -> Result<KeyRing, CustodyError> {
        let wanted: Vec<WalletAddress> = addresses
            .into_iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let rows = self.store.address_keys(&wanted)?;
        let mut keys = HashMap::with_capacity(rows.len());
        for row in rows {
            let wif = self.cipher.open(&row.encrypted_key)?;
            let key = decode_wif(&wif, self.network)?;
            keys.insert(row.address, key);
        }

        if let Some(missing) = wanted.into_iter().find(|a| !keys.contains_key(a)) {
            return Err(CustodyError::MissingKey(missing));
        }
        Ok(KeyRing { keys })
    }
}

/// Decrypted signing keys by address, dropped as soon as a build finishes.
pub struct KeyRing {
    keys: HashMap<WalletAddress, PrivateKey>,
}

impl KeyRing {
    pub fn spend_input(&self, utxo: &Utxo) -> Result<SpendInput, CustodyError> {
        let key = self
            .keys
            .get(&utxo.address)
            .ok_or_else(|| CustodyError::MissingKey(utxo.address.clone()))?;
        Ok(SpendInput {
            outpoint: utxo.outpoint,
            value: utxo.value,
            script_pubkey: utxo.script.clone(),
            key: *key,
        })
    }

    pub fn spend_inputs<'a>(
        &self,
        utxos: impl IntoIterator<Item = &'a Utxo>,
    ) -> Result<Vec<SpendInput>, CustodyError> {
        utxos.into_iter().map(|u| self.spend_input(u)).collect()
    }
}
