use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{NetworkKind, PrivateKey};
use zeroize::Zeroizing;

use crate::error::BtcError;
use crate::network::BtcNetwork;

/// A freshly generated receiving key.
pub struct GeneratedKey {
    /// P2PKH address for the compressed public key.
    pub address: String,
    /// Private key in WIF, wiped on drop.
    pub wif: Zeroizing<String>,
}

/// Generate a random compressed key pair and its P2PKH address.
pub fn generate_key(network: BtcNetwork) -> GeneratedKey {
    let private_key = PrivateKey::generate(network.to_bitcoin_network());
    let address = p2pkh_address(&private_key, network);

    GeneratedKey {
        address,
        wif: Zeroizing::new(private_key.to_wif()),
    }
}

/// P2PKH address controlled by `private_key`.
pub fn p2pkh_address(private_key: &PrivateKey, network: BtcNetwork) -> String {
    let secp = Secp256k1::signing_only();
    let public_key = private_key.public_key(&secp);
    Address::p2pkh(public_key, network.to_bitcoin_network()).to_string()
}

/// Decode a WIF private key and check that it belongs to `network`.
pub fn decode_wif(wif: &str, network: BtcNetwork) -> Result<PrivateKey, BtcError> {
    let private_key = PrivateKey::from_wif(wif)
        .map_err(|e| BtcError::InvalidPrivateKey(format!("failed to decode wif: {e}")))?;

    if private_key.network != NetworkKind::from(network.to_bitcoin_network()) {
        return Err(BtcError::InvalidPrivateKey(format!(
            "wif is not a {network} key"
        )));
    }

    Ok(private_key)
}

/// Parse an address string and require it to be valid for `network`.
pub fn parse_address(address: &str, network: BtcNetwork) -> Result<Address, BtcError> {
    address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse {address}: {e}")))?
        .require_network(network.to_bitcoin_network())
        .map_err(|e| BtcError::InvalidAddress(format!("{address} wrong network: {e}")))
}

/// Validate a Bitcoin address string for the given network.
///
/// Returns `true` if the address is valid for the specified network,
/// `false` if it is valid but for a different network.
pub fn validate_address(address: &str, network: BtcNetwork) -> Result<bool, BtcError> {
    let parsed = address
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse address: {e}")))?;

    Ok(parsed.is_valid_for_network(network.to_bitcoin_network()))
}
