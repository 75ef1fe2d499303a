//! Bitcoin chain support for the custody wallet.
//!
//! Legacy P2PKH key and address handling, Omni Layer simple-send payloads,
//! size estimation for coin selection, and signed transaction assembly with
//! an exact `size * rate` fee.

pub mod address;
pub mod error;
pub mod estimate;
pub mod network;
pub mod omni;
pub mod transaction;

pub use error::BtcError;
pub use network::BtcNetwork;
