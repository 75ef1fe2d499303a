use bitcoin::absolute::LockTime;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf, ScriptBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, PrivateKey, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::address::parse_address;
use crate::error::BtcError;
use crate::network::BtcNetwork;
use crate::omni;

/// Smallest value accepted for any addressed output, in satoshis.
pub const DUST_LIMIT: u64 = 546;

/// Largest transaction this wallet will assemble, in bytes.
pub const MAX_TX_SIZE: u64 = 1_000_000;

/// Sign/measure rounds allowed for the fee to settle.
const MAX_FEE_ROUNDS: usize = 8;

/// An output being spent, together with the key that controls it.
#[derive(Debug, Clone)]
pub struct SpendInput {
    pub outpoint: OutPoint,
    /// Value in satoshis.
    pub value: u64,
    /// Locking script of the spent output (P2PKH or P2WPKH).
    pub script_pubkey: ScriptBuf,
    pub key: PrivateKey,
}

/// A payment to an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub address: String,
    /// Value in satoshis.
    pub value: u64,
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct BuiltTx {
    pub tx: Transaction,
    pub txid: Txid,
    /// Consensus serialization.
    pub raw: Vec<u8>,
    /// Serialized size of the signed transaction, `raw.len()`.
    pub size: u64,
    /// Fee paid, `inputs - outputs`.
    pub fee: u64,
    /// Rate the fee was computed at, sat/byte.
    pub fee_rate: u64,
}

impl BuiltTx {
    /// Hex of [`BuiltTx::raw`], the form `sendrawtransaction` expects.
    pub fn raw_hex(&self) -> String {
        hex::encode(&self.raw)
    }

    /// Sum of all output values.
    pub fn output_value(&self) -> u64 {
        self.tx.output.iter().map(|o| o.value.to_sat()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangePosition {
    First,
    Last,
}

/// Build and sign a transaction paying `payments` in order, with change to
/// `change_address` appended last.
///
/// The fee is exactly `size * fee_rate` of the signed transaction. Change
/// that would fall below the dust limit fails with [`BtcError::DustChange`],
/// so the caller can add an input or drop a payment.
pub fn build_payment_tx(
    inputs: &[SpendInput],
    payments: &[Payment],
    change_address: &str,
    fee_rate: u64,
    network: BtcNetwork,
) -> Result<BuiltTx, BtcError> {
    if payments.is_empty() {
        return Err(BtcError::TransactionBuildError("no payments".into()));
    }

    let mut outputs = Vec::with_capacity(payments.len());
    for payment in payments {
        if payment.value < DUST_LIMIT {
            return Err(BtcError::DustOutput {
                value: payment.value,
                limit: DUST_LIMIT,
            });
        }
        outputs.push(TxOut {
            value: Amount::from_sat(payment.value),
            script_pubkey: parse_address(&payment.address, network)?.script_pubkey(),
        });
    }

    let change_script = parse_address(change_address, network)?.script_pubkey();
    assemble(inputs, outputs, change_script, ChangePosition::Last, true, fee_rate)
}

/// Build and sign a transaction moving everything in `inputs`, less the fee,
/// to `destination` in a single output.
pub fn build_sweep_tx(
    inputs: &[SpendInput],
    destination: &str,
    fee_rate: u64,
    network: BtcNetwork,
) -> Result<BuiltTx, BtcError> {
    let destination_script = parse_address(destination, network)?.script_pubkey();
    assemble(
        inputs,
        Vec::new(),
        destination_script,
        ChangePosition::Last,
        true,
        fee_rate,
    )
    .map_err(|e| match e {
        BtcError::DustChange { value, limit } => BtcError::DustOutput { value, limit },
        e => e,
    })
}

/// Build and sign an Omni simple send of `amount` units of `property_id`.
///
/// The first input must be the token holder's output. Outputs are
/// `[change, OP_RETURN payload, reference]`: the reference output pays the
/// dust limit to `recipient` and comes last so it is the last output not
/// paying the sender. Change below the dust limit is left to the fee.
#[allow(clippy::too_many_arguments)]
pub fn build_token_tx(
    inputs: &[SpendInput],
    change_address: &str,
    recipient: &str,
    property_id: u32,
    amount: u64,
    fee_rate: u64,
    network: BtcNetwork,
) -> Result<BuiltTx, BtcError> {
    let outputs = vec![
        TxOut {
            value: Amount::ZERO,
            script_pubkey: omni::encode_simple_send(property_id, amount)?,
        },
        TxOut {
            value: Amount::from_sat(DUST_LIMIT),
            script_pubkey: parse_address(recipient, network)?.script_pubkey(),
        },
    ];

    let change_script = parse_address(change_address, network)?.script_pubkey();
    assemble(inputs, outputs, change_script, ChangePosition::First, false, fee_rate)
}

/// Sign, measure and re-fee until `fee == size * fee_rate`.
fn assemble(
    inputs: &[SpendInput],
    outputs: Vec<TxOut>,
    change_script: ScriptBuf,
    position: ChangePosition,
    change_required: bool,
    fee_rate: u64,
) -> Result<BuiltTx, BtcError> {
    if inputs.is_empty() {
        return Err(BtcError::TransactionBuildError("no inputs".into()));
    }

    let total_in = checked_sum(inputs.iter().map(|i| i.value))?;
    let total_out = checked_sum(outputs.iter().map(|o| o.value.to_sat()))?;

    let mut fee = 0u64;
    for _ in 0..MAX_FEE_ROUNDS {
        let required = total_out.saturating_add(fee);
        if total_in < required {
            return Err(BtcError::InsufficientFunds {
                available: total_in,
                required,
            });
        }

        let change = total_in - required;
        let with_change = change >= DUST_LIMIT;
        if change_required && !with_change {
            return Err(BtcError::DustChange {
                value: change,
                limit: DUST_LIMIT,
            });
        }

        let mut tx_outputs = outputs.clone();
        if with_change {
            let change_out = TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_script.clone(),
            };
            match position {
                ChangePosition::First => tx_outputs.insert(0, change_out),
                ChangePosition::Last => tx_outputs.push(change_out),
            }
        }

        let tx = sign_inputs(unsigned_tx(inputs, tx_outputs), inputs)?;
        let size = tx.total_size() as u64;
        if size > MAX_TX_SIZE {
            return Err(BtcError::TransactionBuildError(format!(
                "transaction of {size} bytes exceeds {MAX_TX_SIZE}"
            )));
        }
        let needed = size * fee_rate;

        if with_change && needed == fee {
            return Ok(finish(tx, size, fee, fee_rate));
        }
        if !with_change && total_in - total_out >= needed {
            return Ok(finish(tx, size, total_in - total_out, fee_rate));
        }
        fee = needed;
    }

    Err(BtcError::TransactionBuildError(format!(
        "fee did not settle after {MAX_FEE_ROUNDS} rounds"
    )))
}

fn checked_sum(values: impl Iterator<Item = u64>) -> Result<u64, BtcError> {
    let mut total = 0u64;
    for value in values {
        total = total
            .checked_add(value)
            .ok_or_else(|| BtcError::TransactionBuildError("value overflow".into()))?;
    }
    Ok(total)
}

fn unsigned_tx(inputs: &[SpendInput], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs,
    }
}

fn finish(tx: Transaction, size: u64, fee: u64, fee_rate: u64) -> BuiltTx {
    BuiltTx {
        txid: tx.compute_txid(),
        raw: bitcoin::consensus::serialize(&tx),
        tx,
        size,
        fee,
        fee_rate,
    }
}

/// Sign every input with its own key. P2PKH inputs get a
/// `<sig> <pubkey>` scriptSig, P2WPKH inputs a BIP-143 witness.
fn sign_inputs(mut tx: Transaction, inputs: &[SpendInput]) -> Result<Transaction, BtcError> {
    let secp = Secp256k1::signing_only();
    let mut script_sigs = vec![ScriptBuf::new(); inputs.len()];
    let mut witnesses = vec![Witness::default(); inputs.len()];

    {
        let mut cache = SighashCache::new(&tx);
        for (index, input) in inputs.iter().enumerate() {
            let public_key = input.key.public_key(&secp);
            let script = &input.script_pubkey;

            if script.is_p2pkh() {
                if *script != ScriptBuf::new_p2pkh(&public_key.pubkey_hash()) {
                    return Err(BtcError::SigningError(format!(
                        "key does not control input {}",
                        input.outpoint
                    )));
                }
                let sighash = cache
                    .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
                    .map_err(|e| BtcError::SigningError(format!("legacy sighash: {e}")))?;
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = ecdsa::Signature {
                    signature: secp.sign_ecdsa_low_r(&msg, &input.key.inner),
                    sighash_type: EcdsaSighashType::All,
                };
                let push = PushBytesBuf::try_from(signature.to_vec())
                    .map_err(|e| BtcError::SigningError(format!("signature push: {e}")))?;
                script_sigs[index] = Builder::new()
                    .push_slice(push)
                    .push_key(&public_key)
                    .into_script();
            } else if script.is_p2wpkh() {
                let wpubkey_hash = public_key.wpubkey_hash().map_err(|e| {
                    BtcError::SigningError(format!("segwit input needs a compressed key: {e}"))
                })?;
                if *script != ScriptBuf::new_p2wpkh(&wpubkey_hash) {
                    return Err(BtcError::SigningError(format!(
                        "key does not control input {}",
                        input.outpoint
                    )));
                }
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        script,
                        Amount::from_sat(input.value),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| BtcError::SigningError(format!("segwit sighash: {e}")))?;
                let msg = Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_ecdsa_low_r(&msg, &input.key.inner);

                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(EcdsaSighashType::All as u8);

                let mut witness = Witness::new();
                witness.push(&sig_bytes);
                witness.push(public_key.inner.serialize());
                witnesses[index] = witness;
            } else {
                return Err(BtcError::InvalidScript(format!(
                    "unsupported script for input {}",
                    input.outpoint
                )));
            }
        }
    }

    for ((txin, script_sig), witness) in tx.input.iter_mut().zip(script_sigs).zip(witnesses) {
        txin.script_sig = script_sig;
        txin.witness = witness;
    }
    Ok(tx)
}
