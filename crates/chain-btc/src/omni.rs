//! Omni Layer payloads carried in `OP_RETURN` outputs.
//!
//! A class C simple send is a 20-byte push after `OP_RETURN`:
//! `"omni" | version:u16 | type:u16 | property:u32 | amount:u64`, big endian.
//! The recipient is not in the payload; it is the *reference output*, the last
//! addressed output that does not pay back to the sender.

use bitcoin::script::{PushBytesBuf, Script, ScriptBuf};

use crate::error::BtcError;

/// ASCII `"omni"`.
pub const OMNI_MAGIC: [u8; 4] = *b"omni";

/// `OP_RETURN OP_PUSHBYTES_20 "omni"` as hex, the detector prefix for scripts
/// reported by the node.
pub const MARKER_PREFIX_HEX: &str = "6a146f6d6e69";

/// Transaction type of a simple send.
pub const SIMPLE_SEND: u16 = 0;

const MARKER_PREFIX: [u8; 6] = [0x6a, 0x14, b'o', b'm', b'n', b'i'];
const PAYLOAD_LEN: usize = 20;

/// A decoded Omni payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPayload {
    pub version: u16,
    pub tx_type: u16,
    pub property_id: u32,
    /// Amount in indivisible units (8 decimals for divisible properties).
    pub amount: u64,
}

impl TokenPayload {
    /// Whether this payload transfers `amount` of `property_id`.
    pub fn is_simple_send(&self) -> bool {
        self.tx_type == SIMPLE_SEND
    }
}

/// Does `script` carry the token marker?
pub fn is_token_marker(script: &Script) -> bool {
    script.as_bytes().starts_with(&MARKER_PREFIX)
}

/// Same check for the hex scripts found in verbose RPC responses.
pub fn is_token_marker_hex(script_hex: &str) -> bool {
    script_hex.starts_with(MARKER_PREFIX_HEX)
}

/// Build the `OP_RETURN` script for a simple send.
pub fn encode_simple_send(property_id: u32, amount: u64) -> Result<ScriptBuf, BtcError> {
    if amount == 0 {
        return Err(BtcError::TransactionBuildError(
            "token amount must be non-zero".into(),
        ));
    }

    let mut payload = Vec::with_capacity(PAYLOAD_LEN);
    payload.extend_from_slice(&OMNI_MAGIC);
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&SIMPLE_SEND.to_be_bytes());
    payload.extend_from_slice(&property_id.to_be_bytes());
    payload.extend_from_slice(&amount.to_be_bytes());

    let push = PushBytesBuf::try_from(payload)
        .map_err(|e| BtcError::InvalidScript(format!("payload push: {e}")))?;
    Ok(ScriptBuf::new_op_return(&push))
}

/// Decode a marker script. Returns `None` for anything that is not a
/// well-formed 20-byte Omni payload.
pub fn decode_payload(script: &Script) -> Option<TokenPayload> {
    let bytes = script.as_bytes();
    if !bytes.starts_with(&MARKER_PREFIX) || bytes.len() != 2 + PAYLOAD_LEN {
        return None;
    }

    let body = &bytes[2 + OMNI_MAGIC.len()..];
    let version = u16::from_be_bytes(body[0..2].try_into().ok()?);
    let tx_type = u16::from_be_bytes(body[2..4].try_into().ok()?);
    let property_id = u32::from_be_bytes(body[4..8].try_into().ok()?);
    let amount = u64::from_be_bytes(body[8..16].try_into().ok()?);

    Some(TokenPayload {
        version,
        tx_type,
        property_id,
        amount,
    })
}

/// Pick the reference output: scanning from the last output backwards, the
/// first one with an address different from `sender`.
///
/// `outputs` yields the address of each output in order (`None` for outputs
/// without a standard address, such as the payload itself).
pub fn reference_output<'a, I>(outputs: I, sender: &str) -> Option<&'a str>
where
    I: DoubleEndedIterator<Item = Option<&'a str>>,
{
    outputs.rev().flatten().find(|address| *address != sender)
}
