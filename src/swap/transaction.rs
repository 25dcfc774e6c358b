//! Signing of service-built Solana wire transactions
//!
//! Layout: `shortvec(num_signatures) || signatures[64] || message`, where the
//! message starts with an optional version byte (high bit set), the 3-byte
//! header and `shortvec(num_keys) || keys[32]`. The first
//! `num_required_signatures` keys are the signers, in signature-slot order.

use super::SwapError;
use crate::wallet::TransactionSigner;

const SIGNATURE_LEN: usize = 64;
const PUBKEY_LEN: usize = 32;
const VERSION_PREFIX_MASK: u8 = 0x80;

/// A transaction with the agent's signature in place
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub bytes: Vec<u8>,
    /// Base58 first signature; this is the transaction id
    pub signature: String,
}

/// Decode a compact-u16 ("shortvec") length, returning (value, bytes read)
fn decode_shortvec(bytes: &[u8]) -> Result<(usize, usize), SwapError> {
    let mut value = 0usize;
    for (i, byte) in bytes.iter().take(3).enumerate() {
        value |= usize::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(malformed("bad compact-u16 length"))
}

fn malformed(what: &str) -> SwapError {
    SwapError::MalformedResponse(format!("swap transaction: {}", what))
}

/// Sign `wire` with `signer`, placing the signature in the signer's slot
pub fn sign_wire_transaction(
    wire: &[u8],
    signer: &dyn TransactionSigner,
) -> Result<SignedTransaction, SwapError> {
    let (num_signatures, prefix_len) = decode_shortvec(wire)?;
    if num_signatures == 0 {
        return Err(malformed("no signature slots"));
    }
    let message_start = prefix_len + num_signatures * SIGNATURE_LEN;
    if wire.len() <= message_start {
        return Err(malformed("truncated before message"));
    }
    let message = &wire[message_start..];

    let header_start = if message[0] & VERSION_PREFIX_MASK != 0 {
        1
    } else {
        0
    };
    if message.len() < header_start + 3 {
        return Err(malformed("truncated message header"));
    }
    let num_required = usize::from(message[header_start]);
    if num_required != num_signatures {
        return Err(malformed("signature count does not match message header"));
    }

    let keys_offset = header_start + 3;
    let (num_keys, keys_len_bytes) = decode_shortvec(&message[keys_offset..])?;
    let keys_start = keys_offset + keys_len_bytes;
    if num_keys < num_required || message.len() < keys_start + num_keys * PUBKEY_LEN {
        return Err(malformed("truncated account keys"));
    }

    let pubkey = signer.pubkey();
    let slot = (0..num_required)
        .find(|i| {
            let start = keys_start + i * PUBKEY_LEN;
            message[start..start + PUBKEY_LEN] == pubkey
        })
        .ok_or_else(|| {
            SwapError::Signing(format!(
                "{} is not a required signer of this transaction",
                signer.address()
            ))
        })?;

    let signature = signer.sign_message(message);

    let mut bytes = wire.to_vec();
    let sig_start = prefix_len + slot * SIGNATURE_LEN;
    bytes[sig_start..sig_start + SIGNATURE_LEN].copy_from_slice(&signature);

    let unsigned_slot = (0..num_signatures).find(|i| {
        let start = prefix_len + i * SIGNATURE_LEN;
        bytes[start..start + SIGNATURE_LEN].iter().all(|b| *b == 0)
    });
    if let Some(i) = unsigned_slot {
        return Err(SwapError::Signing(format!(
            "transaction still needs a signature in slot {}",
            i
        )));
    }

    let signature = bs58::encode(&bytes[prefix_len..prefix_len + SIGNATURE_LEN]).into_string();
    Ok(SignedTransaction { bytes, signature })
}
