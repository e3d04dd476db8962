//! Keccak hashing, canonical request fingerprints, and EIP-191 signature
//! recovery for wallet-signed mandates and receipts.

use anyhow::{anyhow, Result};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use serde_json::Value;
use sha3::{Digest, Keccak256};

/// keccak256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// keccak256 as a lowercase hex string (no 0x prefix).
pub fn keccak256_hex(data: &[u8]) -> String {
    hex::encode(keccak256(data))
}

/// Canonical request fingerprint for replay suppression.
///
/// `METHOD | path | sorted_query | body_hash | price | idempotency_key | time_window`
/// hashed with keccak256. Two requests with the same observable effect inside
/// one TTL window collide; any observable change produces a new fingerprint.
pub fn request_fingerprint(
    method: &str,
    path: &str,
    query: &[(String, String)],
    body: &[u8],
    price_usdc: &str,
    idempotency_key: &str,
    time_window: u64,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        method.to_uppercase(),
        path,
        sorted_query_string(query),
        keccak256_hex(body),
        price_usdc,
        idempotency_key,
        time_window
    );
    keccak256_hex(canonical.as_bytes())
}

/// `&`-joined `k=escaped(v)` pairs with keys lowercased and sorted.
pub fn sorted_query_string(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                k.to_lowercase(),
                url::form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Deterministic JSON serialization: object keys sorted recursively, array
/// order preserved, compact separators, standard JSON string escaping.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// EIP-191 `personal_sign` prehash of a text message.
pub fn eip191_hash(message: &str) -> [u8; 32] {
    let bytes = message.as_bytes();
    let prefix = format!("\x19Ethereum Signed Message:\n{}", bytes.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Recover the signing wallet from a 65-byte `personal_sign` signature over
/// `message`. Returns the lowercase 0x-prefixed address.
pub fn recover_personal_sign(message: &str, signature_hex: &str) -> Result<String> {
    let signature_bytes = decode_hex(signature_hex)?;
    if signature_bytes.len() != 65 {
        return Err(anyhow!("signature must decode to 65 bytes"));
    }

    let sig = EcdsaSignature::try_from(&signature_bytes[..64])
        .map_err(|e| anyhow!("invalid ECDSA signature bytes: {}", e))?;
    let recovery_id = normalize_recovery_id(signature_bytes[64])?;
    let prehash = eip191_hash(message);
    let verifying_key = VerifyingKey::recover_from_prehash(&prehash, &sig, recovery_id)
        .map_err(|e| anyhow!("failed recovering signer: {}", e))?;
    Ok(address_from_verifying_key(&verifying_key))
}

/// Sign `message` under the EIP-191 envelope with a secp256k1 key, returning
/// the 0x-hex 65-byte signature. Used for receipt signing and test fixtures.
pub fn personal_sign(message: &str, key: &SigningKey) -> Result<String> {
    let prehash = eip191_hash(message);
    let (sig, recid) = key
        .sign_prehash_recoverable(&prehash)
        .map_err(|e| anyhow!("signing failed: {}", e))?;
    let mut bytes = sig.to_bytes().to_vec();
    bytes.push(recid.to_byte() + 27);
    Ok(format!("0x{}", hex::encode(bytes)))
}

/// Derive the lowercase 0x-prefixed Ethereum address for a public key.
pub fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let encoded = key.to_encoded_point(false);
    // Uncompressed SEC1 point: 0x04 || X || Y. Address is the low 20 bytes
    // of keccak(X || Y).
    let digest = keccak256(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Parse a 0x-hex secp256k1 private key.
pub fn signing_key_from_hex(key_hex: &str) -> Result<SigningKey> {
    let bytes = decode_hex(key_hex)?;
    SigningKey::from_slice(&bytes).map_err(|e| anyhow!("invalid signing key: {}", e))
}

fn normalize_recovery_id(raw: u8) -> Result<RecoveryId> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => return Err(anyhow!("recovery id must be 0/1 or 27/28")),
    };
    RecoveryId::try_from(id).map_err(|_| anyhow!("recovery id is invalid"))
}

/// Decode hex with or without a 0x prefix.
pub fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(raw).map_err(|e| anyhow!("invalid hex: {}", e))
}

/// Case-insensitive Ethereum address comparison.
pub fn addresses_equal(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Basic shape check for a 20-byte 0x-hex address.
pub fn is_evm_address(address: &str) -> bool {
    let s = address.trim();
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}
