//! MD5 request signatures. Field order is fixed per direction and must match
//! the counterpart byte for byte.

use md5::{Digest, Md5};

fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Charge creation: merchantCode + merchantOrderId + paymentAmount + apiKey
pub fn charge_signature(merchant_code: &str, order_id: &str, amount: i64, api_key: &str) -> String {
    md5_hex(&[merchant_code, order_id, &amount.to_string(), api_key])
}

/// Payment callback: merchantCode + merchantOrderId + amount + resultCode + apiKey
pub fn callback_signature(
    merchant_code: &str,
    order_id: &str,
    amount: &str,
    result_code: &str,
    api_key: &str,
) -> String {
    md5_hex(&[merchant_code, order_id, amount, result_code, api_key])
}

/// Provider transaction: username + apiKey + ref_id
pub fn provider_signature(username: &str, api_key: &str, ref_id: &str) -> String {
    md5_hex(&[username, api_key, ref_id])
}

/// Provider balance inquiry: username + apiKey
pub fn provider_balance_signature(username: &str, api_key: &str) -> String {
    md5_hex(&[username, api_key])
}

/// Constant-time comparison of two hex signatures. Case-insensitive because
/// some senders upper-case their digests.
pub fn signatures_match(expected: &str, provided: &str) -> bool {
    let a = expected.as_bytes();
    let b = provided.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x.to_ascii_lowercase() ^ y.to_ascii_lowercase();
    }
    diff == 0
}
