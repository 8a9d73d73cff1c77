//! Short human-shareable session codes.

use uuid::Uuid;

use crate::error::SyncError;

pub const JOIN_CODE_LEN: usize = 6;

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Fresh random code drawn from the leading random bytes of a v4 UUID.
pub fn generate() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    bytes[..JOIN_CODE_LEN]
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

pub fn is_valid(code: &str) -> bool {
    code.len() == JOIN_CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Canonical form of user input: trimmed and upper-cased.
pub fn normalize(input: &str) -> Result<String, SyncError> {
    let code = input.trim().to_ascii_uppercase();
    if is_valid(&code) {
        Ok(code)
    } else {
        Err(SyncError::InvalidJoinCode(input.to_string()))
    }
}
