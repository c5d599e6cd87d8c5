//! Encodes a `(source, external thread id)` pair into a Discord thread name.
//!
//! The short form `tool|<source>|<percent-encoded id>` is reversible. Ids whose
//! short form would exceed the platform limit fall back to
//! `tool|<source>|hash|<12 hex chars of sha256(id)>`, which cannot be decoded:
//! threads named that way are only resolvable through the in-memory binding
//! cache, and are lost for routing after a restart.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

use crate::types::ToolSource;

pub const THREAD_NAME_PREFIX: &str = "tool";
pub const HASH_MARKER: &str = "hash";
pub const MAX_THREAD_NAME_LEN: usize = 95;
const HASH_HEX_LEN: usize = 12;
const DELIMITER: char = '|';

/// Characters `encodeURIComponent` leaves untouched.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode(source: ToolSource, external_thread_id: &str) -> String {
    let encoded = utf8_percent_encode(external_thread_id, COMPONENT).to_string();
    let candidate = format!("{THREAD_NAME_PREFIX}{DELIMITER}{source}{DELIMITER}{encoded}");
    if candidate.chars().count() <= MAX_THREAD_NAME_LEN {
        return candidate;
    }
    let digest = hex::encode(Sha256::digest(external_thread_id.as_bytes()));
    format!(
        "{THREAD_NAME_PREFIX}{DELIMITER}{source}{DELIMITER}{HASH_MARKER}{DELIMITER}{}",
        &digest[..HASH_HEX_LEN]
    )
}

/// Recovers the pair from a thread name, or `None` when the name is not a
/// reversible bridge name.
pub fn decode(name: &str) -> Option<(ToolSource, String)> {
    let parts: Vec<&str> = name.split(DELIMITER).collect();
    if parts.first() != Some(&THREAD_NAME_PREFIX) {
        return None;
    }
    let source = parts.get(1)?.parse::<ToolSource>().ok()?;
    if is_hashed(name) {
        tracing::warn!(thread_name = %name, "thread name hashed; unable to recover tool thread id");
        return None;
    }
    if parts.len() != 3 {
        return None;
    }
    let encoded = parts[2];
    if !has_valid_escapes(encoded) {
        tracing::warn!(thread_name = %name, "malformed percent escape in thread name");
        return None;
    }
    match percent_decode_str(encoded).decode_utf8() {
        Ok(decoded) => Some((source, decoded.into_owned())),
        Err(err) => {
            tracing::warn!(thread_name = %name, error = %err, "failed to decode thread id");
            None
        }
    }
}

/// True for names produced by the lossy hash fallback.
pub fn is_hashed(name: &str) -> bool {
    let parts: Vec<&str> = name.split(DELIMITER).collect();
    parts.len() == 4
        && parts[0] == THREAD_NAME_PREFIX
        && parts[2] == HASH_MARKER
        && parts[3].len() == HASH_HEX_LEN
        && parts[3].bytes().all(|byte| byte.is_ascii_hexdigit())
}

fn has_valid_escapes(encoded: &str) -> bool {
    let bytes = encoded.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let valid = bytes
                .get(index + 1..index + 3)
                .is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return false;
            }
            index += 3;
        } else {
            index += 1;
        }
    }
    true
}
