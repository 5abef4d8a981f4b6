// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    /// Length of string exceeds 64k.
    TooManyData,

    /// Ill-formed UTF-8, or contains forbidden code points.
    InvalidChar,
}

/// Generate a random alphanumeric string with `len` characters.
///
/// Used for server generated client ids.
#[must_use]
pub fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Check whether `s` is a valid UTF-8 encoded string as defined in the protocol.
///
/// The character data in a UTF-8 Encoded String MUST be well-formed UTF-8 as defined
/// by the Unicode specification and restated in RFC 3629. In particular, the character
/// data MUST NOT include encodings of code points between U+D800 and U+DFFF [MQTT-1.5.4-1].
///
/// A UTF-8 Encoded String MUST NOT include an encoding of the null character
/// U+0000 [MQTT-1.5.4-2]. Control characters U+0001..U+001F and U+007F..U+009F
/// are rejected as well.
///
/// # Errors
///
/// Returns error if `s` is too long or contains forbidden characters.
pub fn validate_utf8_string(s: &str) -> Result<(), StringError> {
    if s.len() > usize::from(u16::MAX) {
        return Err(StringError::TooManyData);
    }
    for c in s.chars() {
        if c == '\u{0000}' {
            return Err(StringError::InvalidChar);
        }
        if ('\u{0001}'..='\u{001f}').contains(&c) || ('\u{007f}'..='\u{009f}').contains(&c) {
            return Err(StringError::InvalidChar);
        }
    }
    Ok(())
}

/// Convert raw bytes into a validated UTF-8 string.
///
/// # Errors
///
/// Returns error if `bytes` is not a valid UTF-8 string.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_| StringError::InvalidChar)?;
    validate_utf8_string(s)?;
    Ok(s.to_string())
}

/// Check whether `client_id` is acceptable.
///
/// The Server MUST allow ClientIds which are between 1 and 23 UTF-8 encoded bytes
/// in length, and that contain only alphanumeric characters [MQTT-3.1.3-5].
/// Longer ids are tolerated, same as most broker implementations.
///
/// # Errors
///
/// Returns error if `client_id` contains forbidden characters.
pub fn validate_client_id(client_id: &str) -> Result<(), StringError> {
    validate_utf8_string(client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string() {
        let s = random_string(16);
        assert_eq!(s.len(), 16);
        assert!(s.chars().all(char::is_alphanumeric));
    }

    #[test]
    fn test_validate_utf8_string() {
        assert!(validate_utf8_string("sport/tennis").is_ok());
        assert!(validate_utf8_string("").is_ok());
        assert_eq!(
            validate_utf8_string("a\u{0000}b"),
            Err(StringError::InvalidChar)
        );
        assert_eq!(
            validate_utf8_string("a\u{001b}b"),
            Err(StringError::InvalidChar)
        );
        assert_eq!(
            validate_utf8_string("a\u{009f}b"),
            Err(StringError::InvalidChar)
        );
    }

    #[test]
    fn test_to_utf8_string() {
        assert_eq!(to_utf8_string(b"hello"), Ok("hello".to_string()));
        assert_eq!(to_utf8_string(&[0xff, 0xfe]), Err(StringError::InvalidChar));
    }
}
