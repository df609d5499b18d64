//! UTF-8 validation for text messages and close reasons
//!
//! Uses `simdutf8` for the full-buffer check. The `compat` flavour is used
//! when a fragment may end in the middle of a multi-byte sequence.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Validate a prefix of a text stream that may end mid-sequence
///
/// Returns `Some(n)` where `data[..n]` is valid UTF-8 and `data[n..]` is an
/// incomplete (but so far valid) trailing sequence of at most 3 bytes.
/// Returns `None` if the data contains an invalid sequence.
#[inline]
pub fn validate_utf8_incomplete(data: &[u8]) -> Option<usize> {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => Some(data.len()),
        Err(e) if e.error_len().is_none() => Some(e.valid_up_to()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid() {
        assert!(validate_utf8(b"hello"));
        assert!(validate_utf8("Hello, 世界".as_bytes()));
        assert!(!validate_utf8(&[0xff, 0xfe]));
    }

    #[test]
    fn test_incomplete_tail() {
        let text = "a€".as_bytes(); // € is 3 bytes
        assert_eq!(validate_utf8_incomplete(text), Some(4));
        assert_eq!(validate_utf8_incomplete(&text[..2]), Some(1));
        assert_eq!(validate_utf8_incomplete(&text[..3]), Some(1));
        assert_eq!(validate_utf8_incomplete(&[b'a', 0xff]), None);
    }
}
