//! Caller-supplied output buffers.
//!
//! Outputs are copied whole or not at all. A short buffer is left untouched
//! and the error reports the exact size needed, so callers can retry.

use crate::error::{IdentityError, IdentityResult};

/// Copy `src` to the start of `dst`. Returns the number of bytes written.
pub fn copy_to_buffer(src: &[u8], dst: &mut [u8]) -> IdentityResult<usize> {
    if dst.len() < src.len() {
        return Err(IdentityError::BufferTooSmall {
            required: src.len(),
        });
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

/// Copy `src` as NUL-terminated UTF-16 to `dst`.
///
/// Returns the number of code units written, terminator included.
pub fn copy_wide_to_buffer(src: &str, dst: &mut [u16]) -> IdentityResult<usize> {
    let units: Vec<u16> = src.encode_utf16().chain(std::iter::once(0)).collect();
    if dst.len() < units.len() {
        return Err(IdentityError::BufferTooSmall {
            required: units.len(),
        });
    }
    dst[..units.len()].copy_from_slice(&units);
    Ok(units.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_buffer_is_untouched() {
        let mut dst = [0xEEu8; 3];
        let err = copy_to_buffer(b"four", &mut dst).unwrap_err();
        assert!(matches!(err, IdentityError::BufferTooSmall { required: 4 }));
        assert!(err.is_retryable());
        assert_eq!(dst, [0xEE; 3]);

        let mut dst = [0u8; 4];
        assert_eq!(copy_to_buffer(b"four", &mut dst).unwrap(), 4);
        assert_eq!(&dst, b"four");
    }

    #[test]
    fn test_wide_counts_terminator() {
        let mut dst = [0xFFFFu16; 3];
        assert!(matches!(
            copy_wide_to_buffer("abc", &mut dst),
            Err(IdentityError::BufferTooSmall { required: 4 })
        ));
        assert_eq!(dst, [0xFFFF; 3]);

        let mut dst = [0xFFFFu16; 8];
        assert_eq!(copy_wide_to_buffer("abc", &mut dst).unwrap(), 4);
        assert_eq!(&dst[..4], &[0x61, 0x62, 0x63, 0]);
    }
}
