//! Wire codec for block-server blob channels.
//!
//! Several configuration-list channels carry their payload as UTF-8 JSON that
//! has been zlib-compressed and then lowercase-hex encoded. This module owns
//! both directions so the three representations (hex text, raw compressed
//! bytes, plain JSON) are never confused at call sites:
//!
//! ```text
//! JSON bytes --zlib--> compressed --hex--> channel string
//! channel string --dehex--> compressed --inflate--> JSON bytes
//! ```
//!
//! Decoding is strict: a non-hex character or a corrupt deflate stream is a
//! protocol error, never silently tolerated.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{CtlError, CtlResult};

/// Compress a payload with zlib and encode the result as lowercase hex.
///
/// Used when writing list/dict payloads to the mutating block-server keys.
pub fn compress_and_hex(data: &[u8]) -> String {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    let compressed = encoder.finish().unwrap_or_default();
    hex::encode(compressed)
}

/// Strict inverse of [`compress_and_hex`].
pub fn dehex_and_decompress(text: &str) -> CtlResult<Vec<u8>> {
    let compressed = hex::decode(text.trim())
        .map_err(|e| CtlError::BlobDecode(format!("not a hex string: {e}")))?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CtlError::BlobDecode(format!("zlib inflate failed: {e}")))?;
    Ok(out)
}

/// Decode a blob channel straight to a UTF-8 string.
pub fn dehex_and_decompress_to_string(text: &str) -> CtlResult<String> {
    let bytes = dehex_and_decompress(text)?;
    String::from_utf8(bytes).map_err(|e| CtlError::BlobDecode(format!("not UTF-8: {e}")))
}

/// Decode a sample-parameter value that arrived as an integer waveform.
///
/// The waveform encodes a C string: one codepoint per element, terminated by
/// the first 0. Codepoints must sit in 1..=127.
pub fn decode_char_waveform(codes: &[i64]) -> CtlResult<String> {
    let mut out = String::with_capacity(codes.len());
    for &c in codes {
        if c == 0 {
            break;
        }
        if !(1..=127).contains(&c) {
            return Err(CtlError::BlobDecode(format!(
                "waveform codepoint {c} outside 1..=127"
            )));
        }
        out.push(c as u8 as char);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for payload in [
            &b""[..],
            b"x",
            b"[\"TEMP1\", \"FIELD\"]",
            b"{\"blocks\": {\"a\": 1}}",
        ] {
            let encoded = compress_and_hex(payload);
            assert!(encoded.chars().all(|c| c.is_ascii_hexdigit()));
            assert_eq!(dehex_and_decompress(&encoded).unwrap(), payload);
        }
    }

    #[test]
    fn test_round_trip_binary() {
        let payload: Vec<u8> = (0..=255).collect();
        let encoded = compress_and_hex(&payload);
        assert_eq!(dehex_and_decompress(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_rejects_non_hex() {
        assert!(matches!(
            dehex_and_decompress("not hex at all"),
            Err(CtlError::BlobDecode(_))
        ));
    }

    #[test]
    fn test_rejects_corrupt_stream() {
        // Valid hex, not a zlib stream.
        assert!(matches!(
            dehex_and_decompress("deadbeef"),
            Err(CtlError::BlobDecode(_))
        ));
    }

    #[test]
    fn test_char_waveform() {
        let codes = [72, 101, 108, 108, 111, 0, 33, 33];
        assert_eq!(decode_char_waveform(&codes).unwrap(), "Hello");
    }

    #[test]
    fn test_char_waveform_rejects_out_of_range() {
        assert!(decode_char_waveform(&[72, 200, 0]).is_err());
        assert!(decode_char_waveform(&[-1]).is_err());
    }
}
