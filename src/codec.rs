//! Payload framing.
//!
//! Compressed modes carry a plain gzip stream with no extra header. There is
//! no in-band flag: [`encode`] and [`decode`] consult [`Mode::compressed`] on
//! both ends.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::{Mode, PipeError, Result};

/// Gzip `text` into a byte frame.
pub fn compress(text: &str) -> Result<Bytes> {
    // ---
    let mut encoder = GzEncoder::new(Vec::with_capacity(text.len() / 2 + 32), Compression::default());

    encoder
        .write_all(text.as_bytes())
        .map_err(|err| PipeError::Codec(format!("compression failed: {err}")))?;

    let frame = encoder
        .finish()
        .map_err(|err| PipeError::Codec(format!("compression failed: {err}")))?;

    Ok(Bytes::from(frame))
}

/// Inflate a gzip frame back into text.
///
/// # Errors
///
/// [`PipeError::Codec`] if the frame is not valid gzip or the inflated body
/// is not UTF-8.
pub fn decompress(frame: &[u8]) -> Result<String> {
    // ---
    let mut decoder = GzDecoder::new(frame);
    let mut raw = Vec::new();

    decoder
        .read_to_end(&mut raw)
        .map_err(|err| PipeError::Codec(format!("decompression failed: {err}")))?;

    String::from_utf8(raw)
        .map_err(|err| PipeError::Codec(format!("payload is not valid UTF-8: {err}")))
}

/// Frame `text` for the wire according to `mode`.
pub fn encode(mode: Mode, text: &str) -> Result<Bytes> {
    // ---
    if mode.compressed() {
        compress(text)
    } else {
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// Recover the text of a payload received in `mode`.
pub fn decode(mode: Mode, payload: &[u8]) -> Result<String> {
    // ---
    if mode.compressed() {
        decompress(payload)
    } else {
        String::from_utf8(payload.to_vec())
            .map_err(|err| PipeError::Codec(format!("payload is not valid UTF-8: {err}")))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_round_trip() {
        // ---
        for text in ["hello", "multi\nline\n", "ünïcödé ✓", "x".repeat(100_000).as_str()] {
            let frame = compress(text).unwrap();
            assert_eq!(decompress(&frame).unwrap(), text);
        }
    }

    #[test]
    fn test_empty_round_trip() {
        // ---
        let frame = compress("").unwrap();
        assert!(!frame.is_empty(), "gzip always carries a header");
        assert_eq!(decompress(&frame).unwrap(), "");
    }

    #[test]
    fn test_frame_is_plain_gzip() {
        // ---
        let frame = compress("hello").unwrap();
        assert_eq!(&frame[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_malformed_frame_is_codec_error() {
        // ---
        let err = decompress(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, PipeError::Codec(_)), "unexpected: {err:?}");
    }

    #[test]
    fn test_truncated_frame_is_codec_error() {
        // ---
        let frame = compress("some text that will be cut short").unwrap();
        let err = decompress(&frame[..frame.len() - 6]).unwrap_err();
        assert!(matches!(err, PipeError::Codec(_)));
    }

    #[test]
    fn test_raw_mode_is_passthrough() {
        // ---
        let frame = encode(Mode::Discover, "plain").unwrap();
        assert_eq!(&frame[..], b"plain");
        assert_eq!(decode(Mode::Discover, &frame).unwrap(), "plain");
    }

    #[test]
    fn test_compressed_modes_must_not_see_raw_payload() {
        // ---
        assert!(decode(Mode::Direct, b"plain").is_err());

        let frame = encode(Mode::Durable, "queued").unwrap();
        assert_eq!(decode(Mode::Durable, &frame).unwrap(), "queued");
    }
}
