//! Decompression/recompression for the response pipeline (C8 step 1 & 9).
//!
//! The outbound client (`reqwest_impersonate`) may itself transparently
//! decode gzip/deflate/brotli and leave a stale `Content-Encoding` header
//! behind (§4.5, §4.8 step 1); callers try to decompress per the declared
//! encoding and, on failure, assume the body was already decoded and strip
//! the header rather than double-decoding.

use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl Encoding {
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "gzip" => Self::Gzip,
            "deflate" => Self::Deflate,
            "br" => Self::Brotli,
            "zstd" => Self::Zstd,
            _ => Self::Identity,
        }
    }

    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Self::Identity => None,
            Self::Gzip => Some("gzip"),
            Self::Deflate => Some("deflate"),
            Self::Brotli => Some("br"),
            Self::Zstd => Some("zstd"),
        }
    }
}

/// Attempts to decompress `body` per `encoding`. `Ok(None)` for `Identity`
/// (nothing to do); `Err` signals "treat as already-decoded" to the caller
/// (§4.8 step 1: delete `Content-Encoding`, never double-decode).
pub fn decompress(body: &[u8], encoding: Encoding) -> Result<Vec<u8>, ()> {
    match encoding {
        Encoding::Identity => Ok(body.to_vec()),
        Encoding::Gzip => {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|_| ())?;
            Ok(out)
        }
        Encoding::Deflate => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|_| ())?;
            Ok(out)
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let mut reader = brotli::Decompressor::new(body, 4096);
            reader.read_to_end(&mut out).map_err(|_| ())?;
            Ok(out)
        }
        Encoding::Zstd => zstd::stream::decode_all(body).map_err(|_| ()),
    }
}

/// Recompresses `body` under `encoding`, used after body rewrites so the
/// wire encoding matches what was originally negotiated (§4.8 step 9).
pub fn compress(body: &[u8], encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Identity => body.to_vec(),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            let _ = encoder.write_all(body);
            encoder.finish().unwrap_or_default()
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            let _ = encoder.write_all(body);
            encoder.finish().unwrap_or_default()
        }
        Encoding::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            let _ = brotli::BrotliCompress(&mut std::io::Cursor::new(body), &mut out, &params);
            out
        }
        Encoding::Zstd => zstd::stream::encode_all(body, 0).unwrap_or_else(|_| body.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trips() {
        let body = b"hello reverse proxy world";
        let compressed = compress(body, Encoding::Gzip);
        let decompressed = decompress(&compressed, Encoding::Gzip).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn deflate_round_trips() {
        let body = b"session cookie capture payload";
        let compressed = compress(body, Encoding::Deflate);
        let decompressed = decompress(&compressed, Encoding::Deflate).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn zstd_round_trips() {
        let body = b"captured credential material";
        let compressed = compress(body, Encoding::Zstd);
        let decompressed = decompress(&compressed, Encoding::Zstd).unwrap();
        assert_eq!(decompressed, body);
    }

    #[test]
    fn identity_is_passthrough() {
        let body = b"plain";
        assert_eq!(decompress(body, Encoding::Identity).unwrap(), body);
        assert_eq!(compress(body, Encoding::Identity), body);
    }

    #[test]
    fn garbage_gzip_fails_rather_than_double_decoding() {
        let body = b"this is not gzip data";
        assert!(decompress(body, Encoding::Gzip).is_err());
    }
}
