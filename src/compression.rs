//! One-shot chunk compression and decompression.
//!
//! Chunks declare their codec with a string tag: the empty string (no
//! compression), `"lz4"` (LZ4 frame format) or `"zstd"` (Zstandard frames).
//! Any other tag fails with [`McapError::UnsupportedCompression`], as do the
//! known tags when their cargo feature is compiled out.

#[allow(unused_imports)] // Write is unused when both codec features are off.
use std::io::{Read, Write};

use crate::{Compression, McapError, McapResult};

/// Compresses a chunk's record stream, returning the compression tag to
/// store in the chunk header and the bytes of its `records` field.
///
/// With no compression the input buffer is returned as-is.
pub(crate) fn compress(
    records: Vec<u8>,
    compression: Option<Compression>,
    level: Option<i32>,
) -> McapResult<(&'static str, Vec<u8>)> {
    match compression {
        None => {
            let _ = level;
            Ok(("", records))
        }
        #[cfg(feature = "zstd")]
        Some(Compression::Zstd) => {
            #[allow(unused_mut)]
            let mut enc = zstd::Encoder::new(Vec::new(), level.unwrap_or(0))?;
            #[cfg(not(target_arch = "wasm32"))]
            enc.multithread(num_cpus::get_physical() as u32)?;
            enc.write_all(&records)?;
            Ok(("zstd", enc.finish()?))
        }
        #[cfg(feature = "lz4")]
        Some(Compression::Lz4) => {
            let mut builder = lz4::EncoderBuilder::new();
            // Block checksums are disabled for wider compatibility with MCAP
            // tooling that includes a faulty block checksum calculation; the
            // chunk's own CRC covers the same bytes anyway.
            builder.block_checksum(lz4::liblz4::BlockChecksum::NoBlockChecksum);
            if let Some(level) = level {
                builder.level(level.max(0) as u32);
            }
            let mut enc = builder.build(Vec::new())?;
            enc.write_all(&records)?;
            let (out, result) = enc.finish();
            result?;
            Ok(("lz4", out))
        }
        #[cfg(not(any(feature = "zstd", feature = "lz4")))]
        Some(_) => unreachable!("`Compression` is an empty enum that cannot be instantiated"),
    }
}

/// Decompresses a chunk's `records` field given its compression tag and the
/// declared uncompressed size. Fails if the codec produces any other count.
pub(crate) fn decompress(
    compression: &str,
    data: &[u8],
    uncompressed_size: u64,
) -> McapResult<Vec<u8>> {
    let size: usize = uncompressed_size
        .try_into()
        .map_err(|_| McapError::TooLong(uncompressed_size))?;

    match compression {
        "" => {
            if data.len() != size {
                return Err(McapError::BadChunkLength {
                    header: uncompressed_size,
                    available: data.len() as u64,
                });
            }
            Ok(data.to_vec())
        }
        #[cfg(feature = "zstd")]
        "zstd" => {
            let mut out = vec![0; size];
            let n = zstd::zstd_safe::decompress(&mut out[..], data).map_err(|err| {
                McapError::DecompressionError(zstd::zstd_safe::get_error_name(err).into())
            })?;
            if n != size {
                return Err(McapError::DecompressionError(format!(
                    "zstd produced {n} bytes, chunk declared {size}"
                )));
            }
            Ok(out)
        }
        #[cfg(feature = "lz4")]
        "lz4" => {
            let mut out = vec![0; size];
            let mut decoder = lz4::Decoder::new(std::io::Cursor::new(data))?;
            decoder.read_exact(&mut out[..])?;
            Ok(out)
        }
        other => Err(McapError::UnsupportedCompression(other.into())),
    }
}
