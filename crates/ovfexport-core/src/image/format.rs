//! On-disk layout of the image container.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Image magic number ("XIMG" as little-endian u32).
pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"XIMG");

/// Current container version.
pub const IMAGE_VERSION: u32 = 1;

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 512;

/// Size of a grain or end-of-stream marker in bytes.
pub const MARKER_SIZE: usize = 16;

/// Default grain size in bytes (64 KB).
pub const DEFAULT_GRAIN_SIZE: u64 = 64 * 1024;

/// Compression algorithm: DEFLATE.
const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

const STATE_INCOMPLETE: u8 = 0;
const STATE_COMPLETE: u8 = 1;

/// Marker types used between grains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MarkerType {
    /// End of stream; no payload follows.
    EndOfStream = 0,
    /// A compressed grain follows.
    Grain = 1,
}

impl MarkerType {
    fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MarkerType::EndOfStream),
            1 => Ok(MarkerType::Grain),
            other => Err(Error::image(format!("unknown marker type {}", other))),
        }
    }
}

/// Image header, stored in the first 512 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub magic: u32,
    pub version: u32,
    /// Fixed logical capacity in bytes.
    pub capacity: u64,
    /// Grain size in bytes.
    pub grain_size: u64,
    pub compress_algorithm: u16,
    /// Set only once the writer finished successfully.
    pub complete: bool,
    /// Number of grains actually stored (zero grains are skipped).
    pub stored_grains: u64,
}

impl ImageHeader {
    /// Creates an incomplete header for the given capacity.
    pub fn new(capacity: u64) -> Self {
        Self {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            capacity,
            grain_size: DEFAULT_GRAIN_SIZE,
            compress_algorithm: COMPRESS_ALGORITHM_DEFLATE,
            complete: false,
            stored_grains: 0,
        }
    }

    /// Number of grains covering the capacity, stored or not.
    pub fn total_grains(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    /// Logical length of grain `index`; the last grain may be short.
    pub fn grain_len(&self, index: u64) -> usize {
        let start = index * self.grain_size;
        (self.capacity.saturating_sub(start)).min(self.grain_size) as usize
    }

    /// Serializes the header to exactly 512 bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];

        // Offset 0: magic (4 bytes)
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());

        // Offset 4: version (4 bytes)
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());

        // Offset 8: capacity (8 bytes)
        buf[8..16].copy_from_slice(&self.capacity.to_le_bytes());

        // Offset 16: grainSize (8 bytes)
        buf[16..24].copy_from_slice(&self.grain_size.to_le_bytes());

        // Offset 24: compressAlgorithm (2 bytes)
        buf[24..26].copy_from_slice(&self.compress_algorithm.to_le_bytes());

        // Offset 26: state (1 byte)
        buf[26] = if self.complete {
            STATE_COMPLETE
        } else {
            STATE_INCOMPLETE
        };

        // Offset 32: storedGrains (8 bytes)
        buf[32..40].copy_from_slice(&self.stored_grains.to_le_bytes());

        buf
    }

    /// Parse and validate a header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::image("image header too short"));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != IMAGE_MAGIC {
            return Err(Error::image(format!(
                "invalid image magic: expected 0x{:08X}, got 0x{:08X}",
                IMAGE_MAGIC, magic
            )));
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != IMAGE_VERSION {
            return Err(Error::image(format!("unsupported image version {}", version)));
        }

        let capacity = read_u64(&data[8..16]);
        let grain_size = read_u64(&data[16..24]);
        if grain_size == 0 {
            return Err(Error::image("image grain size is zero"));
        }
        let compress_algorithm = u16::from_le_bytes([data[24], data[25]]);
        if compress_algorithm != COMPRESS_ALGORITHM_DEFLATE {
            return Err(Error::image(format!(
                "unsupported compression algorithm {}",
                compress_algorithm
            )));
        }
        let complete = match data[26] {
            STATE_INCOMPLETE => false,
            STATE_COMPLETE => true,
            other => return Err(Error::image(format!("invalid image state {}", other))),
        };
        let stored_grains = read_u64(&data[32..40]);

        Ok(Self {
            magic,
            version,
            capacity,
            grain_size,
            compress_algorithm,
            complete,
            stored_grains,
        })
    }
}

/// Marker preceding each grain and terminating the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrainMarker {
    /// Grain index (or total grain count for end-of-stream).
    pub grain: u64,
    /// Compressed payload size in bytes.
    pub size: u32,
    pub marker_type: MarkerType,
}

impl GrainMarker {
    pub fn grain(grain: u64, size: u32) -> Self {
        Self {
            grain,
            size,
            marker_type: MarkerType::Grain,
        }
    }

    pub fn end_of_stream(total_grains: u64) -> Self {
        Self {
            grain: total_grains,
            size: 0,
            marker_type: MarkerType::EndOfStream,
        }
    }

    /// Serializes the marker to 16 bytes.
    pub fn to_bytes(&self) -> [u8; MARKER_SIZE] {
        let mut buf = [0u8; MARKER_SIZE];
        buf[0..8].copy_from_slice(&self.grain.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.marker_type as u32).to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MARKER_SIZE {
            return Err(Error::image("truncated grain marker"));
        }
        Ok(Self {
            grain: read_u64(&data[0..8]),
            size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            marker_type: MarkerType::from_u32(u32::from_le_bytes([
                data[12], data[13], data[14], data[15],
            ]))?,
        })
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Compresses grain data using DEFLATE.
///
/// # Arguments
///
/// * `data` - The uncompressed grain data.
/// * `level` - Compression level (0-9, where 6 is default).
pub fn compress_grain(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| Error::image(format!("failed to compress grain: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::image(format!("failed to finish compression: {}", e)))
}

/// Inflates a grain and checks it has the expected logical length.
pub fn decompress_grain(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(expected_len);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::image(format!("failed to decompress grain: {}", e)))?;
    if out.len() != expected_len {
        return Err(Error::image(format!(
            "grain inflated to {} bytes, expected {}",
            out.len(),
            expected_len
        )));
    }
    Ok(out)
}
