//! Sequential disk image container.
//!
//! Exported disks are written as fixed-capacity sequential images: a header
//! sector, then deflate-compressed grains each preceded by a marker, then an
//! end-of-stream marker. All-zero grains are not stored. The header is
//! rewritten with its completion flag set only when the writer finishes, so
//! an interrupted image can never be read back as a complete one.

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{
    compress_grain, decompress_grain, GrainMarker, ImageHeader, MarkerType, DEFAULT_GRAIN_SIZE,
    HEADER_SIZE, IMAGE_MAGIC, IMAGE_VERSION, MARKER_SIZE,
};
pub use reader::{GrainIterator, ImageReader};
pub use writer::ImageWriter;
