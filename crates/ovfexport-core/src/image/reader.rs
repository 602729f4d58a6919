//! Image reader with memory-mapped I/O.
//!
//! Opening an image scans its marker chain once and records where each
//! stored grain lives. Grains that were never stored read back as zeros.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use super::format::{decompress_grain, GrainMarker, ImageHeader, MarkerType, HEADER_SIZE, MARKER_SIZE};
use crate::error::{Error, Result};

/// A read-only view of a finished image.
///
/// # Example
///
/// ```no_run
/// use ovfexport_core::image::ImageReader;
/// use std::path::Path;
///
/// let reader = ImageReader::open(Path::new("disk.img")).unwrap();
/// println!("Capacity: {} bytes", reader.capacity());
///
/// for grain in reader.contents() {
///     let data = grain.unwrap();
///     // Process grain...
/// }
/// ```
pub struct ImageReader {
    mmap: Arc<Mmap>,
    header: ImageHeader,
    /// Grain index to (payload offset, payload size).
    grains: BTreeMap<u64, (usize, usize)>,
}

impl ImageReader {
    /// Opens an image and indexes its grains.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or mapped
    /// - The header is invalid or the image was never finished
    /// - The marker chain is truncated or inconsistent with the header
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();
        if size < HEADER_SIZE as u64 {
            return Err(Error::image(format!(
                "'{}' is too small to be an image ({} bytes)",
                path.display(),
                size
            )));
        }

        // Safety: the file is opened read-only and stays open for the
        // lifetime of the mapping.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        let header = ImageHeader::from_bytes(&mmap[..HEADER_SIZE])?;
        if !header.complete {
            return Err(Error::image(format!(
                "'{}' is an incomplete image",
                path.display()
            )));
        }

        let grains = index_grains(&mmap, &header)?;
        Ok(Self {
            mmap: Arc::new(mmap),
            header,
            grains,
        })
    }

    /// Returns the logical capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }

    #[inline]
    pub fn grain_size(&self) -> u64 {
        self.header.grain_size
    }

    /// Number of grains physically stored in the file.
    pub fn stored_grains(&self) -> u64 {
        self.grains.len() as u64
    }

    /// Inflates grain `index`, or returns zeros if it was not stored.
    pub fn read_grain(&self, index: u64) -> Result<Vec<u8>> {
        read_grain(&self.mmap, &self.header, &self.grains, index)
    }

    /// Iterates over the logical content, one grain at a time.
    pub fn contents(&self) -> GrainIterator<'_> {
        GrainIterator {
            reader: self,
            current: 0,
            total: self.header.total_grains(),
        }
    }
}

fn index_grains(data: &[u8], header: &ImageHeader) -> Result<BTreeMap<u64, (usize, usize)>> {
    let total = header.total_grains();
    let mut grains = BTreeMap::new();
    let mut pos = HEADER_SIZE;

    loop {
        if pos + MARKER_SIZE > data.len() {
            return Err(Error::image("image is truncated: missing end-of-stream marker"));
        }
        let marker = GrainMarker::from_bytes(&data[pos..pos + MARKER_SIZE])?;
        pos += MARKER_SIZE;

        match marker.marker_type {
            MarkerType::EndOfStream => break,
            MarkerType::Grain => {
                if marker.grain >= total {
                    return Err(Error::image(format!(
                        "grain {} is outside an image of {} grains",
                        marker.grain, total
                    )));
                }
                let size = marker.size as usize;
                if pos + size > data.len() {
                    return Err(Error::image(format!(
                        "image is truncated inside grain {}",
                        marker.grain
                    )));
                }
                if grains.insert(marker.grain, (pos, size)).is_some() {
                    return Err(Error::image(format!("grain {} is stored twice", marker.grain)));
                }
                pos += size;
            }
        }
    }

    if grains.len() as u64 != header.stored_grains {
        return Err(Error::image(format!(
            "header records {} stored grains but {} were found",
            header.stored_grains,
            grains.len()
        )));
    }
    Ok(grains)
}

fn read_grain(
    data: &[u8],
    header: &ImageHeader,
    grains: &BTreeMap<u64, (usize, usize)>,
    index: u64,
) -> Result<Vec<u8>> {
    if index >= header.total_grains() {
        return Err(Error::image(format!("grain {} is out of range", index)));
    }
    let len = header.grain_len(index);
    match grains.get(&index) {
        Some(&(offset, size)) => decompress_grain(&data[offset..offset + size], len),
        None => Ok(vec![0u8; len]),
    }
}

/// An iterator over the logical content of an image.
///
/// Each item is one grain; the last one may be shorter than the grain size.
pub struct GrainIterator<'r> {
    reader: &'r ImageReader,
    current: u64,
    total: u64,
}

impl GrainIterator<'_> {
    /// Returns the total number of grains that will be yielded.
    pub fn count_grains(&self) -> usize {
        self.total as usize
    }
}

impl Iterator for GrainIterator<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.total {
            return None;
        }
        let index = self.current;
        self.current += 1;
        Some(self.reader.read_grain(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageWriter;
    use crate::pipeline::{Pipeline, PipelineConfig};
    use std::fs;

    fn write_image(path: &Path, content: &[u8]) {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let file = File::create(path).unwrap();
        let mut writer = ImageWriter::create(file, content.len() as u64, &pipeline).unwrap();
        writer.write_chunk(content).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_contents_reproduce_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.img");
        let content: Vec<u8> = (0u8..=255).cycle().take(150_000).collect();
        write_image(&path, &content);

        let reader = ImageReader::open(&path).unwrap();
        assert_eq!(reader.capacity(), 150_000);
        let iter = reader.contents();
        assert_eq!(iter.count_grains(), 3);
        let read: Vec<u8> = iter.map(|g| g.unwrap()).flatten().collect();
        assert_eq!(read, content);
    }

    #[test]
    fn test_unstored_grain_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.img");
        write_image(&path, &vec![0u8; 100_000]);

        let reader = ImageReader::open(&path).unwrap();
        assert_eq!(reader.stored_grains(), 0);
        assert_eq!(reader.read_grain(1).unwrap(), vec![0u8; 100_000 - 65_536]);
        assert!(reader.read_grain(2).is_err());
    }

    #[test]
    fn test_incomplete_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.img");
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let file = File::create(&path).unwrap();
        let mut writer = ImageWriter::create(file, 1000, &pipeline).unwrap();
        writer.write_chunk(&[1u8; 500]).unwrap();
        drop(writer);

        let err = ImageReader::open(&path).err().unwrap();
        assert!(err.to_string().contains("incomplete image"));
    }

    #[test]
    fn test_truncated_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.img");
        write_image(&path, &[7u8; 4096]);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - MARKER_SIZE - 4]).unwrap();

        let err = ImageReader::open(&path).err().unwrap();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_tiny_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.img");
        fs::write(&path, b"XIMG").unwrap();
        assert!(ImageReader::open(&path).is_err());
    }
}
