//! Sequential image writer.
//!
//! Bytes arrive in arbitrary chunks, are cut into fixed-size grains,
//! compressed on the pipeline and appended behind a grain marker. All-zero
//! grains are not stored. The header is written as incomplete on creation
//! and only rewritten as complete by [`ImageWriter::finish`], so an
//! interrupted copy never looks like a finished image.

use std::io::{Seek, SeekFrom, Write};

use super::format::{compress_grain, GrainMarker, ImageHeader};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

/// A writer for fixed-capacity image containers.
///
/// # Example
///
/// ```no_run
/// use ovfexport_core::image::ImageWriter;
/// use ovfexport_core::pipeline::{Pipeline, PipelineConfig};
/// use std::fs::File;
///
/// let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
/// let file = File::create("disk.img").unwrap();
/// let mut writer = ImageWriter::create(file, 4096, &pipeline).unwrap();
/// writer.write_chunk(&[0xAB; 4096]).unwrap();
/// let _file = writer.finish().unwrap();
/// ```
pub struct ImageWriter<'p, W: Write + Seek> {
    writer: W,
    header: ImageHeader,
    pipeline: &'p Pipeline,
    /// Bytes of the grain currently being filled.
    pending: Vec<u8>,
    next_grain: u64,
    bytes_received: u64,
}

impl<'p, W: Write + Seek> ImageWriter<'p, W> {
    /// Creates a new image with a fixed logical capacity.
    ///
    /// # Arguments
    ///
    /// * `writer` - The underlying writer, positioned at offset 0.
    /// * `capacity` - Exact number of bytes the image will hold.
    /// * `pipeline` - Pipeline used to compress grains.
    pub fn create(mut writer: W, capacity: u64, pipeline: &'p Pipeline) -> Result<Self> {
        let header = ImageHeader::new(capacity);
        writer
            .write_all(&header.to_bytes())
            .map_err(|e| Error::image(format!("failed to write image header: {}", e)))?;

        Ok(Self {
            writer,
            pending: Vec::with_capacity(header.grain_size as usize),
            header,
            pipeline,
            next_grain: 0,
            bytes_received: 0,
        })
    }

    /// Appends a chunk of content.
    ///
    /// Fails without writing anything if the chunk would exceed the capacity.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let remaining = self.header.capacity - self.bytes_received;
        if data.len() as u64 > remaining {
            return Err(Error::image(format!(
                "write of {} bytes exceeds image capacity of {} bytes ({} remaining)",
                data.len(),
                self.header.capacity,
                remaining
            )));
        }
        self.bytes_received += data.len() as u64;

        let grain_size = self.header.grain_size as usize;
        let mut grains = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let take = (grain_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == grain_size {
                grains.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(grain_size),
                ));
            }
        }

        self.store_grains(grains)
    }

    fn store_grains(&mut self, grains: Vec<Vec<u8>>) -> Result<()> {
        if grains.is_empty() {
            return Ok(());
        }

        let level = self.pipeline.compression_level();
        let compressed = self.pipeline.process(grains, |_idx, grain| {
            if grain.iter().all(|&b| b == 0) {
                Ok(None)
            } else {
                compress_grain(&grain, level).map(Some)
            }
        })?;

        for payload in compressed {
            let index = self.next_grain;
            self.next_grain += 1;
            let Some(payload) = payload else {
                continue;
            };

            let marker = GrainMarker::grain(index, payload.len() as u32);
            self.writer
                .write_all(&marker.to_bytes())
                .map_err(|e| Error::image(format!("failed to write grain marker: {}", e)))?;
            self.writer
                .write_all(&payload)
                .map_err(|e| Error::image(format!("failed to write grain data: {}", e)))?;
            self.header.stored_grains += 1;
        }
        Ok(())
    }

    /// Finishes the image and marks it complete.
    ///
    /// Fails if fewer bytes than the capacity were written.
    ///
    /// # Returns
    ///
    /// The underlying writer on success.
    pub fn finish(mut self) -> Result<W> {
        if self.bytes_received != self.header.capacity {
            return Err(Error::image(format!(
                "image finished short: {} of {} bytes written",
                self.bytes_received, self.header.capacity
            )));
        }

        if !self.pending.is_empty() {
            let last = std::mem::take(&mut self.pending);
            self.store_grains(vec![last])?;
        }

        let eos = GrainMarker::end_of_stream(self.header.total_grains());
        self.writer
            .write_all(&eos.to_bytes())
            .map_err(|e| Error::image(format!("failed to write end-of-stream marker: {}", e)))?;

        self.header.complete = true;
        self.writer
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::image(format!("failed to rewind image: {}", e)))?;
        self.writer
            .write_all(&self.header.to_bytes())
            .map_err(|e| Error::image(format!("failed to rewrite image header: {}", e)))?;
        self.writer
            .flush()
            .map_err(|e| Error::image(format!("failed to flush image: {}", e)))?;

        tracing::debug!(
            capacity = self.header.capacity,
            stored_grains = self.header.stored_grains,
            "image finished"
        );
        Ok(self.writer)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Returns the total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.header.capacity
    }
}
