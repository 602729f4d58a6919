//! Disk copy engine.
//!
//! Copies a batch of disks, one at a time, from the transfer channel into
//! local image files. Each task reserves a collision-free name, streams the
//! disk into an [`ImageWriter`] and optionally re-reads the result to verify
//! it. The first failure aborts the batch.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result, TransferError};
use crate::events::{EventSink, Stage, TransferEvent};
use crate::image::{ImageReader, ImageWriter};
use crate::ovf::Envelope;
use crate::pipeline::Pipeline;
use crate::transfer::{CancelToken, TransferChannel, TransferSession};

/// Extension of exported disk images.
pub const IMAGE_EXTENSION: &str = "img";

/// Highest `_<n>` suffix tried before giving up on a name.
pub const MAX_COLLISION_SUFFIX: u32 = 9999;

/// One disk to copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskTask {
    pub disk_uuid: String,
    /// Logical size in bytes.
    pub virtual_size: u64,
    /// Allocated size in bytes.
    pub physical_size: u64,
    pub label: String,
    /// Target filename, `<disk-uuid>.img` unless renamed.
    pub filename: String,
    pub bootable: bool,
    /// Ordinal among the VM's disks, starting at 0.
    pub index: usize,
    /// Id of the disk entry emitted for this task.
    pub metadata_id: String,
}

impl DiskTask {
    pub fn default_filename(disk_uuid: &str) -> String {
        format!("{}.{}", disk_uuid, IMAGE_EXTENSION)
    }
}

/// A target name that was taken and the name used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollisionRecord {
    pub original: String,
    pub renamed: String,
}

/// Result of one successful disk copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub disk_uuid: String,
    /// Filename actually written.
    pub filename: String,
    pub path: PathBuf,
    pub bytes_copied: u64,
    pub verified: bool,
    pub collision: Option<CollisionRecord>,
}

/// An exclusively created destination file.
///
/// Unless committed, the file is removed when the reservation is dropped.
struct Reservation {
    path: PathBuf,
    filename: String,
    committed: bool,
}

impl Reservation {
    /// Creates `filename` in `dir`, or the first free `<stem>_<n>.<ext>`.
    ///
    /// Renamed candidates for which `taken` holds are skipped even when no
    /// such file exists yet.
    fn acquire(
        dir: &Path,
        filename: &str,
        taken: impl Fn(&str) -> bool,
    ) -> Result<(Self, File, Option<CollisionRecord>)> {
        let name = Path::new(filename);
        let stem = name
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename)
            .to_string();
        let ext = name.extension().and_then(|s| s.to_str()).map(str::to_string);

        for n in 0..=MAX_COLLISION_SUFFIX {
            let candidate = match (n, &ext) {
                (0, _) => filename.to_string(),
                (n, Some(ext)) => format!("{}_{}.{}", stem, n, ext),
                (n, None) => format!("{}_{}", stem, n),
            };
            if n > 0 && taken(&candidate) {
                continue;
            }
            let path = dir.join(&candidate);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let collision = (n > 0).then(|| CollisionRecord {
                        original: filename.to_string(),
                        renamed: candidate.clone(),
                    });
                    let reservation = Self {
                        path,
                        filename: candidate,
                        committed: false,
                    };
                    return Ok((reservation, file, collision));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::io(e, path)),
            }
        }

        Err(TransferError::Collision {
            filename: filename.to_string(),
            dir: dir.to_path_buf(),
        }
        .into())
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "partial image removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove partial image"
            ),
        }
    }
}

/// Sequential copier for one VM's disks.
pub struct DiskCopyEngine<'a> {
    channel: &'a mut dyn TransferChannel,
    events: &'a EventSink,
    cancel: &'a CancelToken,
    pipeline: &'a Pipeline,
    chunk_size: usize,
}

impl<'a> DiskCopyEngine<'a> {
    pub fn new(
        channel: &'a mut dyn TransferChannel,
        events: &'a EventSink,
        cancel: &'a CancelToken,
        pipeline: &'a Pipeline,
        chunk_size: usize,
    ) -> Self {
        Self {
            channel,
            events,
            cancel,
            pipeline,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Copies every task into `dest`, in order.
    ///
    /// Renamed files are patched into `envelope` before their copy starts.
    /// Stops at the first failure; files of earlier tasks stay in place.
    pub fn copy_all(
        &mut self,
        tasks: &[DiskTask],
        dest: &Path,
        envelope: &mut Envelope,
        verify: bool,
    ) -> Result<Vec<CopyOutcome>> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(self.copy_one(task, dest, envelope, verify)?);
        }
        Ok(outcomes)
    }

    fn copy_one(
        &mut self,
        task: &DiskTask,
        dest: &Path,
        envelope: &mut Envelope,
        verify: bool,
    ) -> Result<CopyOutcome> {
        self.cancel.check()?;

        let (reservation, file, collision) = match reserve(task, dest, envelope) {
            Ok(reserved) => reserved,
            Err(e) => {
                self.setup(&task.filename, task);
                self.fail(&task.filename, &task.disk_uuid, &e);
                self.teardown(&task.filename);
                return Err(e);
            }
        };
        let subject = reservation.filename.clone();

        if let Some(record) = &collision {
            tracing::warn!(
                disk = %task.disk_uuid,
                original = %record.original,
                renamed = %record.renamed,
                "image name taken, using a new name"
            );
            self.events.emit(TransferEvent::warning(
                &subject,
                format!("'{}' already exists, writing '{}'", record.original, record.renamed),
            ));
        }

        self.setup(&subject, task);

        let result = self.transfer(task, &reservation.path, &subject, file, verify);

        let outcome = match result {
            Ok((bytes_copied, verified)) => {
                let path = reservation.path.clone();
                reservation.commit();
                Ok(CopyOutcome {
                    disk_uuid: task.disk_uuid.clone(),
                    filename: subject.clone(),
                    path,
                    bytes_copied,
                    verified,
                    collision,
                })
            }
            Err(e) => {
                drop(reservation);
                if e.is_cancelled() {
                    tracing::info!(disk = %task.disk_uuid, "disk copy cancelled");
                } else {
                    self.fail(&subject, &task.disk_uuid, &e);
                }
                Err(e)
            }
        };

        self.teardown(&subject);
        outcome
    }

    fn setup(&self, subject: &str, task: &DiskTask) {
        self.events.emit(TransferEvent::stage(
            subject,
            Stage::Setup,
            format!("Opening disk {}", task.disk_uuid),
        ));
    }

    fn teardown(&self, subject: &str) {
        self.events
            .emit(TransferEvent::stage(subject, Stage::Teardown, "Transfer finished"));
    }

    fn fail(&self, subject: &str, disk_uuid: &str, err: &Error) {
        tracing::error!(disk = %disk_uuid, error = %err, "disk copy failed");
        self.events.emit(TransferEvent::failure(
            subject,
            format!("Failed to export disk {}", disk_uuid),
            err,
        ));
    }

    /// Streams one disk into `file`. The session is closed on every path
    /// before this returns.
    fn transfer(
        &mut self,
        task: &DiskTask,
        path: &Path,
        subject: &str,
        file: File,
        verify: bool,
    ) -> Result<(u64, bool)> {
        let mut session = TransferSession::open(&mut *self.channel, &task.disk_uuid)?;
        let length = session.length();
        if length != task.virtual_size {
            tracing::debug!(
                disk = %task.disk_uuid,
                stream = length,
                recorded = task.virtual_size,
                "stream length differs from recorded disk size"
            );
        }

        let mut image = ImageWriter::create(BufWriter::new(file), length, self.pipeline)?;
        self.events.emit(TransferEvent::stage(
            subject,
            Stage::Streaming,
            format!("Copying {} bytes", length),
        ));

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut done = 0u64;
        while done < length {
            self.cancel.check()?;

            let want = (length - done).min(buf.len() as u64) as usize;
            let n = match session.read(&mut buf[..want]) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::channel(&task.disk_uuid, e.to_string()).into()),
            };
            if n == 0 {
                return Err(TransferError::channel(
                    &task.disk_uuid,
                    format!("stream ended after {} of {} bytes", done, length),
                )
                .into());
            }

            hasher.update(&buf[..n]);
            image.write_chunk(&buf[..n])?;
            done += n as u64;
            self.events
                .emit(TransferEvent::progress(subject, done, length));
        }

        let writer = image.finish()?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::io(e.into_error(), path))?;
        file.sync_all().map_err(|e| Error::io(e, path))?;
        drop(file);
        session.close()?;

        if !verify {
            return Ok((done, false));
        }

        self.events.emit(TransferEvent::stage(
            subject,
            Stage::Verifying,
            "Verifying image",
        ));
        verify_image(path, subject, length, &hasher.finalize())?;
        Ok((done, true))
    }
}

/// Reserves the task's image file and points its disk entry at the name
/// actually reserved.
fn reserve(
    task: &DiskTask,
    dest: &Path,
    envelope: &mut Envelope,
) -> Result<(Reservation, File, Option<CollisionRecord>)> {
    let (reservation, file, collision) = Reservation::acquire(dest, &task.filename, |name| {
        envelope.file_by_href(name).is_some()
    })?;
    if let Some(record) = &collision {
        envelope.rename_disk_file(&task.metadata_id, &record.renamed)?;
    }
    Ok((reservation, file, collision))
}

/// Re-reads a finished image and compares it with the streamed content.
fn verify_image(path: &Path, filename: &str, length: u64, expected: &[u8]) -> Result<()> {
    let reader = ImageReader::open(path)
        .map_err(|e| TransferError::verify(filename, format!("cannot re-read image: {}", e)))?;
    if reader.capacity() != length {
        return Err(TransferError::verify(
            filename,
            format!("image holds {} bytes, expected {}", reader.capacity(), length),
        )
        .into());
    }

    let mut hasher = Sha256::new();
    for grain in reader.contents() {
        let grain = grain.map_err(|e| TransferError::verify(filename, e.to_string()))?;
        hasher.update(&grain);
    }
    if hasher.finalize().as_slice() != expected {
        return Err(TransferError::verify(filename, "content digest does not match the source").into());
    }
    tracing::debug!(image = filename, "image verified");
    Ok(())
}
