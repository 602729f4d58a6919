//! Transfer channel abstraction.
//!
//! A [`TransferChannel`] is the conduit used to stream disk content out of the
//! hypervisor's storage backend. It carries per-job network settings, so one
//! channel serves one disk at a time. [`TransferSession`] scopes a single
//! opened disk: dropping the session closes the stream and the channel on
//! every exit path.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransferError};

/// Network settings for the transfer channel, applied once per job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferNetwork {
    /// Network the transfer endpoint attaches to. `None` uses the backend default.
    pub network_id: Option<String>,
    /// Use a static address instead of DHCP.
    pub static_ip: bool,
    pub address: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
}

impl TransferNetwork {
    /// Check that a static configuration carries an address and mask.
    pub fn validate(&self) -> Result<()> {
        if self.static_ip && (self.address.is_none() || self.mask.is_none()) {
            return Err(Error::config(
                "static transfer network requires both an address and a mask",
            ));
        }
        Ok(())
    }
}

/// A readable disk content stream with a known length.
pub trait DiskStream: Read + Send {
    /// Total number of bytes the stream will yield.
    fn length(&self) -> u64;
}

/// A data channel to the storage backend.
pub trait TransferChannel: Send {
    /// Apply network settings. Called once per job, before any disk is opened.
    fn configure(&mut self, network: &TransferNetwork) -> std::result::Result<(), TransferError>;

    /// Open a stream over the content of the disk with the given uuid.
    fn open(
        &mut self,
        disk_uuid: &str,
    ) -> std::result::Result<Box<dyn DiskStream>, TransferError>;

    /// Tear down the session opened by the last `open`.
    fn close(&mut self) -> std::result::Result<(), TransferError>;
}

/// Cooperative cancellation flag shared between a job and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread at any time.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Err(Error::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One opened disk on a transfer channel.
///
/// The stream is dropped and the channel closed when the session is closed
/// explicitly or dropped.
pub struct TransferSession<'c> {
    channel: &'c mut dyn TransferChannel,
    stream: Option<Box<dyn DiskStream>>,
    disk_uuid: String,
}

impl<'c> TransferSession<'c> {
    /// Open the disk's stream on `channel`.
    ///
    /// A refused open still closes the channel before the error is returned.
    pub fn open(
        channel: &'c mut dyn TransferChannel,
        disk_uuid: &str,
    ) -> std::result::Result<Self, TransferError> {
        let stream = match channel.open(disk_uuid) {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close_err) = channel.close() {
                    tracing::warn!(
                        disk = disk_uuid,
                        error = %close_err,
                        "failed to close channel after refused open"
                    );
                }
                return Err(e);
            }
        };
        tracing::debug!(disk = disk_uuid, length = stream.length(), "transfer session opened");
        Ok(Self {
            channel,
            stream: Some(stream),
            disk_uuid: disk_uuid.to_string(),
        })
    }

    pub fn disk_uuid(&self) -> &str {
        &self.disk_uuid
    }

    /// Length reported by the source stream.
    pub fn length(&self) -> u64 {
        self.stream.as_ref().map(|s| s.length()).unwrap_or(0)
    }

    /// Read from the source stream. Returns 0 once the session is closed.
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }

    /// Close the stream and the channel, reporting a teardown failure.
    pub fn close(mut self) -> std::result::Result<(), TransferError> {
        self.release()
    }

    fn release(&mut self) -> std::result::Result<(), TransferError> {
        match self.stream.take() {
            Some(stream) => {
                drop(stream);
                tracing::debug!(disk = %self.disk_uuid, "transfer session closed");
                self.channel.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for TransferSession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(disk = %self.disk_uuid, error = %e, "failed to close transfer session");
        }
    }
}
