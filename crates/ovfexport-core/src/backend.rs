//! Directory-backed hypervisor backend.
//!
//! A backend directory holds an `inventory.json` describing VMs, disks and
//! networks, plus one `<disk-uuid>.raw` file per disk with its content.
//! [`LocalBackend`] answers model queries from the inventory and
//! [`LocalChannel`] streams the raw files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, TransferError};
use crate::model::{
    BlockDevice, DiskRecord, InterfaceRecord, NetworkRecord, OpaqueRef, RemoteModelReader,
    VmRecord,
};
use crate::transfer::{DiskStream, TransferChannel, TransferNetwork};

/// Name of the inventory file inside a backend directory.
pub const INVENTORY_FILE: &str = "inventory.json";

/// Platform capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformInfo {
    pub supports_startup_options: bool,
}

/// One VM and the records attached to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmEntry {
    pub vm: VmRecord,
    pub block_devices: Vec<BlockDevice>,
    pub interfaces: Vec<InterfaceRecord>,
    pub guest_metrics: Option<BTreeMap<String, String>>,
}

/// The content of `inventory.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub platform: PlatformInfo,
    pub vms: Vec<VmEntry>,
    pub disks: Vec<DiskRecord>,
    pub networks: Vec<NetworkRecord>,
}

impl Inventory {
    /// Parse an inventory from JSON text.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::backend(format!("invalid inventory: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::backend(format!("failed to serialise inventory: {}", e)))
    }

    fn entry(&self, vm: &OpaqueRef) -> Result<&VmEntry> {
        self.vms
            .iter()
            .find(|entry| &entry.vm.opaque_ref == vm)
            .ok_or_else(|| Error::backend(format!("unknown VM reference {}", vm)))
    }
}

/// Path of the raw content file for a disk inside a backend directory.
pub fn disk_content_path(root: &Path, disk_uuid: &str) -> PathBuf {
    root.join(format!("{}.raw", disk_uuid))
}

/// A backend served from a directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    inventory: Inventory,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, inventory: Inventory) -> Self {
        Self {
            root: root.into(),
            inventory,
        }
    }

    /// Load `inventory.json` from `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(INVENTORY_FILE);
        let content = fs::read_to_string(&path).map_err(|e| Error::io(e, &path))?;
        let inventory = Inventory::from_json(&content)?;
        tracing::debug!(
            root = %root.display(),
            vms = inventory.vms.len(),
            disks = inventory.disks.len(),
            "inventory loaded"
        );
        Ok(Self::new(root, inventory))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// A transfer channel reading this backend's disk content files.
    pub fn channel(&self) -> LocalChannel {
        LocalChannel::new(self.root.clone())
    }
}

impl RemoteModelReader for LocalBackend {
    fn vm_by_uuid(&self, uuid: &str) -> Result<Option<VmRecord>> {
        Ok(self
            .inventory
            .vms
            .iter()
            .find(|entry| entry.vm.uuid == uuid)
            .map(|entry| entry.vm.clone()))
    }

    fn vms_by_name(&self, name: &str) -> Result<Vec<VmRecord>> {
        Ok(self
            .inventory
            .vms
            .iter()
            .filter(|entry| entry.vm.name_label == name)
            .map(|entry| entry.vm.clone())
            .collect())
    }

    fn block_devices(&self, vm: &OpaqueRef) -> Result<Vec<BlockDevice>> {
        Ok(self.inventory.entry(vm)?.block_devices.clone())
    }

    fn disk(&self, disk: &OpaqueRef) -> Result<Option<DiskRecord>> {
        Ok(self
            .inventory
            .disks
            .iter()
            .find(|record| &record.opaque_ref == disk)
            .cloned())
    }

    fn interfaces(&self, vm: &OpaqueRef) -> Result<Vec<InterfaceRecord>> {
        Ok(self.inventory.entry(vm)?.interfaces.clone())
    }

    fn network(&self, network: &OpaqueRef) -> Result<Option<NetworkRecord>> {
        Ok(self
            .inventory
            .networks
            .iter()
            .find(|record| &record.opaque_ref == network)
            .cloned())
    }

    fn guest_metrics(&self, vm: &OpaqueRef) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.inventory.entry(vm)?.guest_metrics.clone())
    }

    fn supports_startup_options(&self) -> bool {
        self.inventory.platform.supports_startup_options
    }
}

struct FileStream {
    reader: BufReader<File>,
    length: u64,
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl DiskStream for FileStream {
    fn length(&self) -> u64 {
        self.length
    }
}

/// Transfer channel over a backend directory's raw content files.
///
/// Like a real transfer endpoint it must be configured before use and serves
/// one open disk at a time.
#[derive(Debug)]
pub struct LocalChannel {
    root: PathBuf,
    network: Option<TransferNetwork>,
    active: Option<String>,
}

impl LocalChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            network: None,
            active: None,
        }
    }

    /// The network settings applied by `configure`, if any.
    pub fn network(&self) -> Option<&TransferNetwork> {
        self.network.as_ref()
    }
}

impl TransferChannel for LocalChannel {
    fn configure(&mut self, network: &TransferNetwork) -> std::result::Result<(), TransferError> {
        if let Some(disk) = &self.active {
            return Err(TransferError::channel(
                disk.clone(),
                "cannot reconfigure the channel while a session is open",
            ));
        }
        self.network = Some(network.clone());
        Ok(())
    }

    fn open(&mut self, disk_uuid: &str) -> std::result::Result<Box<dyn DiskStream>, TransferError> {
        if self.network.is_none() {
            return Err(TransferError::channel(disk_uuid, "channel is not configured"));
        }
        if let Some(active) = &self.active {
            return Err(TransferError::channel(
                disk_uuid,
                format!("a session for disk {} is still open", active),
            ));
        }

        let path = disk_content_path(&self.root, disk_uuid);
        let file = File::open(&path).map_err(|e| {
            TransferError::channel(disk_uuid, format!("cannot open '{}': {}", path.display(), e))
        })?;
        let length = file
            .metadata()
            .map_err(|e| TransferError::channel(disk_uuid, e.to_string()))?
            .len();

        self.active = Some(disk_uuid.to_string());
        Ok(Box::new(FileStream {
            reader: BufReader::new(file),
            length,
        }))
    }

    fn close(&mut self) -> std::result::Result<(), TransferError> {
        self.active = None;
        Ok(())
    }
}
