//! Records read from the hypervisor's object model.
//!
//! The core never writes to the remote model. [`RemoteModelReader`] is the
//! read-only seam, and [`VmSnapshot`] captures everything one VM export
//! needs in a single pass so metadata and disk content come from the same
//! point-in-time view.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An opaque object reference as handed out by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueRef(String);

impl OpaqueRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The reference used by the hypervisor for "no object".
    pub fn null() -> Self {
        Self("OpaqueRef:NULL".to_string())
    }

    /// Whether this reference points at nothing.
    ///
    /// Empty references and any reference containing "null" (in any case)
    /// are treated as null.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0.to_ascii_lowercase().contains("null")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OpaqueRef {
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// VM power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    Halted,
    Paused,
    Running,
    Suspended,
    #[default]
    Unknown,
}

impl PowerState {
    /// Only halted and suspended VMs have consistent disks to export.
    pub fn is_exportable(&self) -> bool {
        matches!(self, PowerState::Halted | PowerState::Suspended)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Halted => write!(f, "Halted"),
            PowerState::Paused => write!(f, "Paused"),
            PowerState::Running => write!(f, "Running"),
            PowerState::Suspended => write!(f, "Suspended"),
            PowerState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A VM record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmRecord {
    pub opaque_ref: OpaqueRef,
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub power_state: PowerState,
    pub vcpus_max: u64,
    /// Dynamic memory maximum in bytes.
    pub memory_dynamic_max: u64,
    pub hvm_boot_policy: Option<String>,
    pub hvm_boot_params: BTreeMap<String, String>,
    pub hvm_shadow_multiplier: f64,
    pub platform: BTreeMap<String, String>,
    pub domarch: Option<String>,
    pub pv_args: Option<String>,
    pub pv_bootloader: Option<String>,
    pub pv_bootloader_args: Option<String>,
    pub pv_kernel: Option<String>,
    pub pv_legacy_args: Option<String>,
    pub pv_ramdisk: Option<String>,
    /// Boot order within a group start.
    pub order: u64,
    /// Seconds to wait after starting this VM.
    pub start_delay: u64,
    /// Seconds to wait after shutting down this VM.
    pub shutdown_delay: u64,
}

impl Default for VmRecord {
    fn default() -> Self {
        Self {
            opaque_ref: OpaqueRef::null(),
            uuid: String::new(),
            name_label: String::new(),
            name_description: String::new(),
            power_state: PowerState::Unknown,
            vcpus_max: 1,
            memory_dynamic_max: 0,
            hvm_boot_policy: None,
            hvm_boot_params: BTreeMap::new(),
            hvm_shadow_multiplier: 1.0,
            platform: BTreeMap::new(),
            domarch: None,
            pv_args: None,
            pv_bootloader: None,
            pv_bootloader_args: None,
            pv_kernel: None,
            pv_legacy_args: None,
            pv_ramdisk: None,
            order: 0,
            start_delay: 0,
            shutdown_delay: 0,
        }
    }
}

/// What a block device is attached as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceKind {
    #[default]
    Disk,
    /// Removable media; never exported as an image.
    Cd,
}

/// A virtual block device: an attachment point on a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDevice {
    pub opaque_ref: OpaqueRef,
    pub uuid: String,
    pub kind: DeviceKind,
    /// User-visible device number, e.g. "0", "3".
    pub user_device: String,
    pub bootable: bool,
    /// Backing disk; absent or null for empty slots.
    pub disk: Option<OpaqueRef>,
}

impl BlockDevice {
    /// The backing disk reference, if it points at something.
    pub fn backing_disk(&self) -> Option<&OpaqueRef> {
        self.disk.as_ref().filter(|r| !r.is_null())
    }
}

/// A virtual disk record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskRecord {
    pub opaque_ref: OpaqueRef,
    pub uuid: String,
    pub name_label: Option<String>,
    pub name_description: String,
    /// Logical size in bytes.
    pub virtual_size: u64,
    /// Allocated size in bytes.
    pub physical_utilisation: u64,
}

/// A virtual network interface record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceRecord {
    pub opaque_ref: OpaqueRef,
    pub device: String,
    #[serde(rename = "MAC")]
    pub mac: String,
    pub network: OpaqueRef,
}

/// A network record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRecord {
    pub opaque_ref: OpaqueRef,
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
}

/// Read-only access to the hypervisor's object graph.
///
/// Lookups that miss return `Ok(None)` or an empty list; `Err` is reserved
/// for the backend failing to answer.
pub trait RemoteModelReader {
    fn vm_by_uuid(&self, uuid: &str) -> Result<Option<VmRecord>>;

    /// VMs with the given name, in the backend's natural enumeration order.
    fn vms_by_name(&self, name: &str) -> Result<Vec<VmRecord>>;

    /// Block devices attached to a VM, in natural order.
    fn block_devices(&self, vm: &OpaqueRef) -> Result<Vec<BlockDevice>>;

    fn disk(&self, disk: &OpaqueRef) -> Result<Option<DiskRecord>>;

    /// Network interfaces attached to a VM, in natural order.
    fn interfaces(&self, vm: &OpaqueRef) -> Result<Vec<InterfaceRecord>>;

    fn network(&self, network: &OpaqueRef) -> Result<Option<NetworkRecord>>;

    /// The `os_version` map of the VM's guest metrics, if the VM has any.
    fn guest_metrics(&self, vm: &OpaqueRef) -> Result<Option<BTreeMap<String, String>>>;

    /// Whether the platform records VM startup ordering.
    fn supports_startup_options(&self) -> bool;
}

/// A block device together with its resolved backing disk.
#[derive(Debug, Clone)]
pub struct AttachedDevice {
    pub device: BlockDevice,
    /// `None` for removable media and for empty slots.
    pub disk: Option<DiskRecord>,
}

/// An interface together with the network it is attached to.
#[derive(Debug, Clone)]
pub struct AttachedInterface {
    pub interface: InterfaceRecord,
    pub network: NetworkRecord,
}

/// Point-in-time view of one VM and everything attached to it.
#[derive(Debug, Clone)]
pub struct VmSnapshot {
    pub vm: VmRecord,
    pub devices: Vec<AttachedDevice>,
    pub interfaces: Vec<AttachedInterface>,
    pub guest_metrics: Option<BTreeMap<String, String>>,
    pub supports_startup_options: bool,
}

impl VmSnapshot {
    /// Read every record the export of `vm` needs.
    pub fn fetch<R: RemoteModelReader + ?Sized>(model: &R, vm: VmRecord) -> Result<Self> {
        let mut devices = Vec::new();
        for device in model.block_devices(&vm.opaque_ref)? {
            let disk = match (device.kind, device.backing_disk()) {
                (DeviceKind::Disk, Some(disk_ref)) => model.disk(disk_ref)?,
                _ => None,
            };
            devices.push(AttachedDevice { device, disk });
        }

        let mut interfaces = Vec::new();
        for interface in model.interfaces(&vm.opaque_ref)? {
            let network = model.network(&interface.network)?.ok_or_else(|| {
                Error::backend(format!(
                    "network {} of interface {} on VM '{}' does not exist",
                    interface.network, interface.device, vm.name_label
                ))
            })?;
            interfaces.push(AttachedInterface { interface, network });
        }

        let guest_metrics = model.guest_metrics(&vm.opaque_ref)?;
        let supports_startup_options = model.supports_startup_options();

        tracing::debug!(
            vm = %vm.name_label,
            devices = devices.len(),
            interfaces = interfaces.len(),
            has_guest_metrics = guest_metrics.is_some(),
            "VM snapshot taken"
        );

        Ok(Self {
            vm,
            devices,
            interfaces,
            guest_metrics,
            supports_startup_options,
        })
    }
}
