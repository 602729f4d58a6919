//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ovfexport_core::backend::{disk_content_path, Inventory, VmEntry, INVENTORY_FILE};
use ovfexport_core::model::{
    BlockDevice, DeviceKind, DiskRecord, InterfaceRecord, NetworkRecord, OpaqueRef, PowerState,
    VmRecord,
};
use ovfexport_core::{EventSink, ExportConfig, LocalBackend, TransferEvent};
use tempfile::TempDir;

pub const MB: u64 = 1024 * 1024;

/// A backend directory and an output directory inside one temp dir.
pub struct Fixture {
    pub dir: TempDir,
    pub inventory: Inventory,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("backend")).unwrap();
        Self {
            dir,
            inventory: Inventory::default(),
        }
    }

    pub fn backend_dir(&self) -> PathBuf {
        self.dir.path().join("backend")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    /// Adds a halted VM with 2 vCPUs and 4 GiB of memory.
    pub fn add_vm(&mut self, uuid: &str, name: &str) -> &mut VmRecord {
        self.inventory.vms.push(VmEntry {
            vm: VmRecord {
                opaque_ref: OpaqueRef::new(format!("OpaqueRef:{}", uuid)),
                uuid: uuid.to_string(),
                name_label: name.to_string(),
                name_description: format!("{} description", name),
                power_state: PowerState::Halted,
                vcpus_max: 2,
                memory_dynamic_max: 4096 * MB,
                hvm_boot_policy: Some("BIOS order".to_string()),
                domarch: Some("x86_64".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        &mut self.entry(uuid).vm
    }

    pub fn entry(&mut self, vm_uuid: &str) -> &mut VmEntry {
        self.inventory
            .vms
            .iter_mut()
            .find(|e| e.vm.uuid == vm_uuid)
            .unwrap()
    }

    /// Attaches a disk with the given content to a VM.
    pub fn add_disk(&mut self, vm_uuid: &str, disk_uuid: &str, user_device: &str, content: &[u8]) {
        fs::write(disk_content_path(&self.backend_dir(), disk_uuid), content).unwrap();
        let disk_ref = OpaqueRef::new(format!("OpaqueRef:{}", disk_uuid));
        self.inventory.disks.push(DiskRecord {
            opaque_ref: disk_ref.clone(),
            uuid: disk_uuid.to_string(),
            name_label: Some(format!("{} label", disk_uuid)),
            name_description: String::new(),
            virtual_size: content.len() as u64,
            physical_utilisation: content.len() as u64 / 2,
        });
        self.entry(vm_uuid).block_devices.push(BlockDevice {
            opaque_ref: OpaqueRef::new(format!("OpaqueRef:vbd-{}", disk_uuid)),
            uuid: format!("vbd-{}", disk_uuid),
            kind: DeviceKind::Disk,
            user_device: user_device.to_string(),
            bootable: user_device == "0",
            disk: Some(disk_ref),
        });
    }

    /// Adds a disk slot with nothing plugged in.
    pub fn add_empty_slot(&mut self, vm_uuid: &str, user_device: &str) {
        self.entry(vm_uuid).block_devices.push(BlockDevice {
            opaque_ref: OpaqueRef::new(format!("OpaqueRef:vbd-empty-{}", user_device)),
            uuid: format!("vbd-empty-{}", user_device),
            kind: DeviceKind::Disk,
            user_device: user_device.to_string(),
            bootable: false,
            disk: Some(OpaqueRef::null()),
        });
    }

    pub fn add_cd(&mut self, vm_uuid: &str, user_device: &str) {
        self.entry(vm_uuid).block_devices.push(BlockDevice {
            opaque_ref: OpaqueRef::new(format!("OpaqueRef:cd-{}", user_device)),
            uuid: format!("cd-{}-{}", vm_uuid, user_device),
            kind: DeviceKind::Cd,
            user_device: user_device.to_string(),
            bootable: false,
            disk: None,
        });
    }

    /// Attaches an interface on `network_uuid`, creating the network once.
    pub fn add_interface(&mut self, vm_uuid: &str, network_uuid: &str, mac: &str) {
        let net_ref = OpaqueRef::new(format!("OpaqueRef:{}", network_uuid));
        if !self.inventory.networks.iter().any(|n| n.opaque_ref == net_ref) {
            self.inventory.networks.push(NetworkRecord {
                opaque_ref: net_ref.clone(),
                uuid: network_uuid.to_string(),
                name_label: format!("{} name", network_uuid),
                name_description: format!("{} description", network_uuid),
            });
        }
        let entry = self.entry(vm_uuid);
        let device = entry.interfaces.len().to_string();
        entry.interfaces.push(InterfaceRecord {
            opaque_ref: OpaqueRef::new(format!("OpaqueRef:vif-{}-{}", vm_uuid, device)),
            device,
            mac: mac.to_string(),
            network: net_ref,
        });
    }

    pub fn set_guest_metrics(&mut self, vm_uuid: &str, pairs: &[(&str, &str)]) {
        let metrics: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.entry(vm_uuid).guest_metrics = Some(metrics);
    }

    /// Writes `inventory.json` and loads it back.
    pub fn backend(&self) -> LocalBackend {
        let json = self.inventory.to_json().unwrap();
        fs::write(self.backend_dir().join(INVENTORY_FILE), json).unwrap();
        LocalBackend::load(&self.backend_dir()).unwrap()
    }
}

/// Deterministic non-zero content of `len` bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32 * 31 + seed as u32) % 251) as u8 + 1)
        .collect()
}

/// Small chunks so every test disk takes several reads.
pub fn test_config() -> ExportConfig {
    ExportConfig {
        chunk_size: 48 * 1024,
        threads: 2,
        ..Default::default()
    }
}

/// A sink recording every event it receives.
pub fn recording_sink() -> (EventSink, Arc<Mutex<Vec<TransferEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let sink = EventSink::callback(move |event| seen.lock().unwrap().push(event.clone()));
    (sink, events)
}
