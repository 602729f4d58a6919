//! Export orchestrator.
//!
//! This module coordinates a full export job:
//! 1. Resolve every VM identifier and check its power state
//! 2. For each VM, take a snapshot of its records and emit its metadata
//! 3. Hand the VM's disks to the [`DiskCopyEngine`] as one batch
//! 4. Merge the per-VM envelopes into one package and save the descriptor
//!
//! # Example
//!
//! ```no_run
//! use ovfexport_core::backend::LocalBackend;
//! use ovfexport_core::config::ExportConfig;
//! use ovfexport_core::events::EventSink;
//! use ovfexport_core::export::{ExportJob, Exporter};
//! use std::path::Path;
//!
//! let backend = LocalBackend::load(Path::new("/srv/pool")).unwrap();
//! let channel = backend.channel();
//! let mut exporter =
//!     Exporter::new(backend, channel, ExportConfig::default(), EventSink::discard()).unwrap();
//!
//! let job = ExportJob::new("/exports/web", "web", vec!["web-01".to_string()]);
//! let result = exporter.run(job).unwrap();
//! println!("{} image(s) written", result.disk_files.len());
//! ```

use std::fs;
use std::path::PathBuf;

use uuid::Uuid;

use crate::config::ExportConfig;
use crate::disk_copy::{CopyOutcome, DiskCopyEngine, DiskTask};
use crate::error::{Error, Result};
use crate::events::{EventSink, TransferEvent};
use crate::guest_os;
use crate::model::{DeviceKind, PowerState, RemoteModelReader, VmRecord, VmSnapshot};
use crate::ovf::{DiskEntry, Envelope, NetworkAdapter, StartupOptions, SystemSettings};
use crate::pipeline::Pipeline;
use crate::transfer::{CancelToken, TransferChannel};

/// Version component of the virtual system type string.
pub const VM_TYPE_VERSION: &str = "3.0";

const MB: u64 = 1024 * 1024;

const SYSTEM_CAPTION: &str = "Virtual System";
const CDROM_CAPTION: &str = "CD/DVD Drive";
const CDROM_DESCRIPTION: &str = "CD/DVD drive";
const DISK_LABEL_PREFIX: &str = "Virtual Disk";

const SETTING_DESCRIPTION: &str = "Hypervisor-specific setting";
const BOOT_POLICY_DESCRIPTION: &str = "Firmware boot policy";
const PLATFORM_DESCRIPTION: &str = "Platform settings as key=value pairs";

/// Switches controlling what a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFlags {
    /// Emit metadata only; copy no disk content.
    pub metadata_only: bool,
    /// Re-read every image after writing it.
    pub verify_disks: bool,
    /// Save the merged descriptor as `<destination>/<package>.ovf`.
    pub auto_save: bool,
}

impl Default for ExportFlags {
    fn default() -> Self {
        Self {
            metadata_only: false,
            verify_disks: false,
            auto_save: true,
        }
    }
}

/// One export request.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub destination: PathBuf,
    pub package_name: String,
    /// VM uuids or names, exported in this order.
    pub vm_ids: Vec<String>,
    pub flags: ExportFlags,
    pub cancel: CancelToken,
}

impl ExportJob {
    pub fn new(
        destination: impl Into<PathBuf>,
        package_name: impl Into<String>,
        vm_ids: Vec<String>,
    ) -> Self {
        Self {
            destination: destination.into(),
            package_name: package_name.into(),
            vm_ids,
            flags: ExportFlags::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_flags(mut self, flags: ExportFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What a finished job produced.
#[derive(Debug, Clone)]
pub struct ExportResult {
    /// The merged package metadata.
    pub envelope: Envelope,
    /// Image files written, in copy order.
    pub disk_files: Vec<PathBuf>,
    pub outcomes: Vec<CopyOutcome>,
    /// Path of the saved descriptor, when auto-save is on.
    pub descriptor: Option<PathBuf>,
}

/// A resolved VM identifier.
#[derive(Debug, Clone)]
pub struct ResolvedVm {
    pub vm: VmRecord,
    /// Other VMs sharing the name, when the identifier was a name.
    pub skipped: Vec<VmRecord>,
}

/// Resolve a VM by uuid first, then by name.
///
/// With several name matches the first in enumeration order wins.
pub fn resolve_vm<R: RemoteModelReader + ?Sized>(model: &R, identifier: &str) -> Result<ResolvedVm> {
    if let Some(vm) = model.vm_by_uuid(identifier)? {
        tracing::debug!(identifier, uuid = %vm.uuid, "resolved VM by uuid");
        return Ok(ResolvedVm {
            vm,
            skipped: Vec::new(),
        });
    }

    let mut matches = model.vms_by_name(identifier)?.into_iter();
    let vm = matches.next().ok_or_else(|| Error::not_found(identifier))?;
    let skipped: Vec<VmRecord> = matches.collect();
    tracing::debug!(
        identifier,
        uuid = %vm.uuid,
        skipped = skipped.len(),
        "resolved VM by name"
    );
    Ok(ResolvedVm { vm, skipped })
}

/// The `{a}-3.0-{b}` virtual system type of a VM.
///
/// | boot policy        | architecture | result              |
/// |--------------------|--------------|---------------------|
/// | default            | set          | `{arch}-3.0-unknown`|
/// | default            | empty        | `hvm-3.0-unknown`   |
/// | other or absent    | set          | `xen-3.0-{arch}`    |
/// | other or absent    | empty        | `xen-3.0-unknown`   |
pub fn virtual_system_type(vm: &VmRecord, default_boot_policy: &str) -> String {
    let arch = vm.domarch.as_deref().filter(|a| !a.is_empty());
    let default_boot = vm.hvm_boot_policy.as_deref() == Some(default_boot_policy);
    match (default_boot, arch) {
        (true, Some(arch)) => format!("{}-{}-unknown", arch, VM_TYPE_VERSION),
        (true, None) => format!("hvm-{}-unknown", VM_TYPE_VERSION),
        (false, Some(arch)) => format!("xen-{}-{}", VM_TYPE_VERSION, arch),
        (false, None) => format!("xen-{}-unknown", VM_TYPE_VERSION),
    }
}

/// Builds the envelope of one VM and the disk tasks it references.
///
/// Empty storage slots are reported as warnings on `events` and skipped.
pub fn build_vm_envelope(
    snapshot: &VmSnapshot,
    package_name: &str,
    config: &ExportConfig,
    events: &EventSink,
) -> Result<(Envelope, Vec<DiskTask>)> {
    let vm = &snapshot.vm;
    let mut env = Envelope::new(package_name);
    let vs = env.add_virtual_system(&vm.name_label);
    let hw = env.add_hardware_section(&vs)?;

    if let Some(os) = snapshot.guest_metrics.as_ref().and_then(guest_os::identify) {
        tracing::debug!(vm = %vm.name_label, os = %os.name, id = os.id, "guest OS identified");
        env.set_operating_system(&vs, os)?;
    }

    env.set_system_settings(
        &vs,
        &hw,
        SystemSettings {
            element_name: vm.name_label.clone(),
            caption: SYSTEM_CAPTION.to_string(),
            description: vm.name_description.clone(),
            instance_id: Uuid::new_v4().to_string(),
            virtual_system_type: virtual_system_type(vm, &config.default_boot_policy),
        },
    )?;
    env.set_cpus(&vs, vm.vcpus_max)?;
    env.set_memory(&vs, vm.memory_dynamic_max / MB, "MB")?;

    for attached in &snapshot.interfaces {
        env.add_network_adapter(
            &vs,
            NetworkAdapter {
                network_id: attached.network.uuid.clone(),
                name: attached.network.name_label.clone(),
                description: attached.network.name_description.clone(),
                mac: attached.interface.mac.clone(),
            },
        )?;
    }

    if snapshot.supports_startup_options {
        env.add_startup_section(
            &vs,
            StartupOptions {
                order: vm.order,
                start_delay: vm.start_delay,
                shutdown_delay: vm.shutdown_delay,
            },
        )?;
    }

    let mut tasks = Vec::new();
    for attached in &snapshot.devices {
        let device = &attached.device;
        match (device.kind, &attached.disk) {
            (DeviceKind::Cd, _) => {
                let id = env.add_cdrom(&vs, &device.uuid, CDROM_CAPTION, CDROM_DESCRIPTION)?;
                env.set_target_device(&vs, &id, &device.user_device)?;
            }
            (DeviceKind::Disk, None) => {
                tracing::warn!(
                    vm = %vm.name_label,
                    device = %device.user_device,
                    "block device has no backing disk, skipping"
                );
                events.emit(TransferEvent::warning(
                    &vm.name_label,
                    format!("Device {} has no disk attached; skipped", device.user_device),
                ));
            }
            (DeviceKind::Disk, Some(disk)) => {
                let index = tasks.len();
                let label = disk
                    .name_label
                    .clone()
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| format!("{} {}", DISK_LABEL_PREFIX, index));
                let filename = DiskTask::default_filename(&disk.uuid);
                let disk_id = env.add_disk(
                    &vs,
                    DiskEntry {
                        disk_id: Uuid::new_v4().to_string(),
                        filename: filename.clone(),
                        bootable: device.bootable,
                        name: label.clone(),
                        description: disk.name_description.clone(),
                        physical_size: disk.physical_utilisation,
                        capacity: disk.virtual_size,
                    },
                )?;
                env.set_target_device(&vs, &disk_id, &device.user_device)?;

                tasks.push(DiskTask {
                    disk_uuid: disk.uuid.clone(),
                    virtual_size: disk.virtual_size,
                    physical_size: disk.physical_utilisation,
                    label,
                    filename,
                    bootable: device.bootable,
                    index,
                    metadata_id: disk_id,
                });
            }
        }
    }

    add_vendor_settings(&mut env, &vs, vm)?;

    Ok((env, tasks))
}

fn add_vendor_settings(env: &mut Envelope, vs: &str, vm: &VmRecord) -> Result<()> {
    if let Some((_, order)) = vm
        .hvm_boot_params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("order"))
    {
        env.add_opaque_setting(vs, "HVM_boot_params", order, SETTING_DESCRIPTION)?;
    }
    if let Some(policy) = vm.hvm_boot_policy.as_deref().filter(|p| !p.is_empty()) {
        env.add_opaque_setting(vs, "HVM_boot_policy", policy, BOOT_POLICY_DESCRIPTION)?;
    }
    if vm.hvm_shadow_multiplier != 1.0 {
        env.add_opaque_setting(
            vs,
            "HVM_shadow_multiplier",
            &vm.hvm_shadow_multiplier.to_string(),
            SETTING_DESCRIPTION,
        )?;
    }
    if !vm.platform.is_empty() {
        let flattened: String = vm
            .platform
            .iter()
            .map(|(key, value)| format!("{}={};", key, value))
            .collect();
        env.add_opaque_setting(vs, "platform", &flattened, PLATFORM_DESCRIPTION)?;
    }

    let pv_settings = [
        ("PV_args", &vm.pv_args),
        ("PV_bootloader", &vm.pv_bootloader),
        ("PV_bootloader_args", &vm.pv_bootloader_args),
        ("PV_kernel", &vm.pv_kernel),
        ("PV_legacy_args", &vm.pv_legacy_args),
        ("PV_ramdisk", &vm.pv_ramdisk),
    ];
    for (key, value) in pv_settings {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            env.add_opaque_setting(vs, key, value, SETTING_DESCRIPTION)?;
        }
    }
    Ok(())
}

/// Turn a package name into a safe descriptor filename.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Runs export jobs against a remote model and a transfer channel.
pub struct Exporter<R, C> {
    model: R,
    channel: C,
    config: ExportConfig,
    events: EventSink,
    pipeline: Pipeline,
}

impl<R: RemoteModelReader, C: TransferChannel> Exporter<R, C> {
    pub fn new(model: R, channel: C, config: ExportConfig, events: EventSink) -> Result<Self> {
        config.validate()?;
        let pipeline = Pipeline::new(config.pipeline_config())?;
        Ok(Self {
            model,
            channel,
            config,
            events,
            pipeline,
        })
    }

    pub fn model(&self) -> &R {
        &self.model
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    fn report(&self, subject: &str, err: Error) -> Error {
        if err.is_cancelled() {
            tracing::info!(subject, "export cancelled");
        } else {
            tracing::error!(subject, error = %err, "export failed");
            self.events.emit(TransferEvent::failure(
                subject,
                format!("Export of '{}' failed", subject),
                &err,
            ));
        }
        err
    }

    /// Resolve every identifier and check every power state.
    fn preflight(&self, job: &ExportJob) -> Result<Vec<VmRecord>> {
        let mut vms = Vec::with_capacity(job.vm_ids.len());
        for identifier in &job.vm_ids {
            let resolved =
                resolve_vm(&self.model, identifier).map_err(|e| self.report(identifier, e))?;

            if !resolved.skipped.is_empty() {
                let skipped: Vec<&str> = resolved.skipped.iter().map(|v| v.uuid.as_str()).collect();
                tracing::warn!(identifier = %identifier, uuid = %resolved.vm.uuid, ?skipped, "several VMs share this name");
                self.events.emit(TransferEvent::warning(
                    identifier,
                    format!(
                        "{} VMs are named '{}'; exporting {} and skipping {}",
                        skipped.len() + 1,
                        identifier,
                        resolved.vm.uuid,
                        skipped.join(", ")
                    ),
                ));
            }

            let vm = resolved.vm;
            if !vm.power_state.is_exportable() {
                let err = Error::invalid_state(&vm.name_label, vm.power_state);
                return Err(self.report(&vm.name_label, err));
            }
            vms.push(vm);
        }
        Ok(vms)
    }

    /// Runs one job to completion.
    pub fn run(&mut self, job: ExportJob) -> Result<ExportResult> {
        tracing::info!(
            package = %job.package_name,
            vms = job.vm_ids.len(),
            destination = %job.destination.display(),
            metadata_only = job.flags.metadata_only,
            "export started"
        );
        if job.vm_ids.is_empty() {
            return Err(Error::config("an export job needs at least one VM"));
        }

        let vms = self.preflight(&job)?;

        fs::create_dir_all(&job.destination)
            .map_err(|e| self.report(&job.package_name, Error::io(e, &job.destination)))?;

        if !job.flags.metadata_only {
            if let Err(e) = self.channel.configure(&self.config.transfer) {
                return Err(self.report(&job.package_name, e.into()));
            }
        }

        let mut envelopes = Vec::with_capacity(vms.len());
        let mut outcomes = Vec::new();
        for vm in vms {
            job.cancel
                .check()
                .map_err(|e| self.report(&job.package_name, e))?;

            let name = vm.name_label.clone();
            tracing::info!(vm = %name, uuid = %vm.uuid, "exporting VM");
            let snapshot = VmSnapshot::fetch(&self.model, vm).map_err(|e| self.report(&name, e))?;
            let (mut envelope, tasks) =
                build_vm_envelope(&snapshot, &job.package_name, &self.config, &self.events)
                    .map_err(|e| self.report(&name, e))?;

            if !job.flags.metadata_only && !tasks.is_empty() {
                let mut engine = DiskCopyEngine::new(
                    &mut self.channel,
                    &self.events,
                    &job.cancel,
                    &self.pipeline,
                    self.config.chunk_size,
                );
                let copied = engine.copy_all(
                    &tasks,
                    &job.destination,
                    &mut envelope,
                    job.flags.verify_disks,
                )?;
                outcomes.extend(copied);
            }

            envelope.finalize().map_err(|e| self.report(&name, e))?;
            envelopes.push(envelope);
        }

        let mut envelope = Envelope::merge(envelopes, &job.package_name);
        let descriptor = if job.flags.auto_save {
            envelope
                .finalize()
                .map_err(|e| self.report(&job.package_name, e))?;
            let path = job
                .destination
                .join(format!("{}.ovf", sanitize_filename(&job.package_name)));
            envelope
                .save_as(&path)
                .map_err(|e| self.report(&job.package_name, e))?;
            Some(path)
        } else {
            None
        };

        let disk_files = outcomes.iter().map(|o| o.path.clone()).collect();
        tracing::info!(package = %job.package_name, images = outcomes.len(), "export completed");
        self.events
            .emit(TransferEvent::complete(&job.package_name, "Export completed"));

        Ok(ExportResult {
            envelope,
            disk_files,
            outcomes,
            descriptor,
        })
    }
}

/// Detail information about a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDetail {
    pub uuid: String,
    pub label: String,
    /// Logical size in bytes.
    pub size_bytes: u64,
    /// Allocated size in bytes.
    pub physical_bytes: u64,
    /// User-visible device number of the slot.
    pub user_device: String,
    pub bootable: bool,
}

/// Summary information about a VM.
#[derive(Debug, Clone, PartialEq)]
pub struct VmInfo {
    pub name: String,
    pub uuid: String,
    pub power_state: PowerState,
    /// Number of virtual CPUs.
    pub cpus: u64,
    /// Memory size in megabytes.
    pub memory_mb: u64,
    /// Details about attached disks.
    pub disks: Vec<DiskDetail>,
    pub cdrom_count: usize,
    pub interface_count: usize,
    /// Total logical size of all disks in bytes.
    pub total_disk_size: u64,
}

/// Get information about a VM without exporting it.
pub fn get_vm_info<R: RemoteModelReader + ?Sized>(model: &R, identifier: &str) -> Result<VmInfo> {
    let resolved = resolve_vm(model, identifier)?;
    let snapshot = VmSnapshot::fetch(model, resolved.vm)?;

    let mut disks = Vec::new();
    let mut cdrom_count = 0;
    for attached in &snapshot.devices {
        match (attached.device.kind, &attached.disk) {
            (DeviceKind::Cd, _) => cdrom_count += 1,
            (DeviceKind::Disk, Some(disk)) => {
                let index = disks.len();
                disks.push(DiskDetail {
                    uuid: disk.uuid.clone(),
                    label: disk
                        .name_label
                        .clone()
                        .filter(|l| !l.is_empty())
                        .unwrap_or_else(|| format!("{} {}", DISK_LABEL_PREFIX, index)),
                    size_bytes: disk.virtual_size,
                    physical_bytes: disk.physical_utilisation,
                    user_device: attached.device.user_device.clone(),
                    bootable: attached.device.bootable,
                });
            }
            (DeviceKind::Disk, None) => {}
        }
    }

    let vm = &snapshot.vm;
    Ok(VmInfo {
        name: vm.name_label.clone(),
        uuid: vm.uuid.clone(),
        power_state: vm.power_state,
        cpus: vm.vcpus_max,
        memory_mb: vm.memory_dynamic_max / MB,
        total_disk_size: disks.iter().map(|d| d.size_bytes).sum(),
        disks,
        cdrom_count,
        interface_count: snapshot.interfaces.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(policy: Option<&str>, arch: Option<&str>) -> VmRecord {
        VmRecord {
            hvm_boot_policy: policy.map(str::to_string),
            domarch: arch.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_export_flags_default() {
        let flags = ExportFlags::default();
        assert!(!flags.metadata_only);
        assert!(!flags.verify_disks);
        assert!(flags.auto_save);
    }

    #[test]
    fn test_vm_type_default_boot_policy() {
        assert_eq!(
            virtual_system_type(&vm(Some("BIOS order"), Some("x86_64")), "BIOS order"),
            "x86_64-3.0-unknown"
        );
        assert_eq!(
            virtual_system_type(&vm(Some("BIOS order"), None), "BIOS order"),
            "hvm-3.0-unknown"
        );
    }

    #[test]
    fn test_vm_type_other_boot_policy() {
        assert_eq!(
            virtual_system_type(&vm(Some(""), Some("x86_32")), "BIOS order"),
            "xen-3.0-x86_32"
        );
        assert_eq!(virtual_system_type(&vm(None, None), "BIOS order"), "xen-3.0-unknown");
        assert_eq!(
            virtual_system_type(&vm(None, Some("")), "BIOS order"),
            "xen-3.0-unknown"
        );
    }

    #[test]
    fn test_vendor_settings_skip_defaults() {
        let mut env = Envelope::new("pkg");
        let vs = env.add_virtual_system("web");
        add_vendor_settings(&mut env, &vs, &VmRecord::default()).unwrap();
        assert!(env.virtual_system(&vs).unwrap().settings.is_empty());
    }

    #[test]
    fn test_vendor_settings_flatten_platform() {
        let mut record = VmRecord {
            hvm_shadow_multiplier: 1.5,
            pv_kernel: Some("/boot/vmlinuz".to_string()),
            pv_args: Some(String::new()),
            ..Default::default()
        };
        record.platform.insert("acpi".to_string(), "1".to_string());
        record.platform.insert("apic".to_string(), "true".to_string());
        record.hvm_boot_params.insert("Order".to_string(), "dc".to_string());
        record.hvm_boot_params.insert("firmware".to_string(), "bios".to_string());

        let mut env = Envelope::new("pkg");
        let vs = env.add_virtual_system("web");
        add_vendor_settings(&mut env, &vs, &record).unwrap();

        let settings: Vec<(&str, &str)> = env
            .virtual_system(&vs)
            .unwrap()
            .settings
            .iter()
            .map(|s| (s.key.as_str(), s.value.as_str()))
            .collect();
        assert_eq!(
            settings,
            vec![
                ("HVM_boot_params", "dc"),
                ("HVM_shadow_multiplier", "1.5"),
                ("platform", "acpi=1;apic=true;"),
                ("PV_kernel", "/boot/vmlinuz"),
            ]
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("web"), "web");
        assert_eq!(sanitize_filename("web tier"), "web_tier");
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
    }
}
