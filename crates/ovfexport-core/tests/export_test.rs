//! Integration tests for the export orchestrator.

mod common;

use std::fs;

use common::{pattern, recording_sink, test_config, Fixture, MB};
use ovfexport_core::image::ImageReader;
use ovfexport_core::model::PowerState;
use ovfexport_core::ovf::resource_type;
use ovfexport_core::{
    get_vm_info, Error, EventKind, ExportFlags, ExportJob, Exporter, Stage,
};

fn read_image(path: &std::path::Path) -> Vec<u8> {
    let reader = ImageReader::open(path).unwrap();
    let mut data = Vec::new();
    for grain in reader.contents() {
        data.extend(grain.unwrap());
    }
    data
}

/// One halted VM with one bootable disk, one CD and one interface.
fn single_vm_fixture() -> (Fixture, Vec<u8>) {
    let mut fx = Fixture::new();
    fx.add_vm("vm-1", "web");
    let content = pattern(200_000, 3);
    fx.add_disk("vm-1", "disk-a", "0", &content);
    fx.add_cd("vm-1", "3");
    fx.add_interface("vm-1", "net-1", "aa:bb:cc:dd:ee:01");
    (fx, content)
}

#[test]
fn test_export_single_vm() {
    let (fx, content) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]))
        .unwrap();

    let image = fx.out_dir().join("disk-a.img");
    assert_eq!(result.disk_files, vec![image.clone()]);
    assert_eq!(result.outcomes[0].bytes_copied, content.len() as u64);
    assert!(result.outcomes[0].collision.is_none());
    assert_eq!(read_image(&image), content);

    let descriptor = fx.out_dir().join("web.ovf");
    assert_eq!(result.descriptor.as_deref(), Some(descriptor.as_path()));
    let xml = fs::read_to_string(&descriptor).unwrap();
    assert!(xml.contains("ovf:href=\"disk-a.img\""));
    assert!(xml.contains("<rasd:VirtualQuantity>4096</rasd:VirtualQuantity>"));
    assert!(xml.contains("<rasd:AllocationUnits>MB</rasd:AllocationUnits>"));
    assert!(xml.contains("<vssd:VirtualSystemType>x86_64-3.0-unknown</vssd:VirtualSystemType>"));
    assert!(xml.contains("<rasd:Address>aa:bb:cc:dd:ee:01</rasd:Address>"));
    assert!(xml.contains("bootable=true,device=0"));
    assert!(!xml.contains("ovf:VirtualSystemCollection"));

    let vs = &result.envelope.virtual_systems()[0];
    assert_eq!(vs.items_of_type(resource_type::CD_DRIVE).len(), 1);
    assert_eq!(vs.items_of_type(resource_type::DISK_DRIVE).len(), 1);
    assert_eq!(result.envelope.networks().len(), 1);

    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Complete);
    assert_eq!(last.message, "Export completed");
    assert!(!events.iter().any(|e| e.kind == EventKind::Failure));
}

#[test]
fn test_empty_job_is_rejected() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let err = exporter
        .run(ExportJob::new(fx.out_dir(), "web", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
}

#[test]
fn test_unknown_identifier_writes_nothing() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let err = exporter
        .run(ExportJob::new(
            fx.out_dir(),
            "web",
            vec!["vm-1".to_string(), "no-such-vm".to_string()],
        ))
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { ref identifier } if identifier == "no-such-vm"));
    assert!(!fx.out_dir().exists());
    assert!(exporter.channel().network().is_none());

    let events = events.lock().unwrap();
    assert_eq!(events.last().unwrap().kind, EventKind::Failure);
    assert!(!events.iter().any(|e| e.kind == EventKind::Complete));
}

#[test]
fn test_running_vm_is_rejected() {
    let (mut fx, _) = single_vm_fixture();
    fx.add_vm("vm-2", "db").power_state = PowerState::Running;
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let err = exporter
        .run(ExportJob::new(
            fx.out_dir(),
            "pkg",
            vec!["vm-1".to_string(), "db".to_string()],
        ))
        .unwrap_err();

    match err {
        Error::InvalidState { vm, state } => {
            assert_eq!(vm, "db");
            assert_eq!(state, "Running");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!fx.out_dir().exists());
}

#[test]
fn test_suspended_vm_is_exported() {
    let (mut fx, _) = single_vm_fixture();
    fx.entry("vm-1").vm.power_state = PowerState::Suspended;
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["web".to_string()]))
        .unwrap();
    assert_eq!(result.outcomes.len(), 1);
}

#[test]
fn test_existing_image_is_kept_and_new_name_used() {
    let (fx, content) = single_vm_fixture();
    fs::create_dir_all(fx.out_dir()).unwrap();
    fs::write(fx.out_dir().join("disk-a.img"), b"keep me").unwrap();

    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();
    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]))
        .unwrap();

    assert_eq!(fs::read(fx.out_dir().join("disk-a.img")).unwrap(), b"keep me");
    let outcome = &result.outcomes[0];
    assert_eq!(outcome.filename, "disk-a_1.img");
    assert_eq!(outcome.collision.as_ref().unwrap().original, "disk-a.img");
    assert_eq!(read_image(&outcome.path), content);

    assert!(result.envelope.file_by_href("disk-a_1.img").is_some());
    assert!(result.envelope.file_by_href("disk-a.img").is_none());

    let events = events.lock().unwrap();
    let warning = events
        .iter()
        .find(|e| e.kind == EventKind::Warning)
        .unwrap();
    assert_eq!(warning.subject, "disk-a_1.img");
}

#[test]
fn test_repeated_export_into_same_directory() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let job = ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]);
    exporter.run(job.clone()).unwrap();
    let second = exporter.run(job).unwrap();

    assert!(fx.out_dir().join("disk-a.img").exists());
    assert!(fx.out_dir().join("disk-a_1.img").exists());
    assert_eq!(second.outcomes[0].filename, "disk-a_1.img");

    let xml = fs::read_to_string(fx.out_dir().join("web.ovf")).unwrap();
    assert!(xml.contains("ovf:href=\"disk-a_1.img\""));
    assert!(!xml.contains("ovf:href=\"disk-a.img\""));
}

#[test]
fn test_metadata_only_copies_nothing() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let flags = ExportFlags {
        metadata_only: true,
        ..Default::default()
    };
    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]).with_flags(flags))
        .unwrap();

    assert!(result.outcomes.is_empty());
    assert!(!fx.out_dir().join("disk-a.img").exists());
    assert!(fx.out_dir().join("web.ovf").exists());
    assert!(exporter.channel().network().is_none());
    assert_eq!(result.envelope.disks().len(), 1);

    let events = events.lock().unwrap();
    assert!(!events.iter().any(|e| e.kind == EventKind::Progress));
}

#[test]
fn test_no_auto_save_leaves_descriptor_unwritten() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let flags = ExportFlags {
        auto_save: false,
        ..Default::default()
    };
    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]).with_flags(flags))
        .unwrap();

    assert!(result.descriptor.is_none());
    assert!(!fx.out_dir().join("web.ovf").exists());
    assert!(fx.out_dir().join("disk-a.img").exists());
}

#[test]
fn test_verified_export_reports_verifying_stage() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let flags = ExportFlags {
        verify_disks: true,
        ..Default::default()
    };
    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]).with_flags(flags))
        .unwrap();

    assert!(result.outcomes[0].verified);
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| e.stage == Some(Stage::Verifying)));
}

#[test]
fn test_shared_name_exports_first_match() {
    let mut fx = Fixture::new();
    fx.add_vm("vm-a", "web");
    fx.add_vm("vm-b", "web");
    fx.add_disk("vm-a", "disk-a", "0", &pattern(4096, 1));
    fx.add_disk("vm-b", "disk-b", "0", &pattern(4096, 2));
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["web".to_string()]))
        .unwrap();

    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].disk_uuid, "disk-a");

    let events = events.lock().unwrap();
    let warning = events
        .iter()
        .find(|e| e.kind == EventKind::Warning)
        .unwrap();
    assert!(warning.message.contains("skipping vm-b"));
}

#[test]
fn test_empty_slot_is_skipped_with_warning() {
    let mut fx = Fixture::new();
    fx.add_vm("vm-1", "web");
    fx.add_empty_slot("vm-1", "1");
    fx.add_disk("vm-1", "disk-a", "0", &pattern(4096, 1));
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]))
        .unwrap();

    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.envelope.disks().len(), 1);
    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Warning && e.message.contains("Device 1 has no disk")));
}

#[test]
fn test_unnamed_disk_gets_positional_label() {
    let mut fx = Fixture::new();
    fx.add_vm("vm-1", "web");
    fx.add_disk("vm-1", "disk-a", "0", &pattern(4096, 1));
    fx.add_disk("vm-1", "disk-b", "1", &pattern(4096, 2));
    fx.inventory.disks[1].name_label = None;
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let result = exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]))
        .unwrap();

    let vs = &result.envelope.virtual_systems()[0];
    let names: Vec<&str> = vs
        .items_of_type(resource_type::DISK_DRIVE)
        .iter()
        .map(|item| item.element_name.as_str())
        .collect();
    assert_eq!(names, vec!["disk-a label", "Virtual Disk 1"]);
}

#[test]
fn test_guest_os_section() {
    let (mut fx, _) = single_vm_fixture();
    fx.set_guest_metrics(
        "vm-1",
        &[
            (
                "name",
                "Microsoft Windows Server 2008 R2 Standard|C:\\Windows|\\Device\\Harddisk0\\Partition2",
            ),
            ("major", "6"),
            ("minor", "1"),
        ],
    );
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let flags = ExportFlags {
        metadata_only: true,
        ..Default::default()
    };
    exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]).with_flags(flags))
        .unwrap();

    let xml = fs::read_to_string(fx.out_dir().join("web.ovf")).unwrap();
    assert!(xml.contains("<ovf:OperatingSystemSection ovf:id=\"102\">"));
    assert!(xml.contains("<ovf:Info>Version 6.1</ovf:Info>"));
    assert!(xml.contains(
        "<ovf:Description>Microsoft Windows Server 2008 R2 Standard</ovf:Description>"
    ));
}

#[test]
fn test_vendor_settings_and_memory_rounding() {
    let (mut fx, _) = single_vm_fixture();
    {
        let vm = &mut fx.entry("vm-1").vm;
        vm.memory_dynamic_max = 1536 * MB + 500_000;
        vm.hvm_boot_policy = None;
        vm.pv_bootloader = Some("pygrub".to_string());
        vm.platform.insert("acpi".to_string(), "1".to_string());
        vm.platform.insert("nx".to_string(), "true".to_string());
    }
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let flags = ExportFlags {
        metadata_only: true,
        ..Default::default()
    };
    exporter
        .run(ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]).with_flags(flags))
        .unwrap();

    let xml = fs::read_to_string(fx.out_dir().join("web.ovf")).unwrap();
    assert!(xml.contains("<rasd:VirtualQuantity>1536</rasd:VirtualQuantity>"));
    assert!(xml.contains("<vssd:VirtualSystemType>xen-3.0-x86_64</vssd:VirtualSystemType>"));
    assert!(xml.contains("Name=\"platform\""));
    assert!(xml.contains("<xenovf:Value>acpi=1;nx=true;</xenovf:Value>"));
    assert!(xml.contains("Name=\"PV_bootloader\""));
    assert!(!xml.contains("Name=\"HVM_boot_policy\""));
}

#[test]
fn test_several_vms_form_a_collection() {
    let mut fx = Fixture::new();
    fx.inventory.platform.supports_startup_options = true;
    fx.add_vm("vm-a", "web").order = 1;
    {
        let db = fx.add_vm("vm-b", "db");
        db.order = 2;
        db.start_delay = 30;
    }
    fx.add_disk("vm-a", "disk-a", "0", &pattern(70_000, 1));
    fx.add_disk("vm-b", "disk-b", "0", &pattern(90_000, 2));
    fx.add_interface("vm-a", "net-1", "aa:00:00:00:00:01");
    fx.add_interface("vm-b", "net-1", "aa:00:00:00:00:02");
    let backend = fx.backend();
    let channel = backend.channel();
    let mut exporter = Exporter::new(backend, channel, test_config(), Default::default()).unwrap();

    let result = exporter
        .run(ExportJob::new(
            fx.out_dir(),
            "stack",
            vec!["web".to_string(), "db".to_string()],
        ))
        .unwrap();

    assert_eq!(result.outcomes.len(), 2);
    assert_eq!(result.envelope.virtual_systems().len(), 2);
    assert_eq!(result.envelope.networks().len(), 1);
    assert_eq!(result.envelope.files().len(), 2);

    let xml = fs::read_to_string(fx.out_dir().join("stack.ovf")).unwrap();
    assert!(xml.contains("<ovf:VirtualSystemCollection ovf:id=\"stack\">"));
    assert!(xml.contains("ovf:order=\"2\""));
    assert!(xml.contains("ovf:startDelay=\"30\""));
    assert_eq!(xml.matches("<ovf:StartupSection>").count(), 1);
    let web = xml.find("<ovf:Name>web</ovf:Name>").unwrap();
    let db = xml.find("<ovf:Name>db</ovf:Name>").unwrap();
    assert!(web < db);
}

#[test]
fn test_cancelled_job_stops_before_copying() {
    let (fx, _) = single_vm_fixture();
    let backend = fx.backend();
    let channel = backend.channel();
    let (sink, events) = recording_sink();
    let mut exporter = Exporter::new(backend, channel, test_config(), sink).unwrap();

    let job = ExportJob::new(fx.out_dir(), "web", vec!["vm-1".to_string()]);
    job.cancel.cancel();
    let err = exporter.run(job).unwrap_err();

    assert!(err.is_cancelled());
    assert!(!fx.out_dir().join("disk-a.img").exists());
    assert!(!fx.out_dir().join("web.ovf").exists());
    let events = events.lock().unwrap();
    assert!(!events.iter().any(|e| e.kind == EventKind::Failure));
}

#[test]
fn test_get_vm_info() {
    let (mut fx, _) = single_vm_fixture();
    fx.add_disk("vm-1", "disk-b", "1", &pattern(1000, 9));
    fx.inventory.disks[1].name_label = Some(String::new());
    let backend = fx.backend();

    let info = get_vm_info(&backend, "web").unwrap();
    assert_eq!(info.name, "web");
    assert_eq!(info.uuid, "vm-1");
    assert_eq!(info.power_state, PowerState::Halted);
    assert_eq!(info.cpus, 2);
    assert_eq!(info.memory_mb, 4096);
    assert_eq!(info.cdrom_count, 1);
    assert_eq!(info.interface_count, 1);
    assert_eq!(info.disks.len(), 2);
    assert_eq!(info.disks[0].label, "disk-a label");
    assert!(info.disks[0].bootable);
    assert_eq!(info.disks[1].label, "Virtual Disk 1");
    assert_eq!(info.disks[1].user_device, "1");
    assert_eq!(info.total_disk_size, 201_000);

    assert!(matches!(
        get_vm_info(&backend, "missing").unwrap_err(),
        Error::NotFound { .. }
    ));
}
