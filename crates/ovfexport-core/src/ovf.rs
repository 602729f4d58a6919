//! OVF envelope construction.
//!
//! [`Envelope`] is the in-memory metadata tree of a package. The exporter
//! fills it in through the builder methods below, patches image filenames
//! when the disk copy had to rename a file, finalizes it and serialises it
//! to an OVF descriptor.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use uuid::Uuid;

use crate::error::{Error, Result};

/// OVF envelope namespace.
pub const OVF_NAMESPACE: &str = "http://schemas.dmtf.org/ovf/envelope/1";
const RASD_NAMESPACE: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData";
const VSSD_NAMESPACE: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const VENDOR_NAMESPACE: &str = "http://schemas.citrix.com/ovf/envelope/1";

/// CIM resource types used by hardware items.
pub mod resource_type {
    pub const PROCESSOR: u16 = 3;
    pub const MEMORY: u16 = 4;
    pub const ETHERNET_ADAPTER: u16 = 10;
    pub const CD_DRIVE: u16 = 16;
    pub const DISK_DRIVE: u16 = 19;
}

/// A file shipped alongside the descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub id: String,
    /// Filename relative to the descriptor.
    pub href: String,
    pub size: u64,
}

/// An entry of the envelope's disk section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSectionEntry {
    pub disk_id: String,
    pub file_ref: String,
    pub capacity: u64,
    pub populated_size: u64,
}

/// An entry of the envelope's network section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Guest operating system identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatingSystem {
    /// CIM operating system id.
    pub id: u16,
    pub name: String,
    pub version: String,
}

/// Virtual system setting data of a hardware section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSettings {
    pub element_name: String,
    pub caption: String,
    pub description: String,
    pub instance_id: String,
    pub virtual_system_type: String,
}

/// Startup ordering of a virtual system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartupOptions {
    pub order: u64,
    pub start_delay: u64,
    pub shutdown_delay: u64,
}

/// Arguments of [`Envelope::add_network_adapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAdapter {
    /// Unique id of the network the adapter attaches to.
    pub network_id: String,
    pub name: String,
    pub description: String,
    pub mac: String,
}

/// Arguments of [`Envelope::add_disk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub disk_id: String,
    pub filename: String,
    pub bootable: bool,
    pub name: String,
    pub description: String,
    /// Allocated size in bytes.
    pub physical_size: u64,
    /// Logical size in bytes.
    pub capacity: u64,
}

/// A vendor-specific key/value setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueSetting {
    pub key: String,
    pub value: String,
    pub description: String,
}

/// A resource allocation item of a hardware section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HardwareItem {
    pub instance_id: String,
    pub resource_type: u16,
    pub element_name: String,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub virtual_quantity: Option<u64>,
    pub allocation_units: Option<String>,
    /// Comma-separated `key=value` connection properties.
    pub connection: Vec<String>,
    pub address: Option<String>,
    pub host_resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareSection {
    pub id: String,
    pub system: Option<SystemSettings>,
    pub items: Vec<HardwareItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualSystem {
    pub id: String,
    pub name: String,
    pub operating_system: Option<OperatingSystem>,
    pub hardware: Vec<HardwareSection>,
    pub startup: Option<StartupOptions>,
    pub settings: Vec<OpaqueSetting>,
}

impl VirtualSystem {
    /// Looks up a hardware item by instance id across all sections.
    pub fn item(&self, instance_id: &str) -> Option<&HardwareItem> {
        self.hardware
            .iter()
            .flat_map(|hw| hw.items.iter())
            .find(|item| item.instance_id == instance_id)
    }

    /// All items of the given resource type, in insertion order.
    pub fn items_of_type(&self, resource_type: u16) -> Vec<&HardwareItem> {
        self.hardware
            .iter()
            .flat_map(|hw| hw.items.iter())
            .filter(|item| item.resource_type == resource_type)
            .collect()
    }
}

/// The metadata tree of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    name: String,
    files: Vec<FileReference>,
    disks: Vec<DiskSectionEntry>,
    networks: Vec<NetworkEntry>,
    systems: Vec<VirtualSystem>,
    finalized: bool,
}

impl Envelope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
            disks: Vec::new(),
            networks: Vec::new(),
            systems: Vec::new(),
            finalized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn files(&self) -> &[FileReference] {
        &self.files
    }

    pub fn disks(&self) -> &[DiskSectionEntry] {
        &self.disks
    }

    pub fn networks(&self) -> &[NetworkEntry] {
        &self.networks
    }

    pub fn virtual_systems(&self) -> &[VirtualSystem] {
        &self.systems
    }

    pub fn virtual_system(&self, vs_id: &str) -> Option<&VirtualSystem> {
        self.systems.iter().find(|vs| vs.id == vs_id)
    }

    /// The file reference with the given href, if any.
    pub fn file_by_href(&self, href: &str) -> Option<&FileReference> {
        self.files.iter().find(|f| f.href == href)
    }

    fn system_mut(&mut self, vs_id: &str) -> Result<&mut VirtualSystem> {
        self.systems
            .iter_mut()
            .find(|vs| vs.id == vs_id)
            .ok_or_else(|| Error::package(format!("no virtual system with id {}", vs_id)))
    }

    fn first_hardware_mut(&mut self, vs_id: &str) -> Result<&mut HardwareSection> {
        self.system_mut(vs_id)?
            .hardware
            .first_mut()
            .ok_or_else(|| {
                Error::package(format!("virtual system {} has no hardware section", vs_id))
            })
    }

    /// Adds a virtual system and returns its id.
    pub fn add_virtual_system(&mut self, name: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.systems.push(VirtualSystem {
            id: id.clone(),
            name: name.into(),
            operating_system: None,
            hardware: Vec::new(),
            startup: None,
            settings: Vec::new(),
        });
        id
    }

    /// Adds a virtual hardware section to a system and returns its id.
    pub fn add_hardware_section(&mut self, vs_id: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.system_mut(vs_id)?.hardware.push(HardwareSection {
            id: id.clone(),
            system: None,
            items: Vec::new(),
        });
        Ok(id)
    }

    pub fn set_operating_system(&mut self, vs_id: &str, os: OperatingSystem) -> Result<()> {
        self.system_mut(vs_id)?.operating_system = Some(os);
        Ok(())
    }

    pub fn set_system_settings(
        &mut self,
        vs_id: &str,
        hw_id: &str,
        settings: SystemSettings,
    ) -> Result<()> {
        let hw = self
            .system_mut(vs_id)?
            .hardware
            .iter_mut()
            .find(|hw| hw.id == hw_id)
            .ok_or_else(|| Error::package(format!("no hardware section with id {}", hw_id)))?;
        hw.system = Some(settings);
        Ok(())
    }

    /// Sets the processor count, replacing any previous value.
    pub fn set_cpus(&mut self, vs_id: &str, count: u64) -> Result<()> {
        let item = HardwareItem {
            instance_id: Uuid::new_v4().to_string(),
            resource_type: resource_type::PROCESSOR,
            element_name: format!("{} virtual CPU(s)", count),
            virtual_quantity: Some(count),
            allocation_units: Some("count".to_string()),
            ..Default::default()
        };
        self.replace_singleton(vs_id, item)
    }

    /// Sets the memory size in `unit`, replacing any previous value.
    pub fn set_memory(&mut self, vs_id: &str, value: u64, unit: &str) -> Result<()> {
        let item = HardwareItem {
            instance_id: Uuid::new_v4().to_string(),
            resource_type: resource_type::MEMORY,
            element_name: format!("{} {} of memory", value, unit),
            virtual_quantity: Some(value),
            allocation_units: Some(unit.to_string()),
            ..Default::default()
        };
        self.replace_singleton(vs_id, item)
    }

    fn replace_singleton(&mut self, vs_id: &str, item: HardwareItem) -> Result<()> {
        let hw = self.first_hardware_mut(vs_id)?;
        match hw
            .items
            .iter_mut()
            .find(|existing| existing.resource_type == item.resource_type)
        {
            Some(existing) => *existing = item,
            None => hw.items.push(item),
        }
        Ok(())
    }

    /// Adds an ethernet adapter and, once per network, a network entry.
    /// Returns the adapter's item id.
    pub fn add_network_adapter(&mut self, vs_id: &str, adapter: NetworkAdapter) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let item = HardwareItem {
            instance_id: id.clone(),
            resource_type: resource_type::ETHERNET_ADAPTER,
            element_name: adapter.name.clone(),
            caption: Some("Ethernet adapter".to_string()),
            description: Some(adapter.description.clone()),
            connection: vec![adapter.network_id.clone()],
            address: Some(adapter.mac.clone()),
            ..Default::default()
        };
        self.first_hardware_mut(vs_id)?.items.push(item);

        if !self.networks.iter().any(|n| n.id == adapter.network_id) {
            self.networks.push(NetworkEntry {
                id: adapter.network_id,
                name: adapter.name,
                description: adapter.description,
            });
        }
        Ok(id)
    }

    pub fn add_startup_section(&mut self, vs_id: &str, startup: StartupOptions) -> Result<()> {
        self.system_mut(vs_id)?.startup = Some(startup);
        Ok(())
    }

    /// Adds a file reference, a disk section entry and a disk drive item.
    /// Returns the item id, which is the disk id.
    pub fn add_disk(&mut self, vs_id: &str, disk: DiskEntry) -> Result<String> {
        if self.files.iter().any(|f| f.href == disk.filename) {
            return Err(Error::package(format!(
                "file '{}' is already referenced",
                disk.filename
            )));
        }

        let mut connection = Vec::new();
        if disk.bootable {
            connection.push("bootable=true".to_string());
        }
        let item = HardwareItem {
            instance_id: disk.disk_id.clone(),
            resource_type: resource_type::DISK_DRIVE,
            element_name: disk.name,
            caption: Some("Hard disk image".to_string()),
            description: Some(disk.description),
            connection,
            host_resource: Some(format!("ovf:/disk/{}", disk.disk_id)),
            ..Default::default()
        };
        self.first_hardware_mut(vs_id)?.items.push(item);

        let file_id = format!("file-{}", disk.disk_id);
        self.files.push(FileReference {
            id: file_id.clone(),
            href: disk.filename,
            size: disk.physical_size,
        });
        self.disks.push(DiskSectionEntry {
            disk_id: disk.disk_id.clone(),
            file_ref: file_id,
            capacity: disk.capacity,
            populated_size: disk.physical_size,
        });
        Ok(disk.disk_id)
    }

    /// Adds a CD drive item and returns its id.
    pub fn add_cdrom(
        &mut self,
        vs_id: &str,
        device_id: &str,
        caption: &str,
        description: &str,
    ) -> Result<String> {
        let item = HardwareItem {
            instance_id: device_id.to_string(),
            resource_type: resource_type::CD_DRIVE,
            element_name: caption.to_string(),
            caption: Some(caption.to_string()),
            description: Some(description.to_string()),
            ..Default::default()
        };
        self.first_hardware_mut(vs_id)?.items.push(item);
        Ok(device_id.to_string())
    }

    /// Binds an item to the user-visible device number of its slot.
    pub fn set_target_device(&mut self, vs_id: &str, item_id: &str, device: &str) -> Result<()> {
        let item = self
            .system_mut(vs_id)?
            .hardware
            .iter_mut()
            .flat_map(|hw| hw.items.iter_mut())
            .find(|item| item.instance_id == item_id)
            .ok_or_else(|| Error::package(format!("no hardware item with id {}", item_id)))?;
        item.connection.retain(|c| !c.starts_with("device="));
        item.connection.push(format!("device={}", device));
        Ok(())
    }

    pub fn add_opaque_setting(
        &mut self,
        vs_id: &str,
        key: &str,
        value: &str,
        description: &str,
    ) -> Result<()> {
        self.system_mut(vs_id)?.settings.push(OpaqueSetting {
            key: key.to_string(),
            value: value.to_string(),
            description: description.to_string(),
        });
        Ok(())
    }

    /// Renames the file reference `old` to `new`.
    ///
    /// Exactly one reference must carry `old`, and the envelope must not be
    /// finalized yet.
    pub fn update_filename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::package(format!(
                "cannot rename '{}': envelope is finalized",
                old
            )));
        }
        let matches = self.files.iter().filter(|f| f.href == old).count();
        if matches != 1 {
            return Err(Error::package(format!(
                "expected exactly one file reference '{}', found {}",
                old, matches
            )));
        }
        if self.files.iter().any(|f| f.href == new) {
            return Err(Error::package(format!("file '{}' is already referenced", new)));
        }
        for file in self.files.iter_mut().filter(|f| f.href == old) {
            file.href = new.to_string();
        }
        Ok(())
    }

    /// Points the file reference of disk `disk_id` at `new`.
    pub fn rename_disk_file(&mut self, disk_id: &str, new: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::package(format!(
                "cannot rename the file of disk {}: envelope is finalized",
                disk_id
            )));
        }
        let file_ref = self
            .disks
            .iter()
            .find(|d| d.disk_id == disk_id)
            .map(|d| d.file_ref.clone())
            .ok_or_else(|| Error::package(format!("no disk with id {}", disk_id)))?;
        if self.files.iter().any(|f| f.href == new && f.id != file_ref) {
            return Err(Error::package(format!("file '{}' is already referenced", new)));
        }
        let file = self
            .files
            .iter_mut()
            .find(|f| f.id == file_ref)
            .ok_or_else(|| Error::package(format!("disk {} has no file reference", disk_id)))?;
        file.href = new.to_string();
        Ok(())
    }

    /// Checks the references of the tree and seals it.
    pub fn finalize(&mut self) -> Result<()> {
        let mut hrefs = HashSet::new();
        for file in &self.files {
            if !hrefs.insert(file.href.as_str()) {
                return Err(Error::package(format!(
                    "file '{}' is referenced more than once",
                    file.href
                )));
            }
        }
        for disk in &self.disks {
            if !self.files.iter().any(|f| f.id == disk.file_ref) {
                return Err(Error::package(format!(
                    "disk {} references missing file {}",
                    disk.disk_id, disk.file_ref
                )));
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Combines several envelopes into one named `name`.
    ///
    /// Systems keep their order; networks shared between envelopes appear
    /// once. The result is not finalized.
    pub fn merge(envelopes: Vec<Envelope>, name: impl Into<String>) -> Envelope {
        let mut merged = Envelope::new(name);
        for envelope in envelopes {
            merged.files.extend(envelope.files);
            merged.disks.extend(envelope.disks);
            for network in envelope.networks {
                if !merged.networks.iter().any(|n| n.id == network.id) {
                    merged.networks.push(network);
                }
            }
            merged.systems.extend(envelope.systems);
        }
        merged
    }

    /// Writes the descriptor to `path`.
    pub fn save_as(&self, path: &Path) -> Result<()> {
        let xml = self.to_xml()?;
        fs::write(path, xml).map_err(|e| Error::io(e, path))?;
        tracing::debug!(path = %path.display(), "descriptor saved");
        Ok(())
    }

    /// Serialises the envelope to an OVF descriptor.
    pub fn to_xml(&self) -> Result<String> {
        let mut out = XmlOut::new();
        out.decl()?;

        out.start(
            "ovf:Envelope",
            &[
                ("xmlns", OVF_NAMESPACE),
                ("xmlns:ovf", OVF_NAMESPACE),
                ("xmlns:rasd", RASD_NAMESPACE),
                ("xmlns:vssd", VSSD_NAMESPACE),
                ("xmlns:xsi", XSI_NAMESPACE),
                ("xmlns:xenovf", VENDOR_NAMESPACE),
                ("ovf:version", "1.0.0"),
            ],
        )?;

        out.start("ovf:References", &[])?;
        for file in &self.files {
            let size = file.size.to_string();
            out.empty(
                "ovf:File",
                &[
                    ("ovf:id", file.id.as_str()),
                    ("ovf:href", file.href.as_str()),
                    ("ovf:size", size.as_str()),
                ],
            )?;
        }
        out.end("ovf:References")?;

        if !self.disks.is_empty() {
            out.start("ovf:DiskSection", &[])?;
            out.text_element("ovf:Info", "Virtual disk information")?;
            for disk in &self.disks {
                let capacity = disk.capacity.to_string();
                let populated = disk.populated_size.to_string();
                out.empty(
                    "ovf:Disk",
                    &[
                        ("ovf:diskId", disk.disk_id.as_str()),
                        ("ovf:fileRef", disk.file_ref.as_str()),
                        ("ovf:capacity", capacity.as_str()),
                        ("ovf:populatedSize", populated.as_str()),
                    ],
                )?;
            }
            out.end("ovf:DiskSection")?;
        }

        if !self.networks.is_empty() {
            out.start("ovf:NetworkSection", &[])?;
            out.text_element("ovf:Info", "List of logical networks")?;
            for network in &self.networks {
                out.start("ovf:Network", &[("ovf:name", network.id.as_str())])?;
                out.text_element("ovf:Description", &network.description)?;
                out.end("ovf:Network")?;
            }
            out.end("ovf:NetworkSection")?;
        }

        if self.systems.len() > 1 {
            out.start("ovf:VirtualSystemCollection", &[("ovf:id", self.name.as_str())])?;
            out.text_element("ovf:Info", "Virtual appliance")?;
            out.text_element("ovf:Name", &self.name)?;
            let startups: Vec<&VirtualSystem> =
                self.systems.iter().filter(|vs| vs.startup.is_some()).collect();
            if !startups.is_empty() {
                out.start("ovf:StartupSection", &[])?;
                out.text_element("ovf:Info", "Startup order of the virtual systems")?;
                for vs in startups {
                    write_startup_item(&mut out, vs)?;
                }
                out.end("ovf:StartupSection")?;
            }
            for vs in &self.systems {
                write_virtual_system(&mut out, vs, false)?;
            }
            out.end("ovf:VirtualSystemCollection")?;
        } else {
            for vs in &self.systems {
                write_virtual_system(&mut out, vs, true)?;
            }
        }

        out.end("ovf:Envelope")?;
        out.finish()
    }
}

fn write_startup_item(out: &mut XmlOut, vs: &VirtualSystem) -> Result<()> {
    if let Some(startup) = &vs.startup {
        let order = startup.order.to_string();
        let start = startup.start_delay.to_string();
        let stop = startup.shutdown_delay.to_string();
        out.empty(
            "ovf:Item",
            &[
                ("ovf:id", vs.id.as_str()),
                ("ovf:order", order.as_str()),
                ("ovf:startDelay", start.as_str()),
                ("ovf:stopDelay", stop.as_str()),
            ],
        )?;
    }
    Ok(())
}

fn write_virtual_system(out: &mut XmlOut, vs: &VirtualSystem, own_startup: bool) -> Result<()> {
    out.start("ovf:VirtualSystem", &[("ovf:id", vs.id.as_str())])?;
    out.text_element("ovf:Info", "A virtual machine")?;
    out.text_element("ovf:Name", &vs.name)?;

    if own_startup && vs.startup.is_some() {
        out.start("ovf:StartupSection", &[])?;
        out.text_element("ovf:Info", "Startup options of the virtual system")?;
        write_startup_item(out, vs)?;
        out.end("ovf:StartupSection")?;
    }

    if let Some(os) = &vs.operating_system {
        let id = os.id.to_string();
        out.start("ovf:OperatingSystemSection", &[("ovf:id", id.as_str())])?;
        out.text_element("ovf:Info", &os.version)?;
        out.text_element("ovf:Description", &os.name)?;
        out.end("ovf:OperatingSystemSection")?;
    }

    for hw in &vs.hardware {
        out.start("ovf:VirtualHardwareSection", &[("ovf:id", hw.id.as_str())])?;
        out.text_element("ovf:Info", "Virtual hardware requirements")?;

        if let Some(system) = &hw.system {
            out.start("ovf:System", &[])?;
            out.text_element("vssd:Caption", &system.caption)?;
            out.text_element("vssd:Description", &system.description)?;
            out.text_element("vssd:ElementName", &system.element_name)?;
            out.text_element("vssd:InstanceID", &system.instance_id)?;
            out.text_element("vssd:VirtualSystemType", &system.virtual_system_type)?;
            out.end("ovf:System")?;
        }

        for item in &hw.items {
            write_item(out, item)?;
        }

        for setting in &vs.settings {
            out.start(
                "xenovf:VirtualSystemOtherConfigurationData",
                &[("Name", setting.key.as_str()), ("ovf:required", "false")],
            )?;
            out.text_element("xenovf:Info", &setting.description)?;
            out.text_element("xenovf:Value", &setting.value)?;
            out.end("xenovf:VirtualSystemOtherConfigurationData")?;
        }

        out.end("ovf:VirtualHardwareSection")?;
    }

    out.end("ovf:VirtualSystem")
}

fn write_item(out: &mut XmlOut, item: &HardwareItem) -> Result<()> {
    out.start("ovf:Item", &[])?;
    if let Some(address) = &item.address {
        out.text_element("rasd:Address", address)?;
    }
    if let Some(units) = &item.allocation_units {
        out.text_element("rasd:AllocationUnits", units)?;
    }
    if let Some(caption) = &item.caption {
        out.text_element("rasd:Caption", caption)?;
    }
    if !item.connection.is_empty() {
        out.text_element("rasd:Connection", &item.connection.join(","))?;
    }
    if let Some(description) = &item.description {
        out.text_element("rasd:Description", description)?;
    }
    out.text_element("rasd:ElementName", &item.element_name)?;
    if let Some(host) = &item.host_resource {
        out.text_element("rasd:HostResource", host)?;
    }
    out.text_element("rasd:InstanceID", &item.instance_id)?;
    out.text_element("rasd:ResourceType", &item.resource_type.to_string())?;
    if let Some(quantity) = item.virtual_quantity {
        out.text_element("rasd:VirtualQuantity", &quantity.to_string())?;
    }
    out.end("ovf:Item")
}

/// Thin wrapper over the quick-xml writer mapping its errors.
struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::package(format!("failed to write descriptor: {}", e)))
    }

    fn decl(&mut self) -> Result<()> {
        self.write(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
    }

    fn start(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for &attr in attrs {
            elem.push_attribute(attr);
        }
        self.write(Event::Start(elem))
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> Result<()> {
        let mut elem = BytesStart::new(name);
        for &attr in attrs {
            elem.push_attribute(attr);
        }
        self.write(Event::Empty(elem))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, text: &str) -> Result<()> {
        self.start(name, &[])?;
        self.write(Event::Text(BytesText::new(text)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| Error::package(format!("descriptor is not valid UTF-8: {}", e)))
    }
}
