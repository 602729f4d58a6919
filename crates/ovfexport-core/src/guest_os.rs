//! Guest operating system identification.
//!
//! Guest metrics report the running OS as free text, e.g.
//! `"Microsoft Windows Server 2008 R2 Standard|C:\Windows|\Device\Harddisk0\Partition2"`.
//! The text is matched against a static table of CIM operating system ids.

use std::collections::BTreeMap;

use crate::ovf::OperatingSystem;

/// CIM id for an operating system the table does not know.
pub const OS_OTHER: u16 = 1;

/// Info string used when the metrics carry no major/minor version.
pub const DEFAULT_OS_INFO: &str = "Guest Operating System";

/// Lowercase substrings and their CIM ids. Checked in order, so more
/// specific names come before the names they contain.
const OS_TABLE: &[(&str, u16)] = &[
    ("server 2012 r2", 115),
    ("server 2012", 112),
    ("2008 r2", 102),
    ("server 2008", 74),
    ("server 2003", 69),
    ("windows 8", 113),
    ("windows 7", 104),
    ("vista", 73),
    ("xp", 67),
    ("windows 2000", 58),
    ("red hat enterprise linux", 79),
    ("centos", 105),
    ("oracle linux", 107),
    ("suse linux enterprise server", 84),
    ("suse", 82),
    ("ubuntu", 92),
    ("debian", 94),
    ("freebsd", 42),
    ("netbsd", 43),
    ("solaris", 29),
    ("linux", 36),
];

/// Maps a reported OS name to its CIM id, falling back to [`OS_OTHER`].
pub fn os_id(name: &str) -> u16 {
    let name = name.to_ascii_lowercase();
    OS_TABLE
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .map(|&(_, id)| id)
        .unwrap_or(OS_OTHER)
}

/// Builds the operating system entry from a guest metrics `os_version` map.
///
/// Returns `None` when no key equals "name" (ignoring case).
pub fn identify(os_version: &BTreeMap<String, String>) -> Option<OperatingSystem> {
    let value = os_version
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("name"))
        .map(|(_, value)| value)?;

    let version = match (os_version.get("major"), os_version.get("minor")) {
        (Some(major), Some(minor)) => format!("Version {}.{}", major, minor),
        _ => DEFAULT_OS_INFO.to_string(),
    };
    let name = value.split('|').next().unwrap_or_default().to_string();

    Some(OperatingSystem {
        id: os_id(value),
        name,
        version,
    })
}
