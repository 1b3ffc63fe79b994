//! Resolves a user-supplied snapshot name to the origin and exception-store
//! devices it's built from, by parsing the text output of the device-mapper
//! tooling. The regex parsers are kept private to this module (per the
//! Design Note on isolating them behind a replaceable interface) so a future
//! native device-mapper binding only has to satisfy [`DmTableSource`].

use std::collections::HashMap;
use std::process::Command;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{DeviceLocatorError, Error};

/// One row of `dmsetup table`: a linear span of a dm device, backed by
/// whatever `kind` (e.g. `"snapshot"`, `"linear"`) names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
    pub kind: String,
    pub args: Vec<String>,
}

/// The origin and exception-store dm names backing a resolved snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSnapshot {
    pub origin_dm: String,
    pub exception_dm: String,
}

/// Supplies the raw text this module parses. Production code shells out to
/// `dmsetup`; tests supply canned fixtures so the parsers can be exercised
/// without a real device-mapper stack.
pub trait DmTableSource {
    /// Raw stdout of `dmsetup ls`.
    fn dm_list(&self) -> Result<String, Error>;
    /// Raw stdout of `dmsetup table`.
    fn dm_table(&self) -> Result<String, Error>;
}

/// The production [`DmTableSource`]: shells out to the real `dmsetup` binary.
pub struct ShellDmSource;

impl DmTableSource for ShellDmSource {
    fn dm_list(&self) -> Result<String, Error> {
        run_dmsetup(&["ls"])
    }

    fn dm_table(&self) -> Result<String, Error> {
        run_dmsetup(&["table"])
    }
}

fn run_dmsetup(args: &[&str]) -> Result<String, Error> {
    let output = Command::new("dmsetup").args(args).output().map_err(|source| {
        DeviceLocatorError::CommandFailed { command: "dmsetup", source }
    })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Turns any of the accepted device-name forms into the canonical
/// device-mapper name: `/dev/mapper/X` → `X`; `/dev/vg/lv` or `vg/lv` →
/// `vg`(with `-` doubled)`-`lv`(with `-` doubled)`; anything else is assumed
/// to already be a dm name and is returned unchanged.
pub fn canonicalize_dm_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("/dev/mapper/") {
        return rest.to_string();
    }

    let without_dev_prefix = name.strip_prefix("/dev/").unwrap_or(name);
    if let Some((vg, lv)) = without_dev_prefix.split_once('/') {
        return format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"));
    }

    name.to_string()
}

lazy_static! {
    static ref LIST_LINE: Regex =
        Regex::new(r"^(\S+)\s+\((\d+)(?:, |:)(\d+)\)$").unwrap();
    static ref TABLE_LINE: Regex =
        Regex::new(r"^(\S+):\s+(\d+)\s+(\d+)\s+(\S+)\s*(.*)$").unwrap();
}

/// Parses `dmsetup ls` output into a name → (major, minor) map. Lines that
/// don't match the expected shape (e.g. blank lines) are silently skipped,
/// matching the original tool's tolerance of stray output.
fn parse_dm_list(text: &str) -> HashMap<String, (u32, u32)> {
    let mut out = HashMap::new();
    for line in text.lines() {
        if let Some(caps) = LIST_LINE.captures(line) {
            let name = caps[1].to_string();
            let major: u32 = caps[2].parse().unwrap();
            let minor: u32 = caps[3].parse().unwrap();
            out.insert(name, (major, minor));
        }
    }
    out
}

/// Parses `dmsetup table` output into a name → segments map.
fn parse_dm_table(text: &str) -> HashMap<String, Vec<Segment>> {
    let mut out: HashMap<String, Vec<Segment>> = HashMap::new();
    for line in text.lines() {
        if let Some(caps) = TABLE_LINE.captures(line) {
            let name = caps[1].to_string();
            let segment = Segment {
                offset: caps[2].parse().unwrap(),
                length: caps[3].parse().unwrap(),
                kind: caps[4].to_string(),
                args: caps[5].split_whitespace().map(str::to_string).collect(),
            };
            out.entry(name).or_default().push(segment);
        }
    }
    out
}

fn dm_name_for_devnum(devnum: &str, list: &HashMap<String, (u32, u32)>) -> Option<String> {
    let (major_str, minor_str) = devnum.split_once(':')?;
    let major: u32 = major_str.parse().ok()?;
    let minor: u32 = minor_str.parse().ok()?;
    list.iter()
        .find(|(_, &(maj, min))| maj == major && min == minor)
        .map(|(name, _)| name.clone())
}

/// Resolves `name` (in any accepted form) to its origin and exception-store
/// dm devices.
pub fn locate<S: DmTableSource>(source: &S, name: &str) -> Result<ResolvedSnapshot, Error> {
    let canonical = canonicalize_dm_name(name);

    let list = parse_dm_list(&source.dm_list()?);
    let table = parse_dm_table(&source.dm_table()?);

    let segments = table
        .get(&canonical)
        .ok_or_else(|| DeviceLocatorError::SnapshotNotFound(canonical.clone()))?;

    let snapshot_segment = segments
        .first()
        .filter(|segment| segment.kind == "snapshot")
        .ok_or_else(|| DeviceLocatorError::NotASnapshot(canonical.clone()))?;

    let origin_devnum = snapshot_segment
        .args
        .first()
        .ok_or_else(|| DeviceLocatorError::NotASnapshot(canonical.clone()))?;
    let exception_devnum = snapshot_segment
        .args
        .get(1)
        .ok_or_else(|| DeviceLocatorError::NotASnapshot(canonical.clone()))?;

    let origin_dm = dm_name_for_devnum(origin_devnum, &list).ok_or_else(|| {
        DeviceLocatorError::OriginMissing { snapshot: canonical.clone(), devnum: origin_devnum.clone() }
    })?;
    let exception_dm = dm_name_for_devnum(exception_devnum, &list).ok_or_else(|| {
        DeviceLocatorError::ExceptionMissing { snapshot: canonical.clone(), devnum: exception_devnum.clone() }
    })?;

    Ok(ResolvedSnapshot { origin_dm, exception_dm })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDmSource {
        list: &'static str,
        table: &'static str,
    }

    impl DmTableSource for FixedDmSource {
        fn dm_list(&self) -> Result<String, Error> {
            Ok(self.list.to_string())
        }

        fn dm_table(&self) -> Result<String, Error> {
            Ok(self.table.to_string())
        }
    }

    #[test]
    fn s1_canonicalizes_mapper_path() {
        assert_eq!(canonicalize_dm_name("/dev/mapper/xyz"), "xyz");
    }

    #[test]
    fn s1_canonicalizes_vg_lv_path() {
        assert_eq!(canonicalize_dm_name("/dev/vg0/lv0"), "vg0-lv0");
    }

    #[test]
    fn s1_canonicalizes_bare_vg_lv() {
        assert_eq!(canonicalize_dm_name("foo-bar/baz"), "foo--bar-baz");
    }

    #[test]
    fn canonicalize_bare_name_is_unchanged() {
        assert_eq!(canonicalize_dm_name("some-dm-name"), "some-dm-name");
    }

    #[test]
    fn parses_list_output_with_comma_and_colon_forms() {
        let list = parse_dm_list("myvg-mylv (253, 0)\nother (253:1)\nnot a match\n");
        assert_eq!(list.get("myvg-mylv"), Some(&(253, 0)));
        assert_eq!(list.get("other"), Some(&(253, 1)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn parses_table_output() {
        let table = parse_dm_table("myvg-snap: 0 2097152 snapshot 253:2 253:3 P 8\n");
        let segments = table.get("myvg-snap").unwrap();
        assert_eq!(segments[0].kind, "snapshot");
        assert_eq!(segments[0].args, vec!["253:2", "253:3", "P", "8"]);
    }

    #[test]
    fn locates_origin_and_exception_devices() {
        let source = FixedDmSource {
            list: "myvg-myvol (253, 0)\nmyvg-myvol-cow (253, 1)\nmyvg-myvol-snap (253, 2)\n",
            table: "myvg-myvol-snap: 0 2097152 snapshot 253:0 253:1 P 8\n",
        };

        let resolved = locate(&source, "myvg/myvol-snap").unwrap();
        assert_eq!(resolved.origin_dm, "myvg-myvol");
        assert_eq!(resolved.exception_dm, "myvg-myvol-cow");
    }

    #[test]
    fn s7_rejects_non_snapshot_device() {
        let source = FixedDmSource {
            list: "myvg-myvol (253, 0)\n",
            table: "myvg-myvol: 0 2097152 linear 253:5 0\n",
        };

        let err = locate(&source, "myvg-myvol").unwrap_err();
        assert!(matches!(err, Error::DeviceLocator(DeviceLocatorError::NotASnapshot(_))));
    }

    #[test]
    fn rejects_unknown_device() {
        let source = FixedDmSource { list: "", table: "" };
        let err = locate(&source, "missing").unwrap_err();
        assert!(matches!(err, Error::DeviceLocator(DeviceLocatorError::SnapshotNotFound(_))));
    }
}
