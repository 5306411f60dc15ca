//! Local disk probe: `df -h` filtered down to real mount points.

use bundle_codec::{CommandBundle, SectionMap};

use crate::config::BundleConfig;
use crate::poll::{DecodeError, SourceDecoder};

pub fn bundle(commands: &BundleConfig) -> CommandBundle {
    CommandBundle::new().with("DISK", commands.disk.as_str())
}

/// Renders a `mount / used / avail` table sorted by mount point.
///
/// Rows are kept when the final column is a mount path of at least three
/// characters, which drops the header, the root filesystem, and pseudo
/// filesystems without a path.
pub struct DiskDecoder;

impl SourceDecoder for DiskDecoder {
    fn decode(&self, sections: &SectionMap) -> Result<String, DecodeError> {
        let text = sections
            .get("DISK")
            .ok_or_else(|| DecodeError::new("missing section DISK"))?;

        let mut rows: Vec<(String, String, String)> = Vec::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            let mount = fields[fields.len() - 1];
            if !mount.starts_with('/') || mount.len() < 3 {
                continue;
            }
            let used = fields[fields.len() - 4];
            let avail = fields[fields.len() - 3];
            rows.push((mount.to_owned(), used.to_owned(), avail.to_owned()));
        }
        rows.sort();

        let mut out = vec![format!("{:<16} {:>6} {:>6}", "Mount", "Used", "Avail")];
        for (mount, used, avail) in rows {
            out.push(format!("{mount:<16} {used:>6} {avail:>6}"));
        }
        Ok(out.join("\n"))
    }
}
