// Discovery of named partitions in the kernel's line-oriented mtd table.
//
// /proc/mtd looks like:
//
//   dev:    size   erasesize  name
//   mtd0: 01000000 00020000 "boot"
//   mtd1: 3e000000 00020000 "swifota"

use std::path::PathBuf;

use log::trace;

use super::MtdError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtdEntry {
    pub index: u32,
    pub size: u64,
    pub erase_size: u32,
    pub name: String,
}

impl MtdEntry {
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/mtd{}", self.index))
    }
}

/// Parse the table contents; malformed lines are skipped.
pub fn parse_table(contents: &str) -> Vec<MtdEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        if !line.starts_with("mtd") {
            trace!("skipping mtd table line: {}", line);
            continue;
        }
        let entry = (|| {
            let colon = line.find(':')?;
            let index: u32 = line[3..colon].parse().ok()?;
            let rest = &line[colon + 1..];
            let mut fields = rest.split_whitespace();
            let size = u64::from_str_radix(fields.next()?, 16).ok()?;
            let erase_size = u32::from_str_radix(fields.next()?, 16).ok()?;
            let first_quote = rest.find('"')?;
            let last_quote = rest.rfind('"')?;
            if last_quote <= first_quote {
                return None;
            }
            let name = rest[first_quote + 1..last_quote].to_owned();
            Some(MtdEntry {
                index,
                size,
                erase_size,
                name,
            })
        })();
        if let Some(entry) = entry {
            entries.push(entry);
        } else {
            trace!("malformed mtd table line: {}", line);
        }
    }
    entries
}

pub fn find_partition(contents: &str, name: &str) -> Option<MtdEntry> {
    parse_table(contents).into_iter().find(|e| e.name == name)
}

/// Locate a partition by name in the running system.
pub fn lookup(name: &str) -> Result<MtdEntry, MtdError> {
    let contents = std::fs::read_to_string("/proc/mtd")?;
    find_partition(&contents, name).ok_or_else(|| MtdError::NotFound(name.to_owned()))
}

/// Whether the partition is mounted or attached to an UBI device.
pub fn is_busy(index: u32) -> bool {
    if let Ok(mounts) = std::fs::read_to_string("/proc/mounts") {
        let dev = format!("/dev/mtdblock{} ", index);
        if mounts.lines().any(|l| l.starts_with(&dev)) {
            return true;
        }
    }
    if let Ok(dir) = std::fs::read_dir("/sys/class/ubi") {
        for entry in dir.flatten() {
            let attached = std::fs::read_to_string(entry.path().join("mtd_num"))
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            if attached == Some(index) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    const TABLE: &str = "dev:    size   erasesize  name\n\
                         mtd0: 01000000 00020000 \"boot\"\n\
                         mtd1: 3e000000 00020000 \"swifota\"\n\
                         mtd2: 00100000 00020000 \"user data\"\n";

    #[test]
    fn parses_entries() {
        let entries = parse_table(TABLE);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "boot");
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].size, 0x3e00_0000);
        assert_eq!(entries[1].erase_size, 0x2_0000);
        assert_eq!(entries[1].device_path(), PathBuf::from("/dev/mtd1"));
    }

    #[test]
    fn name_may_contain_spaces() {
        let entries = parse_table(TABLE);
        assert_eq!(entries[2].name, "user data");
    }

    #[test]
    fn finds_by_name() {
        assert_eq!(find_partition(TABLE, "swifota").unwrap().index, 1);
        assert!(find_partition(TABLE, "nosuch").is_none());
    }

    #[test]
    fn skips_malformed_lines() {
        let entries = parse_table("garbage\nmtd9: zz 00020000 \"x\"\n");
        assert!(entries.is_empty());
    }
}
