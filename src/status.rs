// Download status file: a single byte, recreated on every transition.

use std::fs;
use std::io::Write;
use std::path::Path;

use log::warn;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("status file does not exist")]
    Missing,
    #[error("status file is empty")]
    Truncated,
    #[error("status file holds invalid byte {0:#04x}")]
    Corrupt(u8),
    #[error("status file i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Internal download/install states surfaced through the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DwlStatus {
    Ok = 0,
    SwifotaCorrupt = 1,
    UaFail = 2,
    BlFail = 3,
    DwlOngoing = 4,
    DwlFailed = 5,
    DwlTimeout = 6,
    InstOngoing = 7,
    Unknown = 8,
}

impl DwlStatus {
    pub fn label(self) -> &'static str {
        match self {
            DwlStatus::Ok => "OK",
            DwlStatus::SwifotaCorrupt => "SWIFOTA_CORRUPT",
            DwlStatus::UaFail => "UA_FAIL",
            DwlStatus::BlFail => "BL_FAIL",
            DwlStatus::DwlOngoing => "DWL_ONGOING",
            DwlStatus::DwlFailed => "DWL_FAILED",
            DwlStatus::DwlTimeout => "DWL_TIMEOUT",
            DwlStatus::InstOngoing => "INST_ONGOING",
            DwlStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DwlStatus::Ok),
            1 => Some(DwlStatus::SwifotaCorrupt),
            2 => Some(DwlStatus::UaFail),
            3 => Some(DwlStatus::BlFail),
            4 => Some(DwlStatus::DwlOngoing),
            5 => Some(DwlStatus::DwlFailed),
            6 => Some(DwlStatus::DwlTimeout),
            7 => Some(DwlStatus::InstOngoing),
            8 => Some(DwlStatus::Unknown),
            _ => None,
        }
    }
}

/// Replace the status file with `status`.
pub fn write(path: &Path, status: DwlStatus) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = fs::File::create(path)?;
    file.write_all(&[status as u8])?;
    file.sync_all()
}

/// Read the stored status.
///
/// Missing and corrupt files are reported distinctly; callers that only
/// want a displayable value go through [`read_or_unknown`].
pub fn read(path: &Path) -> Result<DwlStatus, StatusError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StatusError::Missing)
        }
        Err(e) => return Err(StatusError::Io(e)),
    };
    match bytes.first().copied() {
        Some(b) => DwlStatus::from_byte(b).ok_or(StatusError::Corrupt(b)),
        None => Err(StatusError::Truncated),
    }
}

/// Read for display: degenerate states collapse to `Unknown`, with the
/// distinction kept in the log.
pub fn read_or_unknown(path: &Path) -> DwlStatus {
    match read(path) {
        Ok(status) => status,
        Err(StatusError::Missing) => DwlStatus::Unknown,
        Err(e) => {
            warn!("unreadable download status ({}), reporting UNKNOWN", e);
            DwlStatus::Unknown
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TempDir;

    #[test]
    fn write_then_read() {
        let dir = TempDir::new("status-rw");
        let path = dir.path().join("dwl_status");
        write(&path, DwlStatus::DwlOngoing).unwrap();
        assert_eq!(read(&path).unwrap(), DwlStatus::DwlOngoing);
        write(&path, DwlStatus::Ok).unwrap();
        assert_eq!(read(&path).unwrap(), DwlStatus::Ok);
    }

    #[test]
    fn missing_is_distinct_from_corrupt() {
        let dir = TempDir::new("status-missing");
        let path = dir.path().join("dwl_status");
        assert!(matches!(read(&path), Err(StatusError::Missing)));
        std::fs::write(&path, [0x7f]).unwrap();
        assert!(matches!(read(&path), Err(StatusError::Corrupt(0x7f))));
        assert_eq!(read_or_unknown(&path), DwlStatus::Unknown);
    }

    #[test]
    fn labels() {
        assert_eq!(DwlStatus::DwlTimeout.label(), "DWL_TIMEOUT");
        assert_eq!(DwlStatus::from_byte(6), Some(DwlStatus::DwlTimeout));
        assert_eq!(DwlStatus::from_byte(9), None);
    }
}
