/*
   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

      http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

// Raw NAND partition access.
//
// `RawMtd` is the physical-space primitive surface; `MtdDevice` implements
// it over a /dev/mtdN character device and `sim::SimMtd` over a RAM array
// for the tests. `FlashPartition` layers the logical view on top: after a
// scan, block indices address the sequence of good blocks and bad PEBs are
// skipped transparently.

pub mod ioctl;
pub mod proc;
#[cfg(test)]
pub(crate) mod sim;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{debug, warn};
use thiserror::Error;

/// Value a freshly erased NAND cell reads back as.
pub const ERASED_BYTE: u8 = 0xff;

#[derive(Error, Debug)]
pub enum MtdError {
    #[error("partition \"{0}\" not found in the mtd table")]
    NotFound(String),
    #[error("partition is busy (mounted or ubi-attached)")]
    Busy,
    #[error("device refused the operation")]
    NotPermitted,
    #[error("flash hardware error: {0}")]
    Hardware(String),
    #[error("uncorrectable ecc errors on read")]
    EccFailure,
    #[error("block {0} out of range")]
    OutOfRange(u32),
    #[error("write of {0} bytes is not a multiple of the write unit")]
    Misaligned(usize),
    #[error("partition must be scanned for logical access")]
    NotScanned,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for MtdError {
    fn from(e: nix::errno::Errno) -> Self {
        match e {
            nix::errno::Errno::EPERM | nix::errno::Errno::EACCES | nix::errno::Errno::EOPNOTSUPP => {
                MtdError::NotPermitted
            }
            nix::errno::Errno::EIO => MtdError::Hardware("i/o error".to_owned()),
            other => MtdError::Hardware(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    /// Read-write, with bad-block marking on erase failure.
    ReadWrite,
    /// Write-only, with bad-block marking on erase failure.
    WriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Partition size in bytes.
    pub size: u64,
    pub erase_size: u32,
    pub write_size: u32,
    /// Physical erase blocks in the partition.
    pub peb_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EccStats {
    pub corrected: u32,
    pub failed: u32,
    pub bad_blocks: u32,
}

/// Physical-space primitives of one mtd partition.
pub trait RawMtd: Send {
    fn geometry(&self) -> Geometry;
    fn is_bad(&mut self, peb: u32) -> Result<bool, MtdError>;
    fn mark_bad(&mut self, peb: u32) -> Result<(), MtdError>;
    fn erase(&mut self, peb: u32) -> Result<(), MtdError>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), MtdError>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), MtdError>;
    fn ecc_stats(&mut self) -> Result<EccStats, MtdError>;
}

/// A /dev/mtdN character device.
pub struct MtdDevice {
    file: File,
    geom: Geometry,
}

impl MtdDevice {
    pub fn open(path: &Path, mode: AccessMode) -> Result<MtdDevice, MtdError> {
        let file = OpenOptions::new()
            .read(mode != AccessMode::WriteOnly)
            .write(mode != AccessMode::ReadOnly)
            .open(path)?;
        let mut info = ioctl::MtdInfoUser::default();
        unsafe { ioctl::mem_get_info(file.as_raw_fd(), &mut info) }?;
        let geom = Geometry {
            size: u64::from(info.size),
            erase_size: info.erasesize,
            write_size: info.writesize,
            peb_count: info.size / info.erasesize,
        };
        debug!(
            "opened {} ({} PEBs of {} bytes, write unit {})",
            path.display(),
            geom.peb_count,
            geom.erase_size,
            geom.write_size
        );
        Ok(MtdDevice { file, geom })
    }

    fn peb_offset(&self, peb: u32) -> Result<u64, MtdError> {
        if peb >= self.geom.peb_count {
            return Err(MtdError::OutOfRange(peb));
        }
        Ok(u64::from(peb) * u64::from(self.geom.erase_size))
    }
}

impl RawMtd for MtdDevice {
    fn geometry(&self) -> Geometry {
        self.geom
    }

    fn is_bad(&mut self, peb: u32) -> Result<bool, MtdError> {
        let offset = self.peb_offset(peb)? as libc::loff_t;
        let ret = unsafe { ioctl::mem_get_bad_block(self.file.as_raw_fd(), &offset) }?;
        Ok(ret > 0)
    }

    fn mark_bad(&mut self, peb: u32) -> Result<(), MtdError> {
        let offset = self.peb_offset(peb)? as libc::loff_t;
        unsafe { ioctl::mem_set_bad_block(self.file.as_raw_fd(), &offset) }?;
        Ok(())
    }

    fn erase(&mut self, peb: u32) -> Result<(), MtdError> {
        let erase = ioctl::EraseInfoUser {
            start: self.peb_offset(peb)? as u32,
            length: self.geom.erase_size,
        };
        unsafe { ioctl::mem_erase(self.file.as_raw_fd(), &erase) }?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), MtdError> {
        self.file.read_exact_at(buf, offset).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBADMSG) {
                MtdError::EccFailure
            } else {
                MtdError::Io(e)
            }
        })
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), MtdError> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn ecc_stats(&mut self) -> Result<EccStats, MtdError> {
        let mut stats = ioctl::MtdEccStats::default();
        unsafe { ioctl::ecc_get_stats(self.file.as_raw_fd(), &mut stats) }?;
        Ok(EccStats {
            corrected: stats.corrected,
            failed: stats.failed,
            bad_blocks: stats.badblocks,
        })
    }
}

/// A partition handle with an optional logical (bad-block-skipping) view.
///
/// After [`scan`](FlashPartition::scan), block indices and the byte cursor
/// address the sequence of good blocks only; before, they address raw PEBs.
pub struct FlashPartition {
    dev: Box<dyn RawMtd>,
    geom: Geometry,
    mode: AccessMode,
    map: Option<Vec<u32>>,
    pos: u64,
}

impl FlashPartition {
    pub fn new(dev: Box<dyn RawMtd>, mode: AccessMode) -> FlashPartition {
        let geom = dev.geometry();
        FlashPartition {
            dev,
            geom,
            mode,
            map: None,
            pos: 0,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geom
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_scanned(&self) -> bool {
        self.map.is_some()
    }

    /// Blocks addressable in the current view.
    pub fn block_count(&self) -> u32 {
        match &self.map {
            Some(map) => map.len() as u32,
            None => self.geom.peb_count,
        }
    }

    pub fn usable_size(&self) -> u64 {
        u64::from(self.block_count()) * u64::from(self.geom.erase_size)
    }

    /// Build the logical view. A device refusing bad-block checks is
    /// treated as having none.
    pub fn scan(&mut self) -> Result<(), MtdError> {
        let mut map = Vec::with_capacity(self.geom.peb_count as usize);
        for peb in 0..self.geom.peb_count {
            match self.dev.is_bad(peb) {
                Ok(true) => {
                    debug!("skipping bad PEB {}", peb);
                }
                Ok(false) => map.push(peb),
                Err(MtdError::NotPermitted) => map.push(peb),
                Err(e) => return Err(e),
            }
        }
        self.map = Some(map);
        self.pos = 0;
        Ok(())
    }

    /// Drop back to the physical view.
    pub fn unscan(&mut self) {
        self.map = None;
        self.pos = 0;
    }

    pub fn check_bad_block(&mut self, index: u32) -> Result<bool, MtdError> {
        let peb = self.to_physical(index)?;
        self.dev.is_bad(peb)
    }

    /// Erase one block; a hardware failure marks it bad before reporting.
    pub fn erase_block(&mut self, index: u32) -> Result<(), MtdError> {
        let peb = self.to_physical(index)?;
        match self.dev.erase(peb) {
            Err(MtdError::Hardware(msg)) => {
                warn!("erase of PEB {} failed ({}), marking bad", peb, msg);
                if let Err(e) = self.dev.mark_bad(peb) {
                    warn!("marking PEB {} bad failed: {}", peb, e);
                }
                Err(MtdError::Hardware(msg))
            }
            other => other,
        }
    }

    /// Erase every good block of the partition (physical pass). Blocks that
    /// fail to erase are marked bad and skipped. Returns the good count.
    pub fn erase_all_good(&mut self) -> Result<u32, MtdError> {
        let mut good = 0;
        for peb in 0..self.geom.peb_count {
            match self.dev.is_bad(peb) {
                Ok(true) => continue,
                Ok(false) | Err(MtdError::NotPermitted) => {}
                Err(e) => return Err(e),
            }
            match self.dev.erase(peb) {
                Ok(()) => good += 1,
                Err(MtdError::Hardware(msg)) => {
                    warn!("erase of PEB {} failed ({}), marking bad", peb, msg);
                    if let Err(e) = self.dev.mark_bad(peb) {
                        warn!("marking PEB {} bad failed: {}", peb, e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(good)
    }

    pub fn seek_block(&mut self, index: u32) -> Result<(), MtdError> {
        if index >= self.block_count() {
            return Err(MtdError::OutOfRange(index));
        }
        self.pos = u64::from(index) * u64::from(self.geom.erase_size);
        Ok(())
    }

    pub fn seek_offset(&mut self, offset: u64) -> Result<(), MtdError> {
        if offset > self.usable_size() {
            return Err(MtdError::OutOfRange((offset / u64::from(self.geom.erase_size)) as u32));
        }
        self.pos = offset;
        Ok(())
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Physical PEB index of a block in the current view.
    pub fn physical_block(&self, index: u32) -> Result<u32, MtdError> {
        self.to_physical(index)
    }

    fn to_physical(&self, index: u32) -> Result<u32, MtdError> {
        match &self.map {
            Some(map) => map
                .get(index as usize)
                .copied()
                .ok_or(MtdError::OutOfRange(index)),
            None => {
                if index >= self.geom.peb_count {
                    Err(MtdError::OutOfRange(index))
                } else {
                    Ok(index)
                }
            }
        }
    }

    fn spans(&self, mut pos: u64, len: usize) -> Result<Vec<(u64, usize)>, MtdError> {
        let erase = u64::from(self.geom.erase_size);
        let mut spans = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let block = (pos / erase) as u32;
            let within = pos % erase;
            let take = std::cmp::min((erase - within) as usize, remaining);
            let peb = self.to_physical(block)?;
            spans.push((u64::from(peb) * erase + within, take));
            pos += take as u64;
            remaining -= take;
        }
        Ok(spans)
    }

    /// Read exactly `buf.len()` bytes at the cursor, advancing it. An
    /// increase of the uncorrectable-ECC counter across the read is fatal.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), MtdError> {
        let before = self.dev.ecc_stats().ok();
        let spans = self.spans(self.pos, buf.len())?;
        let mut done = 0;
        for (offset, len) in spans {
            self.dev.read_at(offset, &mut buf[done..done + len])?;
            done += len;
        }
        if let (Some(before), Ok(after)) = (before, self.dev.ecc_stats()) {
            if after.failed > before.failed {
                return Err(MtdError::EccFailure);
            }
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    /// Write `buf` at the cursor, advancing it. The length must be a
    /// multiple of the write unit.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), MtdError> {
        if buf.len() % self.geom.write_size as usize != 0 {
            return Err(MtdError::Misaligned(buf.len()));
        }
        let spans = self.spans(self.pos, buf.len())?;
        let mut done = 0;
        for (offset, len) in spans {
            self.dev.write_at(offset, &buf[done..done + len])?;
            done += len;
        }
        self.pos += buf.len() as u64;
        Ok(())
    }

    pub fn ecc_stats(&mut self) -> Result<EccStats, MtdError> {
        self.dev.ecc_stats()
    }
}

/// Seam through which the engine opens its staging and origin partitions.
pub trait FlashOpener: Send {
    fn open(&self, mode: AccessMode) -> Result<FlashPartition, MtdError>;
}

/// Production opener: a named partition of the system mtd table.
pub struct NamedPartition {
    name: String,
}

impl NamedPartition {
    pub fn new(name: impl Into<String>) -> NamedPartition {
        NamedPartition { name: name.into() }
    }
}

impl FlashOpener for NamedPartition {
    fn open(&self, mode: AccessMode) -> Result<FlashPartition, MtdError> {
        let entry = proc::lookup(&self.name)?;
        if mode != AccessMode::ReadOnly && proc::is_busy(entry.index) {
            return Err(MtdError::Busy);
        }
        let dev = MtdDevice::open(&entry.device_path(), mode)?;
        Ok(FlashPartition::new(Box::new(dev), mode))
    }
}

#[cfg(test)]
mod test {
    use super::sim::SimDevice;
    use super::*;

    fn partition(pebs: u32) -> (FlashPartition, SimDevice) {
        let sim = SimDevice::create(pebs, 4096, 512);
        (
            FlashPartition::new(Box::new(sim.raw()), AccessMode::ReadWrite),
            sim,
        )
    }

    #[test]
    fn geometry_reported() {
        let (flash, _sim) = partition(8);
        let geom = flash.geometry();
        assert_eq!(geom.erase_size, 4096);
        assert_eq!(geom.write_size, 512);
        assert_eq!(geom.peb_count, 8);
        assert_eq!(geom.size, 8 * 4096);
    }

    #[test]
    fn scan_skips_bad_blocks() {
        let (mut flash, sim) = partition(8);
        sim.set_bad(2);
        flash.scan().unwrap();
        assert_eq!(flash.block_count(), 7);
        // Logical block 2 now maps to PEB 3.
        assert_eq!(flash.physical_block(2).unwrap(), 3);
    }

    #[test]
    fn logical_write_crosses_bad_block() {
        let (mut flash, sim) = partition(8);
        sim.set_bad(1);
        flash.scan().unwrap();
        flash.seek_block(0).unwrap();
        let data: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        flash.write(&data).unwrap();
        // Second half landed in PEB 2, skipping the bad PEB 1.
        assert_eq!(sim.peb(0)[..], data[..4096]);
        assert_eq!(sim.peb(2)[..], data[4096..]);
        let mut back = vec![0u8; 8192];
        flash.seek_block(0).unwrap();
        flash.read(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn misaligned_write_rejected() {
        let (mut flash, _sim) = partition(4);
        flash.scan().unwrap();
        assert!(matches!(
            flash.write(&[0u8; 100]),
            Err(MtdError::Misaligned(100))
        ));
    }

    #[test]
    fn erase_failure_marks_bad() {
        let (mut flash, sim) = partition(4);
        sim.fail_erase(1);
        flash.scan().unwrap();
        assert!(matches!(
            flash.erase_block(1),
            Err(MtdError::Hardware(_))
        ));
        assert!(sim.is_bad(1));
    }

    #[test]
    fn erase_all_good_skips_and_marks() {
        let (mut flash, sim) = partition(6);
        sim.set_bad(0);
        sim.fail_erase(3);
        let good = flash.erase_all_good().unwrap();
        assert_eq!(good, 4);
        assert!(sim.is_bad(3));
    }

    #[test]
    fn ecc_failure_surfaces() {
        let (mut flash, sim) = partition(4);
        flash.scan().unwrap();
        sim.inject_ecc_failure();
        let mut buf = [0u8; 512];
        flash.seek_block(0).unwrap();
        assert!(matches!(flash.read(&mut buf), Err(MtdError::EccFailure)));
    }

    #[test]
    fn out_of_range_seek() {
        let (mut flash, _sim) = partition(4);
        flash.scan().unwrap();
        assert!(matches!(flash.seek_block(4), Err(MtdError::OutOfRange(4))));
    }
}
