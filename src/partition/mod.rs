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

// Staging partition manager.
//
// The partition grows linearly in "raw space": byte 0 of the image lands at
// the start of logical block 2, the first two good PEBs being reserved for
// the slot metadata record written at install time. Writes accumulate in a
// one-erase-block buffer; only whole blocks go to flash, and the caller is
// re-driven with whatever did not fit (the `consumed` handshake). A region
// of raw space can be handed to the UBI builder, after which writes target
// the open volume one LEB at a time.

pub mod metadata;

use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::checksum::Crc32;
use crate::cwe::CWE_HEADER_SIZE;
use crate::mtd::{AccessMode, FlashOpener, FlashPartition, MtdError, ERASED_BYTE};
use crate::ubi::{leb_data_size, UbiBuilder, UbiError, UBI_VTBL_PEBS};

use metadata::{SlotMetadata, SLOT_META_SIZE};

/// Logical blocks reserved at the head of the partition for metadata.
pub const META_PEBS: u32 = 2;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("image does not fit the staging partition")]
    OutOfRange,
    #[error("invalid in the current partition state: {0}")]
    State(&'static str),
    #[error("ubi volume parameters do not match the on-media volume")]
    VolumeMismatch,
    #[error(transparent)]
    Flash(#[from] MtdError),
    #[error(transparent)]
    Ubi(#[from] UbiError),
}

/// Result of one buffered write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Bytes accepted from the caller's slice.
    pub consumed: usize,
    /// Whether an erase block went to flash during this call.
    pub flushed_block: bool,
}

struct UbiRegion {
    builder: UbiBuilder,
    /// Raw-space offset of the region start (block aligned).
    base_offset: u64,
    leb_buf: Vec<u8>,
    /// Bytes accepted into the open volume.
    vol_written: u64,
}

pub struct PartitionCtx {
    flash: FlashPartition,
    erase_size: usize,
    buffer: Vec<u8>,
    image_size: u64,
    written: u64,
    flushed: u64,
    full_crc: Crc32,
    ubi: Option<UbiRegion>,
}

impl PartitionCtx {
    /// Fresh start: erase every good block, reserve the metadata blocks and
    /// park the write head at the start of raw space. The size check runs
    /// before anything touches the media.
    pub fn open(opener: &dyn FlashOpener, image_size: u64) -> Result<PartitionCtx, PartitionError> {
        let mut flash = opener.open(AccessMode::ReadWrite)?;
        flash.scan()?;
        let erase = u64::from(flash.geometry().erase_size);
        if flash.block_count() <= META_PEBS
            || image_size > u64::from(flash.block_count() - META_PEBS) * erase
        {
            return Err(PartitionError::OutOfRange);
        }
        flash.unscan();
        flash.erase_all_good()?;
        flash.scan()?;
        Self::with_flash(flash, image_size, 0, Crc32::START, &[])
    }

    /// Resume at raw-space byte `offset`. When `offset` is not block
    /// aligned the partial block is read back into the buffer and erased,
    /// so the later full-block flush rewrites it whole. Everything at or
    /// past the write head is erased; it may hold stale bytes from beyond
    /// the checkpoint.
    pub fn open_at(
        opener: &dyn FlashOpener,
        image_size: u64,
        offset: u64,
        full_crc: u32,
    ) -> Result<PartitionCtx, PartitionError> {
        let mut flash = opener.open(AccessMode::ReadWrite)?;
        flash.scan()?;
        let erase = flash.geometry().erase_size as usize;
        let fill = (offset % erase as u64) as usize;
        let mut tail = vec![0u8; fill];
        if fill != 0 {
            flash.seek_offset(u64::from(META_PEBS) * erase as u64 + offset - fill as u64)?;
            flash.read(&mut tail)?;
        }
        let mut ctx = Self::with_flash(flash, image_size, offset, full_crc, &tail)?;
        let first_stale = META_PEBS + (ctx.flushed / erase as u64) as u32;
        for block in first_stale..ctx.flash.block_count() {
            ctx.flash.erase_block(block)?;
        }
        Ok(ctx)
    }

    fn with_flash(
        flash: FlashPartition,
        image_size: u64,
        offset: u64,
        full_crc: u32,
        tail: &[u8],
    ) -> Result<PartitionCtx, PartitionError> {
        let geom = flash.geometry();
        let ctx = PartitionCtx {
            erase_size: geom.erase_size as usize,
            flash,
            buffer: tail.to_vec(),
            image_size,
            written: offset,
            flushed: offset - tail.len() as u64,
            full_crc: Crc32::from_value(full_crc),
            ubi: None,
        };
        if ctx.flash.block_count() <= META_PEBS || image_size > ctx.data_capacity() {
            return Err(PartitionError::OutOfRange);
        }
        Ok(ctx)
    }

    fn data_capacity(&self) -> u64 {
        u64::from(self.flash.block_count() - META_PEBS) * self.erase_size as u64
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn full_crc(&self) -> u32 {
        self.full_crc.value()
    }

    pub fn ubi_open(&self) -> bool {
        self.ubi.is_some()
    }

    pub fn volume_open(&self) -> bool {
        self.ubi
            .as_ref()
            .map_or(false, |r| r.builder.current_volume().is_some())
    }

    /// Logical and physical index of the first payload block, for the
    /// metadata record.
    pub fn data_start_blocks(&self) -> Result<(u32, u32), PartitionError> {
        Ok((META_PEBS, self.flash.physical_block(META_PEBS)?))
    }

    fn flush_block(&mut self) -> Result<(), PartitionError> {
        let erase = self.erase_size as u64;
        if self.flushed + erase > self.data_capacity() {
            return Err(PartitionError::OutOfRange);
        }
        let block = META_PEBS + (self.flushed / erase) as u32;
        self.flash.seek_block(block)?;
        self.flash.write(&self.buffer)?;
        self.full_crc.update(&self.buffer);
        self.flushed += erase;
        self.buffer.clear();
        Ok(())
    }

    /// Buffered raw write. Accepts up to one block boundary per call; the
    /// caller re-drives with the remainder.
    pub fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, PartitionError> {
        if self.ubi.is_some() {
            return Err(PartitionError::State("raw write while an ubi region is open"));
        }
        if buf.is_empty() {
            return Ok(WriteOutcome {
                consumed: 0,
                flushed_block: false,
            });
        }
        let space = self.erase_size - self.buffer.len();
        let take = space.min(buf.len());
        self.buffer.extend_from_slice(&buf[..take]);
        self.written += take as u64;
        let mut flushed_block = false;
        if self.buffer.len() == self.erase_size {
            self.flush_block()?;
            flushed_block = true;
        }
        Ok(WriteOutcome {
            consumed: take,
            flushed_block,
        })
    }

    /// Start an UBI region at the current write head. A partial raw block
    /// is padded with the erased value and flushed first. Two PEBs are
    /// accounted for the volume table immediately.
    pub fn open_ubi(
        &mut self,
        image_seq: u32,
        seq_valid: bool,
        force_create: bool,
    ) -> Result<(), PartitionError> {
        if self.ubi.is_some() {
            return Err(PartitionError::State("ubi region already open"));
        }
        if !self.buffer.is_empty() {
            self.buffer.resize(self.erase_size, ERASED_BYTE);
            self.flush_block()?;
            self.written = self.flushed;
        }
        let base_offset = self.flushed;
        let base_peb = META_PEBS + (base_offset / self.erase_size as u64) as u32;
        let (builder, kept) = UbiBuilder::create_or_adopt(
            &mut self.flash,
            base_peb,
            image_seq,
            seq_valid,
            force_create,
        )?;
        if kept {
            debug!("adopted existing ubi image at raw offset {}", base_offset);
        }
        self.flushed += u64::from(UBI_VTBL_PEBS) * self.erase_size as u64;
        self.written = self.flushed;
        self.ubi = Some(UbiRegion {
            builder,
            base_offset,
            leb_buf: Vec::new(),
            vol_written: 0,
        });
        Ok(())
    }

    /// Finish the UBI region; raw writing continues right after it.
    /// Returns the PEB count the region occupies.
    pub fn close_ubi(&mut self) -> Result<u32, PartitionError> {
        let region = self
            .ubi
            .take()
            .ok_or(PartitionError::State("no ubi region open"))?;
        if region.builder.current_volume().is_some() {
            self.ubi = Some(region);
            return Err(PartitionError::State("ubi volume still open"));
        }
        let total = region.builder.pebs_used();
        self.flushed = region.base_offset + u64::from(total) * self.erase_size as u64;
        self.written = self.flushed;
        self.buffer.clear();
        Ok(total)
    }

    /// Open a volume for writing: create it, or on resume verify that the
    /// on-media volume matches the expected parameters.
    pub fn open_ubi_volume(
        &mut self,
        vol_id: u32,
        vol_type: u8,
        size: u64,
        flags: u8,
        name: &str,
        create: bool,
    ) -> Result<(), PartitionError> {
        let region = self
            .ubi
            .as_mut()
            .ok_or(PartitionError::State("no ubi region open"))?;
        if create {
            region
                .builder
                .create_volume(&mut self.flash, vol_id, name, vol_type, size, flags)?;
        } else {
            match region.builder.volume_info(vol_id) {
                Some((t, n, f)) if t == vol_type && n == name && f == flags => {}
                Some(_) => return Err(PartitionError::VolumeMismatch),
                None => return Err(UbiError::VolumeNotFound(vol_id).into()),
            }
            region.builder.open_volume(vol_id, 0)?;
        }
        region.vol_written = 0;
        region.leb_buf.clear();
        Ok(())
    }

    /// Buffered write into the open volume; same handshake as [`write`].
    pub fn write_ubi(&mut self, buf: &[u8]) -> Result<WriteOutcome, PartitionError> {
        let leb_data = leb_data_size(&self.flash);
        let erase = self.erase_size as u64;
        let region = self
            .ubi
            .as_mut()
            .ok_or(PartitionError::State("no ubi region open"))?;
        if region.builder.current_volume().is_none() {
            return Err(PartitionError::State("no ubi volume open"));
        }
        if buf.is_empty() {
            return Ok(WriteOutcome {
                consumed: 0,
                flushed_block: false,
            });
        }
        let space = leb_data - region.leb_buf.len();
        let take = space.min(buf.len());
        region.leb_buf.extend_from_slice(&buf[..take]);
        region.vol_written += take as u64;
        let mut flushed_block = false;
        if region.leb_buf.len() == leb_data {
            region.builder.write_leb(&mut self.flash, &region.leb_buf)?;
            region.leb_buf.clear();
            self.flushed += erase;
            self.written = self.flushed;
            flushed_block = true;
        }
        Ok(WriteOutcome {
            consumed: take,
            flushed_block,
        })
    }

    /// Close the open volume, flushing a partial trailing LEB.
    pub fn close_ubi_volume(&mut self, final_size: u64) -> Result<(), PartitionError> {
        let erase = self.erase_size as u64;
        let region = self
            .ubi
            .as_mut()
            .ok_or(PartitionError::State("no ubi region open"))?;
        if !region.leb_buf.is_empty() {
            region.builder.write_leb(&mut self.flash, &region.leb_buf)?;
            region.leb_buf.clear();
            self.flushed += erase;
            self.written = self.flushed;
        }
        if region.vol_written != final_size {
            warn!(
                "ubi volume closed with {} bytes, {} declared",
                region.vol_written, final_size
            );
        }
        region.builder.close_volume(final_size)?;
        Ok(())
    }

    /// CRC32 over a raw-space range, spanning into the in-memory buffer
    /// when the range extends past the last flushed block. Yields briefly
    /// between blocks so long images do not starve the process.
    pub fn compute_data_crc32(&mut self, start: u64, len: u64) -> Result<u32, PartitionError> {
        if start + len > self.written {
            return Err(PartitionError::State("crc range beyond written data"));
        }
        let erase = self.erase_size as u64;
        let mut crc = Crc32::new();
        let mut pos = start;
        let end = start + len;
        let mut chunk = vec![0u8; self.erase_size];
        while pos < end {
            let to_boundary = erase - pos % erase;
            let take = to_boundary.min(end - pos);
            if pos < self.flushed {
                let take = take.min(self.flushed - pos) as usize;
                self.flash
                    .seek_offset(u64::from(META_PEBS) * erase + pos)?;
                self.flash.read(&mut chunk[..take])?;
                crc.update(&chunk[..take]);
                pos += take as u64;
            } else {
                let off = (pos - self.flushed) as usize;
                let take = take as usize;
                crc.update(&self.buffer[off..off + take]);
                pos += take as u64;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(crc.value())
    }

    /// Size and CRC over every volume of the open UBI region.
    pub fn compute_ubi_crc32(&mut self) -> Result<(u64, u32), PartitionError> {
        let region = self
            .ubi
            .as_ref()
            .ok_or(PartitionError::State("no ubi region open"))?;
        Ok(region.builder.region_crc(&mut self.flash)?)
    }

    /// Size and CRC of one volume of the open UBI region.
    pub fn compute_ubi_volume_crc32(&mut self, vol_id: u32) -> Result<(u64, u32), PartitionError> {
        let region = self
            .ubi
            .as_ref()
            .ok_or(PartitionError::State("no ubi region open"))?;
        Ok(region.builder.volume_crc(&mut self.flash, vol_id)?)
    }

    /// Flush the trailing partial block padded with the erased value and
    /// release the handle. With `force`, pending state is discarded.
    pub fn close(mut self, final_image_length: u64, force: bool) -> Result<(), PartitionError> {
        if force {
            return Ok(());
        }
        if self.ubi.is_some() {
            return Err(PartitionError::State("ubi region still open"));
        }
        if !self.buffer.is_empty() {
            self.buffer.resize(self.erase_size, ERASED_BYTE);
            self.flush_block()?;
        }
        if self.written != final_image_length {
            warn!(
                "partition closed with {} bytes laid down, {} declared",
                self.written, final_image_length
            );
        }
        Ok(())
    }

    /// Serialized checkpoint state: the packed snapshot struct followed by
    /// the buffered raw-block and LEB tails, so a checkpoint taken between
    /// block flushes restores byte-exactly.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        let snap = self.snapshot();
        let mut bytes = snap.to_bytes();
        bytes.extend_from_slice(&self.buffer);
        if let Some(region) = &self.ubi {
            bytes.extend_from_slice(&region.leb_buf);
        }
        bytes
    }

    fn snapshot(&self) -> PartitionSnapshot {
        let mut snap = PartitionSnapshot {
            image_size: self.image_size,
            written: self.written,
            flushed: self.flushed,
            full_crc: self.full_crc.value(),
            block_fill: self.buffer.len() as u32,
            ubi_base: -1,
            ubi_image_seq: 0,
            ubi_seq_valid: 0,
            ubi_vol_open: 0,
            ubi_vol_type: 0,
            ubi_vol_flags: 0,
            ubi_vol_id: 0,
            ubi_vol_size: 0,
            ubi_lebs_written: 0,
            ubi_leb_fill: 0,
            ubi_data_pebs: 0,
            ubi_next_sqnum: 0,
            ubi_vol_written: 0,
            ubi_vol_name: [0u8; 128],
        };
        if let Some(region) = &self.ubi {
            snap.ubi_base = region.base_offset as i64;
            let (seq, valid) = region.builder.image_seq();
            snap.ubi_image_seq = seq;
            snap.ubi_seq_valid = valid as u8;
            snap.ubi_leb_fill = region.leb_buf.len() as u32;
            snap.ubi_next_sqnum = region.builder.next_sqnum();
            snap.ubi_vol_written = region.vol_written;
            let closed_pebs = region.builder.pebs_used()
                - UBI_VTBL_PEBS
                - region
                    .builder
                    .current_volume()
                    .map_or(0, |v| v.lebs_written);
            snap.ubi_data_pebs = closed_pebs;
            if let Some(vol) = region.builder.current_volume() {
                snap.ubi_vol_open = 1;
                snap.ubi_vol_type = vol.vol_type;
                snap.ubi_vol_flags = vol.flags;
                snap.ubi_vol_id = vol.vol_id;
                snap.ubi_lebs_written = vol.lebs_written;
                let name = vol.name.as_bytes();
                snap.ubi_vol_name[..name.len()].copy_from_slice(name);
            }
        }
        snap
    }

    /// Rebuild from checkpoint bytes produced by [`snapshot_bytes`]:
    /// reopen the flash, restore the buffered tails, erase everything past
    /// the write head, re-adopt the UBI region and reopen its volume where
    /// one was open.
    pub fn resume(opener: &dyn FlashOpener, bytes: &[u8]) -> Result<PartitionCtx, PartitionError> {
        let snap = PartitionSnapshot::from_bytes(bytes)
            .ok_or(PartitionError::State("short partition snapshot"))?;
        let block_fill = snap.block_fill as usize;
        let leb_fill = snap.ubi_leb_fill as usize;
        if bytes.len() < SNAPSHOT_SIZE + block_fill + leb_fill {
            return Err(PartitionError::State("truncated partition snapshot"));
        }
        let block_tail = &bytes[SNAPSHOT_SIZE..SNAPSHOT_SIZE + block_fill];
        let leb_tail = &bytes[SNAPSHOT_SIZE + block_fill..SNAPSHOT_SIZE + block_fill + leb_fill];
        let mut flash = opener.open(AccessMode::ReadWrite)?;
        flash.scan()?;
        let mut ctx = Self::with_flash(flash, snap.image_size, snap.written, snap.full_crc, block_tail)?;
        let erase = ctx.erase_size as u64;
        let first_stale = META_PEBS + (ctx.flushed / erase) as u32;
        for block in first_stale..ctx.flash.block_count() {
            ctx.flash.erase_block(block)?;
        }
        if snap.ubi_base >= 0 {
            let base_offset = snap.ubi_base as u64;
            let base_peb = META_PEBS + (base_offset / ctx.erase_size as u64) as u32;
            let mut builder = UbiBuilder::adopt(&mut ctx.flash, base_peb)?;
            builder.set_image_seq(snap.ubi_image_seq, snap.ubi_seq_valid != 0);
            builder.restore_counters(snap.ubi_data_pebs, snap.ubi_next_sqnum);
            if snap.ubi_vol_open != 0 {
                let vol_id = snap.ubi_vol_id;
                let name_len = snap
                    .ubi_vol_name
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(snap.ubi_vol_name.len());
                let name = String::from_utf8_lossy(&snap.ubi_vol_name[..name_len]).into_owned();
                match builder.volume_info(vol_id) {
                    Some((t, n, f))
                        if t == snap.ubi_vol_type && n == name && f == snap.ubi_vol_flags => {}
                    Some(_) => return Err(PartitionError::VolumeMismatch),
                    None => return Err(UbiError::VolumeNotFound(vol_id).into()),
                }
                builder.open_volume(vol_id, snap.ubi_lebs_written)?;
            }
            ctx.ubi = Some(UbiRegion {
                builder,
                base_offset,
                leb_buf: leb_tail.to_vec(),
                vol_written: snap.ubi_vol_written,
            });
        }
        Ok(ctx)
    }
}

/// Checkpointed partition-manager state, stored opaquely in the journal.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct PartitionSnapshot {
    pub image_size: u64,
    pub written: u64,
    pub flushed: u64,
    pub full_crc: u32,
    pub block_fill: u32,
    pub ubi_base: i64,
    pub ubi_image_seq: u32,
    pub ubi_seq_valid: u8,
    pub ubi_vol_open: u8,
    pub ubi_vol_type: u8,
    pub ubi_vol_flags: u8,
    pub ubi_vol_id: u32,
    pub ubi_vol_size: u64,
    pub ubi_lebs_written: u32,
    pub ubi_leb_fill: u32,
    pub ubi_data_pebs: u32,
    pub ubi_next_sqnum: u64,
    pub ubi_vol_written: u64,
    pub ubi_vol_name: [u8; 128],
}

pub const SNAPSHOT_SIZE: usize = 216;

impl PartitionSnapshot {
    pub fn to_bytes(&self) -> Vec<u8> {
        let bytes = unsafe {
            std::slice::from_raw_parts(self as *const PartitionSnapshot as *const u8, SNAPSHOT_SIZE)
        };
        bytes.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Option<PartitionSnapshot> {
        if data.len() < SNAPSHOT_SIZE {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const PartitionSnapshot) })
    }
}

/// Write the slot metadata record into the first good PEB, the second
/// staying erased as the fallback copy slot. Opens the partition on its
/// own; used at install time, not during a download.
pub fn write_meta(
    opener: &dyn FlashOpener,
    record: &mut SlotMetadata,
) -> Result<(), PartitionError> {
    let mut flash = opener.open(AccessMode::WriteOnly)?;
    flash.scan()?;
    if flash.block_count() < META_PEBS {
        return Err(PartitionError::OutOfRange);
    }
    flash.erase_block(0)?;
    flash.erase_block(1)?;
    let erase = flash.geometry().erase_size as usize;
    let mut buf = vec![ERASED_BYTE; erase];
    buf[..SLOT_META_SIZE].copy_from_slice(record.as_bytes());
    flash.seek_block(0)?;
    flash.write(&buf)?;
    Ok(())
}

/// Read the first CWE header back from the staged image, along with the
/// logical and physical index of the block it starts in.
pub fn read_first_header(
    opener: &dyn FlashOpener,
) -> Result<([u8; CWE_HEADER_SIZE], u32, u32), PartitionError> {
    let mut flash = opener.open(AccessMode::ReadOnly)?;
    flash.scan()?;
    let mut buf = [0u8; CWE_HEADER_SIZE];
    flash.seek_block(META_PEBS)?;
    flash.read(&mut buf)?;
    let phy = flash.physical_block(META_PEBS)?;
    Ok((buf, META_PEBS, phy))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::crc32;
    use crate::cwe::{build_header, ImageType, MiscOpts};
    use crate::mtd::sim::SimDevice;
    use crate::ubi::headers::UBI_VID_STATIC;

    const ERASE: usize = 4096;

    fn device(pebs: u32) -> SimDevice {
        SimDevice::create(pebs, ERASE as u32, 512)
    }

    fn drive(ctx: &mut PartitionCtx, mut data: &[u8]) {
        while !data.is_empty() {
            let outcome = ctx.write(data).unwrap();
            data = &data[outcome.consumed..];
        }
    }

    #[test]
    fn snapshot_is_packed() {
        assert_eq!(std::mem::size_of::<PartitionSnapshot>(), SNAPSHOT_SIZE);
    }

    #[test]
    fn raw_write_lands_after_reserved_blocks() {
        let sim = device(8);
        let mut ctx = PartitionCtx::open(&sim.opener(), 3 * ERASE as u64).unwrap();
        let data: Vec<u8> = (0..ERASE + 100).map(|i| (i % 249) as u8).collect();
        drive(&mut ctx, &data);
        assert_eq!(ctx.written(), (ERASE + 100) as u64);
        assert_eq!(ctx.flushed(), ERASE as u64);
        // Full block visible in PEB 2; tail still buffered.
        assert_eq!(sim.peb(2)[..], data[..ERASE]);
        ctx.close((ERASE + 100) as u64, false).unwrap();
        let tail = sim.read_range(3 * ERASE as u64, 200);
        assert_eq!(&tail[..100], &data[ERASE..]);
        assert!(tail[100..].iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn consumed_handshake_stops_at_block_boundary() {
        let sim = device(8);
        let mut ctx = PartitionCtx::open(&sim.opener(), 3 * ERASE as u64).unwrap();
        let data = vec![7u8; ERASE + 10];
        let outcome = ctx.write(&data).unwrap();
        assert_eq!(outcome.consumed, ERASE);
        assert!(outcome.flushed_block);
        let outcome = ctx.write(&data[outcome.consumed..]).unwrap();
        assert_eq!(outcome.consumed, 10);
        assert!(!outcome.flushed_block);
    }

    #[test]
    fn rejects_image_larger_than_capacity() {
        let sim = device(4);
        // 4 PEBs minus 2 reserved leaves 2 blocks.
        let too_big = (2 * ERASE + 1) as u64;
        assert!(matches!(
            PartitionCtx::open(&sim.opener(), too_big),
            Err(PartitionError::OutOfRange)
        ));
        assert!(PartitionCtx::open(&sim.opener(), (2 * ERASE) as u64).is_ok());
    }

    #[test]
    fn ranged_crc_spans_flash_and_buffer() {
        let sim = device(8);
        let mut ctx = PartitionCtx::open(&sim.opener(), 3 * ERASE as u64).unwrap();
        let data: Vec<u8> = (0..ERASE + 600).map(|i| (i % 241) as u8).collect();
        drive(&mut ctx, &data);
        let crc = ctx.compute_data_crc32(100, (ERASE + 400) as u64).unwrap();
        assert_eq!(crc, crc32(&data[100..100 + ERASE + 400]));
    }

    #[test]
    fn resume_reads_back_partial_block() {
        let sim = device(8);
        let mut ctx = PartitionCtx::open(&sim.opener(), 3 * ERASE as u64).unwrap();
        let data: Vec<u8> = (0..ERASE + 512).map(|i| (i % 239) as u8).collect();
        drive(&mut ctx, &data);
        // Persist the buffered tail the way a suspended close would.
        ctx.close((ERASE + 512) as u64, false).unwrap();

        let resumed_at = (ERASE + 512) as u64;
        let mut ctx =
            PartitionCtx::open_at(&sim.opener(), 3 * ERASE as u64, resumed_at, crc32(&data[..ERASE]))
                .unwrap();
        assert_eq!(ctx.written(), resumed_at);
        assert_eq!(ctx.flushed(), ERASE as u64);
        let rest: Vec<u8> = (0..ERASE - 512).map(|i| (i % 233) as u8).collect();
        drive(&mut ctx, &rest);
        assert_eq!(ctx.flushed(), 2 * ERASE as u64);
        let mut whole = data.clone();
        whole.extend_from_slice(&rest);
        let crc = ctx.compute_data_crc32(0, 2 * ERASE as u64).unwrap();
        assert_eq!(crc, crc32(&whole));
    }

    #[test]
    fn ubi_region_roundtrip() {
        let sim = device(32);
        let mut ctx = PartitionCtx::open(&sim.opener(), 20 * ERASE as u64).unwrap();
        // Some raw data first, not block aligned.
        drive(&mut ctx, &[3u8; 1000]);
        ctx.open_ubi(0x55aa_1234, true, true).unwrap();
        // Partial block was padded out; region starts at the next block.
        assert_eq!(ctx.flushed(), (3 * ERASE) as u64);

        let leb_data = ERASE - 2 * 512;
        let volume: Vec<u8> = (0..leb_data + 300).map(|i| (i % 251) as u8).collect();
        ctx.open_ubi_volume(0, UBI_VID_STATIC, volume.len() as u64, 0, "sys", true)
            .unwrap();
        let mut rest: &[u8] = &volume;
        while !rest.is_empty() {
            let outcome = ctx.write_ubi(rest).unwrap();
            rest = &rest[outcome.consumed..];
        }
        ctx.close_ubi_volume(volume.len() as u64).unwrap();
        let (size, crc) = ctx.compute_ubi_volume_crc32(0).unwrap();
        assert_eq!(size, volume.len() as u64);
        assert_eq!(crc, crc32(&volume));
        let total = ctx.close_ubi().unwrap();
        // 2 vtbl + 2 data PEBs.
        assert_eq!(total, 4);

        // Raw writing continues after the region.
        drive(&mut ctx, &vec![9u8; ERASE]);
        assert_eq!(sim.peb(2 + 1 + 4)[..], [9u8; ERASE][..]);
    }

    #[test]
    fn snapshot_resume_restores_ubi_volume() {
        let sim = device(32);
        let mut ctx = PartitionCtx::open(&sim.opener(), 20 * ERASE as u64).unwrap();
        ctx.open_ubi(7, true, true).unwrap();
        let leb_data = ERASE - 2 * 512;
        ctx.open_ubi_volume(0, UBI_VID_STATIC, 2 * leb_data as u64, 0, "modem", true)
            .unwrap();
        let first_leb: Vec<u8> = (0..leb_data).map(|i| (i % 199) as u8).collect();
        let mut rest: &[u8] = &first_leb;
        while !rest.is_empty() {
            let outcome = ctx.write_ubi(rest).unwrap();
            rest = &rest[outcome.consumed..];
        }
        let bytes = ctx.snapshot_bytes();
        drop(ctx);

        assert_eq!(bytes.len(), SNAPSHOT_SIZE);
        let mut ctx = PartitionCtx::resume(&sim.opener(), &bytes).unwrap();
        assert!(ctx.volume_open());
        let second_leb: Vec<u8> = (0..leb_data).map(|i| (i % 197) as u8).collect();
        let mut rest: &[u8] = &second_leb;
        while !rest.is_empty() {
            let outcome = ctx.write_ubi(rest).unwrap();
            rest = &rest[outcome.consumed..];
        }
        ctx.close_ubi_volume(2 * leb_data as u64).unwrap();
        let (size, crc) = ctx.compute_ubi_volume_crc32(0).unwrap();
        assert_eq!(size, 2 * leb_data as u64);
        let mut whole = first_leb;
        whole.extend_from_slice(&second_leb);
        assert_eq!(crc, crc32(&whole));
    }

    #[test]
    fn mid_block_checkpoint_carries_buffer_tail() {
        let sim = device(8);
        let mut ctx = PartitionCtx::open(&sim.opener(), 3 * ERASE as u64).unwrap();
        let data: Vec<u8> = (0..ERASE + 700).map(|i| (i % 211) as u8).collect();
        drive(&mut ctx, &data);
        let bytes = ctx.snapshot_bytes();
        assert_eq!(bytes.len(), SNAPSHOT_SIZE + 700);
        drop(ctx);

        let mut ctx = PartitionCtx::resume(&sim.opener(), &bytes).unwrap();
        assert_eq!(ctx.written(), (ERASE + 700) as u64);
        let rest: Vec<u8> = (0..ERASE - 700).map(|i| (i % 203) as u8).collect();
        drive(&mut ctx, &rest);
        let mut whole = data.clone();
        whole.extend_from_slice(&rest);
        let crc = ctx.compute_data_crc32(0, 2 * ERASE as u64).unwrap();
        assert_eq!(crc, crc32(&whole));
    }

    #[test]
    fn volume_mismatch_on_resume() {
        let sim = device(32);
        let mut ctx = PartitionCtx::open(&sim.opener(), 8 * ERASE as u64).unwrap();
        ctx.open_ubi(1, true, true).unwrap();
        ctx.open_ubi_volume(0, UBI_VID_STATIC, 512, 0, "modem", true)
            .unwrap();
        ctx.close_ubi_volume(0).unwrap();
        // Reopening with a different name must be refused.
        assert!(matches!(
            ctx.open_ubi_volume(0, UBI_VID_STATIC, 512, 0, "other", false),
            Err(PartitionError::VolumeMismatch)
        ));
    }

    #[test]
    fn metadata_written_to_first_good_peb() {
        let sim = device(8);
        let hdr = build_header(ImageType::Syst, 1024, 0x1234, MiscOpts::empty());
        let mut record = SlotMetadata::new(&hdr, 2, 2, 1424);
        write_meta(&sim.opener(), &mut record).unwrap();
        let peb0 = sim.peb(0);
        let parsed = SlotMetadata::from_bytes(&peb0[..SLOT_META_SIZE]).unwrap();
        assert_eq!(parsed.image_size(), 1424);
        assert!(peb0[SLOT_META_SIZE..].iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn metadata_skips_bad_first_peb() {
        let sim = device(8);
        sim.set_bad(0);
        let hdr = build_header(ImageType::Syst, 0, 0, MiscOpts::empty());
        let mut record = SlotMetadata::new(&hdr, 2, 3, 400);
        write_meta(&sim.opener(), &mut record).unwrap();
        // First good PEB is physical 1.
        let peb1 = sim.peb(1);
        assert!(SlotMetadata::from_bytes(&peb1[..SLOT_META_SIZE]).is_ok());
    }
}
