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

// UBI region builder.
//
// Carves a mountable UBI container out of a contiguous run of logical
// blocks of the staging partition. The first two region PEBs hold the two
// copies of the volume table (the layout volume); volume data follows, one
// LEB per PEB, each PEB fronted by an erase-counter page and a volume-ID
// page. Usable bytes per LEB are therefore `erase_size - 2 * write_size`.

pub mod headers;

use log::{debug, warn};
use thiserror::Error;

use crate::checksum::Crc32;
use crate::mtd::{FlashPartition, MtdError, ERASED_BYTE};

use headers::{
    EcHdr, VidHdr, VtblRecord, UBI_COMPAT_REJECT, UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES,
    UBI_VID_DYNAMIC, UBI_VID_STATIC, UBI_VOL_NAME_MAX, UBI_VTBL_RECORD_SIZE,
};

/// PEBs taken by the two volume-table copies at the head of the region.
pub const UBI_VTBL_PEBS: u32 = 2;

#[derive(Error, Debug)]
pub enum UbiError {
    #[error("not an ubi {0} header")]
    BadMagic(&'static str),
    #[error("ubi {0} header crc mismatch")]
    HeaderCrc(&'static str),
    #[error("unsupported ubi version {0}")]
    BadVersion(u8),
    #[error("volume name too long")]
    NameTooLong,
    #[error("volume {0} already exists")]
    VolumeExists(u32),
    #[error("volume {0} not found in the volume table")]
    VolumeNotFound(u32),
    #[error("volume id {0} out of range")]
    BadVolumeId(u32),
    #[error("volume has no room for another block")]
    VolumeFull,
    #[error("no volume is open")]
    NoOpenVolume,
    #[error("a volume is already open")]
    VolumeOpen,
    #[error(transparent)]
    Flash(#[from] MtdError),
}

/// Parameters of the volume currently being written.
#[derive(Debug, Clone)]
pub struct OpenVolume {
    pub vol_id: u32,
    pub vol_type: u8,
    pub flags: u8,
    pub name: String,
    pub reserved_pebs: u32,
    pub start_peb: u32,
    pub lebs_written: u32,
}

pub struct UbiBuilder {
    base_peb: u32,
    image_seq: u32,
    seq_valid: bool,
    next_sqnum: u64,
    vtbl: Vec<Option<VtblRecord>>,
    /// Data PEBs consumed by volumes already closed.
    data_pebs: u32,
    current: Option<OpenVolume>,
}

/// Usable data bytes per logical erase block.
pub fn leb_data_size(flash: &FlashPartition) -> usize {
    let geom = flash.geometry();
    geom.erase_size as usize - 2 * geom.write_size as usize
}

fn vtbl_slots(flash: &FlashPartition) -> usize {
    std::cmp::min(leb_data_size(flash) / UBI_VTBL_RECORD_SIZE, UBI_MAX_VOLUMES)
}

impl UbiBuilder {
    /// Lay down a fresh, empty container at `base_peb`.
    pub fn format(
        flash: &mut FlashPartition,
        base_peb: u32,
        image_seq: u32,
        seq_valid: bool,
    ) -> Result<UbiBuilder, UbiError> {
        let mut builder = UbiBuilder {
            base_peb,
            image_seq,
            seq_valid,
            next_sqnum: u64::from(UBI_VTBL_PEBS),
            vtbl: vec![None; vtbl_slots(flash)],
            data_pebs: 0,
            current: None,
        };
        builder.write_vtbl(flash)?;
        debug!(
            "formatted ubi region at block {} ({} volume slots)",
            base_peb,
            builder.vtbl.len()
        );
        Ok(builder)
    }

    /// Adopt a container already present at `base_peb` (resume path).
    pub fn adopt(flash: &mut FlashPartition, base_peb: u32) -> Result<UbiBuilder, UbiError> {
        let slots = vtbl_slots(flash);
        let mut last_err = None;
        for copy in 0..UBI_VTBL_PEBS {
            match Self::read_vtbl_copy(flash, base_peb + copy, slots) {
                Ok((image_seq, vtbl)) => {
                    return Ok(UbiBuilder {
                        base_peb,
                        image_seq,
                        seq_valid: true,
                        next_sqnum: u64::from(UBI_VTBL_PEBS),
                        vtbl,
                        data_pebs: 0,
                        current: None,
                    });
                }
                Err(e) => {
                    warn!("volume table copy {} unusable: {}", copy, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(UbiError::BadMagic("erase-counter")))
    }

    /// Adopt when a valid container exists and `force` is unset; format
    /// otherwise. The bool reports whether an existing image was kept.
    pub fn create_or_adopt(
        flash: &mut FlashPartition,
        base_peb: u32,
        image_seq: u32,
        seq_valid: bool,
        force: bool,
    ) -> Result<(UbiBuilder, bool), UbiError> {
        if !force {
            match Self::adopt(flash, base_peb) {
                Ok(builder) => return Ok((builder, true)),
                Err(UbiError::Flash(e)) => return Err(UbiError::Flash(e)),
                Err(e) => debug!("no adoptable ubi image at block {}: {}", base_peb, e),
            }
        }
        Ok((Self::format(flash, base_peb, image_seq, seq_valid)?, false))
    }

    fn read_vtbl_copy(
        flash: &mut FlashPartition,
        peb: u32,
        slots: usize,
    ) -> Result<(u32, Vec<Option<VtblRecord>>), UbiError> {
        let geom = flash.geometry();
        let erase = u64::from(geom.erase_size);
        let write = geom.write_size as usize;
        let mut page = vec![0u8; write.max(headers::UBI_EC_HDR_SIZE)];
        flash.seek_offset(u64::from(peb) * erase)?;
        flash.read(&mut page[..headers::UBI_EC_HDR_SIZE])?;
        let ec = EcHdr::decode(&page[..headers::UBI_EC_HDR_SIZE])?;
        flash.seek_offset(u64::from(peb) * erase + write as u64)?;
        flash.read(&mut page[..headers::UBI_VID_HDR_SIZE])?;
        let vid = VidHdr::decode(&page[..headers::UBI_VID_HDR_SIZE])?;
        if vid.vol_id != UBI_LAYOUT_VOLUME_ID {
            return Err(UbiError::BadMagic("layout-volume"));
        }
        let mut table = vec![0u8; slots * UBI_VTBL_RECORD_SIZE];
        flash.seek_offset(u64::from(peb) * erase + 2 * write as u64)?;
        flash.read(&mut table)?;
        let mut vtbl = Vec::with_capacity(slots);
        for slot in 0..slots {
            let rec = VtblRecord::decode(&table[slot * UBI_VTBL_RECORD_SIZE..])?;
            vtbl.push(rec);
        }
        Ok((ec.image_seq, vtbl))
    }

    /// Image sequence number stamped into subsequently written headers.
    pub fn set_image_seq(&mut self, seq: u32, valid: bool) {
        self.image_seq = seq;
        self.seq_valid = valid;
    }

    pub fn image_seq(&self) -> (u32, bool) {
        (self.image_seq, self.seq_valid)
    }

    /// Restore the write-position counters after a resume.
    pub fn restore_counters(&mut self, data_pebs: u32, next_sqnum: u64) {
        self.data_pebs = data_pebs;
        self.next_sqnum = next_sqnum;
    }

    pub fn next_sqnum(&self) -> u64 {
        self.next_sqnum
    }

    /// Region PEBs consumed so far, volume table included.
    pub fn pebs_used(&self) -> u32 {
        UBI_VTBL_PEBS
            + self.data_pebs
            + self.current.as_ref().map_or(0, |v| v.lebs_written)
    }

    pub fn base_peb(&self) -> u32 {
        self.base_peb
    }

    pub fn current_volume(&self) -> Option<&OpenVolume> {
        self.current.as_ref()
    }

    /// Type, name and flags of a volume in the table.
    pub fn volume_info(&self, vol_id: u32) -> Option<(u8, &str, u8)> {
        self.vtbl
            .get(vol_id as usize)
            .and_then(|slot| slot.as_ref())
            .map(|rec| (rec.vol_type, rec.name.as_str(), rec.flags))
    }

    fn ec_hdr(&self, flash: &FlashPartition) -> EcHdr {
        let geom = flash.geometry();
        EcHdr {
            ec: 0,
            vid_hdr_offset: geom.write_size,
            data_offset: 2 * geom.write_size,
            image_seq: if self.seq_valid { self.image_seq } else { 0 },
        }
    }

    fn write_vtbl(&mut self, flash: &mut FlashPartition) -> Result<(), UbiError> {
        let geom = flash.geometry();
        let erase = geom.erase_size as usize;
        let write = geom.write_size as usize;
        for copy in 0..UBI_VTBL_PEBS {
            let peb = self.base_peb + copy;
            flash.erase_block(peb)?;
            let mut buf = vec![ERASED_BYTE; erase];
            buf[..headers::UBI_EC_HDR_SIZE].copy_from_slice(&self.ec_hdr(flash).encode());
            let vid = VidHdr {
                vol_type: UBI_VID_DYNAMIC,
                copy_flag: 0,
                compat: UBI_COMPAT_REJECT,
                vol_id: UBI_LAYOUT_VOLUME_ID,
                lnum: copy,
                data_size: 0,
                used_ebs: 0,
                data_pad: 0,
                data_crc: 0,
                sqnum: u64::from(copy),
            };
            buf[write..write + headers::UBI_VID_HDR_SIZE].copy_from_slice(&vid.encode());
            for (slot, rec) in self.vtbl.iter().enumerate() {
                let bytes = match rec {
                    Some(rec) => rec.encode(),
                    None => VtblRecord::encode_empty(),
                };
                let at = 2 * write + slot * UBI_VTBL_RECORD_SIZE;
                buf[at..at + UBI_VTBL_RECORD_SIZE].copy_from_slice(&bytes);
            }
            flash.seek_block(peb)?;
            flash.write(&buf)?;
        }
        Ok(())
    }

    /// Register a volume and open it for writing.
    pub fn create_volume(
        &mut self,
        flash: &mut FlashPartition,
        vol_id: u32,
        name: &str,
        vol_type: u8,
        max_size: u64,
        flags: u8,
    ) -> Result<(), UbiError> {
        if self.current.is_some() {
            return Err(UbiError::VolumeOpen);
        }
        if vol_id as usize >= self.vtbl.len() {
            return Err(UbiError::BadVolumeId(vol_id));
        }
        if self.vtbl[vol_id as usize].is_some() {
            return Err(UbiError::VolumeExists(vol_id));
        }
        if name.len() > UBI_VOL_NAME_MAX {
            return Err(UbiError::NameTooLong);
        }
        let leb_data = leb_data_size(flash) as u64;
        let reserved_pebs = ((max_size + leb_data - 1) / leb_data) as u32;
        self.vtbl[vol_id as usize] = Some(VtblRecord {
            reserved_pebs,
            alignment: 1,
            data_pad: 0,
            vol_type,
            upd_marker: 0,
            name: name.to_owned(),
            flags,
        });
        self.write_vtbl(flash)?;
        self.current = Some(OpenVolume {
            vol_id,
            vol_type,
            flags,
            name: name.to_owned(),
            reserved_pebs,
            start_peb: self.base_peb + UBI_VTBL_PEBS + self.data_pebs,
            lebs_written: 0,
        });
        Ok(())
    }

    /// Reopen a volume found in the table (resume path). The caller
    /// restores `lebs_written` from its checkpoint.
    pub fn open_volume(
        &mut self,
        vol_id: u32,
        lebs_written: u32,
    ) -> Result<&OpenVolume, UbiError> {
        if self.current.is_some() {
            return Err(UbiError::VolumeOpen);
        }
        let rec = self
            .vtbl
            .get(vol_id as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(UbiError::VolumeNotFound(vol_id))?
            .clone();
        self.current = Some(OpenVolume {
            vol_id,
            vol_type: rec.vol_type,
            flags: rec.flags,
            name: rec.name,
            reserved_pebs: rec.reserved_pebs,
            start_peb: self.base_peb + UBI_VTBL_PEBS + self.data_pebs,
            lebs_written,
        });
        Ok(self.current.as_ref().unwrap())
    }

    /// Append the next logical block of the open volume. `data` is a full
    /// LEB except possibly the last; the PEB remainder is padded with the
    /// erased value.
    pub fn write_leb(&mut self, flash: &mut FlashPartition, data: &[u8]) -> Result<(), UbiError> {
        let ec = self.ec_hdr(flash);
        let geom = flash.geometry();
        let erase = geom.erase_size as usize;
        let write = geom.write_size as usize;
        let leb_data = leb_data_size(flash);
        let sqnum = self.next_sqnum;
        let vol = self.current.as_mut().ok_or(UbiError::NoOpenVolume)?;
        if data.len() > leb_data {
            return Err(UbiError::VolumeFull);
        }
        if vol.lebs_written >= vol.reserved_pebs {
            return Err(UbiError::VolumeFull);
        }
        let peb = vol.start_peb + vol.lebs_written;
        let mut buf = vec![ERASED_BYTE; erase];
        buf[..headers::UBI_EC_HDR_SIZE].copy_from_slice(&ec.encode());
        let vid = VidHdr {
            vol_type: vol.vol_type,
            copy_flag: 0,
            compat: 0,
            vol_id: vol.vol_id,
            lnum: vol.lebs_written,
            data_size: data.len() as u32,
            used_ebs: if vol.vol_type == UBI_VID_STATIC {
                vol.reserved_pebs
            } else {
                0
            },
            data_pad: 0,
            data_crc: crate::checksum::ubi_crc32(data),
            sqnum,
        };
        buf[write..write + headers::UBI_VID_HDR_SIZE].copy_from_slice(&vid.encode());
        buf[2 * write..2 * write + data.len()].copy_from_slice(data);
        flash.seek_block(peb)?;
        flash.write(&buf)?;
        vol.lebs_written += 1;
        self.next_sqnum = sqnum + 1;
        Ok(())
    }

    /// Read back the data region of one logical block of the open volume.
    pub fn read_leb(
        &self,
        flash: &mut FlashPartition,
        leb: u32,
        buf: &mut [u8],
    ) -> Result<(), UbiError> {
        let geom = flash.geometry();
        let vol = self.current.as_ref().ok_or(UbiError::NoOpenVolume)?;
        if leb >= vol.lebs_written {
            return Err(UbiError::VolumeFull);
        }
        let peb = vol.start_peb + leb;
        flash.seek_offset(
            u64::from(peb) * u64::from(geom.erase_size) + 2 * u64::from(geom.write_size),
        )?;
        flash.read(buf)?;
        Ok(())
    }

    /// Close the open volume. `actual_size` is the byte length the caller
    /// laid down; the per-block headers already carry the final sizes.
    pub fn close_volume(&mut self, actual_size: u64) -> Result<u32, UbiError> {
        let vol = self.current.take().ok_or(UbiError::NoOpenVolume)?;
        debug!(
            "closed ubi volume {} ({} LEBs, {} bytes)",
            vol.vol_id, vol.lebs_written, actual_size
        );
        self.data_pebs += vol.lebs_written;
        Ok(vol.lebs_written)
    }

    fn scan_volume(
        &self,
        flash: &mut FlashPartition,
        vol_id: u32,
    ) -> Result<Vec<(u32, u32, u32)>, UbiError> {
        let geom = flash.geometry();
        let erase = u64::from(geom.erase_size);
        let write = u64::from(geom.write_size);
        let first = self.base_peb + UBI_VTBL_PEBS;
        let last = self.base_peb + self.pebs_used();
        let mut lebs = Vec::new();
        let mut page = vec![0u8; headers::UBI_VID_HDR_SIZE];
        for peb in first..last {
            flash.seek_offset(u64::from(peb) * erase + write)?;
            flash.read(&mut page)?;
            let vid = VidHdr::decode(&page)?;
            if vid.vol_id == vol_id {
                lebs.push((vid.lnum, peb, vid.data_size));
            }
        }
        lebs.sort_by_key(|&(lnum, _, _)| lnum);
        Ok(lebs)
    }

    /// Size and CRC32 of one volume's data, in logical block order.
    pub fn volume_crc(
        &self,
        flash: &mut FlashPartition,
        vol_id: u32,
    ) -> Result<(u64, u32), UbiError> {
        let geom = flash.geometry();
        let erase = u64::from(geom.erase_size);
        let write = u64::from(geom.write_size);
        let lebs = self.scan_volume(flash, vol_id)?;
        if lebs.is_empty() {
            return Err(UbiError::VolumeNotFound(vol_id));
        }
        let mut crc = Crc32::new();
        let mut size = 0u64;
        let mut data = vec![0u8; leb_data_size(flash)];
        for (_lnum, peb, data_size) in lebs {
            flash.seek_offset(u64::from(peb) * erase + 2 * write)?;
            flash.read(&mut data[..data_size as usize])?;
            crc.update(&data[..data_size as usize]);
            size += u64::from(data_size);
        }
        Ok((size, crc.value()))
    }

    /// Size and CRC32 over every volume's data, in volume-id order.
    pub fn region_crc(&self, flash: &mut FlashPartition) -> Result<(u64, u32), UbiError> {
        let mut crc = Crc32::new();
        let mut size = 0u64;
        let geom = flash.geometry();
        let erase = u64::from(geom.erase_size);
        let write = u64::from(geom.write_size);
        let mut data = vec![0u8; leb_data_size(flash)];
        for vol_id in 0..self.vtbl.len() as u32 {
            if self.vtbl[vol_id as usize].is_none() {
                continue;
            }
            for (_lnum, peb, data_size) in self.scan_volume(flash, vol_id)? {
                flash.seek_offset(u64::from(peb) * erase + 2 * write)?;
                flash.read(&mut data[..data_size as usize])?;
                crc.update(&data[..data_size as usize]);
                size += u64::from(data_size);
            }
        }
        Ok((size, crc.value()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::checksum::crc32;
    use crate::mtd::sim::SimDevice;
    use crate::mtd::AccessMode;

    fn flash(pebs: u32) -> (FlashPartition, SimDevice) {
        let sim = SimDevice::create(pebs, 4096, 512);
        let mut flash = FlashPartition::new(Box::new(sim.raw()), AccessMode::ReadWrite);
        flash.erase_all_good().unwrap();
        flash.scan().unwrap();
        (flash, sim)
    }

    #[test]
    fn format_then_adopt() {
        let (mut flash, _sim) = flash(16);
        let builder = UbiBuilder::format(&mut flash, 2, 0xcafe_f00d, true).unwrap();
        assert_eq!(builder.pebs_used(), 2);
        let adopted = UbiBuilder::adopt(&mut flash, 2).unwrap();
        assert_eq!(adopted.image_seq(), (0xcafe_f00d, true));
        assert!(adopted.volume_info(0).is_none());
    }

    #[test]
    fn adopt_falls_back_to_second_copy() {
        let (mut flash, sim) = flash(16);
        UbiBuilder::format(&mut flash, 2, 7, true).unwrap();
        // Corrupt the first volume-table PEB.
        sim.fill(2 * 4096, &[0u8; 64]);
        let adopted = UbiBuilder::adopt(&mut flash, 2).unwrap();
        assert_eq!(adopted.image_seq(), (7, true));
    }

    #[test]
    fn create_or_adopt_honors_force() {
        let (mut flash, _sim) = flash(16);
        UbiBuilder::format(&mut flash, 2, 1, true).unwrap();
        let (_b, kept) = UbiBuilder::create_or_adopt(&mut flash, 2, 9, true, false).unwrap();
        assert!(kept);
        let (b, kept) = UbiBuilder::create_or_adopt(&mut flash, 2, 9, true, true).unwrap();
        assert!(!kept);
        assert_eq!(b.image_seq(), (9, true));
    }

    #[test]
    fn volume_write_and_crc() {
        let (mut flash, _sim) = flash(16);
        let mut builder = UbiBuilder::format(&mut flash, 2, 3, true).unwrap();
        let leb_data = leb_data_size(&flash);
        builder
            .create_volume(
                &mut flash,
                0,
                "rootfs",
                headers::UBI_VID_STATIC,
                (leb_data + 100) as u64,
                0,
            )
            .unwrap();
        let full: Vec<u8> = (0..leb_data).map(|i| (i % 253) as u8).collect();
        let tail = vec![0x5au8; 100];
        builder.write_leb(&mut flash, &full).unwrap();
        builder.write_leb(&mut flash, &tail).unwrap();
        builder.close_volume((leb_data + 100) as u64).unwrap();
        assert_eq!(builder.pebs_used(), 4);

        let (size, crc) = builder.volume_crc(&mut flash, 0).unwrap();
        assert_eq!(size, (leb_data + 100) as u64);
        let mut whole = full.clone();
        whole.extend_from_slice(&tail);
        assert_eq!(crc, crc32(&whole));
    }

    #[test]
    fn written_blocks_scan_back() {
        let (mut flash, sim) = flash(16);
        let mut builder = UbiBuilder::format(&mut flash, 2, 5, true).unwrap();
        builder
            .create_volume(&mut flash, 0, "sys", headers::UBI_VID_DYNAMIC, 512, 0)
            .unwrap();
        builder.write_leb(&mut flash, &[1u8; 512]).unwrap();
        builder.close_volume(512).unwrap();

        // Data LEB landed in PEB 4 (2 reserved + 2 vtbl).
        let peb = sim.peb(4);
        let ec = EcHdr::decode(&peb[..64]).unwrap();
        assert_eq!(ec.image_seq, 5);
        assert_eq!(ec.data_offset, 1024);
        let vid = VidHdr::decode(&peb[512..576]).unwrap();
        assert_eq!(vid.vol_id, 0);
        assert_eq!(vid.lnum, 0);
        assert_eq!(vid.data_size, 512);
        assert_eq!(&peb[1024..1536], &[1u8; 512][..]);
    }

    #[test]
    fn reopen_after_adopt() {
        let (mut flash, _sim) = flash(16);
        let mut builder = UbiBuilder::format(&mut flash, 2, 1, true).unwrap();
        builder
            .create_volume(&mut flash, 0, "modem", headers::UBI_VID_STATIC, 2048, 0)
            .unwrap();
        builder.write_leb(&mut flash, &[9u8; 1024]).unwrap();

        let mut adopted = UbiBuilder::adopt(&mut flash, 2).unwrap();
        adopted.restore_counters(0, builder.next_sqnum());
        let info = adopted.volume_info(0).unwrap();
        assert_eq!(info, (headers::UBI_VID_STATIC, "modem", 0));
        let vol = adopted.open_volume(0, 1).unwrap();
        assert_eq!(vol.lebs_written, 1);
        assert_eq!(vol.start_peb, 4);
    }

    #[test]
    fn volume_bookkeeping_errors() {
        let (mut flash, _sim) = flash(16);
        let mut builder = UbiBuilder::format(&mut flash, 2, 0, false).unwrap();
        assert!(matches!(
            builder.write_leb(&mut flash, &[0u8; 16]),
            Err(UbiError::NoOpenVolume)
        ));
        builder
            .create_volume(&mut flash, 1, "a", headers::UBI_VID_DYNAMIC, 100, 0)
            .unwrap();
        assert!(matches!(
            builder.create_volume(&mut flash, 1, "b", headers::UBI_VID_DYNAMIC, 100, 0),
            Err(UbiError::VolumeOpen)
        ));
    }
}
