// On-media UBI structures: erase-counter header, volume-ID header and the
// volume-table record, per the kernel's drivers/mtd/ubi layout. All fields
// are big-endian; header CRCs use the no-final-xor CRC32 variant.

use std::convert::TryInto;

use crate::checksum::ubi_crc32;

use super::UbiError;

pub const UBI_EC_HDR_SIZE: usize = 64;
pub const UBI_VID_HDR_SIZE: usize = 64;
pub const UBI_VTBL_RECORD_SIZE: usize = 172;

pub const UBI_EC_HDR_MAGIC: u32 = 0x5542_4923; // "UBI#"
pub const UBI_VID_HDR_MAGIC: u32 = 0x5542_4921; // "UBI!"
pub const UBI_VERSION: u8 = 1;

pub const UBI_VID_DYNAMIC: u8 = 1;
pub const UBI_VID_STATIC: u8 = 2;
pub const UBI_COMPAT_REJECT: u8 = 5;

pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7fff_efff;
pub const UBI_MAX_VOLUMES: usize = 128;
pub const UBI_VOL_NAME_MAX: usize = 127;

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn be64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Erase-counter header, first page of every UBI PEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcHdr {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl EcHdr {
    pub fn encode(&self) -> [u8; UBI_EC_HDR_SIZE] {
        let mut buf = [0u8; UBI_EC_HDR_SIZE];
        buf[0..4].copy_from_slice(&UBI_EC_HDR_MAGIC.to_be_bytes());
        buf[4] = UBI_VERSION;
        buf[8..16].copy_from_slice(&self.ec.to_be_bytes());
        buf[16..20].copy_from_slice(&self.vid_hdr_offset.to_be_bytes());
        buf[20..24].copy_from_slice(&self.data_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.image_seq.to_be_bytes());
        let crc = ubi_crc32(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<EcHdr, UbiError> {
        if buf.len() < UBI_EC_HDR_SIZE || be32(buf, 0) != UBI_EC_HDR_MAGIC {
            return Err(UbiError::BadMagic("erase-counter"));
        }
        if buf[4] != UBI_VERSION {
            return Err(UbiError::BadVersion(buf[4]));
        }
        if be32(buf, 60) != ubi_crc32(&buf[..60]) {
            return Err(UbiError::HeaderCrc("erase-counter"));
        }
        Ok(EcHdr {
            ec: be64(buf, 8),
            vid_hdr_offset: be32(buf, 16),
            data_offset: be32(buf, 20),
            image_seq: be32(buf, 24),
        })
    }
}

/// Volume-ID header, second page of a mapped UBI PEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VidHdr {
    pub vol_type: u8,
    pub copy_flag: u8,
    pub compat: u8,
    pub vol_id: u32,
    pub lnum: u32,
    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,
    pub sqnum: u64,
}

impl VidHdr {
    pub fn encode(&self) -> [u8; UBI_VID_HDR_SIZE] {
        let mut buf = [0u8; UBI_VID_HDR_SIZE];
        buf[0..4].copy_from_slice(&UBI_VID_HDR_MAGIC.to_be_bytes());
        buf[4] = UBI_VERSION;
        buf[5] = self.vol_type;
        buf[6] = self.copy_flag;
        buf[7] = self.compat;
        buf[8..12].copy_from_slice(&self.vol_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.lnum.to_be_bytes());
        buf[20..24].copy_from_slice(&self.data_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.used_ebs.to_be_bytes());
        buf[28..32].copy_from_slice(&self.data_pad.to_be_bytes());
        buf[32..36].copy_from_slice(&self.data_crc.to_be_bytes());
        buf[40..48].copy_from_slice(&self.sqnum.to_be_bytes());
        let crc = ubi_crc32(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<VidHdr, UbiError> {
        if buf.len() < UBI_VID_HDR_SIZE || be32(buf, 0) != UBI_VID_HDR_MAGIC {
            return Err(UbiError::BadMagic("volume-id"));
        }
        if buf[4] != UBI_VERSION {
            return Err(UbiError::BadVersion(buf[4]));
        }
        if be32(buf, 60) != ubi_crc32(&buf[..60]) {
            return Err(UbiError::HeaderCrc("volume-id"));
        }
        Ok(VidHdr {
            vol_type: buf[5],
            copy_flag: buf[6],
            compat: buf[7],
            vol_id: be32(buf, 8),
            lnum: be32(buf, 12),
            data_size: be32(buf, 20),
            used_ebs: be32(buf, 24),
            data_pad: be32(buf, 28),
            data_crc: be32(buf, 32),
            sqnum: be64(buf, 40),
        })
    }
}

/// One record of the volume table held in the layout volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VtblRecord {
    pub reserved_pebs: u32,
    pub alignment: u32,
    pub data_pad: u32,
    pub vol_type: u8,
    pub upd_marker: u8,
    pub name: String,
    pub flags: u8,
}

impl VtblRecord {
    pub fn encode(&self) -> [u8; UBI_VTBL_RECORD_SIZE] {
        let mut buf = [0u8; UBI_VTBL_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.reserved_pebs.to_be_bytes());
        buf[4..8].copy_from_slice(&self.alignment.to_be_bytes());
        buf[8..12].copy_from_slice(&self.data_pad.to_be_bytes());
        buf[12] = self.vol_type;
        buf[13] = self.upd_marker;
        let name = self.name.as_bytes();
        buf[14..16].copy_from_slice(&(name.len() as u16).to_be_bytes());
        buf[16..16 + name.len()].copy_from_slice(name);
        buf[144] = self.flags;
        let crc = ubi_crc32(&buf[..168]);
        buf[168..172].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// An unused slot still carries a valid CRC over its zero bytes.
    pub fn encode_empty() -> [u8; UBI_VTBL_RECORD_SIZE] {
        let mut buf = [0u8; UBI_VTBL_RECORD_SIZE];
        let crc = ubi_crc32(&buf[..168]);
        buf[168..172].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decode one slot; `Ok(None)` for an unused record.
    pub fn decode(buf: &[u8]) -> Result<Option<VtblRecord>, UbiError> {
        if buf.len() < UBI_VTBL_RECORD_SIZE {
            return Err(UbiError::BadMagic("volume-table"));
        }
        if be32(buf, 168) != ubi_crc32(&buf[..168]) {
            return Err(UbiError::HeaderCrc("volume-table"));
        }
        let reserved_pebs = be32(buf, 0);
        let name_len = u16::from_be_bytes(buf[14..16].try_into().unwrap()) as usize;
        if reserved_pebs == 0 && name_len == 0 {
            return Ok(None);
        }
        if name_len > UBI_VOL_NAME_MAX {
            return Err(UbiError::NameTooLong);
        }
        Ok(Some(VtblRecord {
            reserved_pebs,
            alignment: be32(buf, 4),
            data_pad: be32(buf, 8),
            vol_type: buf[12],
            upd_marker: buf[13],
            name: String::from_utf8_lossy(&buf[16..16 + name_len]).into_owned(),
            flags: buf[144],
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ec_roundtrip() {
        let hdr = EcHdr {
            ec: 0,
            vid_hdr_offset: 512,
            data_offset: 1024,
            image_seq: 0x1234_5678,
        };
        let buf = hdr.encode();
        assert_eq!(&buf[0..4], b"UBI#");
        assert_eq!(EcHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn ec_crc_rejected() {
        let mut buf = EcHdr {
            ec: 1,
            vid_hdr_offset: 512,
            data_offset: 1024,
            image_seq: 0,
        }
        .encode();
        buf[8] ^= 1;
        assert!(matches!(
            EcHdr::decode(&buf),
            Err(UbiError::HeaderCrc("erase-counter"))
        ));
    }

    #[test]
    fn vid_roundtrip() {
        let hdr = VidHdr {
            vol_type: UBI_VID_STATIC,
            copy_flag: 0,
            compat: 0,
            vol_id: 3,
            lnum: 9,
            data_size: 2048,
            used_ebs: 10,
            data_pad: 0,
            data_crc: 0xaabb_ccdd,
            sqnum: 42,
        };
        let buf = hdr.encode();
        assert_eq!(&buf[0..4], b"UBI!");
        assert_eq!(VidHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn vtbl_roundtrip_and_empty() {
        let rec = VtblRecord {
            reserved_pebs: 7,
            alignment: 1,
            data_pad: 0,
            vol_type: UBI_VID_DYNAMIC,
            upd_marker: 0,
            name: "rootfs".to_owned(),
            flags: 0,
        };
        let buf = rec.encode();
        assert_eq!(VtblRecord::decode(&buf).unwrap(), Some(rec));
        assert_eq!(VtblRecord::decode(&VtblRecord::encode_empty()).unwrap(), None);
    }

    #[test]
    fn vtbl_corruption_rejected() {
        let mut buf = VtblRecord::encode_empty();
        buf[0] = 1;
        assert!(matches!(
            VtblRecord::decode(&buf),
            Err(UbiError::HeaderCrc("volume-table"))
        ));
    }
}
