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

// The 256-byte slot metadata record the bootloader reads from the head of
// the staging partition. Fields are native little-endian, matching the
// modules this engine runs on; the leading bytes are the first CWE header
// of the package, truncated.

use std::convert::TryInto;

use thiserror::Error;

use crate::checksum::crc32;
use crate::cwe::CWE_HEADER_SIZE;

pub const SLOT_META_SIZE: usize = 256;
pub const SLOT_MAGIC_BEGIN: u32 = 0x92b1_5380;
pub const SLOT_MAGIC_END: u32 = 0x31dd_f742;

const CWE_PREFIX_LEN: usize = 128;
const CRC_OFFSET: usize = SLOT_META_SIZE - 4;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("slot metadata needs {SLOT_META_SIZE} bytes, got {0}")]
    ShortRecord(usize),
    #[error("slot metadata magic mismatch")]
    BadMagic,
    #[error("slot metadata crc mismatch")]
    Crc,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SlotMetadata {
    cwe_header: [u8; CWE_PREFIX_LEN],
    magic_begin: u32,
    version: u32,
    offset: u32,
    logical_block: u32,
    phy_block: u32,
    image_size: u32,
    dld_source: u32,
    nb_components: u32,
    reserved: [u8; 88],
    magic_end: u32,
    crc32_le: u32,
}

impl SlotMetadata {
    pub fn new(
        first_cwe_header: &[u8; CWE_HEADER_SIZE],
        logical_block: u32,
        phy_block: u32,
        image_size: u32,
    ) -> SlotMetadata {
        let mut cwe_header = [0u8; CWE_PREFIX_LEN];
        cwe_header.copy_from_slice(&first_cwe_header[..CWE_PREFIX_LEN]);
        let mut record = SlotMetadata {
            cwe_header,
            magic_begin: SLOT_MAGIC_BEGIN,
            version: 1,
            offset: 0,
            logical_block,
            phy_block,
            image_size,
            dld_source: 0,
            nb_components: 1,
            reserved: [0u8; 88],
            magic_end: SLOT_MAGIC_END,
            crc32_le: 0,
        };
        record.set_checksum();
        record
    }

    fn set_checksum(&mut self) {
        let bytes = unsafe {
            std::slice::from_raw_parts(self as *const SlotMetadata as *const u8, SLOT_META_SIZE)
        };
        self.crc32_le = crc32(&bytes[..CRC_OFFSET]);
    }

    /// The record as it goes to flash. The checksum is refreshed in case a
    /// field was touched since construction.
    pub fn as_bytes(&mut self) -> &[u8] {
        self.set_checksum();
        unsafe {
            std::slice::from_raw_parts(self as *const SlotMetadata as *const u8, SLOT_META_SIZE)
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<SlotMetadata, MetadataError> {
        if data.len() < SLOT_META_SIZE {
            return Err(MetadataError::ShortRecord(data.len()));
        }
        let stored = u32::from_le_bytes(data[CRC_OFFSET..SLOT_META_SIZE].try_into().unwrap());
        if stored != crc32(&data[..CRC_OFFSET]) {
            return Err(MetadataError::Crc);
        }
        let record =
            unsafe { std::ptr::read_unaligned(data.as_ptr() as *const SlotMetadata) };
        if record.magic_begin() != SLOT_MAGIC_BEGIN || record.magic_end() != SLOT_MAGIC_END {
            return Err(MetadataError::BadMagic);
        }
        Ok(record)
    }

    pub fn cwe_header_prefix(&self) -> &[u8] {
        &self.cwe_header
    }

    pub fn magic_begin(&self) -> u32 {
        self.magic_begin
    }

    pub fn magic_end(&self) -> u32 {
        self.magic_end
    }

    pub fn logical_block(&self) -> u32 {
        self.logical_block
    }

    pub fn phy_block(&self) -> u32 {
        self.phy_block
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn nb_components(&self) -> u32 {
        self.nb_components
    }
}
