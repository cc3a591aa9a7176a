// MTD character-device ioctls, mirroring include/uapi/mtd/mtd-abi.h.

use nix::{ioctl_read, ioctl_write_ptr};

/// `type` values reported by MEMGETINFO.
pub const MTD_NANDFLASH: u8 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MtdInfoUser {
    pub mtd_type: u8,
    pub flags: u32,
    pub size: u32,
    pub erasesize: u32,
    pub writesize: u32,
    pub oobsize: u32,
    pub padding: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct EraseInfoUser {
    pub start: u32,
    pub length: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MtdEccStats {
    pub corrected: u32,
    pub failed: u32,
    pub badblocks: u32,
    pub bbtblocks: u32,
}

ioctl_read!(mem_get_info, b'M', 1, MtdInfoUser);
ioctl_write_ptr!(mem_erase, b'M', 2, EraseInfoUser);
ioctl_write_ptr!(mem_get_bad_block, b'M', 11, libc::loff_t);
ioctl_write_ptr!(mem_set_bad_block, b'M', 12, libc::loff_t);
ioctl_read!(ecc_get_stats, b'M', 18, MtdEccStats);
