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

// Two-file round-robin checkpoint of the engine state.
//
// Each file holds a single record: the packed save-context struct followed
// by the partition manager's opaque snapshot blob. Writes alternate between
// the files, so at any instant at least one of them carries either the
// previous checkpoint or the new one; a torn write costs at most one
// checkpoint of progress.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use log::{debug, warn};
use thiserror::Error;

use crate::checksum::crc32;

pub const RESUME_FILE_NAMES: [&str; 2] = ["resume_ctx_0", "resume_ctx_1"];

/// Packed engine checkpoint. Fields mirror the parser and accounting state
/// of the engine; the partition snapshot travels separately as a blob with
/// its own CRC.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SaveCtx {
    pub ctx_counter: u32,
    pub file_index: u32,
    pub image_type: [u8; 4],
    pub image_size: u32,
    pub image_crc: u32,
    pub current_image_crc: u32,
    pub current_global_crc: u32,
    pub total_read: u64,
    pub current_in_image_offset: u64,
    pub full_image_crc: u32,
    pub full_image_length: u64,
    pub in_image_length: u64,
    pub misc_opts: u32,
    pub phase: u8,
    pub is_image_to_be_read: u8,
    pub had_delta: u8,
    pub first_header_seen: u8,
    pub ubi_volume_created: u8,
    pub patch_meta_valid: u8,
    pub patch_slice_valid: u8,
    pub meta_count: u8,
    pub meta_replayed: u8,
    pub body_remaining: u64,
    pub patch_remaining: u32,
    pub slices_done: u32,
    pub patch_meta: [u8; 56],
    pub patch_slice: [u8; 12],
    pub meta_img_data: [u8; 3600],
    pub first_header: [u8; 400],
    pub partition_len: u32,
    pub partition_crc: u32,
    pub ctx_crc: u32,
}

pub const SAVE_CTX_SIZE: usize = 4173;
const CTX_CRC_OFFSET: usize = SAVE_CTX_SIZE - 4;

impl SaveCtx {
    pub fn zeroed() -> SaveCtx {
        // Every field is a plain integer or byte array.
        unsafe { std::mem::zeroed() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const SaveCtx as *const u8, SAVE_CTX_SIZE)
        }
    }

    fn refresh_crc(&mut self) {
        let crc = crc32(&self.as_bytes()[..CTX_CRC_OFFSET]);
        self.ctx_crc = crc;
    }

    /// Decode and CRC-check a record.
    pub fn from_bytes(data: &[u8]) -> Option<SaveCtx> {
        if data.len() < SAVE_CTX_SIZE {
            return None;
        }
        let ctx = unsafe { std::ptr::read_unaligned(data.as_ptr() as *const SaveCtx) };
        let stored = ctx.ctx_crc;
        if stored != crc32(&data[..CTX_CRC_OFFSET]) {
            return None;
        }
        Some(ctx)
    }
}

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Journal {
    dir: PathBuf,
    next_index: u32,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>) -> Journal {
        Journal {
            dir: dir.into(),
            next_index: 0,
        }
    }

    fn file_path(&self, index: u32) -> PathBuf {
        self.dir.join(RESUME_FILE_NAMES[index as usize])
    }

    /// Commit one checkpoint: bump the generation, stamp both CRCs, write
    /// the file opposite the last one written and fsync it.
    pub fn save(&mut self, ctx: &mut SaveCtx, blob: &[u8]) -> Result<(), JournalError> {
        ctx.ctx_counter = ctx.ctx_counter.wrapping_add(1);
        ctx.file_index = self.next_index;
        ctx.partition_len = blob.len() as u32;
        ctx.partition_crc = crc32(blob);
        ctx.refresh_crc();
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(self.next_index);
        let mut file = fs::File::create(&path)?;
        file.write_all(ctx.as_bytes())?;
        file.write_all(blob)?;
        file.sync_all()?;
        debug!(
            "checkpoint {} written to {}",
            { ctx.ctx_counter },
            path.display()
        );
        self.next_index ^= 1;
        Ok(())
    }

    fn read_record(&self, index: u32) -> Option<(SaveCtx, Vec<u8>)> {
        let bytes = fs::read(self.file_path(index)).ok()?;
        let ctx = SaveCtx::from_bytes(&bytes)?;
        let blob_len = ctx.partition_len as usize;
        if bytes.len() < SAVE_CTX_SIZE + blob_len {
            return None;
        }
        let blob = bytes[SAVE_CTX_SIZE..SAVE_CTX_SIZE + blob_len].to_vec();
        if ctx.partition_crc != crc32(&blob) {
            return None;
        }
        Some((ctx, blob))
    }

    /// The newest valid checkpoint, without touching journal state.
    pub fn peek(&self) -> Option<(SaveCtx, Vec<u8>)> {
        let a = self.read_record(0);
        let b = self.read_record(1);
        match (a, b) {
            (Some(a), Some(b)) => {
                if a.0.ctx_counter >= b.0.ctx_counter {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Load the newest valid checkpoint and aim the next write at the
    /// other file. If files exist but none validates, both are erased and
    /// the engine cold-starts.
    pub fn load(&mut self) -> Option<(SaveCtx, Vec<u8>)> {
        match self.peek() {
            Some((ctx, blob)) => {
                self.next_index = ctx.file_index ^ 1;
                Some((ctx, blob))
            }
            None => {
                let any_present = (0..2).any(|i| self.file_path(i).exists());
                if any_present {
                    warn!("no valid resume context, erasing journal");
                    if let Err(e) = self.erase() {
                        warn!("journal erase failed: {}", e);
                    }
                }
                None
            }
        }
    }

    /// Remove both files; missing files are fine.
    pub fn erase(&mut self) -> Result<(), JournalError> {
        for index in 0..2 {
            match fs::remove_file(self.file_path(index)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.next_index = 0;
        Ok(())
    }
}
