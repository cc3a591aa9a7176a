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

// The update engine: an incremental parser over the CWE byte stream that
// drives the staging partition, the patch appliers and the resume journal.
//
// The parser decides byte-for-byte how much to consume next: a 400-byte
// CWE header, a 56-byte patch meta header, a 12-byte slice header, or up
// to 64 KiB of body. Every byte is parsed, written, checksummed and
// checkpointed before the next one is read.

pub mod input;

use std::os::unix::io::OwnedFd;

use tracing::{debug, info};

use crate::checksum::Crc32;
use crate::config::{Config, CHUNK_LENGTH};
use crate::cwe::{CweHeader, ImageType, MiscOpts, CWE_HEADER_SIZE, META_MAX_HEADERS};
use crate::error::{Result, UpdateError};
use crate::journal::{Journal, SaveCtx};
use crate::mtd::{AccessMode, FlashOpener, FlashPartition, MtdError};
use crate::partition::{self, metadata::SlotMetadata, PartitionCtx, PartitionError};
use crate::patch::{
    PatchFamily, PatchMetaHeader, PatchSliceHeader, PATCH_HEADER_SIZE, PATCH_META_HEADER_SIZE,
};
use crate::status::{self, DwlStatus};
use crate::ubi::headers::{UBI_VID_DYNAMIC, UBI_VID_STATIC};

use delta::{Bsdiff, Imgdiff, Nodiff, PatchApplier, PatchError, PatchSink};
use input::{InputStream, ReadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Next chunk is a 400-byte CWE header.
    Header,
    /// Body of a META sub-package: concatenated original headers.
    MetaBody,
    /// Body bytes of a plain leaf component.
    Body,
    /// Next chunk is a patch meta header.
    PatchMeta,
    /// Next chunk is a patch slice header.
    PatchSlice,
    /// Patch-stream bytes of the current slice.
    PatchBody,
    /// The package is fully ingested.
    Complete,
}

impl Phase {
    fn code(self) -> u8 {
        match self {
            Phase::Header => 0,
            Phase::MetaBody => 1,
            Phase::Body => 2,
            Phase::PatchMeta => 3,
            Phase::PatchSlice => 4,
            Phase::PatchBody => 5,
            Phase::Complete => 6,
        }
    }

    fn from_code(code: u8) -> Option<Phase> {
        match code {
            0 => Some(Phase::Header),
            1 => Some(Phase::MetaBody),
            2 => Some(Phase::Body),
            3 => Some(Phase::PatchMeta),
            4 => Some(Phase::PatchSlice),
            5 => Some(Phase::PatchBody),
            6 => Some(Phase::Complete),
            _ => None,
        }
    }
}

struct State {
    ctx_counter: u32,
    phase: Phase,
    first_header_seen: bool,
    first_header: [u8; CWE_HEADER_SIZE],
    full_image_length: u64,
    full_image_crc: u32,
    in_image_length: u64,
    image_type: Option<ImageType>,
    image_size: u64,
    image_crc: u32,
    misc_opts: MiscOpts,
    current_image_crc: Crc32,
    current_global_crc: Crc32,
    total_read: u64,
    current_in_image_offset: u64,
    body_remaining: u64,
    meta_headers: Vec<[u8; CWE_HEADER_SIZE]>,
    meta_replayed: usize,
    patch_meta: Option<PatchMetaHeader>,
    patch_slice: Option<PatchSliceHeader>,
    patch_remaining: u64,
    slices_done: u32,
    had_delta: bool,
    ubi_volume_created: bool,
    dest_start: u64,
    slot_metadata: Option<SlotMetadata>,
}

impl State {
    fn fresh() -> State {
        State {
            ctx_counter: 0,
            phase: Phase::Header,
            first_header_seen: false,
            first_header: [0u8; CWE_HEADER_SIZE],
            full_image_length: 0,
            full_image_crc: 0,
            in_image_length: u64::MAX,
            image_type: None,
            image_size: 0,
            image_crc: 0,
            misc_opts: MiscOpts::empty(),
            current_image_crc: Crc32::new(),
            current_global_crc: Crc32::new(),
            total_read: 0,
            current_in_image_offset: 0,
            body_remaining: 0,
            meta_headers: Vec::new(),
            meta_replayed: 0,
            patch_meta: None,
            patch_slice: None,
            patch_remaining: 0,
            slices_done: 0,
            had_delta: false,
            ubi_volume_created: false,
            dest_start: 0,
            slot_metadata: None,
        }
    }
}

/// Destination adapter handed to the patch appliers: output goes through
/// the partition manager (raw space or the open UBI volume), origin reads
/// come from the configured origin partition.
struct EngineSink<'a> {
    part: &'a mut PartitionCtx,
    origin: Option<&'a mut FlashPartition>,
    to_ubi: bool,
    written: &'a mut u64,
    global: &'a mut Crc32,
    dest_limit: u64,
}

impl<'a> PatchSink for EngineSink<'a> {
    fn write(&mut self, data: &[u8]) -> std::result::Result<(), PatchError> {
        if *self.written + data.len() as u64 > self.dest_limit {
            return Err(PatchError::Sink("destination size exceeded".to_owned()));
        }
        let mut rest = data;
        while !rest.is_empty() {
            let outcome = if self.to_ubi {
                self.part.write_ubi(rest)
            } else {
                self.part.write(rest)
            }
            .map_err(|e| PatchError::Sink(e.to_string()))?;
            self.global.update(&rest[..outcome.consumed]);
            *self.written += outcome.consumed as u64;
            rest = &rest[outcome.consumed..];
        }
        Ok(())
    }

    fn read_origin(&mut self, offset: u64, buf: &mut [u8]) -> std::result::Result<(), PatchError> {
        let dev = self
            .origin
            .as_mut()
            .ok_or_else(|| PatchError::Origin("no origin partition configured".to_owned()))?;
        dev.seek_offset(offset)
            .and_then(|_| dev.read(buf))
            .map_err(|e| PatchError::Origin(e.to_string()))
    }
}

fn part_err(e: PartitionError) -> UpdateError {
    UpdateError::Fault(e.to_string())
}

fn open_err(e: PartitionError) -> UpdateError {
    match e {
        PartitionError::Flash(MtdError::NotFound(name)) => {
            UpdateError::Unavailable(format!("partition \"{}\" not found", name))
        }
        PartitionError::Flash(MtdError::Busy) => UpdateError::Busy,
        PartitionError::OutOfRange => {
            UpdateError::Fault("image does not fit the staging partition".to_owned())
        }
        other => UpdateError::Unavailable(other.to_string()),
    }
}

pub struct Engine {
    cfg: Config,
    opener: Box<dyn FlashOpener>,
    origin: Option<Box<dyn FlashOpener>>,
    watchdog: Option<Box<dyn FnMut() + Send>>,
    journal: Journal,
    st: State,
    partition: Option<PartitionCtx>,
    applier: Option<Box<dyn PatchApplier>>,
    origin_dev: Option<FlashPartition>,
}

impl Engine {
    pub fn new(cfg: Config, opener: Box<dyn FlashOpener>) -> Engine {
        let journal = Journal::new(cfg.resume_dir.clone());
        Engine {
            cfg,
            opener,
            origin: None,
            watchdog: None,
            journal,
            st: State::fresh(),
            partition: None,
            applier: None,
            origin_dev: None,
        }
    }

    /// Partition holding the original image, read by the delta appliers.
    pub fn set_origin(&mut self, opener: Box<dyn FlashOpener>) {
        self.origin = Some(opener);
    }

    /// Callback kicked between input waits.
    pub fn set_watchdog(&mut self, kick: Box<dyn FnMut() + Send>) {
        self.watchdog = Some(kick);
    }

    /// Blocking download of one package (or the remainder of one, when
    /// resuming). Ownership of the descriptor transfers to the engine.
    pub fn download(&mut self, fd: OwnedFd) -> Result<()> {
        let mut stream = InputStream::new(fd, self.cfg.read_deadline, self.cfg.wdog_kick_interval)
            .map_err(|_| UpdateError::BadParameter("unusable input descriptor"))?;
        if self.st.phase == Phase::Complete {
            self.reset_state();
        }
        if self.partition.is_none() {
            match self.journal.load() {
                Some((ctx, blob)) => match self.restore(&ctx, &blob) {
                    Ok(()) => info!(total_read = self.st.total_read, "resuming from checkpoint"),
                    Err(e) => {
                        log::warn!("checkpoint unusable ({}), cold start", e);
                        let _ = self.journal.erase();
                        self.reset_state();
                    }
                },
                None => self.reset_state(),
            }
        } else {
            info!(total_read = self.st.total_read, "continuing suspended download");
        }
        if let Err(e) = status::write(&self.cfg.status_file, DwlStatus::DwlOngoing) {
            log::warn!("status file update failed: {}", e);
        }

        let result = self.run(&mut stream);
        match &result {
            Ok(()) => {}
            Err(UpdateError::Closed(at)) => {
                debug!(at, "input closed, checkpoint preserved");
            }
            Err(UpdateError::Timeout(_)) => {
                let _ = status::write(&self.cfg.status_file, DwlStatus::DwlTimeout);
            }
            Err(UpdateError::Unavailable(_)) | Err(UpdateError::Fault(_)) => {
                self.teardown_fault();
            }
            Err(_) => {}
        }
        result
    }

    /// Erase the journal and any partial state; the next download starts
    /// from zero. Idempotent.
    pub fn init_download(&mut self) -> Result<()> {
        if let Some(part) = self.partition.take() {
            let _ = part.close(0, true);
        }
        self.applier = None;
        self.origin_dev = None;
        self.journal
            .erase()
            .map_err(|e| UpdateError::Fault(e.to_string()))?;
        self.reset_state();
        Ok(())
    }

    /// Bytes of the input stream already reflected on media: the live
    /// in-memory position when a download is suspended in this process,
    /// the newest checkpoint otherwise.
    pub fn get_resume_position(&self) -> u64 {
        if self.partition.is_some() {
            return self.st.total_read;
        }
        match self.journal.peek() {
            Some((ctx, _)) => ctx.total_read,
            None => 0,
        }
    }

    /// Write the slot metadata record, then record the status transition.
    /// Rebooting into the bootloader is the host's concern.
    pub fn install(&mut self, mark_good: bool) -> Result<()> {
        if self.partition.is_some() {
            return Err(UpdateError::Busy);
        }
        let mut record = match self.st.slot_metadata {
            Some(record) => record,
            None => {
                let (raw, leb, peb) = partition::read_first_header(self.opener.as_ref())
                    .map_err(|e| match e {
                        PartitionError::Flash(MtdError::Busy) => UpdateError::Busy,
                        other => UpdateError::Fault(other.to_string()),
                    })?;
                let hdr = CweHeader::parse(&raw).map_err(|e| {
                    UpdateError::Fault(format!("no installable image staged: {}", e))
                })?;
                SlotMetadata::new(
                    &raw,
                    leb,
                    peb,
                    hdr.image_size + CWE_HEADER_SIZE as u32,
                )
            }
        };
        partition::write_meta(self.opener.as_ref(), &mut record).map_err(|e| match e {
            PartitionError::Flash(MtdError::Busy) => UpdateError::Busy,
            other => UpdateError::Fault(other.to_string()),
        })?;
        // Metadata first: a crash here re-runs a harmless status update,
        // the reverse order could point the bootloader at an absent slot.
        let next = if mark_good {
            DwlStatus::Ok
        } else {
            DwlStatus::InstOngoing
        };
        status::write(&self.cfg.status_file, next)
            .map_err(|e| UpdateError::Fault(e.to_string()))?;
        Ok(())
    }

    pub fn get_update_status(&self) -> (DwlStatus, &'static str) {
        let current = status::read_or_unknown(&self.cfg.status_file);
        (current, current.label())
    }

    fn reset_state(&mut self) {
        self.st = State::fresh();
        self.applier = None;
        self.origin_dev = None;
    }

    fn run(&mut self, stream: &mut InputStream) -> Result<()> {
        let mut buf = vec![0u8; CHUNK_LENGTH];
        loop {
            if self.st.first_header_seen && self.st.total_read >= self.st.in_image_length {
                return self.finalize();
            }
            let want = self.length_to_read();
            if want == 0 {
                return self.finalize();
            }
            let kick: Option<&mut (dyn FnMut() + Send)> = match self.watchdog.as_mut() {
                Some(cb) => Some(&mut **cb),
                None => None,
            };
            let outcome = stream
                .read_full(&mut buf[..want], kick)
                .map_err(|e| UpdateError::Fault(format!("input read: {}", e)))?;
            match outcome {
                ReadOutcome::Full => self.process(&buf[..want])?,
                ReadOutcome::Eof(got) => {
                    if got > 0 && self.partial_bytes_usable() {
                        self.process(&buf[..got])?;
                    }
                    return Err(UpdateError::Closed(self.st.total_read));
                }
                ReadOutcome::TimedOut(got) => {
                    if got > 0 && self.partial_bytes_usable() {
                        self.process(&buf[..got])?;
                    }
                    return Err(UpdateError::Timeout(self.cfg.read_deadline.as_secs()));
                }
            }
        }
    }

    /// Body bytes can be consumed short of the requested length; header
    /// chunks must arrive whole and are re-requested after a resume.
    fn partial_bytes_usable(&self) -> bool {
        matches!(self.st.phase, Phase::Body | Phase::PatchBody)
    }

    fn length_to_read(&self) -> usize {
        match self.st.phase {
            Phase::Header => CWE_HEADER_SIZE,
            Phase::PatchMeta => PATCH_META_HEADER_SIZE,
            Phase::PatchSlice => PATCH_HEADER_SIZE,
            Phase::MetaBody => self.st.body_remaining as usize,
            Phase::Body => CHUNK_LENGTH.min(self.st.body_remaining as usize),
            Phase::PatchBody => {
                let mut want = CHUNK_LENGTH.min(self.st.patch_remaining as usize);
                if let Some(applier) = &self.applier {
                    if let Some(cap) = applier.read_cap() {
                        if cap > 0 {
                            want = want.min(cap);
                        }
                    }
                }
                want
            }
            Phase::Complete => 0,
        }
    }

    fn process(&mut self, chunk: &[u8]) -> Result<()> {
        match self.st.phase {
            Phase::Header => self.on_cwe_header(chunk),
            Phase::MetaBody => self.on_meta_body(chunk),
            Phase::Body => self.on_body(chunk),
            Phase::PatchMeta => self.on_patch_meta(chunk),
            Phase::PatchSlice => self.on_patch_slice(chunk),
            Phase::PatchBody => self.on_patch_body(chunk),
            Phase::Complete => Err(UpdateError::Fault("bytes past the end of the package".into())),
        }
    }

    fn on_cwe_header(&mut self, chunk: &[u8]) -> Result<()> {
        let hdr = CweHeader::parse(chunk).map_err(|e| UpdateError::Fault(e.to_string()))?;
        self.st.total_read += CWE_HEADER_SIZE as u64;
        let is_delta_leaf = !hdr.image_type.is_composite()
            && !hdr.image_type.is_meta()
            && hdr.misc_opts.contains(MiscOpts::DELTAPATCH);

        if !self.st.first_header_seen {
            self.st.first_header_seen = true;
            self.st.first_header.copy_from_slice(&hdr.raw);
            self.st.full_image_length = u64::from(hdr.image_size) + CWE_HEADER_SIZE as u64;
            self.st.full_image_crc = hdr.data_crc;
            self.st.in_image_length = self.st.full_image_length;
            let part = PartitionCtx::open(self.opener.as_ref(), self.st.full_image_length)
                .map_err(open_err)?;
            self.partition = Some(part);
            info!(
                image_type = %hdr.image_type,
                length = self.st.full_image_length,
                "package start"
            );
            // The first header anchors the package; its bytes sit before
            // the range the global CRC covers.
            let raw = hdr.raw;
            self.write_through(&raw, false)?;
        } else if !is_delta_leaf {
            let raw = hdr.raw;
            self.write_through(&raw, true)?;
        }

        if hdr.image_type.is_composite() {
            debug!(image_type = %hdr.image_type, "composite header");
        } else if hdr.image_type.is_meta() {
            if !self.st.meta_headers.is_empty() {
                return Err(UpdateError::Fault("duplicate META sub-package".into()));
            }
            let size = u64::from(hdr.image_size);
            let max = (META_MAX_HEADERS * CWE_HEADER_SIZE) as u64;
            if size == 0 || size % CWE_HEADER_SIZE as u64 != 0 || size > max {
                return Err(UpdateError::Fault(format!(
                    "META sub-package size {} invalid (1..={} headers)",
                    size, META_MAX_HEADERS
                )));
            }
            self.st.had_delta = true;
            self.st.body_remaining = size;
            self.st.phase = Phase::MetaBody;
        } else {
            self.st.image_type = Some(hdr.image_type);
            self.st.image_size = u64::from(hdr.image_size);
            self.st.image_crc = hdr.data_crc;
            self.st.misc_opts = hdr.misc_opts;
            self.st.current_image_crc.reset();
            self.st.current_in_image_offset = 0;
            self.st.body_remaining = u64::from(hdr.image_size);
            self.st.phase = if is_delta_leaf {
                Phase::PatchMeta
            } else {
                Phase::Body
            };
        }
        Ok(())
    }

    fn on_meta_body(&mut self, chunk: &[u8]) -> Result<()> {
        self.st.total_read += chunk.len() as u64;
        self.st.body_remaining -= chunk.len() as u64;
        let count = chunk.len() / CWE_HEADER_SIZE;
        for i in 0..count {
            let mut raw = [0u8; CWE_HEADER_SIZE];
            raw.copy_from_slice(&chunk[i * CWE_HEADER_SIZE..(i + 1) * CWE_HEADER_SIZE]);
            CweHeader::parse(&raw).map_err(|e| {
                UpdateError::Fault(format!("META original header {}: {}", i, e))
            })?;
            if self.st.meta_headers.len() >= META_MAX_HEADERS {
                return Err(UpdateError::Fault("too many META original headers".into()));
            }
            self.st.meta_headers.push(raw);
        }
        info!(count, "cached original headers from META sub-package");
        // The first original header goes to flash right away; the rest are
        // replayed just ahead of their delta components.
        let first = self.st.meta_headers[0];
        self.write_through(&first, true)?;
        self.st.meta_replayed = 0;
        self.st.phase = Phase::Header;
        Ok(())
    }

    fn on_body(&mut self, chunk: &[u8]) -> Result<()> {
        let mut rest = chunk;
        while !rest.is_empty() {
            let part = self
                .partition
                .as_mut()
                .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
            let outcome = part.write(rest).map_err(part_err)?;
            let slice = &rest[..outcome.consumed];
            self.st.current_image_crc.update(slice);
            self.st.current_global_crc.update(slice);
            self.st.total_read += outcome.consumed as u64;
            self.st.current_in_image_offset += outcome.consumed as u64;
            self.st.body_remaining -= outcome.consumed as u64;
            rest = &rest[outcome.consumed..];
            if outcome.flushed_block {
                self.checkpoint();
            }
        }
        if self.st.body_remaining == 0 {
            self.finish_plain_component()?;
        }
        Ok(())
    }

    fn finish_plain_component(&mut self) -> Result<()> {
        let computed = self.st.current_image_crc.value();
        if computed != self.st.image_crc {
            return Err(UpdateError::Fault(format!(
                "component {} body crc mismatch: computed {:#010x}, declared {:#010x}",
                self.st
                    .image_type
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".into()),
                computed,
                self.st.image_crc
            )));
        }
        info!(
            image_type = %self.st.image_type.map(|t| t.to_string()).unwrap_or_else(|| "?".into()),
            size = self.st.image_size,
            "component verified"
        );
        self.st.misc_opts.remove(MiscOpts::DELTAPATCH);
        self.st.phase = Phase::Header;
        Ok(())
    }

    /// Emit the cached original header for the delta component that is
    /// about to start. The first component's header went out with the META
    /// body itself.
    fn replay_meta_header(&mut self) -> Result<()> {
        if self.st.meta_headers.is_empty() {
            return Ok(());
        }
        if self.st.meta_replayed == 0 {
            self.st.meta_replayed = 1;
            return Ok(());
        }
        let index = self.st.meta_replayed;
        if index >= self.st.meta_headers.len() {
            return Err(UpdateError::Fault(
                "more delta components than cached original headers".into(),
            ));
        }
        let raw = self.st.meta_headers[index];
        self.write_through(&raw, true)?;
        self.st.meta_replayed += 1;
        Ok(())
    }

    fn on_patch_meta(&mut self, chunk: &[u8]) -> Result<()> {
        let meta = PatchMetaHeader::parse(chunk).map_err(|e| UpdateError::Fault(e.to_string()))?;
        self.st.total_read += chunk.len() as u64;
        self.st.current_image_crc.update(chunk);
        self.st.body_remaining -= chunk.len() as u64;
        self.st.had_delta = true;
        info!(
            family = ?meta.family,
            slices = meta.num_slices,
            dest_size = meta.dest_size,
            "patch meta"
        );

        self.replay_meta_header()?;

        if meta.family.targets_ubi() {
            let part = self
                .partition
                .as_mut()
                .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
            if !part.ubi_open() {
                part.open_ubi(meta.ubi_image_seq, true, true).map_err(part_err)?;
            }
            if !part.volume_open() {
                let vol_type = match meta.ubi_vol_type {
                    x if x == u32::from(UBI_VID_DYNAMIC) => UBI_VID_DYNAMIC,
                    _ => UBI_VID_STATIC,
                };
                let name = format!("vol_{}", meta.ubi_vol_id);
                part.open_ubi_volume(
                    meta.ubi_vol_id,
                    vol_type,
                    u64::from(meta.dest_size),
                    (meta.ubi_vol_flags & 0xff) as u8,
                    &name,
                    true,
                )
                .map_err(part_err)?;
                self.st.ubi_volume_created = true;
            }
        } else {
            let part = self
                .partition
                .as_ref()
                .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
            self.st.dest_start = part.written();
        }

        if meta.family.needs_origin() {
            self.open_origin()?;
            let computed = self.origin_crc(meta.orig_size)?;
            if computed != meta.orig_crc {
                return Err(UpdateError::Fault(format!(
                    "origin image crc mismatch: computed {:#010x}, declared {:#010x}",
                    computed, meta.orig_crc
                )));
            }
        }

        self.st.patch_meta = Some(meta);
        self.st.slices_done = 0;
        self.st.phase = Phase::PatchSlice;
        // Component-start checkpoint, before the applier holds state the
        // journal cannot carry.
        self.checkpoint();
        self.applier = Some(self.make_applier()?);
        Ok(())
    }

    fn make_applier(&self) -> Result<Box<dyn PatchApplier>> {
        let meta = self
            .st
            .patch_meta
            .as_ref()
            .ok_or_else(|| UpdateError::Fault("no patch meta header".into()))?;
        Ok(match meta.family {
            PatchFamily::Nodiff => Box::new(Nodiff::new()),
            PatchFamily::Bsdiff => Box::new(Bsdiff::new()),
            PatchFamily::Imgdiff => Box::new(Imgdiff::new()),
        })
    }

    fn open_origin(&mut self) -> Result<()> {
        if self.origin_dev.is_some() {
            return Ok(());
        }
        let opener = self.origin.as_ref().ok_or_else(|| {
            UpdateError::Fault("delta package but no origin partition configured".into())
        })?;
        let mut dev = opener
            .open(AccessMode::ReadOnly)
            .map_err(|e| UpdateError::Fault(e.to_string()))?;
        dev.scan().map_err(|e| UpdateError::Fault(e.to_string()))?;
        self.origin_dev = Some(dev);
        Ok(())
    }

    fn origin_crc(&mut self, size: u32) -> Result<u32> {
        let dev = self
            .origin_dev
            .as_mut()
            .ok_or_else(|| UpdateError::Fault("origin partition not open".into()))?;
        let mut crc = Crc32::new();
        let mut remaining = size as usize;
        let mut buf = vec![0u8; dev.geometry().erase_size as usize];
        dev.seek_offset(0)
            .map_err(|e| UpdateError::Fault(e.to_string()))?;
        while remaining > 0 {
            let take = buf.len().min(remaining);
            dev.read(&mut buf[..take])
                .map_err(|e| UpdateError::Fault(e.to_string()))?;
            crc.update(&buf[..take]);
            remaining -= take;
        }
        Ok(crc.value())
    }

    fn on_patch_slice(&mut self, chunk: &[u8]) -> Result<()> {
        let hdr = PatchSliceHeader::parse(chunk).map_err(|e| UpdateError::Fault(e.to_string()))?;
        self.st.total_read += chunk.len() as u64;
        self.st.current_image_crc.update(chunk);
        self.st.body_remaining -= chunk.len() as u64;
        if hdr.number != self.st.slices_done {
            return Err(UpdateError::Fault(format!(
                "patch slice {} out of order (expected {})",
                hdr.number, self.st.slices_done
            )));
        }
        if u64::from(hdr.dest_offset) != self.st.current_in_image_offset {
            return Err(UpdateError::Fault(format!(
                "patch slice destination {} does not continue at {}",
                hdr.dest_offset, self.st.current_in_image_offset
            )));
        }
        self.st.patch_remaining = u64::from(hdr.size);
        self.st.patch_slice = Some(hdr);
        self.st.phase = Phase::PatchBody;
        if self.st.patch_remaining == 0 {
            self.finish_patch_slice()?;
        }
        Ok(())
    }

    fn on_patch_body(&mut self, chunk: &[u8]) -> Result<()> {
        self.st.total_read += chunk.len() as u64;
        self.st.current_image_crc.update(chunk);
        self.st.body_remaining -= chunk.len() as u64;
        self.st.patch_remaining -= chunk.len() as u64;

        let mut applier = self
            .applier
            .take()
            .ok_or_else(|| UpdateError::Fault("patch applier missing".into()))?;
        let fed = {
            let (to_ubi, dest_limit) = {
                let meta = self
                    .st
                    .patch_meta
                    .as_ref()
                    .ok_or_else(|| UpdateError::Fault("no patch meta header".into()))?;
                (meta.family.targets_ubi(), u64::from(meta.dest_size))
            };
            let part = self
                .partition
                .as_mut()
                .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
            let mut sink = EngineSink {
                part,
                origin: self.origin_dev.as_mut(),
                to_ubi,
                written: &mut self.st.current_in_image_offset,
                global: &mut self.st.current_global_crc,
                dest_limit,
            };
            applier.feed(chunk, &mut sink)
        };
        self.applier = Some(applier);
        fed.map_err(|e| UpdateError::Fault(format!("patch application: {}", e)))?;

        if self.st.patch_remaining == 0 {
            self.finish_patch_slice()?;
        }
        Ok(())
    }

    fn finish_patch_slice(&mut self) -> Result<()> {
        self.st.slices_done += 1;
        self.st.patch_slice = None;
        let meta = self
            .st
            .patch_meta
            .clone()
            .ok_or_else(|| UpdateError::Fault("no patch meta header".into()))?;
        if self.st.slices_done < meta.num_slices {
            self.st.phase = Phase::PatchSlice;
            return Ok(());
        }
        self.finish_delta_component(&meta)
    }

    fn finish_delta_component(&mut self, meta: &PatchMetaHeader) -> Result<()> {
        // Drain the applier first.
        let mut applier = self
            .applier
            .take()
            .ok_or_else(|| UpdateError::Fault("patch applier missing".into()))?;
        {
            let part = self
                .partition
                .as_mut()
                .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
            let mut sink = EngineSink {
                part,
                origin: self.origin_dev.as_mut(),
                to_ubi: meta.family.targets_ubi(),
                written: &mut self.st.current_in_image_offset,
                global: &mut self.st.current_global_crc,
                dest_limit: u64::from(meta.dest_size),
            };
            applier
                .finalize(&mut sink)
                .map_err(|e| UpdateError::Fault(format!("patch application: {}", e)))?;
        }

        // The patch stream itself must match the envelope header.
        let stream_crc = self.st.current_image_crc.value();
        if stream_crc != self.st.image_crc {
            return Err(UpdateError::Fault(format!(
                "patch stream crc mismatch: computed {:#010x}, declared {:#010x}",
                stream_crc, self.st.image_crc
            )));
        }

        // The reconstructed destination must match the meta header, and
        // the original header cached from the META sub-package.
        let dest_size = u64::from(meta.dest_size);
        let part = self
            .partition
            .as_mut()
            .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
        let (size, crc) = if meta.family.targets_ubi() {
            part.close_ubi_volume(dest_size).map_err(part_err)?;
            self.st.ubi_volume_created = false;
            part.compute_ubi_volume_crc32(meta.ubi_vol_id)
                .map_err(part_err)?
        } else {
            if self.st.current_in_image_offset != dest_size {
                return Err(UpdateError::Fault(format!(
                    "patch produced {} bytes, {} declared",
                    self.st.current_in_image_offset, dest_size
                )));
            }
            let crc = part
                .compute_data_crc32(self.st.dest_start, dest_size)
                .map_err(part_err)?;
            (dest_size, crc)
        };
        if size != dest_size || crc != meta.dest_crc {
            return Err(UpdateError::Fault(format!(
                "patched image crc mismatch: computed {:#010x} over {} bytes, declared {:#010x} over {}",
                crc, size, meta.dest_crc, dest_size
            )));
        }
        if self.st.meta_replayed > 0 {
            let original = self.st.meta_headers[self.st.meta_replayed - 1];
            let hdr = CweHeader::parse(&original)
                .map_err(|e| UpdateError::Fault(e.to_string()))?;
            if hdr.data_crc != crc {
                return Err(UpdateError::Fault(
                    "patched image does not match its cached original header".into(),
                ));
            }
        }

        info!(dest_size, "delta component verified");
        self.origin_dev = None;
        self.st.patch_meta = None;
        self.st.misc_opts.remove(MiscOpts::DELTAPATCH);
        self.st.phase = Phase::Header;
        self.checkpoint();
        Ok(())
    }

    /// Push bytes into raw space, checkpointing on every block flush.
    fn write_through(&mut self, bytes: &[u8], count_global: bool) -> Result<()> {
        let mut rest: &[u8] = bytes;
        while !rest.is_empty() {
            let part = self
                .partition
                .as_mut()
                .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;
            let outcome = part.write(rest).map_err(part_err)?;
            if count_global {
                self.st.current_global_crc.update(&rest[..outcome.consumed]);
            }
            rest = &rest[outcome.consumed..];
            if outcome.flushed_block {
                self.checkpoint();
            }
        }
        Ok(())
    }

    /// Commit a checkpoint. Suppressed while a patch applier holds state
    /// the journal cannot carry; the journal then stays at the component
    /// start and a power cut replays the component. A failed journal write
    /// is a warning: the previous checkpoint remains valid.
    fn checkpoint(&mut self) {
        if self.applier.is_some() {
            return;
        }
        let part = match &self.partition {
            Some(part) => part,
            None => return,
        };
        let blob = part.snapshot_bytes();
        let mut ctx = self.to_save_ctx();
        match self.journal.save(&mut ctx, &blob) {
            Ok(()) => self.st.ctx_counter = ctx.ctx_counter,
            Err(e) => log::warn!("checkpoint write failed: {}", e),
        }
    }

    fn to_save_ctx(&self) -> SaveCtx {
        let mut ctx = SaveCtx::zeroed();
        ctx.ctx_counter = self.st.ctx_counter;
        if let Some(t) = self.st.image_type {
            ctx.image_type = *t.tag();
        }
        ctx.image_size = self.st.image_size as u32;
        ctx.image_crc = self.st.image_crc;
        ctx.current_image_crc = self.st.current_image_crc.value();
        ctx.current_global_crc = self.st.current_global_crc.value();
        ctx.total_read = self.st.total_read;
        ctx.current_in_image_offset = self.st.current_in_image_offset;
        ctx.full_image_crc = self.st.full_image_crc;
        ctx.full_image_length = self.st.full_image_length;
        ctx.in_image_length = self.st.in_image_length;
        ctx.misc_opts = self.st.misc_opts.bits();
        ctx.phase = self.st.phase.code();
        ctx.is_image_to_be_read =
            matches!(self.st.phase, Phase::Body | Phase::MetaBody | Phase::PatchBody) as u8;
        ctx.had_delta = self.st.had_delta as u8;
        ctx.first_header_seen = self.st.first_header_seen as u8;
        ctx.ubi_volume_created = self.st.ubi_volume_created as u8;
        if let Some(meta) = &self.st.patch_meta {
            ctx.patch_meta_valid = 1;
            ctx.patch_meta.copy_from_slice(&meta.raw);
        }
        if let Some(slice) = &self.st.patch_slice {
            ctx.patch_slice_valid = 1;
            ctx.patch_slice.copy_from_slice(&slice.raw);
        }
        ctx.meta_count = self.st.meta_headers.len() as u8;
        ctx.meta_replayed = self.st.meta_replayed as u8;
        for (i, raw) in self.st.meta_headers.iter().enumerate() {
            ctx.meta_img_data[i * CWE_HEADER_SIZE..(i + 1) * CWE_HEADER_SIZE]
                .copy_from_slice(raw);
        }
        ctx.body_remaining = self.st.body_remaining;
        ctx.patch_remaining = self.st.patch_remaining as u32;
        ctx.slices_done = self.st.slices_done;
        ctx.first_header = self.st.first_header;
        ctx
    }

    fn restore(&mut self, ctx: &SaveCtx, blob: &[u8]) -> Result<()> {
        let part = PartitionCtx::resume(self.opener.as_ref(), blob).map_err(open_err)?;
        let mut st = State::fresh();
        st.ctx_counter = ctx.ctx_counter;
        st.phase = Phase::from_code(ctx.phase)
            .ok_or_else(|| UpdateError::Fault("unknown parser phase in checkpoint".into()))?;
        if st.phase == Phase::PatchBody {
            return Err(UpdateError::Fault("checkpoint inside a patch slice".into()));
        }
        st.first_header_seen = ctx.first_header_seen != 0;
        st.first_header = ctx.first_header;
        st.full_image_length = ctx.full_image_length;
        st.full_image_crc = ctx.full_image_crc;
        st.in_image_length = ctx.in_image_length;
        st.image_type = ImageType::from_tag(&ctx.image_type);
        st.image_size = u64::from(ctx.image_size);
        st.image_crc = ctx.image_crc;
        st.misc_opts = MiscOpts::from_bits_retain(ctx.misc_opts);
        st.current_image_crc = Crc32::from_value(ctx.current_image_crc);
        st.current_global_crc = Crc32::from_value(ctx.current_global_crc);
        st.total_read = ctx.total_read;
        st.current_in_image_offset = ctx.current_in_image_offset;
        st.body_remaining = ctx.body_remaining;
        st.patch_remaining = u64::from(ctx.patch_remaining);
        st.slices_done = ctx.slices_done;
        st.had_delta = ctx.had_delta != 0;
        st.ubi_volume_created = ctx.ubi_volume_created != 0;
        let meta_count = (ctx.meta_count as usize).min(META_MAX_HEADERS);
        for i in 0..meta_count {
            let mut raw = [0u8; CWE_HEADER_SIZE];
            raw.copy_from_slice(&ctx.meta_img_data[i * CWE_HEADER_SIZE..(i + 1) * CWE_HEADER_SIZE]);
            st.meta_headers.push(raw);
        }
        st.meta_replayed = ctx.meta_replayed as usize;
        if ctx.patch_meta_valid != 0 {
            st.patch_meta = Some(
                PatchMetaHeader::parse(&ctx.patch_meta)
                    .map_err(|e| UpdateError::Fault(e.to_string()))?,
            );
        }
        if ctx.patch_slice_valid != 0 {
            st.patch_slice = Some(
                PatchSliceHeader::parse(&ctx.patch_slice)
                    .map_err(|e| UpdateError::Fault(e.to_string()))?,
            );
        }
        st.dest_start = part.written();
        self.partition = Some(part);
        self.st = st;
        // A checkpoint inside a delta component sits at the component
        // start; rebuild the applier and origin for the replay.
        if self.st.phase == Phase::PatchSlice {
            if let Some(meta) = &self.st.patch_meta {
                if meta.family.needs_origin() {
                    self.open_origin()?;
                }
            }
            self.applier = Some(self.make_applier()?);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        if self.st.phase != Phase::Header {
            return Err(UpdateError::Fault(
                "input ended inside a component".into(),
            ));
        }
        if self.st.total_read != self.st.in_image_length {
            return Err(UpdateError::Fault(format!(
                "package length mismatch: read {}, declared {}",
                self.st.total_read, self.st.in_image_length
            )));
        }
        let mut part = self
            .partition
            .take()
            .ok_or_else(|| UpdateError::Fault("partition not open".into()))?;

        let outcome = (|| -> Result<SlotMetadata> {
            if part.ubi_open() {
                part.close_ubi().map_err(part_err)?;
            }
            if !self.st.had_delta {
                let span = self.st.full_image_length - CWE_HEADER_SIZE as u64;
                let computed = part
                    .compute_data_crc32(CWE_HEADER_SIZE as u64, span)
                    .map_err(part_err)?;
                if computed != self.st.full_image_crc {
                    return Err(UpdateError::Fault(format!(
                        "package crc mismatch: computed {:#010x}, declared {:#010x}",
                        computed, self.st.full_image_crc
                    )));
                }
            }
            let (leb, peb) = part.data_start_blocks().map_err(part_err)?;
            Ok(SlotMetadata::new(
                &self.st.first_header,
                leb,
                peb,
                self.st.full_image_length as u32,
            ))
        })();

        let record = match outcome {
            Ok(record) => record,
            Err(e) => {
                let _ = part.close(0, true);
                return Err(e);
            }
        };
        part.close(self.st.full_image_length, false).map_err(part_err)?;

        self.st.slot_metadata = Some(record);
        self.st.phase = Phase::Complete;
        // Journal first, status second: a crash in between resumes as a
        // cold start instead of reporting a success that never installed.
        if let Err(e) = self.journal.erase() {
            log::warn!("journal erase failed: {}", e);
        }
        let _ = status::write(&self.cfg.status_file, DwlStatus::Ok);
        info!(total = self.st.total_read, "download complete");
        Ok(())
    }

    fn teardown_fault(&mut self) {
        if let Some(part) = self.partition.take() {
            let _ = part.close(0, true);
        }
        self.applier = None;
        self.origin_dev = None;
        if let Err(e) = self.journal.erase() {
            log::warn!("journal erase failed: {}", e);
        }
        self.reset_state();
        let _ = status::write(&self.cfg.status_file, DwlStatus::DwlFailed);
    }
}
