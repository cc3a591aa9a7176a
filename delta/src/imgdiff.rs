// Chunk-typed image diff, the UBI-volume-aware patch family.
//
// The stream is a sequence of records, each opened by a 16-byte header:
//
//   kind          u32 BE   0 = bsdiff payload, 3 = raw payload
//   data_len      u32 BE   bytes of payload following the header
//   origin_offset u32 BE   window base in the original image (bsdiff only)
//   origin_len    u32 BE   window length (bsdiff only)
//
// A raw record's payload is copied to the destination. A bsdiff record's
// payload is a nested bsdiff control stream whose origin reads are
// rebased onto the declared window, so each destination chunk patches
// against its own region of the original volume.

use std::convert::TryInto;

use crate::bsdiff::Bsdiff;
use crate::{PatchApplier, PatchError, PatchProgress, PatchSink};

const HDR_SIZE: usize = 16;

pub const CHUNK_BSDIFF: u32 = 0;
pub const CHUNK_RAW: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Header,
    Raw,
    Bsdiff,
}

pub struct Imgdiff {
    step: Step,
    hdr: [u8; HDR_SIZE],
    hdr_fill: usize,
    body_remaining: u32,
    origin_base: u64,
    origin_len: u32,
    inner: Option<Bsdiff>,
    progress: PatchProgress,
}

struct WindowSink<'a> {
    base: u64,
    len: u32,
    inner: &'a mut dyn PatchSink,
}

impl<'a> PatchSink for WindowSink<'a> {
    fn write(&mut self, data: &[u8]) -> Result<(), PatchError> {
        self.inner.write(data)
    }

    fn read_origin(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), PatchError> {
        if offset + buf.len() as u64 > u64::from(self.len) {
            return Err(PatchError::Origin(
                "read past the declared origin window".to_owned(),
            ));
        }
        self.inner.read_origin(self.base + offset, buf)
    }
}

impl Imgdiff {
    pub fn new() -> Imgdiff {
        Imgdiff {
            step: Step::Header,
            hdr: [0u8; HDR_SIZE],
            hdr_fill: 0,
            body_remaining: 0,
            origin_base: 0,
            origin_len: 0,
            inner: None,
            progress: PatchProgress::default(),
        }
    }

    fn parse_header(&mut self) -> Result<(), PatchError> {
        let kind = u32::from_be_bytes(self.hdr[0..4].try_into().unwrap());
        self.body_remaining = u32::from_be_bytes(self.hdr[4..8].try_into().unwrap());
        self.origin_base = u64::from(u32::from_be_bytes(self.hdr[8..12].try_into().unwrap()));
        self.origin_len = u32::from_be_bytes(self.hdr[12..16].try_into().unwrap());
        log::debug!(
            "imgdiff record kind {} ({} payload bytes)",
            kind,
            self.body_remaining
        );
        self.step = match kind {
            CHUNK_RAW => Step::Raw,
            CHUNK_BSDIFF => {
                self.inner = Some(Bsdiff::new());
                Step::Bsdiff
            }
            _ => return Err(PatchError::Malformed("unknown imgdiff chunk kind")),
        };
        if self.body_remaining == 0 {
            // Empty record; close it out immediately.
            self.inner = None;
            self.step = Step::Header;
        }
        Ok(())
    }
}

impl Default for Imgdiff {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchApplier for Imgdiff {
    fn feed(&mut self, chunk: &[u8], sink: &mut dyn PatchSink) -> Result<usize, PatchError> {
        let mut used = 0;
        while used < chunk.len() {
            match self.step {
                Step::Header => {
                    let need = HDR_SIZE - self.hdr_fill;
                    let take = need.min(chunk.len() - used);
                    self.hdr[self.hdr_fill..self.hdr_fill + take]
                        .copy_from_slice(&chunk[used..used + take]);
                    self.hdr_fill += take;
                    used += take;
                    if self.hdr_fill == HDR_SIZE {
                        self.hdr_fill = 0;
                        self.parse_header()?;
                    }
                }
                Step::Raw => {
                    let take = (chunk.len() - used).min(self.body_remaining as usize);
                    sink.write(&chunk[used..used + take])?;
                    self.body_remaining -= take as u32;
                    self.progress.written += take as u64;
                    used += take;
                    if self.body_remaining == 0 {
                        self.step = Step::Header;
                    }
                }
                Step::Bsdiff => {
                    let take = (chunk.len() - used).min(self.body_remaining as usize);
                    let mut window = WindowSink {
                        base: self.origin_base,
                        len: self.origin_len,
                        inner: &mut *sink,
                    };
                    let inner = self
                        .inner
                        .as_mut()
                        .ok_or(PatchError::Malformed("bsdiff record without state"))?;
                    let before = inner.progress().written;
                    inner.feed(&chunk[used..used + take], &mut window)?;
                    self.progress.written += inner.progress().written - before;
                    self.body_remaining -= take as u32;
                    used += take;
                    if self.body_remaining == 0 {
                        let mut inner = self.inner.take().unwrap();
                        inner.finalize(&mut window)?;
                        self.step = Step::Header;
                    }
                }
            }
        }
        self.progress.consumed += used as u64;
        Ok(used)
    }

    fn progress(&self) -> PatchProgress {
        self.progress
    }

    fn read_cap(&self) -> Option<usize> {
        match self.step {
            Step::Header => Some(HDR_SIZE - self.hdr_fill),
            Step::Raw | Step::Bsdiff => Some(self.body_remaining as usize),
        }
    }

    fn finalize(&mut self, _sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        if self.step != Step::Header || self.hdr_fill != 0 {
            return Err(PatchError::Truncated);
        }
        Ok(())
    }
}

/// Assemble one record header for the tests.
#[cfg(test)]
pub(crate) fn record_header(
    kind: u32,
    data_len: u32,
    origin_offset: u32,
    origin_len: u32,
) -> [u8; HDR_SIZE] {
    let mut buf = [0u8; HDR_SIZE];
    buf[0..4].copy_from_slice(&kind.to_be_bytes());
    buf[4..8].copy_from_slice(&data_len.to_be_bytes());
    buf[8..12].copy_from_slice(&origin_offset.to_be_bytes());
    buf[12..16].copy_from_slice(&origin_len.to_be_bytes());
    buf
}
