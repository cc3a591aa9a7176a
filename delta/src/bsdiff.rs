// Streaming bsdiff application.
//
// The stream is a sequence of control records, each followed by its data:
//
//   diff_len  u32 BE | extra_len u32 BE | seek i32 BE
//   diff bytes  (diff_len)  -- added bytewise to the origin at the cursor
//   extra bytes (extra_len) -- copied to the destination verbatim
//
// After a record the origin cursor has advanced by `diff_len` and is then
// adjusted by `seek`. The applier is incremental: chunks may split records
// anywhere.

use std::convert::TryInto;

use crate::{PatchApplier, PatchError, PatchProgress, PatchSink};

const CTRL_SIZE: usize = 12;
const SCRATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Control,
    Diff,
    Extra,
}

pub struct Bsdiff {
    step: Step,
    ctrl: [u8; CTRL_SIZE],
    ctrl_fill: usize,
    diff_remaining: u32,
    extra_remaining: u32,
    seek: i32,
    origin_pos: u64,
    progress: PatchProgress,
}

impl Bsdiff {
    pub fn new() -> Bsdiff {
        Bsdiff {
            step: Step::Control,
            ctrl: [0u8; CTRL_SIZE],
            ctrl_fill: 0,
            diff_remaining: 0,
            extra_remaining: 0,
            seek: 0,
            origin_pos: 0,
            progress: PatchProgress::default(),
        }
    }

    fn apply_seek(&mut self) -> Result<(), PatchError> {
        let moved = self.origin_pos as i64 + i64::from(self.seek);
        if moved < 0 {
            return Err(PatchError::Malformed("origin seek before start"));
        }
        self.origin_pos = moved as u64;
        Ok(())
    }

    /// Run the transitions that need no further input, so a stream ending
    /// exactly on a record boundary leaves the applier in `Control`.
    fn settle(&mut self) -> Result<(), PatchError> {
        loop {
            match self.step {
                Step::Diff if self.diff_remaining == 0 => self.step = Step::Extra,
                Step::Extra if self.extra_remaining == 0 => {
                    self.apply_seek()?;
                    self.step = Step::Control;
                }
                _ => return Ok(()),
            }
        }
    }
}

impl Default for Bsdiff {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchApplier for Bsdiff {
    fn feed(&mut self, chunk: &[u8], sink: &mut dyn PatchSink) -> Result<usize, PatchError> {
        let mut used = 0;
        while used < chunk.len() {
            self.settle()?;
            match self.step {
                Step::Control => {
                    let need = CTRL_SIZE - self.ctrl_fill;
                    let take = need.min(chunk.len() - used);
                    self.ctrl[self.ctrl_fill..self.ctrl_fill + take]
                        .copy_from_slice(&chunk[used..used + take]);
                    self.ctrl_fill += take;
                    used += take;
                    if self.ctrl_fill == CTRL_SIZE {
                        self.ctrl_fill = 0;
                        self.diff_remaining =
                            u32::from_be_bytes(self.ctrl[0..4].try_into().unwrap());
                        self.extra_remaining =
                            u32::from_be_bytes(self.ctrl[4..8].try_into().unwrap());
                        self.seek = i32::from_be_bytes(self.ctrl[8..12].try_into().unwrap());
                        self.step = Step::Diff;
                    }
                }
                Step::Diff => {
                    let take = (chunk.len() - used)
                        .min(self.diff_remaining as usize)
                        .min(SCRATCH);
                    let mut origin = [0u8; SCRATCH];
                    sink.read_origin(self.origin_pos, &mut origin[..take])?;
                    let mut out = [0u8; SCRATCH];
                    for i in 0..take {
                        out[i] = origin[i].wrapping_add(chunk[used + i]);
                    }
                    sink.write(&out[..take])?;
                    self.origin_pos += take as u64;
                    self.diff_remaining -= take as u32;
                    self.progress.written += take as u64;
                    used += take;
                }
                Step::Extra => {
                    let take = (chunk.len() - used).min(self.extra_remaining as usize);
                    sink.write(&chunk[used..used + take])?;
                    self.extra_remaining -= take as u32;
                    self.progress.written += take as u64;
                    used += take;
                }
            }
        }
        self.settle()?;
        self.progress.consumed += used as u64;
        Ok(used)
    }

    fn progress(&self) -> PatchProgress {
        self.progress
    }

    fn finalize(&mut self, _sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        self.settle()?;
        if self.step != Step::Control || self.ctrl_fill != 0 {
            return Err(PatchError::Truncated);
        }
        Ok(())
    }
}

/// Assemble one control record for the tests.
#[cfg(test)]
pub(crate) fn control(diff_len: u32, extra_len: u32, seek: i32) -> [u8; CTRL_SIZE] {
    let mut buf = [0u8; CTRL_SIZE];
    buf[0..4].copy_from_slice(&diff_len.to_be_bytes());
    buf[4..8].copy_from_slice(&extra_len.to_be_bytes());
    buf[8..12].copy_from_slice(&seek.to_be_bytes());
    buf
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testsink::VecSink;

    fn patch_stream() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        // Origin: 0..16. Patch: add 1 to the first 4 bytes, insert "XY",
        // skip 4 origin bytes, then add 2 to the next 4.
        let origin: Vec<u8> = (0u8..16).collect();
        let mut patch = Vec::new();
        patch.extend_from_slice(&control(4, 2, 4));
        patch.extend_from_slice(&[1, 1, 1, 1]);
        patch.extend_from_slice(b"XY");
        patch.extend_from_slice(&control(4, 0, 0));
        patch.extend_from_slice(&[2, 2, 2, 2]);
        let expected = vec![1, 2, 3, 4, b'X', b'Y', 10, 11, 12, 13];
        (origin, patch, expected)
    }

    #[test]
    fn applies_in_one_chunk() {
        let (origin, patch, expected) = patch_stream();
        let mut sink = VecSink::new(origin);
        let mut applier = Bsdiff::new();
        assert_eq!(applier.feed(&patch, &mut sink).unwrap(), patch.len());
        applier.finalize(&mut sink).unwrap();
        assert_eq!(sink.out, expected);
        assert_eq!(applier.progress().written, expected.len() as u64);
    }

    #[test]
    fn applies_byte_at_a_time() {
        let (origin, patch, expected) = patch_stream();
        let mut sink = VecSink::new(origin);
        let mut applier = Bsdiff::new();
        for byte in &patch {
            applier.feed(std::slice::from_ref(byte), &mut sink).unwrap();
        }
        applier.finalize(&mut sink).unwrap();
        assert_eq!(sink.out, expected);
    }

    #[test]
    fn truncated_stream_fails_finalize() {
        let (origin, patch, _) = patch_stream();
        let mut sink = VecSink::new(origin);
        let mut applier = Bsdiff::new();
        applier.feed(&patch[..patch.len() - 2], &mut sink).unwrap();
        assert!(matches!(
            applier.finalize(&mut sink),
            Err(PatchError::Truncated)
        ));
    }

    #[test]
    fn pure_seek_record() {
        let origin: Vec<u8> = (0u8..8).collect();
        let mut patch = Vec::new();
        patch.extend_from_slice(&control(0, 0, 4));
        patch.extend_from_slice(&control(2, 0, 0));
        patch.extend_from_slice(&[10, 10]);
        let mut sink = VecSink::new(origin);
        let mut applier = Bsdiff::new();
        applier.feed(&patch, &mut sink).unwrap();
        applier.finalize(&mut sink).unwrap();
        assert_eq!(sink.out, vec![14, 15]);
    }

    #[test]
    fn negative_seek_past_start_rejected() {
        let mut patch = Vec::new();
        patch.extend_from_slice(&control(0, 0, -1));
        let mut sink = VecSink::new(vec![0u8; 4]);
        let mut applier = Bsdiff::new();
        assert!(matches!(
            applier.feed(&patch, &mut sink),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn origin_overrun_reported() {
        let mut patch = Vec::new();
        patch.extend_from_slice(&control(8, 0, 0));
        patch.extend_from_slice(&[0u8; 8]);
        let mut sink = VecSink::new(vec![0u8; 4]);
        let mut applier = Bsdiff::new();
        assert!(matches!(
            applier.feed(&patch, &mut sink),
            Err(PatchError::Origin(_))
        ));
    }
}
