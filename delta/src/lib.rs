//! Binary-patch appliers for the firmware update engine.
//!
//! The engine frames the patch stream (meta header, slice headers, slice
//! bodies) and hands slice-body bytes to one of these appliers. Appliers
//! know nothing about flash or partitions: they read the original image and
//! emit destination bytes through the [`PatchSink`] the caller provides.

pub mod bsdiff;
pub mod imgdiff;

use thiserror::Error;

pub use bsdiff::Bsdiff;
pub use imgdiff::Imgdiff;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("patch stream is malformed: {0}")]
    Malformed(&'static str),
    #[error("patch stream ended mid-record")]
    Truncated,
    #[error("origin read failed: {0}")]
    Origin(String),
    #[error("destination write failed: {0}")]
    Sink(String),
}

/// Destination and origin surface an applier runs against.
pub trait PatchSink {
    /// Append destination bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), PatchError>;
    /// Read from the original image.
    fn read_origin(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), PatchError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchProgress {
    /// Patch-stream bytes consumed.
    pub consumed: u64,
    /// Destination bytes emitted.
    pub written: u64,
}

/// One patch family behind a uniform feed/progress/finalize surface.
pub trait PatchApplier: Send {
    /// Consume patch-stream bytes, emitting destination output through the
    /// sink. Always consumes the whole chunk or fails.
    fn feed(&mut self, chunk: &[u8], sink: &mut dyn PatchSink) -> Result<usize, PatchError>;

    fn progress(&self) -> PatchProgress;

    /// Cap on how many bytes the next `feed` wants, when smaller than the
    /// caller's chunk size.
    fn read_cap(&self) -> Option<usize> {
        None
    }

    /// Assert the stream ended on a record boundary.
    fn finalize(&mut self, sink: &mut dyn PatchSink) -> Result<(), PatchError>;
}

/// Pass-through applier: slice bodies are the destination bytes.
#[derive(Default)]
pub struct Nodiff {
    progress: PatchProgress,
}

impl Nodiff {
    pub fn new() -> Nodiff {
        Nodiff::default()
    }
}

impl PatchApplier for Nodiff {
    fn feed(&mut self, chunk: &[u8], sink: &mut dyn PatchSink) -> Result<usize, PatchError> {
        sink.write(chunk)?;
        self.progress.consumed += chunk.len() as u64;
        self.progress.written += chunk.len() as u64;
        Ok(chunk.len())
    }

    fn progress(&self) -> PatchProgress {
        self.progress
    }

    fn finalize(&mut self, _sink: &mut dyn PatchSink) -> Result<(), PatchError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testsink {
    use super::{PatchError, PatchSink};

    /// In-memory sink for the applier tests.
    pub struct VecSink {
        pub origin: Vec<u8>,
        pub out: Vec<u8>,
    }

    impl VecSink {
        pub fn new(origin: Vec<u8>) -> VecSink {
            VecSink {
                origin,
                out: Vec::new(),
            }
        }
    }

    impl PatchSink for VecSink {
        fn write(&mut self, data: &[u8]) -> Result<(), PatchError> {
            self.out.extend_from_slice(data);
            Ok(())
        }

        fn read_origin(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), PatchError> {
            let start = offset as usize;
            let end = start + buf.len();
            if end > self.origin.len() {
                return Err(PatchError::Origin(format!(
                    "read past origin end ({} > {})",
                    end,
                    self.origin.len()
                )));
            }
            buf.copy_from_slice(&self.origin[start..end]);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::testsink::VecSink;
    use super::*;

    #[test]
    fn nodiff_copies_through() {
        let mut sink = VecSink::new(Vec::new());
        let mut applier = Nodiff::new();
        assert_eq!(applier.feed(b"hello ", &mut sink).unwrap(), 6);
        assert_eq!(applier.feed(b"world", &mut sink).unwrap(), 5);
        applier.finalize(&mut sink).unwrap();
        assert_eq!(sink.out, b"hello world");
        assert_eq!(
            applier.progress(),
            PatchProgress {
                consumed: 11,
                written: 11
            }
        );
    }
}
