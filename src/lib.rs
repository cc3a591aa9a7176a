#![doc(html_no_source)]
//! Firmware-update staging engine for cellular modem modules.
//!
//! A CWE update package arrives over a byte stream and is laid down into a
//! raw NAND staging partition, ready for the bootloader to install on the
//! next reboot. The engine is a streaming parser with a resumable writer:
//! every byte is parsed, written, checksummed and checkpointed before the
//! next one is read, so an arbitrary power cut during a download is
//! recoverable from the two-file resume journal.

pub mod checksum;
pub mod config;
pub mod cwe;
pub mod engine;
pub mod error;
pub mod journal;
pub mod mtd;
pub mod partition;
pub mod patch;
pub mod status;
pub mod ubi;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use engine::Engine;
pub use error::{Result, UpdateError};
pub use status::DwlStatus;
