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

// CWE package header codec.
//
// Every multi-byte field is big-endian on the wire. The 400-byte layout:
//
//   [0..256)    product specific buffer: 8 x 32-byte sub-entries
//   [256..260)  header CRC32 over the product specific buffer
//   [260..264)  image type, a four-character ASCII tag
//   [264..268)  product type
//   [268..272)  image size: bytes of body following this header
//   [272..276)  CRC32 of the body
//   [276..360)  version string, NUL padded
//   [360..368)  release date
//   [368..372)  misc options
//   [372..376)  storage address
//   [376..380)  program address
//   [380..384)  entry address
//   [384..388)  application signature
//   [388..400)  reserved

use std::convert::TryInto;
use std::fmt;

use thiserror::Error;

use crate::checksum::crc32;

pub const CWE_HEADER_SIZE: usize = 400;
/// Number of sub-entries in the product specific buffer.
pub const PSB_ENTRY_COUNT: usize = 8;
/// Most original headers a META sub-package may carry.
pub const META_MAX_HEADERS: usize = PSB_ENTRY_COUNT + 1;

const PSB_SIZE: usize = 256;
const VERSION_LEN: usize = 84;
const DATE_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum CweError {
    #[error("cwe header needs {CWE_HEADER_SIZE} bytes, got {0}")]
    ShortHeader(usize),
    #[error("cwe header crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderCrc { stored: u32, computed: u32 },
    #[error("unknown image type tag {0:?}")]
    UnknownImageType(String),
}

bitflags::bitflags! {
    /// Option bits of a component header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MiscOpts: u32 {
        const COMPRESSED = 1 << 0;
        const ENCRYPTED  = 1 << 1;
        const SIGNED     = 1 << 2;
        const DELTAPATCH = 1 << 3;
    }
}

macro_rules! image_types {
    ($($variant:ident = $tag:literal),+ $(,)?) => {
        /// Image type tags understood by the parser.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ImageType {
            $($variant),+
        }

        impl ImageType {
            pub fn from_tag(tag: &[u8; 4]) -> Option<ImageType> {
                match tag {
                    $($tag => Some(ImageType::$variant),)+
                    _ => None,
                }
            }

            pub fn tag(self) -> &'static [u8; 4] {
                match self {
                    $(ImageType::$variant => $tag),+
                }
            }
        }
    };
}

image_types! {
    Qpar = b"QPAR",
    Sbl1 = b"SBL1",
    Sbl2 = b"SBL2",
    Dsp1 = b"DSP1",
    Dsp2 = b"DSP2",
    Dsp3 = b"DSP3",
    Foto = b"FOTO",
    Rami = b"RAMI",
    Osbl = b"OSBL",
    Amss = b"AMSS",
    Apps = b"APPS",
    Apbl = b"APBL",
    Nvbf = b"NVBF",
    Sffs = b"SFFS",
    Cus0 = b"CUS0",
    Cus1 = b"CUS1",
    Cus2 = b"CUS2",
    Hdat = b"HDAT",
    Exec = b"EXEC",
    Swoc = b"SWOC",
    Lram = b"LRAM",
    Cfpr = b"CFPR",
    Modm = b"MODM",
    Syst = b"SYST",
    User = b"USER",
    Uapp = b"UAPP",
    Boot = b"BOOT",
    Spkg = b"SPKG",
    Appl = b"APPL",
    Meta = b"META",
    Qrpm = b"QRPM",
    Tzon = b"TZON",
    Qsdi = b"QSDI",
    Arch = b"ARCH",
    Kern = b"KERN",
    Rofs = b"ROFS",
    Dtbo = b"DTBO",
    Init = b"INIT",
    Usdt = b"USDT",
    Rpm0 = b"RPM0",
}

impl ImageType {
    /// Composite containers carry further sub-headers instead of a body.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            ImageType::Appl | ImageType::Modm | ImageType::Spkg | ImageType::Boot
        )
    }

    /// The META pseudo-package caches original headers for delta children.
    pub fn is_meta(self) -> bool {
        self == ImageType::Meta
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(std::str::from_utf8(self.tag()).unwrap_or("????"))
    }
}

/// A decoded CWE header, with the wire bytes kept verbatim for re-emission.
#[derive(Clone)]
pub struct CweHeader {
    pub image_type: ImageType,
    pub prod_type: u32,
    pub image_size: u32,
    pub data_crc: u32,
    pub misc_opts: MiscOpts,
    pub storage_addr: u32,
    pub prog_addr: u32,
    pub entry_addr: u32,
    pub signature: u32,
    pub raw: [u8; CWE_HEADER_SIZE],
}

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

impl CweHeader {
    pub fn parse(buf: &[u8]) -> Result<CweHeader, CweError> {
        if buf.len() != CWE_HEADER_SIZE {
            return Err(CweError::ShortHeader(buf.len()));
        }
        let stored = be32(buf, 256);
        let computed = crc32(&buf[..PSB_SIZE]);
        if stored != computed {
            return Err(CweError::HeaderCrc { stored, computed });
        }
        let tag: [u8; 4] = buf[260..264].try_into().unwrap();
        let image_type = ImageType::from_tag(&tag)
            .ok_or_else(|| CweError::UnknownImageType(String::from_utf8_lossy(&tag).into_owned()))?;
        let mut raw = [0u8; CWE_HEADER_SIZE];
        raw.copy_from_slice(buf);
        Ok(CweHeader {
            image_type,
            prod_type: be32(buf, 264),
            image_size: be32(buf, 268),
            data_crc: be32(buf, 272),
            misc_opts: MiscOpts::from_bits_retain(be32(buf, 368)),
            storage_addr: be32(buf, 372),
            prog_addr: be32(buf, 376),
            entry_addr: be32(buf, 380),
            signature: be32(buf, 384),
            raw,
        })
    }

    /// Version string with trailing NULs trimmed.
    pub fn version(&self) -> String {
        let field = &self.raw[276..276 + VERSION_LEN];
        let end = field.iter().position(|&b| b == 0).unwrap_or(VERSION_LEN);
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    /// Release date bytes as stored.
    pub fn release_date(&self) -> &[u8] {
        &self.raw[360..360 + DATE_LEN]
    }
}

impl fmt::Debug for CweHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CweHeader")
            .field("image_type", &self.image_type)
            .field("image_size", &self.image_size)
            .field("data_crc", &format_args!("{:#010x}", self.data_crc))
            .field("misc_opts", &self.misc_opts)
            .finish()
    }
}

/// Assemble a wire header for the test packages.
#[cfg(test)]
pub(crate) fn build_header(
    image_type: ImageType,
    image_size: u32,
    data_crc: u32,
    misc_opts: MiscOpts,
) -> [u8; CWE_HEADER_SIZE] {
    let mut buf = [0u8; CWE_HEADER_SIZE];
    // Leave the product specific buffer zeroed; its CRC still has to hold.
    let psb_crc = crc32(&buf[..PSB_SIZE]);
    buf[256..260].copy_from_slice(&psb_crc.to_be_bytes());
    buf[260..264].copy_from_slice(image_type.tag());
    buf[264..268].copy_from_slice(&0x9999_0001u32.to_be_bytes());
    buf[268..272].copy_from_slice(&image_size.to_be_bytes());
    buf[272..276].copy_from_slice(&data_crc.to_be_bytes());
    buf[276..281].copy_from_slice(b"1.0_t");
    buf[360..368].copy_from_slice(b"20250101");
    buf[368..372].copy_from_slice(&misc_opts.bits().to_be_bytes());
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_roundtrip() {
        let raw = build_header(ImageType::Syst, 1024, 0xdead_beef, MiscOpts::empty());
        let hdr = CweHeader::parse(&raw).unwrap();
        assert_eq!(hdr.image_type, ImageType::Syst);
        assert_eq!(hdr.image_size, 1024);
        assert_eq!(hdr.data_crc, 0xdead_beef);
        assert_eq!(hdr.misc_opts, MiscOpts::empty());
        assert_eq!(hdr.version(), "1.0_t");
        assert_eq!(hdr.release_date(), b"20250101");
        assert_eq!(&hdr.raw[..], &raw[..]);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            CweHeader::parse(&[0u8; 10]),
            Err(CweError::ShortHeader(10))
        ));
    }

    #[test]
    fn rejects_bad_header_crc() {
        let mut raw = build_header(ImageType::Syst, 1024, 0, MiscOpts::empty());
        raw[0] ^= 0xff;
        assert!(matches!(
            CweHeader::parse(&raw),
            Err(CweError::HeaderCrc { .. })
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut raw = build_header(ImageType::Syst, 0, 0, MiscOpts::empty());
        raw[260..264].copy_from_slice(b"ZZZZ");
        assert!(matches!(
            CweHeader::parse(&raw),
            Err(CweError::UnknownImageType(_))
        ));
    }

    #[test]
    fn classification() {
        assert!(ImageType::Appl.is_composite());
        assert!(ImageType::Modm.is_composite());
        assert!(ImageType::Spkg.is_composite());
        assert!(ImageType::Boot.is_composite());
        assert!(!ImageType::Syst.is_composite());
        assert!(ImageType::Meta.is_meta());
        assert!(!ImageType::Meta.is_composite());
    }

    #[test]
    fn delta_option_bit() {
        let raw = build_header(ImageType::Dsp2, 64, 0, MiscOpts::DELTAPATCH);
        let hdr = CweHeader::parse(&raw).unwrap();
        assert!(hdr.misc_opts.contains(MiscOpts::DELTAPATCH));
    }
}
