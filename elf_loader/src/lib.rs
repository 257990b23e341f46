//! # ELF Loader
//!
//! Validates an ELF image from a boot module and stages it for loading
//! into a fresh isolation domain.
//!
//! ## Philosophy
//!
//! The loader is a pure function from bytes to a staged description: it
//! creates no kernel objects and touches no supervisor state, so every
//! malformed-image path can be tested in isolation and a failed load can
//! never leak. Each validation step has its own named failure.

use cap_types::Rights;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the ELF header this loader understands (ELF64)
pub const EHDR_SIZE: usize = 64;

/// Size of one program-header entry (ELF64)
pub const PHDR_SIZE: usize = 56;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Validation failures, in the order the loader checks them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Image shorter than an ELF header
    #[error("image too small to hold an ELF header")]
    ImageTooSmall,

    /// Declared program-header entry size cannot hold a program header
    #[error("program header entry size {0} incompatible with the declared format")]
    BadProgramHeaderSize(u16),

    /// Program-header table runs past the declared image size
    #[error("program header table exceeds the image bounds")]
    ProgramHeadersOutOfBounds,

    /// Magic signature mismatch
    #[error("bad ELF magic signature")]
    BadMagic,

    /// A load segment's file-backed bytes run past the image
    #[error("load segment exceeds the image bounds")]
    SegmentOutOfBounds,
}

/// One loadable segment, described against the staged bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Virtual address the segment expects to live at
    pub virt: u64,
    /// In-memory size, including any zero-filled tail
    pub mem_size: u64,
    /// Offset of the segment's bytes within the staged image
    pub offset: u64,
    /// Permission triple translated from the segment flags
    pub perms: Rights,
}

/// A validated image, ready to back a child's region map.
///
/// The staged bytes are the original image with every segment's
/// file-to-memory gap zero-filled in place, so each segment is one
/// contiguous source range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub entry: u64,
    pub bytes: Vec<u8>,
    pub segments: Vec<SegmentDescriptor>,
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn segment_perms(flags: u32) -> Rights {
    Rights {
        read: flags & PF_R != 0,
        write: flags & PF_W != 0,
        execute: flags & PF_X != 0,
    }
}

/// Validates `image` and stages its loadable segments.
pub fn load_image(image: &[u8]) -> Result<StagedImage, LoadError> {
    if image.len() < EHDR_SIZE {
        return Err(LoadError::ImageTooSmall);
    }
    let phentsize = read_u16(image, 54);
    if (phentsize as usize) < PHDR_SIZE {
        return Err(LoadError::BadProgramHeaderSize(phentsize));
    }
    let phoff = read_u64(image, 32);
    let phnum = read_u16(image, 56);
    let table_end = phoff
        .checked_add(u64::from(phentsize) * u64::from(phnum))
        .ok_or(LoadError::ProgramHeadersOutOfBounds)?;
    if table_end > image.len() as u64 {
        return Err(LoadError::ProgramHeadersOutOfBounds);
    }
    if image[..4] != ELF_MAGIC {
        return Err(LoadError::BadMagic);
    }

    let entry = read_u64(image, 24);
    let mut bytes = image.to_vec();
    let mut segments = Vec::new();

    for i in 0..phnum {
        let ph = (phoff + u64::from(i) * u64::from(phentsize)) as usize;
        if read_u32(image, ph) != PT_LOAD {
            continue;
        }
        let flags = read_u32(image, ph + 4);
        let offset = read_u64(image, ph + 8);
        let virt = read_u64(image, ph + 16);
        let file_size = read_u64(image, ph + 32);
        let mem_size = read_u64(image, ph + 40);

        let file_end = offset
            .checked_add(file_size)
            .ok_or(LoadError::SegmentOutOfBounds)?;
        if file_end > image.len() as u64 {
            return Err(LoadError::SegmentOutOfBounds);
        }

        if mem_size > file_size {
            // zero-fill the gap so the whole segment is one source range
            let mem_end = offset
                .checked_add(mem_size)
                .ok_or(LoadError::SegmentOutOfBounds)? as usize;
            if bytes.len() < mem_end {
                bytes.resize(mem_end, 0);
            }
            bytes[file_end as usize..mem_end].fill(0);
        }

        segments.push(SegmentDescriptor {
            virt,
            mem_size,
            offset,
            perms: segment_perms(flags),
        });
    }

    Ok(StagedImage {
        entry,
        bytes,
        segments,
    })
}

/// Test support: assembles minimal ELF images.
pub mod testing {
    use super::{EHDR_SIZE, ELF_MAGIC, PHDR_SIZE, PF_R, PF_W, PF_X, PT_LOAD};

    struct BuilderSegment {
        virt: u64,
        flags: u32,
        data: Vec<u8>,
        mem_size: u64,
    }

    /// Builds ELF images for loader and supervisor tests.
    pub struct ImageBuilder {
        entry: u64,
        segments: Vec<BuilderSegment>,
    }

    impl ImageBuilder {
        pub fn new(entry: u64) -> Self {
            Self {
                entry,
                segments: Vec::new(),
            }
        }

        /// Adds a load segment whose memory size equals its file size
        pub fn segment(self, virt: u64, flags: u32, data: Vec<u8>) -> Self {
            let mem_size = data.len() as u64;
            self.segment_with_mem_size(virt, flags, data, mem_size)
        }

        /// Adds a load segment with an explicit (possibly larger) memory size
        pub fn segment_with_mem_size(
            mut self,
            virt: u64,
            flags: u32,
            data: Vec<u8>,
            mem_size: u64,
        ) -> Self {
            self.segments.push(BuilderSegment {
                virt,
                flags,
                data,
                mem_size,
            });
            self
        }

        /// Flag combination for code segments
        pub fn rx() -> u32 {
            PF_R | PF_X
        }

        /// Flag combination for data segments
        pub fn rw() -> u32 {
            PF_R | PF_W
        }

        pub fn build(self) -> Vec<u8> {
            let phoff = EHDR_SIZE;
            let data_start = phoff + self.segments.len() * PHDR_SIZE;
            let mut image = vec![0u8; data_start];

            image[..4].copy_from_slice(&ELF_MAGIC);
            image[4] = 2; // 64-bit
            image[5] = 1; // little-endian
            image[24..32].copy_from_slice(&self.entry.to_le_bytes());
            image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
            image[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
            image[56..58].copy_from_slice(&(self.segments.len() as u16).to_le_bytes());

            let mut offsets = Vec::new();
            for seg in &self.segments {
                offsets.push(image.len() as u64);
                image.extend_from_slice(&seg.data);
            }
            for (i, seg) in self.segments.iter().enumerate() {
                let ph = phoff + i * PHDR_SIZE;
                image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
                image[ph + 4..ph + 8].copy_from_slice(&seg.flags.to_le_bytes());
                image[ph + 8..ph + 16].copy_from_slice(&offsets[i].to_le_bytes());
                image[ph + 16..ph + 24].copy_from_slice(&seg.virt.to_le_bytes());
                image[ph + 32..ph + 40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
                image[ph + 40..ph + 48].copy_from_slice(&seg.mem_size.to_le_bytes());
            }
            image
        }
    }
}
