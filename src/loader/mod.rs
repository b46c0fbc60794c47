//! Loading of VMM images and symbol resolution across them.
//!
//! The ELF parsing and relocation itself is provided by an [`ImageLinker`];
//! this module only places the loadable segments in executable memory.

mod image;
mod set;

pub use self::image::Image;
pub use self::set::ImageSet;

use crate::{HostVirtAddr, Result};

bitflags::bitflags! {
    /// Permissions of a loadable segment (ELF `p_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// A loadable segment of a parsed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSegment {
    /// Offset of the segment from the image's load base.
    pub vaddr: u64,
    /// Size of the segment in memory.
    pub mem_size: u64,
    /// Number of bytes present in the file, `<= mem_size`.
    pub file_size: u64,
    /// Offset of the segment's bytes in the file.
    pub file_offset: u64,
    pub flags: SegmentFlags,
}

impl ProgramSegment {
    /// Offset one past the last byte of the segment in memory.
    pub fn end(&self) -> Option<u64> {
        self.vaddr.checked_add(self.mem_size)
    }
}

/// Locations of the constructor, destructor and unwind tables of one image,
/// handed to its `local_init` and `local_fini` entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionInfo {
    pub ctors_addr: u64,
    pub ctors_size: u64,
    pub dtors_addr: u64,
    pub dtors_size: u64,
    pub eh_frame_addr: u64,
    pub eh_frame_size: u64,
}

/// The relocation and symbol service the loader is built on.
///
/// A linker holds one link set. Images are parsed individually, added to the
/// set together with the address they were placed at, and relocated as a unit.
pub trait ImageLinker {
    /// A parsed image file.
    type File;

    /// Parses a staged image.
    fn parse(&self, image: &'static [u8]) -> Result<Self::File>;
    /// The number of loadable segments of `file`.
    fn segment_count(&self, file: &Self::File) -> usize;
    /// The `index`-th loadable segment of `file`.
    fn segment(&self, file: &Self::File, index: usize) -> Result<ProgramSegment>;

    /// Adds `file`, placed at `exec_base`, to the link set.
    fn add_to_link_set(&mut self, file: &Self::File, exec_base: HostVirtAddr) -> Result;
    /// Applies the relocations of every image in the link set.
    fn relocate(&mut self) -> Result;
    /// Resolves `name` across the relocated link set.
    fn resolve(&self, name: &str) -> Result<usize>;
    /// Resolves `name` in the symbol table of `file` only, `file` being placed
    /// at `exec_base`.
    fn resolve_in(&self, file: &Self::File, exec_base: HostVirtAddr, name: &str) -> Result<usize>;
    /// Section tables of `file` as placed by the link set.
    fn section_info(&self, file: &Self::File) -> Result<SectionInfo>;
    /// Forgets the link set.
    fn reset(&mut self);
}
