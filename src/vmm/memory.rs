// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Registration of the VMM's own memory with its memory manager.

use memory_addr::{PAGE_SIZE_4K as PAGE_SIZE, align_down_4k, align_up_4k};

use crate::entry::{EntryPoint, ImageHandle, Scope};
use crate::loader::{ImageLinker, ImageSet, ProgramSegment, SegmentFlags};
use crate::{HostVirtAddr, Result, VmmError, VmmHal};

bitflags::bitflags! {
    /// Access rights of a page handed to the VMM's memory manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryType: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// One page of VMM memory, as passed to the `add_md` entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub virt: u64,
    pub phys: u64,
    pub ty: u64,
}

impl MemoryDescriptor {
    pub fn memory_type(&self) -> MemoryType {
        MemoryType::from_bits_truncate(self.ty)
    }
}

impl MemoryType {
    /// Executable segments map read+execute, all others read+write.
    pub fn for_segment(flags: SegmentFlags) -> Self {
        if flags.contains(SegmentFlags::EXECUTE) {
            Self::READ | Self::EXECUTE
        } else {
            Self::READ | Self::WRITE
        }
    }
}

/// The page-aligned range `[start, end)` covering `segment` placed at `base`.
pub(crate) fn segment_pages(base: HostVirtAddr, segment: &ProgramSegment) -> Option<(usize, usize)> {
    if segment.mem_size == 0 {
        return None;
    }
    let start = base.as_usize().checked_add(usize::try_from(segment.vaddr).ok()?)?;
    let end = start.checked_add(usize::try_from(segment.mem_size).ok()?)?;
    Some((align_down_4k(start), align_up_4k(end)))
}

/// Hands every page of one image to the VMM's memory manager.
pub(crate) fn register_image<H, L, const N: usize>(
    set: &ImageSet<H, L, N>,
    handle: ImageHandle,
) -> Result
where
    H: VmmHal,
    L: ImageLinker,
{
    let image = set.image(handle).ok_or(VmmError::InvalidArgument)?;
    let linker = set.linker();

    for index in 0..linker.segment_count(image.file()) {
        let segment = linker
            .segment(image.file(), index)
            .map_err(|_| VmmError::FormatError)?;
        let Some((start, end)) = segment_pages(image.exec_base(), &segment) else {
            continue;
        };
        let ty = MemoryType::for_segment(segment.flags);

        for virt in (start..end).step_by(PAGE_SIZE) {
            let md = MemoryDescriptor {
                virt: virt as u64,
                phys: H::virt_to_phys(HostVirtAddr::from(virt)).as_usize() as u64,
                ty: ty.bits(),
            };
            trace!("[VMM] add_md {:#x} -> {:#x} ({:?})", md.virt, md.phys, ty);
            set.invoke(
                EntryPoint::AddMemoryDescriptor,
                &md as *const MemoryDescriptor as u64,
                0,
                Scope::Global,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(vaddr: u64, mem_size: u64, flags: SegmentFlags) -> ProgramSegment {
        ProgramSegment {
            vaddr,
            mem_size,
            file_size: 0,
            file_offset: 0,
            flags,
        }
    }

    #[test]
    fn test_segment_pages_rounds_to_page_boundaries() {
        let base = HostVirtAddr::from(0x40_0000);
        let seg = segment(0x1800, 0x1000, SegmentFlags::READ);
        assert_eq!(segment_pages(base, &seg), Some((0x40_1000, 0x40_3000)));

        let aligned = segment(0x2000, 0x2000, SegmentFlags::READ);
        assert_eq!(segment_pages(base, &aligned), Some((0x40_2000, 0x40_4000)));
    }

    #[test]
    fn test_empty_segment_has_no_pages() {
        let base = HostVirtAddr::from(0x40_0000);
        assert_eq!(segment_pages(base, &segment(0x1000, 0, SegmentFlags::READ)), None);
    }

    #[test]
    fn test_memory_type_for_segment() {
        assert_eq!(
            MemoryType::for_segment(SegmentFlags::READ | SegmentFlags::EXECUTE),
            MemoryType::READ | MemoryType::EXECUTE
        );
        assert_eq!(
            MemoryType::for_segment(SegmentFlags::READ | SegmentFlags::WRITE),
            MemoryType::READ | MemoryType::WRITE
        );
        assert_eq!(
            MemoryType::for_segment(SegmentFlags::READ),
            MemoryType::READ | MemoryType::WRITE
        );
    }
}
