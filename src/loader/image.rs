use super::{ImageLinker, ProgramSegment};
use crate::region::ExecRegion;
use crate::{HostVirtAddr, Result, VmmError, VmmHal};

/// A VMM image copied into its own executable region.
///
/// The parsed file is kept for linking; the executable region is owned and released
/// when the image is dropped.
pub struct Image<H: VmmHal, F> {
    file: F,
    exec: ExecRegion<H>,
}

impl<H: VmmHal, F> Image<H, F> {
    /// Parses `buffer` with `linker` and copies its loadable segments into a
    /// freshly allocated, zero-filled executable region.
    pub fn load<L>(linker: &L, buffer: &'static [u8]) -> Result<Self>
    where
        L: ImageLinker<File = F>,
    {
        if buffer.is_empty() {
            return Err(VmmError::InvalidArgument);
        }

        let file = linker.parse(buffer).map_err(|err| {
            warn!("[VMM] failed to parse image: {err}");
            VmmError::FormatError
        })?;

        let size = Self::required_size(linker, &file)?;
        if size == 0 {
            warn!("[VMM] image has no loadable contents");
            return Err(VmmError::FormatError);
        }

        // Dropping `exec` on any error below hands the region back to the platform.
        let mut exec = ExecRegion::<H>::alloc_zero(size)?;
        for index in 0..linker.segment_count(&file) {
            let segment = Self::segment(linker, &file, index)?;
            exec.copy_from(segment.vaddr as usize, file_bytes(buffer, &segment)?)?;
        }

        Ok(Self { file, exec })
    }

    /// The size of the executable region needed by `file`: the highest end
    /// address over all of its loadable segments.
    fn required_size<L>(linker: &L, file: &F) -> Result<usize>
    where
        L: ImageLinker<File = F>,
    {
        let mut total = 0u64;
        for index in 0..linker.segment_count(file) {
            let end = Self::segment(linker, file, index)?
                .end()
                .ok_or(VmmError::FormatError)?;
            total = total.max(end);
        }
        usize::try_from(total).map_err(|_| VmmError::FormatError)
    }

    fn segment<L>(linker: &L, file: &F, index: usize) -> Result<ProgramSegment>
    where
        L: ImageLinker<File = F>,
    {
        linker.segment(file, index).map_err(|err| {
            warn!("[VMM] failed to read segment {index}: {err}");
            VmmError::FormatError
        })
    }

    pub fn file(&self) -> &F {
        &self.file
    }

    pub fn exec_base(&self) -> HostVirtAddr {
        self.exec.base()
    }

    pub fn exec_size(&self) -> usize {
        self.exec.size()
    }
}

/// The on-disk bytes of `segment`; the rest of it up to `mem_size` stays zero.
fn file_bytes<'a>(buffer: &'a [u8], segment: &ProgramSegment) -> Result<&'a [u8]> {
    if segment.file_size > segment.mem_size {
        return Err(VmmError::FormatError);
    }
    let start = usize::try_from(segment.file_offset).map_err(|_| VmmError::FormatError)?;
    let len = usize::try_from(segment.file_size).map_err(|_| VmmError::FormatError)?;
    let end = start.checked_add(len).ok_or(VmmError::FormatError)?;
    buffer.get(start..end).ok_or(VmmError::FormatError)
}
