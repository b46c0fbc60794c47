use alloc::string::ToString;

use arrayvec::ArrayVec;

use super::{Image, ImageLinker, SectionInfo};
use crate::entry::{ENTRY_SUCCESS, EXECUTE_ENTRY_SYMBOL, EntryPoint, ImageHandle, Scope};
use crate::region::CallStack;
use crate::{Result, VmmError, VmmHal};

/// A bounded, ordered table of loaded images together with the link state
/// shared by them: the linker, the entry trampoline and the call stack.
pub struct ImageSet<H: VmmHal, L: ImageLinker, const N: usize> {
    linker: L,
    images: ArrayVec<Image<H, L::File>, N>,
    stack: Option<CallStack<H>>,
    trampoline: Option<usize>,
}

impl<H: VmmHal, L: ImageLinker, const N: usize> ImageSet<H, L, N> {
    pub const fn new(linker: L) -> Self {
        Self {
            linker,
            images: ArrayVec::new_const(),
            stack: None,
            trampoline: None,
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn linker(&self) -> &L {
        &self.linker
    }

    pub fn image(&self, handle: ImageHandle) -> Option<&Image<H, L::File>> {
        self.images.get(handle.index())
    }

    /// Loads `buffer` as the next image.
    ///
    /// The image only becomes visible once it has been fully copied.
    pub fn add(&mut self, buffer: &'static [u8]) -> Result<ImageHandle> {
        if self.images.is_full() {
            return Err(VmmError::CapacityExceeded);
        }

        let image = Image::load(&self.linker, buffer)?;
        let handle = ImageHandle(self.images.len());
        debug!(
            "[VMM] added image [{}]: addr = {:#x}, size = {:#x}",
            handle.index(),
            image.exec_base().as_usize(),
            image.exec_size()
        );
        self.images.push(image);
        Ok(handle)
    }

    /// Allocates the stack entry points are called on.
    pub fn alloc_stack(&mut self) -> Result {
        if self.stack.is_none() {
            self.stack = Some(CallStack::alloc()?);
        }
        Ok(())
    }

    /// Links all images as one set and resolves the entry trampoline.
    pub fn link(&mut self) -> Result {
        self.linker.reset();
        for image in &self.images {
            self.linker
                .add_to_link_set(image.file(), image.exec_base())
                .map_err(|err| {
                    warn!("[VMM] failed to add image to link set: {err}");
                    VmmError::FormatError
                })?;
        }
        self.linker.relocate().map_err(|err| {
            warn!("[VMM] failed to relocate images: {err}");
            VmmError::FormatError
        })?;

        self.trampoline = Some(self.resolve_symbol(EXECUTE_ENTRY_SYMBOL, Scope::Global)?);
        Ok(())
    }

    /// Section tables of one image, as placed by the link set.
    pub fn section_info(&self, handle: ImageHandle) -> Result<SectionInfo> {
        let image = self.image(handle).ok_or(VmmError::InvalidArgument)?;
        self.linker.section_info(image.file()).map_err(|err| {
            warn!("[VMM] no section info for image [{}]: {err}", handle.index());
            VmmError::FormatError
        })
    }

    /// Resolves `name`, either across the linked set or within one image.
    pub fn resolve_symbol(&self, name: &str, scope: Scope) -> Result<usize> {
        let resolved = match scope {
            Scope::Global => {
                if self.images.is_empty() {
                    return Err(VmmError::NoImagesLoaded);
                }
                self.linker.resolve(name)
            }
            Scope::Image(handle) => {
                let image = self.image(handle).ok_or(VmmError::InvalidArgument)?;
                self.linker.resolve_in(image.file(), image.exec_base(), name)
            }
        };
        resolved.map_err(|_| {
            warn!("[VMM] failed to find: {name}");
            VmmError::SymbolNotFound(name.to_string())
        })
    }

    /// Resolves `entry` in `scope` and calls it through the trampoline on the
    /// dedicated call stack.
    pub fn invoke(&self, entry: EntryPoint, arg1: u64, arg2: u64, scope: Scope) -> Result {
        let (Some(trampoline), Some(stack)) = (self.trampoline, self.stack.as_ref()) else {
            return Err(VmmError::InvalidState);
        };
        let target = self
            .resolve_symbol(entry.symbol(), scope)
            .map_err(|_| VmmError::EntryFailure { entry, status: -1 })?;

        trace!(
            "[VMM] {}({:#x}, {:#x}) @ {:#x}",
            entry.symbol(),
            arg1,
            arg2,
            target
        );
        let status = unsafe { H::execute_entry(trampoline, stack.top(), target, arg1, arg2) };
        if status != ENTRY_SUCCESS {
            warn!("[VMM] {} failed: {:#x}", entry.symbol(), status);
            return Err(VmmError::EntryFailure { entry, status });
        }
        Ok(())
    }

    /// Drops every image, the call stack and the link state.
    pub fn release(&mut self) {
        self.trampoline = None;
        self.images.clear();
        self.stack = None;
        self.linker.reset();
    }

    /// Forgets every image and the call stack without returning their memory.
    pub fn leak(&mut self) {
        self.trampoline = None;
        for image in self.images.drain(..) {
            core::mem::forget(image);
        }
        if let Some(stack) = self.stack.take() {
            core::mem::forget(stack);
        }
    }
}
