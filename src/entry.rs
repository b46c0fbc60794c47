/// Symbol of the trampoline every entry point is called through.
pub const EXECUTE_ENTRY_SYMBOL: &str = "execute_entry";

/// Status returned by an entry point on success.
pub const ENTRY_SUCCESS: i64 = 0;

/// The entry points a loaded VMM exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    /// `local_init(&SectionInfo)`: runs the constructors of one image.
    LocalInit,
    /// `local_fini(&SectionInfo)`: runs the destructors of one image.
    LocalFini,
    /// `start_vmm(cpu)`: enters VMX root operation on the current CPU.
    StartVmm,
    /// `stop_vmm(cpu)`: leaves VMX operation on the current CPU.
    StopVmm,
    /// `add_md(&MemoryDescriptor)`: hands one page of VMM memory to its memory manager.
    AddMemoryDescriptor,
    /// `get_drr(vcpu_id, &mut *const DebugRingResources)`.
    GetDebugRing,
}

impl EntryPoint {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::LocalInit => "local_init",
            Self::LocalFini => "local_fini",
            Self::StartVmm => "start_vmm",
            Self::StopVmm => "stop_vmm",
            Self::AddMemoryDescriptor => "add_md",
            Self::GetDebugRing => "get_drr",
        }
    }
}

/// Where a symbol is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The relocated set of all images.
    Global,
    /// The private symbol table of one image.
    Image(ImageHandle),
}

/// Identifies an image by its position in the image table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageHandle(pub(crate) usize);

impl ImageHandle {
    pub fn index(self) -> usize {
        self.0
    }
}
