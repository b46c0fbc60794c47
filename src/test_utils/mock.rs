//! Mocks keep their state per thread, so tests running in parallel do not
//! observe each other. Call `MockHal::reset()` at the start of every test.

use std::alloc::{Layout, alloc, dealloc};
use std::boxed::Box;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::vec::Vec;

use crate::entry::{EXECUTE_ENTRY_SYMBOL, EntryPoint};
use crate::loader::{ImageLinker, ProgramSegment, SectionInfo, SegmentFlags};
use crate::msr::Msr;
use crate::vmm::{DebugRingResources, MemoryDescriptor};
use crate::vmx::{ControlSource, VmcsField};
use crate::{HostPhysAddr, HostVirtAddr, Result, VmmError, VmmHal};

/// Affinity reported while the test thread is not pinned.
pub const UNPINNED: usize = usize::MAX;

const MOCK_ALIGN: usize = 0x1000;

/// One call made through [`MockHal::execute_entry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCall {
    pub symbol: &'static str,
    pub image: &'static str,
    pub arg1: u64,
    pub arg2: u64,
    /// Affinity at the time of the call.
    pub cpu: usize,
    pub stack_top: usize,
    /// The section info passed to `local_init`/`local_fini`.
    pub section: Option<SectionInfo>,
    /// The descriptor passed to `add_md`.
    pub descriptor: Option<MemoryDescriptor>,
}

#[derive(Debug, Clone)]
struct EntryFault {
    symbol: &'static str,
    image: Option<&'static str>,
    arg1: Option<u64>,
    status: i64,
}

impl EntryFault {
    fn matches(&self, symbol: &str, image: &str, arg1: u64) -> bool {
        self.symbol == symbol
            && self.image.is_none_or(|name| name == image)
            && self.arg1.is_none_or(|arg| arg == arg1)
    }
}

struct HalState {
    exec: BTreeMap<usize, usize>,
    rw: BTreeMap<usize, usize>,
    total_exec: usize,
    fail_exec: bool,
    fail_rw: bool,
    cpu_count: usize,
    failing_cpus: Vec<usize>,
    current_cpu: usize,
    calls: Vec<EntryCall>,
    faults: Vec<EntryFault>,
    on_start: usize,
    on_stop: usize,
    ring: *mut DebugRingResources,
    hide_ring: bool,
}

impl HalState {
    fn new() -> Self {
        Self {
            exec: BTreeMap::new(),
            rw: BTreeMap::new(),
            total_exec: 0,
            fail_exec: false,
            fail_rw: false,
            cpu_count: 4,
            failing_cpus: Vec::new(),
            current_cpu: UNPINNED,
            calls: Vec::new(),
            faults: Vec::new(),
            on_start: 0,
            on_stop: 0,
            ring: Box::into_raw(Box::new(DebugRingResources::new())),
            hide_ring: false,
        }
    }
}

/// Maps resolved entry addresses to `(symbol, image name)`.
type EntryTable = HashMap<usize, (&'static str, &'static str)>;

std::thread_local! {
    static HAL: RefCell<HalState> = RefCell::new(HalState::new());
    static ENTRY_TABLE: RefCell<EntryTable> = RefCell::new(HashMap::new());
    static STAGED: RefCell<HashMap<usize, MockFile>> = RefCell::new(HashMap::new());
}

fn with_hal<R>(f: impl FnOnce(&mut HalState) -> R) -> R {
    HAL.with(|state| f(&mut state.borrow_mut()))
}

fn layout(size: usize) -> Layout {
    Layout::from_size_align(size.max(1), MOCK_ALIGN).unwrap()
}

fn mock_alloc(size: usize) -> usize {
    unsafe { alloc(layout(size)) as usize }
}

fn mock_free(base: usize, size: usize) {
    unsafe { dealloc(base as *mut u8, layout(size)) }
}

#[derive(Debug)]
pub struct MockHal;

impl MockHal {
    /// Drops every fault, counter and recorded call of this thread.
    pub fn reset() {
        with_hal(|state| *state = HalState::new());
        ENTRY_TABLE.with(|table| table.borrow_mut().clear());
    }

    pub fn fail_exec_allocations(fail: bool) {
        with_hal(|state| state.fail_exec = fail);
    }

    pub fn fail_rw_allocations(fail: bool) {
        with_hal(|state| state.fail_rw = fail);
    }

    pub fn live_exec_allocations() -> usize {
        with_hal(|state| state.exec.len())
    }

    pub fn total_exec_allocations() -> usize {
        with_hal(|state| state.total_exec)
    }

    pub fn live_rw_allocations() -> usize {
        with_hal(|state| state.rw.len())
    }

    pub fn set_cpu_count(count: usize) {
        with_hal(|state| state.cpu_count = count);
    }

    /// Makes pinning to `cpu` fail.
    pub fn fail_affinity_for(cpu: usize) {
        with_hal(|state| state.failing_cpus.push(cpu));
    }

    pub fn current_cpu() -> usize {
        with_hal(|state| state.current_cpu)
    }

    /// Makes calls to `symbol` return `status`, optionally only for one image
    /// or one value of the first argument.
    pub fn fail_entry(symbol: &'static str, image: Option<&'static str>, arg1: Option<u64>, status: i64) {
        with_hal(|state| {
            state.faults.push(EntryFault {
                symbol,
                image,
                arg1,
                status,
            })
        });
    }

    pub fn clear_entry_faults() {
        with_hal(|state| state.faults.clear());
    }

    pub fn calls() -> Vec<EntryCall> {
        with_hal(|state| state.calls.clone())
    }

    pub fn calls_to(symbol: &str) -> Vec<EntryCall> {
        with_hal(|state| {
            state
                .calls
                .iter()
                .filter(|call| call.symbol == symbol)
                .cloned()
                .collect()
        })
    }

    pub fn clear_calls() {
        with_hal(|state| state.calls.clear());
    }

    pub fn on_start_count() -> usize {
        with_hal(|state| state.on_start)
    }

    pub fn on_stop_count() -> usize {
        with_hal(|state| state.on_stop)
    }

    /// The ring handed out by `get_drr`.
    pub fn debug_ring() -> *mut DebugRingResources {
        with_hal(|state| state.ring)
    }

    /// Makes `get_drr` succeed without returning a ring.
    pub fn hide_debug_ring(hide: bool) {
        with_hal(|state| state.hide_ring = hide);
    }
}

fn lookup_entry(addr: usize) -> Option<(&'static str, &'static str)> {
    ENTRY_TABLE.with(|table| table.borrow().get(&addr).copied())
}

impl VmmHal for MockHal {
    fn alloc_exec(size: usize) -> Option<HostVirtAddr> {
        with_hal(|state| {
            if state.fail_exec {
                return None;
            }
            let base = mock_alloc(size);
            state.exec.insert(base, size);
            state.total_exec += 1;
            Some(HostVirtAddr::from(base))
        })
    }

    fn free_exec(vaddr: HostVirtAddr, size: usize) {
        with_hal(|state| {
            assert_eq!(state.exec.remove(&vaddr.as_usize()), Some(size), "bad free_exec");
        });
        mock_free(vaddr.as_usize(), size);
    }

    fn alloc_rw(size: usize) -> Option<HostVirtAddr> {
        with_hal(|state| {
            if state.fail_rw {
                return None;
            }
            let base = mock_alloc(size);
            state.rw.insert(base, size);
            Some(HostVirtAddr::from(base))
        })
    }

    fn free_rw(vaddr: HostVirtAddr, size: usize) {
        with_hal(|state| {
            assert_eq!(state.rw.remove(&vaddr.as_usize()), Some(size), "bad free_rw");
        });
        mock_free(vaddr.as_usize(), size);
    }

    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
        HostPhysAddr::from(vaddr.as_usize())
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn cpu_count() -> usize {
        with_hal(|state| state.cpu_count)
    }

    fn set_affinity(cpu: usize) -> Result<usize> {
        with_hal(|state| {
            if cpu >= state.cpu_count || state.failing_cpus.contains(&cpu) {
                return Err(VmmError::InvalidArgument);
            }
            Ok(core::mem::replace(&mut state.current_cpu, cpu))
        })
    }

    fn restore_affinity(prior: usize) {
        with_hal(|state| state.current_cpu = prior);
    }

    fn on_start() {
        with_hal(|state| state.on_start += 1);
    }

    fn on_stop() {
        with_hal(|state| state.on_stop += 1);
    }

    unsafe fn execute_entry(
        trampoline: usize,
        stack_top: HostVirtAddr,
        entry: usize,
        arg1: u64,
        arg2: u64,
    ) -> i64 {
        let (trampoline_symbol, _) = lookup_entry(trampoline).expect("unknown trampoline");
        assert_eq!(trampoline_symbol, EXECUTE_ENTRY_SYMBOL);
        let (symbol, image) = lookup_entry(entry).expect("unknown entry point");

        let section = if symbol == EntryPoint::LocalInit.symbol()
            || symbol == EntryPoint::LocalFini.symbol()
        {
            Some(unsafe { *(arg1 as *const SectionInfo) })
        } else {
            None
        };
        let descriptor = if symbol == EntryPoint::AddMemoryDescriptor.symbol() {
            Some(unsafe { *(arg1 as *const MemoryDescriptor) })
        } else {
            None
        };

        let (fault, ring) = with_hal(|state| {
            state.calls.push(EntryCall {
                symbol,
                image,
                arg1,
                arg2,
                cpu: state.current_cpu,
                stack_top: stack_top.as_usize(),
                section,
                descriptor,
            });
            let fault = state
                .faults
                .iter()
                .find(|fault| fault.matches(symbol, image, arg1))
                .map(|fault| fault.status);
            let ring = if state.hide_ring {
                core::ptr::null()
            } else {
                state.ring as *const DebugRingResources
            };
            (fault, ring)
        });
        if let Some(status) = fault {
            return status;
        }

        if symbol == EntryPoint::GetDebugRing.symbol() {
            unsafe { *(arg2 as *mut *const DebugRingResources) = ring };
        }
        0
    }
}

/// The symbols every [`MockImage`] exports unless removed.
const STANDARD_SYMBOLS: [&str; 7] = [
    EXECUTE_ENTRY_SYMBOL,
    "local_init",
    "local_fini",
    "start_vmm",
    "stop_vmm",
    "add_md",
    "get_drr",
];

/// A parsed [`MockImage`].
#[derive(Debug, Clone)]
pub struct MockFile {
    pub name: &'static str,
    pub segments: Vec<ProgramSegment>,
    pub symbols: Vec<(&'static str, u64)>,
    /// Address of the staged buffer; identifies the file.
    key: usize,
}

/// Builds the staged buffer of an image understood by [`MockLinker`].
#[derive(Debug, Clone)]
pub struct MockImage {
    name: &'static str,
    segments: Vec<ProgramSegment>,
    payload: Vec<u8>,
    symbols: Vec<(&'static str, u64)>,
}

impl MockImage {
    pub fn new() -> Self {
        Self {
            name: "vmm",
            segments: Vec::new(),
            payload: Vec::new(),
            symbols: STANDARD_SYMBOLS
                .iter()
                .enumerate()
                .map(|(i, name)| (*name, 0x10 * i as u64))
                .collect(),
        }
    }

    /// An image named `name` with a text and a data segment.
    pub fn standard(name: &'static str) -> Self {
        Self::new()
            .named(name)
            .segment(ProgramSegment {
                vaddr: 0,
                mem_size: 0x1800,
                file_size: 0x80,
                file_offset: 0,
                flags: SegmentFlags::READ | SegmentFlags::EXECUTE,
            })
            .segment(ProgramSegment {
                vaddr: 0x2000,
                mem_size: 0x1000,
                file_size: 0x10,
                file_offset: 0x80,
                flags: SegmentFlags::READ | SegmentFlags::WRITE,
            })
            .payload(&[0x90; 0x90])
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn segment(mut self, segment: ProgramSegment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn payload(mut self, bytes: &[u8]) -> Self {
        self.payload = bytes.to_vec();
        self
    }

    pub fn symbol(mut self, name: &'static str, offset: u64) -> Self {
        self.symbols.push((name, offset));
        self
    }

    pub fn without_symbol(mut self, name: &str) -> Self {
        self.symbols.retain(|(symbol, _)| *symbol != name);
        self
    }

    /// Leaks the staged buffer and registers it for [`MockLinker::parse`].
    pub fn stage(self) -> &'static [u8] {
        let mut bytes = self.payload;
        if bytes.is_empty() {
            bytes.push(0);
        }
        let buffer: &'static [u8] = Box::leak(bytes.into_boxed_slice());
        let key = buffer.as_ptr() as usize;
        let file = MockFile {
            name: self.name,
            segments: self.segments,
            symbols: self.symbols,
            key,
        };
        STAGED.with(|staged| staged.borrow_mut().insert(key, file));
        buffer
    }
}

/// A relocation service for [`MockImage`] buffers.
#[derive(Debug, Default)]
pub struct MockLinker {
    link_set: Vec<(MockFile, HostVirtAddr)>,
    relocated: bool,
    fail_relocate: bool,
}

impl MockLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_relocate() -> Self {
        Self {
            fail_relocate: true,
            ..Self::default()
        }
    }

    pub fn link_set_len(&self) -> usize {
        self.link_set.len()
    }

    fn register(name: &'static str, image: &'static str, addr: usize) -> usize {
        ENTRY_TABLE.with(|table| table.borrow_mut().insert(addr, (name, image)));
        addr
    }

    fn lookup(file: &MockFile, base: HostVirtAddr, name: &str) -> Result<usize> {
        let (symbol, offset) = file
            .symbols
            .iter()
            .find(|(symbol, _)| *symbol == name)
            .ok_or(VmmError::FormatError)?;
        Ok(Self::register(symbol, file.name, base.as_usize() + *offset as usize))
    }
}

impl ImageLinker for MockLinker {
    type File = MockFile;

    fn parse(&self, image: &'static [u8]) -> Result<MockFile> {
        STAGED
            .with(|staged| staged.borrow().get(&(image.as_ptr() as usize)).cloned())
            .ok_or(VmmError::FormatError)
    }

    fn segment_count(&self, file: &MockFile) -> usize {
        file.segments.len()
    }

    fn segment(&self, file: &MockFile, index: usize) -> Result<ProgramSegment> {
        file.segments.get(index).copied().ok_or(VmmError::FormatError)
    }

    fn add_to_link_set(&mut self, file: &MockFile, exec_base: HostVirtAddr) -> Result {
        self.link_set.push((file.clone(), exec_base));
        Ok(())
    }

    fn relocate(&mut self) -> Result {
        if self.fail_relocate {
            return Err(VmmError::FormatError);
        }
        self.relocated = true;
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<usize> {
        if !self.relocated {
            return Err(VmmError::InvalidState);
        }
        self.link_set
            .iter()
            .find_map(|(file, base)| Self::lookup(file, *base, name).ok())
            .ok_or(VmmError::FormatError)
    }

    fn resolve_in(&self, file: &MockFile, exec_base: HostVirtAddr, name: &str) -> Result<usize> {
        Self::lookup(file, exec_base, name)
    }

    fn section_info(&self, file: &MockFile) -> Result<SectionInfo> {
        let (_, base) = self
            .link_set
            .iter()
            .find(|(linked, _)| linked.key == file.key)
            .ok_or(VmmError::FormatError)?;
        let base = base.as_usize() as u64;
        Ok(SectionInfo {
            ctors_addr: base + 0x100,
            ctors_size: 0x10,
            dtors_addr: base + 0x110,
            dtors_size: 0x10,
            eh_frame_addr: base + 0x120,
            eh_frame_size: 0x40,
        })
    }

    fn reset(&mut self) {
        self.link_set.clear();
        self.relocated = false;
    }
}

/// Physical-address width reported by [`MockVmcs::new`].
pub const MOCK_PHYS_ADDR_WIDTH: u8 = 39;

/// An in-memory VMCS whose capability MSRs allow every control setting.
pub struct MockVmcs {
    fields: HashMap<VmcsField, u64>,
    msrs: HashMap<Msr, u64>,
    width: u8,
    pages: HashMap<u64, Box<[u8; 0x1000]>>,
    failing_field: Option<VmcsField>,
}

impl MockVmcs {
    pub fn new() -> Self {
        let permissive = 0xFFFF_FFFF_0000_0000;
        let msrs = [
            (Msr::IA32_VMX_BASIC, 0),
            (Msr::IA32_VMX_PINBASED_CTLS, permissive),
            (Msr::IA32_VMX_PROCBASED_CTLS, permissive),
            (Msr::IA32_VMX_PROCBASED_CTLS2, permissive),
            (Msr::IA32_VMX_EXIT_CTLS, permissive),
            (Msr::IA32_VMX_ENTRY_CTLS, permissive),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, permissive),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, permissive),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, permissive),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, permissive),
            // UC, WB and accessed/dirty flags
            (Msr::IA32_VMX_EPT_VPID_CAP, (1 << 8) | (1 << 14) | (1 << 21)),
            (Msr::IA32_VMX_VMFUNC, 0x1),
        ];
        Self {
            fields: HashMap::new(),
            msrs: msrs.into_iter().collect(),
            width: MOCK_PHYS_ADDR_WIDTH,
            pages: HashMap::new(),
            failing_field: None,
        }
    }

    pub fn with(mut self, field: VmcsField, value: u64) -> Self {
        self.set(field, value);
        self
    }

    pub fn with_msr(mut self, msr: Msr, value: u64) -> Self {
        self.set_msr(msr, value);
        self
    }

    pub fn set(&mut self, field: VmcsField, value: u64) -> &mut Self {
        self.fields.insert(field, value);
        self
    }

    pub fn set_msr(&mut self, msr: Msr, value: u64) -> &mut Self {
        self.msrs.insert(msr, value);
        self
    }

    pub fn field(&self, field: VmcsField) -> u64 {
        self.fields.get(&field).copied().unwrap_or(0)
    }

    /// Backs the page at `paddr` with memory readable through `phys_to_virt`.
    pub fn map_page(&mut self, paddr: u64) -> &mut [u8; 0x1000] {
        self.pages
            .entry(paddr & !0xFFF)
            .or_insert_with(|| Box::new([0; 0x1000]))
    }

    pub fn fail_read(&mut self, field: VmcsField) {
        self.failing_field = Some(field);
    }
}

impl ControlSource for MockVmcs {
    fn read_field(&self, field: VmcsField) -> Result<u64> {
        if self.failing_field == Some(field) {
            return Err(VmmError::VmcsReadFailed(field));
        }
        Ok(self.field(field))
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn phys_addr_width(&self) -> u8 {
        self.width
    }

    fn phys_to_virt(&self, paddr: u64) -> Option<usize> {
        let page = self.pages.get(&(paddr & !0xFFF))?;
        Some(page.as_ptr() as usize + (paddr & 0xFFF) as usize)
    }
}
