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

//! Lifecycle control of a VMM made of one or more loaded images.

mod affinity;
mod debug_ring;
mod memory;

use spin::Mutex;

use self::affinity::AffinityGuard;
use crate::entry::{EntryPoint, ImageHandle, Scope};
use crate::loader::{ImageLinker, ImageSet, SectionInfo};
use crate::{MAX_IMAGES, Result, VmmError, VmmHal};

pub use self::debug_ring::{DEBUG_RING_SIZE, DebugRingResources};
pub use self::memory::{MemoryDescriptor, MemoryType};

/// The lifecycle state of a VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmStatus {
    /// No image set is linked; images may be added.
    Unloaded,
    /// Images are linked and initialized, no CPU runs the VMM.
    Loaded,
    /// Every CPU runs the VMM.
    Running,
    /// A teardown step failed. Only [`VmmManager::reset`] leaves this state.
    Corrupt,
}

/// Owns the images of one VMM and drives it through its lifecycle.
///
/// `N` bounds the number of images that can be added.
pub struct VmmManager<H: VmmHal, L: ImageLinker, const N: usize = MAX_IMAGES> {
    status: VmmStatus,
    images: ImageSet<H, L, N>,
    started_cpus: usize,
}

impl<H: VmmHal, L: ImageLinker, const N: usize> VmmManager<H, L, N> {
    pub const fn new(linker: L) -> Self {
        Self {
            status: VmmStatus::Unloaded,
            images: ImageSet::new(linker),
            started_cpus: 0,
        }
    }

    pub fn status(&self) -> VmmStatus {
        self.status
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// The number of CPUs the VMM has been started on.
    pub fn started_cpus(&self) -> usize {
        self.started_cpus
    }

    pub fn linker(&self) -> &L {
        self.images.linker()
    }

    /// Adds a staged image file. Only legal while [`VmmStatus::Unloaded`].
    pub fn add_image(&mut self, buffer: &'static [u8]) -> Result<ImageHandle> {
        match self.status {
            VmmStatus::Unloaded => {}
            VmmStatus::Corrupt => return Err(VmmError::VmmCorrupted),
            _ => return Err(VmmError::InvalidState),
        }
        self.images.add(buffer)
    }

    pub fn resolve_symbol(&self, name: &str, scope: Scope) -> Result<usize> {
        self.images.resolve_symbol(name, scope)
    }

    pub fn invoke(&self, entry: EntryPoint, arg1: u64, arg2: u64, scope: Scope) -> Result {
        self.images.invoke(entry, arg1, arg2, scope)
    }

    /// Links the added images, runs their constructors and hands their
    /// memory to the VMM.
    pub fn load(&mut self) -> Result {
        match self.status {
            VmmStatus::Unloaded => {}
            VmmStatus::Loaded => return Ok(()),
            VmmStatus::Running => return Err(VmmError::InvalidState),
            VmmStatus::Corrupt => return Err(VmmError::VmmCorrupted),
        }
        if self.images.is_empty() {
            return Err(VmmError::NoImagesLoaded);
        }
        self.images.alloc_stack()?;

        let mut initialized = 0;
        if let Err(err) = self.load_images(&mut initialized) {
            warn!("[VMM] load failed: {err}");
            self.rollback_load(initialized);
            return Err(err);
        }

        self.status = VmmStatus::Loaded;
        info!("[VMM] loaded {} image(s)", self.images.len());
        Ok(())
    }

    fn load_images(&mut self, initialized: &mut usize) -> Result {
        self.images.link()?;

        for index in 0..self.images.len() {
            let handle = ImageHandle(index);
            let info = self.images.section_info(handle)?;
            self.invoke_section_entry(EntryPoint::LocalInit, handle, &info)?;
            *initialized += 1;
        }

        for index in 0..self.images.len() {
            memory::register_image(&self.images, ImageHandle(index))?;
        }
        Ok(())
    }

    /// Finalizes the first `initialized` images and drops the image set.
    fn rollback_load(&mut self, initialized: usize) {
        if let Err(err) = self.fini_images(initialized) {
            warn!("[VMM] failed to unwind partial load: {err}");
            self.mark_corrupt();
            return;
        }
        self.reset();
    }

    /// Runs the destructors of the first `count` images, last one first.
    fn fini_images(&self, count: usize) -> Result {
        for index in (0..count).rev() {
            let handle = ImageHandle(index);
            let info = self.images.section_info(handle)?;
            self.invoke_section_entry(EntryPoint::LocalFini, handle, &info)?;
        }
        Ok(())
    }

    fn invoke_section_entry(&self, entry: EntryPoint, handle: ImageHandle, info: &SectionInfo) -> Result {
        self.images.invoke(
            entry,
            info as *const SectionInfo as u64,
            0,
            Scope::Image(handle),
        )
    }

    /// Runs the destructors of every image and releases them.
    pub fn unload(&mut self) -> Result {
        match self.status {
            VmmStatus::Unloaded => return Ok(()),
            VmmStatus::Loaded => {}
            VmmStatus::Running => return Err(VmmError::InvalidState),
            VmmStatus::Corrupt => return Err(VmmError::VmmCorrupted),
        }

        if let Err(err) = self.fini_images(self.images.len()) {
            self.mark_corrupt();
            return Err(err);
        }

        self.reset();
        info!("[VMM] unloaded");
        Ok(())
    }

    /// Starts the VMM on every CPU, in increasing order.
    pub fn start(&mut self) -> Result {
        match self.status {
            VmmStatus::Loaded => {}
            VmmStatus::Running => return Ok(()),
            VmmStatus::Unloaded => return Err(VmmError::InvalidState),
            VmmStatus::Corrupt => return Err(VmmError::VmmCorrupted),
        }

        for cpu in 0..H::cpu_count() {
            if let Err(err) = self.start_cpu(cpu) {
                warn!("[VMM] failed to start CPU {cpu}: {err}");
                if let Err(rollback) = self.stop_cpus() {
                    warn!("[VMM] failed to roll back start: {rollback}");
                }
                return Err(err);
            }
            self.started_cpus += 1;
        }

        self.status = VmmStatus::Running;
        info!("[VMM] started on {} CPU(s)", self.started_cpus);
        Ok(())
    }

    fn start_cpu(&self, cpu: usize) -> Result {
        let guard = AffinityGuard::<H>::pin(cpu)?;
        debug!("[VMM] starting CPU {}", guard.cpu());
        self.images
            .invoke(EntryPoint::StartVmm, cpu as u64, 0, Scope::Global)?;
        H::on_start();
        Ok(())
    }

    /// Stops the VMM on every CPU, in decreasing order.
    pub fn stop(&mut self) -> Result {
        match self.status {
            VmmStatus::Running => {}
            VmmStatus::Loaded => return Ok(()),
            VmmStatus::Unloaded => return Err(VmmError::InvalidState),
            VmmStatus::Corrupt => return Err(VmmError::VmmCorrupted),
        }
        self.stop_cpus()?;
        info!("[VMM] stopped");
        Ok(())
    }

    /// Stops every started CPU, last one first. Leaves the VMM Loaded, or
    /// Corrupt on the first failure.
    fn stop_cpus(&mut self) -> Result {
        while self.started_cpus > 0 {
            let cpu = self.started_cpus - 1;
            if let Err(err) = self.stop_cpu(cpu) {
                self.mark_corrupt();
                return Err(err);
            }
            self.started_cpus = cpu;
        }
        self.status = VmmStatus::Loaded;
        Ok(())
    }

    fn stop_cpu(&self, cpu: usize) -> Result {
        let guard = AffinityGuard::<H>::pin(cpu)?;
        debug!("[VMM] stopping CPU {}", guard.cpu());
        self.images
            .invoke(EntryPoint::StopVmm, cpu as u64, 0, Scope::Global)?;
        H::on_stop();
        Ok(())
    }

    /// The debug ring of vCPU `vcpu_id`, as published by the VMM.
    pub fn dump(&self, vcpu_id: u64) -> Result<&DebugRingResources> {
        if self.status == VmmStatus::Unloaded {
            return Err(VmmError::InvalidState);
        }

        let mut drr: *const DebugRingResources = core::ptr::null();
        self.images.invoke(
            EntryPoint::GetDebugRing,
            vcpu_id,
            &mut drr as *mut *const DebugRingResources as u64,
            Scope::Global,
        )?;

        // The ring lives in the VMM's own memory, which outlives `&self`.
        unsafe { drr.as_ref() }.ok_or(VmmError::EntryFailure {
            entry: EntryPoint::GetDebugRing,
            status: -1,
        })
    }

    /// Releases every image and the call stack regardless of the current
    /// state. This is the only way out of [`VmmStatus::Corrupt`].
    pub fn reset(&mut self) {
        self.images.release();
        self.started_cpus = 0;
        self.status = VmmStatus::Unloaded;
    }

    /// Stops and unloads the VMM, then releases it.
    ///
    /// Failures of the intermediate steps are logged; only a VMM left
    /// Corrupt is reported.
    pub fn fini(&mut self) -> Result {
        if self.status == VmmStatus::Running {
            if let Err(err) = self.stop() {
                warn!("[VMM] fini: stop failed: {err}");
            }
        }
        if self.status == VmmStatus::Loaded {
            if let Err(err) = self.unload() {
                warn!("[VMM] fini: unload failed: {err}");
            }
        }
        if self.status == VmmStatus::Corrupt {
            return Err(VmmError::VmmCorrupted);
        }
        self.reset();
        Ok(())
    }

    fn mark_corrupt(&mut self) {
        error!("[VMM] VMM is corrupt, a reset is required");
        self.status = VmmStatus::Corrupt;
    }
}

impl<H: VmmHal, L: ImageLinker, const N: usize> Drop for VmmManager<H, L, N> {
    fn drop(&mut self) {
        if let Err(err) = self.fini() {
            // CPUs may still execute from the images.
            error!("[VMM] leaking VMM memory: {err}");
            self.images.leak();
        }
    }
}

/// A [`VmmManager`] behind a lock, for drivers keeping one global VMM.
pub struct SharedVmm<H: VmmHal, L: ImageLinker, const N: usize = MAX_IMAGES> {
    inner: Mutex<VmmManager<H, L, N>>,
}

impl<H: VmmHal, L: ImageLinker, const N: usize> SharedVmm<H, L, N> {
    pub const fn new(linker: L) -> Self {
        Self {
            inner: Mutex::new(VmmManager::new(linker)),
        }
    }

    /// Runs `f` with exclusive access to the manager.
    pub fn with<R>(&self, f: impl FnOnce(&mut VmmManager<H, L, N>) -> R) -> R {
        f(&mut *self.inner.lock())
    }

    pub fn status(&self) -> VmmStatus {
        self.inner.lock().status()
    }

    pub fn add_image(&self, buffer: &'static [u8]) -> Result<ImageHandle> {
        self.inner.lock().add_image(buffer)
    }

    pub fn load(&self) -> Result {
        self.inner.lock().load()
    }

    pub fn unload(&self) -> Result {
        self.inner.lock().unload()
    }

    pub fn start(&self) -> Result {
        self.inner.lock().start()
    }

    pub fn stop(&self) -> Result {
        self.inner.lock().stop()
    }

    pub fn fini(&self) -> Result {
        self.inner.lock().fini()
    }

    pub fn reset(&self) {
        self.inner.lock().reset()
    }
}
