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

use alloc::vec::Vec;

/// Size of the character buffer of a debug ring.
pub const DEBUG_RING_SIZE: usize = 0x7FF0;

/// The debug ring a vCPU of the VMM writes its log to.
///
/// `spos` and `epos` are free-running byte counters; the live contents are the
/// last `epos - spos` bytes written, at most [`DEBUG_RING_SIZE`].
#[repr(C)]
pub struct DebugRingResources {
    pub spos: u64,
    pub epos: u64,
    pub buf: [u8; DEBUG_RING_SIZE],
}

impl DebugRingResources {
    pub const fn new() -> Self {
        Self {
            spos: 0,
            epos: 0,
            buf: [0; DEBUG_RING_SIZE],
        }
    }

    /// The number of readable bytes.
    pub fn len(&self) -> usize {
        let len = self.epos.saturating_sub(self.spos);
        (len as usize).min(DEBUG_RING_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the readable contents out of the ring, oldest byte first.
    pub fn read(&self) -> Vec<u8> {
        let len = self.len();
        let start = (self.epos as usize).wrapping_sub(len);
        (0..len)
            .map(|i| self.buf[start.wrapping_add(i) % DEBUG_RING_SIZE])
            .collect()
    }

    /// Appends `bytes` to the ring, dropping the oldest contents when full.
    pub fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.buf[self.epos as usize % DEBUG_RING_SIZE] = *byte;
            self.epos += 1;
        }
        let len = self.epos - self.spos;
        if len > DEBUG_RING_SIZE as u64 {
            self.spos = self.epos - DEBUG_RING_SIZE as u64;
        }
    }
}

impl Default for DebugRingResources {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DebugRingResources {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DebugRingResources")
            .field("spos", &self.spos)
            .field("epos", &self.epos)
            .finish_non_exhaustive()
    }
}
