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

use core::marker::PhantomData;

use crate::{Result, VmmHal};

/// Keeps the calling context pinned to one CPU; the previous affinity is
/// restored when the guard is dropped.
pub(crate) struct AffinityGuard<H: VmmHal> {
    cpu: usize,
    prior: usize,
    _marker: PhantomData<H>,
}

impl<H: VmmHal> AffinityGuard<H> {
    pub fn pin(cpu: usize) -> Result<Self> {
        let prior = H::set_affinity(cpu).inspect_err(|err| {
            warn!("[VMM] failed to set affinity to CPU {cpu}: {err}");
        })?;
        Ok(Self {
            cpu,
            prior,
            _marker: PhantomData,
        })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl<H: VmmHal> Drop for AffinityGuard<H> {
    fn drop(&mut self) {
        H::restore_affinity(self.prior);
    }
}
