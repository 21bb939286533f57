/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Shared memory accounting for buffer-producing stages.
//!
//! All buffer factories allocate through a [`MemoryAllocator`], a shared
//! capability that tracks per-caller usage against a fixed byte budget.
//! Allocation itself is mutually exclusive; the returned
//! [`AllocationLease`] releases its bytes when dropped, so a buffer that
//! owns a lease pays for its backing region exactly as long as it lives.

use anyhow::{ensure, Result};
use std::sync::{Arc, Mutex};

/// Identifies a registered caller for per-caller accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(usize);

#[derive(Debug)]
struct Accounting {
    used: u64,
    per_caller: Vec<(String, u64)>,
}

/// A shared allocation budget with per-caller accounting.
#[derive(Debug)]
pub struct MemoryAllocator {
    capacity: u64,
    accounting: Mutex<Accounting>,
}

impl MemoryAllocator {
    /// Creates an allocator with the given byte budget.
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(MemoryAllocator {
            capacity,
            accounting: Mutex::new(Accounting {
                used: 0,
                per_caller: Vec::new(),
            }),
        })
    }

    /// The total byte budget of this allocator.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently leased.
    pub fn used(&self) -> u64 {
        self.accounting.lock().unwrap().used
    }

    /// Registers a caller by name and returns its accounting id.
    pub fn register_caller(self: &Arc<Self>, name: impl Into<String>) -> CallerId {
        let mut accounting = self.accounting.lock().unwrap();
        accounting.per_caller.push((name.into(), 0));
        CallerId(accounting.per_caller.len() - 1)
    }

    /// Leases `bytes` from the budget on behalf of `caller`.
    ///
    /// Fails when the lease would exceed the allocator's capacity; running
    /// past the budget is a deadlock in the making, not a condition to wait
    /// out.
    pub fn allocate(self: &Arc<Self>, caller: CallerId, bytes: u64) -> Result<AllocationLease> {
        let mut accounting = self.accounting.lock().unwrap();
        ensure!(
            accounting.used + bytes <= self.capacity,
            "allocation of {} bytes for caller {} would exceed the {} byte budget ({} in use)",
            bytes,
            accounting.per_caller[caller.0].0,
            self.capacity,
            accounting.used
        );
        accounting.used += bytes;
        accounting.per_caller[caller.0].1 += bytes;
        Ok(AllocationLease {
            allocator: Arc::clone(self),
            caller,
            bytes,
        })
    }

    /// Bytes currently leased by a single caller.
    pub fn used_by(&self, caller: CallerId) -> u64 {
        self.accounting.lock().unwrap().per_caller[caller.0].1
    }

    fn release(&self, caller: CallerId, bytes: u64) {
        let mut accounting = self.accounting.lock().unwrap();
        accounting.used -= bytes;
        accounting.per_caller[caller.0].1 -= bytes;
    }
}

/// A transferable claim on allocator budget, released on drop.
#[derive(Debug)]
pub struct AllocationLease {
    allocator: Arc<MemoryAllocator>,
    caller: CallerId,
    bytes: u64,
}

impl AllocationLease {
    /// The number of bytes this lease claims.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for AllocationLease {
    fn drop(&mut self) {
        self.allocator.release(self.caller, self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_accounting() -> Result<()> {
        let allocator = MemoryAllocator::new(1000);
        let reader = allocator.register_caller("reader");
        let sorter = allocator.register_caller("sorter");

        let lease = allocator.allocate(reader, 600)?;
        assert_eq!(allocator.used(), 600);
        assert_eq!(allocator.used_by(reader), 600);
        assert_eq!(allocator.used_by(sorter), 0);

        assert!(allocator.allocate(sorter, 500).is_err());
        let small = allocator.allocate(sorter, 400)?;
        assert_eq!(allocator.used(), 1000);

        drop(lease);
        assert_eq!(allocator.used(), 400);
        drop(small);
        assert_eq!(allocator.used(), 0);
        Ok(())
    }
}
