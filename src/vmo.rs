// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Shared memory objects
//!
//! The userspace driver allocates one VMO per CPU for trace data and hands
//! the kernel a reference. The perfmon core only needs two things from the
//! VM system: the object's size, and a committed read/write kernel mapping
//! while collection runs. Everything else stays in the VM subsystem behind
//! this interface.

use crate::types::Result;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

/// Reference-counted pointer to a shared object.
pub type RefPtr<T> = Arc<T>;

/// A shared memory object assignable as a per-CPU trace buffer.
pub trait VmObject: Send + Sync {
    /// Size of the object in bytes.
    fn size(&self) -> usize;

    /// Map the object read/write into the kernel address space.
    ///
    /// All pages are committed and mapped up front; the returned mapping
    /// must be usable from interrupt context without faulting.
    fn map(&self) -> Result<VmMapping>;
}

/// A live kernel mapping of a [`VmObject`]. Unmaps itself when dropped.
pub struct VmMapping {
    base: NonNull<u8>,
    size: usize,
    unmap: Option<Box<dyn FnOnce() + Send>>,
}

impl VmMapping {
    /// Wrap an established mapping. `unmap` runs exactly once, on drop.
    pub fn new(base: NonNull<u8>, size: usize, unmap: impl FnOnce() + Send + 'static) -> Self {
        Self {
            base,
            size,
            unmap: Some(Box::new(unmap)),
        }
    }

    /// Base address of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Length of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for VmMapping {
    fn drop(&mut self) {
        if let Some(unmap) = self.unmap.take() {
            unmap();
        }
    }
}

// The mapping is plain memory; the base pointer is only dereferenced by
// whichever context owns the per-CPU slot holding it.
unsafe impl Send for VmMapping {}
unsafe impl Sync for VmMapping {}
