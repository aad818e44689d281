// Copyright 2025-2026 CEMAXECUTER LLC

//! Slab storage backing both receive pipelines: a pool of equally sized,
//! alignment-padded byte slabs carved from one contiguous allocation, and
//! the complex-sample banks behind each stream's double buffer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use num_complex::Complex32;

/// Fixed pool of `num_slabs` byte regions of `slab_size` bytes each.
/// Slab base addresses are mutually padded to the pool alignment.  Created
/// once, addressed by index, never reallocated.
pub struct AlignedPool {
    mem: NonNull<u8>,
    layout: Layout,
    padded: usize,
    slab_size: usize,
    num_slabs: usize,
}

impl AlignedPool {
    pub const DEFAULT_ALIGNMENT: usize = 16;

    pub fn new(num_slabs: usize, slab_size: usize) -> Result<Self, String> {
        Self::with_alignment(num_slabs, slab_size, Self::DEFAULT_ALIGNMENT)
    }

    pub fn with_alignment(
        num_slabs: usize,
        slab_size: usize,
        alignment: usize,
    ) -> Result<Self, String> {
        if num_slabs == 0 || slab_size == 0 {
            return Err("slab pool requires non-zero count and size".to_string());
        }
        if !alignment.is_power_of_two() {
            return Err(format!("alignment {} is not a power of two", alignment));
        }
        let padded = slab_size
            .checked_next_multiple_of(alignment)
            .ok_or_else(|| format!("slab size {} overflows alignment padding", slab_size))?;
        let total = padded
            .checked_mul(num_slabs)
            .ok_or_else(|| format!("slab pool of {}x{} overflows", num_slabs, padded))?;
        let layout = Layout::from_size_align(total, alignment)
            .map_err(|e| format!("slab pool layout: {}", e))?;
        let mem = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or_else(|| format!("failed to allocate {} bytes for slab pool", total))?;
        Ok(Self {
            mem,
            layout,
            padded,
            slab_size,
            num_slabs,
        })
    }

    pub fn len(&self) -> usize {
        self.num_slabs
    }

    pub fn is_empty(&self) -> bool {
        self.num_slabs == 0
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn at(&self, index: usize) -> &[u8] {
        assert!(index < self.num_slabs, "slab index {} out of range", index);
        unsafe {
            std::slice::from_raw_parts(self.mem.as_ptr().add(index * self.padded), self.slab_size)
        }
    }

    pub fn at_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.num_slabs, "slab index {} out of range", index);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.mem.as_ptr().add(index * self.padded),
                self.slab_size,
            )
        }
    }
}

impl Drop for AlignedPool {
    fn drop(&mut self) {
        unsafe { dealloc(self.mem.as_ptr(), self.layout) }
    }
}

// The pool is a plain allocation; all slab access goes through &/&mut self.
unsafe impl Send for AlignedPool {}
unsafe impl Sync for AlignedPool {}

/// One half of a stream's double buffer: a fixed run of complex samples.
///
/// Decode workers write disjoint, orchestrator-reserved ranges of the
/// active half while the consumer reads the other half, so access is by
/// raw range rather than `&mut self`.  Range reservation is the
/// orchestrator's job; this type only carries the storage.
pub struct SampleBank {
    mem: NonNull<Complex32>,
    layout: Layout,
    len: usize,
}

impl SampleBank {
    /// Cache-line alignment for the sample runs.
    const ALIGNMENT: usize = 64;

    pub fn new(len: usize) -> Result<Self, String> {
        if len == 0 {
            return Err("sample bank requires non-zero capacity".to_string());
        }
        let bytes = len
            .checked_mul(std::mem::size_of::<Complex32>())
            .ok_or_else(|| format!("sample bank of {} samples overflows", len))?;
        let layout = Layout::from_size_align(bytes, Self::ALIGNMENT)
            .map_err(|e| format!("sample bank layout: {}", e))?;
        let mem = NonNull::new(unsafe { alloc_zeroed(layout) } as *mut Complex32)
            .ok_or_else(|| format!("failed to allocate {} bytes for sample bank", bytes))?;
        Ok(Self { mem, layout, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mutable view of `start..start + len`.
    ///
    /// # Safety
    ///
    /// The caller must be the only accessor of that range for the life of
    /// the returned slice.  The pipeline guarantees this by reserving
    /// non-overlapping ranges of the active half for the decode workers
    /// and quiescing them before any flip.
    pub unsafe fn range_mut(&self, start: usize, len: usize) -> &mut [Complex32] {
        assert!(
            start <= self.len && len <= self.len - start,
            "bank range {}+{} out of {}",
            start,
            len,
            self.len
        );
        std::slice::from_raw_parts_mut(self.mem.as_ptr().add(start), len)
    }

    /// Shared view of `start..start + len`.
    ///
    /// # Safety
    ///
    /// No writer may touch the range while the returned slice is live.
    /// The consumer only reads the inactive half between flips, which the
    /// flip protocol keeps writer-free.
    pub unsafe fn range(&self, start: usize, len: usize) -> &[Complex32] {
        assert!(
            start <= self.len && len <= self.len - start,
            "bank range {}+{} out of {}",
            start,
            len,
            self.len
        );
        std::slice::from_raw_parts(self.mem.as_ptr().add(start), len)
    }
}

impl Drop for SampleBank {
    fn drop(&mut self) {
        unsafe { dealloc(self.mem.as_ptr() as *mut u8, self.layout) }
    }
}

unsafe impl Send for SampleBank {}
unsafe impl Sync for SampleBank {}
