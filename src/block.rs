//! Slot blocks and the block directory. A block is `N` payload cells followed by `N` generation
//! cells, one contiguous allocation; the directory is a fixed-capacity array of atomic pointers
//! to published blocks. Directory slots are write-once (monotonicity invariant in §3).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};

/// malloc-like alignment guarantee for block storage: wide enough for any primitive the free-list
/// link encoding reinterprets a payload cell's first bytes as (`u32` for the 32-bit form, `u64`
/// for the 64-bit form), and generous enough for typical caller payloads without needing to know
/// their real alignment requirement up front.
const BLOCK_ALIGN: usize = 16;

/// Offset of the generation area within a block: the payload area rounded up to a 4-byte boundary
/// so that `gen_cell_u32`'s `AtomicU32::from_ptr` is always properly aligned, regardless of
/// whether `element_size` itself is a multiple of 4.
#[inline]
fn gen_area_offset(block_len: usize, element_size: usize) -> usize {
	let payload_bytes = block_len * element_size;
	(payload_bytes + 3) & !3
}

/// Computes the `Layout` for a block of `block_len` slots whose payload cell is `element_size`
/// bytes and whose generation cell is `gen_size` bytes. Payload area first, generation area
/// trailing, matching `src/hande64.c`'s `blockSize` computation.
pub(crate) fn block_layout(block_len: usize, element_size: usize, gen_size: usize) -> Layout {
	let gen_bytes = block_len * gen_size;
	Layout::from_size_align(gen_area_offset(block_len, element_size) + gen_bytes, BLOCK_ALIGN)
		.expect("block layout overflowed isize::MAX")
}

/// Allocates and zeroes a block. Returns `None` if the allocator returns null (§4.3 "backing
/// memory exhausted").
pub(crate) fn alloc_block(layout: Layout) -> Option<NonNull<u8>> {
	debug_assert!(layout.size() > 0);
	// Safety: layout has non-zero size, checked above.
	let ptr = unsafe { alloc_zeroed(layout) };
	NonNull::new(ptr)
}

/// Frees a block previously returned by `alloc_block` with the same layout.
///
/// # Safety
/// `ptr` must have been produced by `alloc_block(layout)` and not freed already.
pub(crate) unsafe fn dealloc_block(ptr: NonNull<u8>, layout: Layout) {
	dealloc(ptr.as_ptr(), layout);
}

/// A fixed-capacity array of atomic block pointers. Capacity is chosen at construction
/// (`max_blocks`) and never changes; individual entries move from null to non-null exactly once.
pub(crate) struct Directory {
	slots: Box<[AtomicPtr<u8>]>,
}

impl Directory {
	pub(crate) fn new(max_blocks: usize) -> Self {
		let mut slots = Vec::with_capacity(max_blocks);
		slots.resize_with(max_blocks, || AtomicPtr::new(std::ptr::null_mut()));
		Self {
			slots: slots.into_boxed_slice(),
		}
	}

	pub(crate) fn capacity(&self) -> usize {
		self.slots.len()
	}

	/// Loads the block pointer for `block_index`, if published. Uses `Acquire` ordering so a
	/// thread that observes a non-null pointer also observes the zeroed/initialized block memory
	/// written by the publisher before its `Release` store in `publish`.
	pub(crate) fn get(&self, block_index: usize) -> Option<NonNull<u8>> {
		let raw = self.slots[block_index].load(Ordering::Acquire);
		NonNull::new(raw)
	}

	/// Publishes a freshly allocated block at `block_index`. Every block is initialized fully
	/// before this call, so `Release` ordering is sufficient to make it visible to `get`'s
	/// `Acquire` load on any other thread.
	///
	/// # Safety
	/// Must be called at most once per `block_index`; violating this breaks the directory
	/// monotonicity invariant and would leak the previously published block.
	pub(crate) fn publish(&self, block_index: usize, ptr: NonNull<u8>) {
		debug_assert!(
			self.slots[block_index].load(Ordering::Relaxed).is_null(),
			"directory slot {block_index} published twice",
		);
		self.slots[block_index].store(ptr.as_ptr(), Ordering::Release);
	}

	/// Iterates over every currently-published block pointer, for use during teardown.
	pub(crate) fn published(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
		self.slots
			.iter()
			.filter_map(|slot| NonNull::new(slot.load(Ordering::Relaxed)))
	}
}

/// Address of payload cell `index` within a block whose payload cells are `element_size` bytes.
#[inline]
pub(crate) unsafe fn payload_cell(block: NonNull<u8>, index: usize, element_size: usize) -> *mut u8 {
	block.as_ptr().add(index * element_size)
}

/// Address of the generation area for a block of `block_len` slots with `element_size`-byte
/// payload cells, i.e. where the trailing generation area begins.
#[inline]
pub(crate) unsafe fn gen_area(block: NonNull<u8>, block_len: usize, element_size: usize) -> *mut u8 {
	block.as_ptr().add(gen_area_offset(block_len, element_size))
}

/// Reads a free/deferred-list "next" link out of a free slot's payload cell. The cell is reused
/// as storage for the link while the slot is not allocated (§9 "Pointer-inside-free-slot chain").
/// Goes through `bytemuck` rather than a raw unaligned pointer cast, since the cell's address has
/// no alignment guarantee beyond `BLOCK_ALIGN` and the caller-chosen `element_size` stride.
#[inline]
pub(crate) unsafe fn read_link_u32(cell: *const u8) -> u32 {
	let bytes = std::slice::from_raw_parts(cell, 4);
	bytemuck::pod_read_unaligned(bytes)
}

#[inline]
pub(crate) unsafe fn write_link_u32(cell: *mut u8, value: u32) {
	std::ptr::copy_nonoverlapping(bytemuck::bytes_of(&value).as_ptr(), cell, 4);
}

#[inline]
pub(crate) unsafe fn read_link_u64(cell: *const u8) -> u64 {
	let bytes = std::slice::from_raw_parts(cell, 8);
	bytemuck::pod_read_unaligned(bytes)
}

#[inline]
pub(crate) unsafe fn write_link_u64(cell: *mut u8, value: u64) {
	std::ptr::copy_nonoverlapping(bytemuck::bytes_of(&value).as_ptr(), cell, 8);
}

/// Zeroes a payload cell, giving a freshly allocated slot the "zero-on-alloc" guarantee (§8,
/// property 7).
#[inline]
pub(crate) unsafe fn zero_cell(cell: *mut u8, element_size: usize) {
	std::ptr::write_bytes(cell, 0, element_size);
}

/// Borrows generation cell `index` of a block (32-bit form: one byte per slot) as an atomic.
/// Concurrent release-side increments race benignly against validity-check reads; modelling the
/// cell as `AtomicU8` rather than a plain byte makes that race well-defined instead of undefined
/// behavior, at `Relaxed` cost only.
///
/// # Safety
/// `block` must have been allocated with `block_layout(block_len, element_size, 1)` and `index`
/// must be `< block_len`. The returned reference must not outlive the block.
#[inline]
pub(crate) unsafe fn gen_cell_u8<'a>(
	block: NonNull<u8>,
	block_len: usize,
	element_size: usize,
	index: usize,
) -> &'a AtomicU8 {
	let base = gen_area(block, block_len, element_size).add(index);
	AtomicU8::from_ptr(base)
}

/// Borrows generation cell `index` of a block (64-bit form: one `u32`-wide `GenCell64` per slot)
/// as an atomic. See `gen_cell_u8` for the reasoning.
///
/// # Safety
/// `block` must have been allocated with `block_layout(block_len, element_size, 4)`, `index` must
/// be `< block_len`, and `gen_area(..)` must be 4-byte aligned (guaranteed by `BLOCK_ALIGN`). The
/// returned reference must not outlive the block.
#[inline]
pub(crate) unsafe fn gen_cell_u32<'a>(
	block: NonNull<u8>,
	block_len: usize,
	element_size: usize,
	index: usize,
) -> &'a AtomicU32 {
	let base = gen_area(block, block_len, element_size).add(index * 4);
	AtomicU32::from_ptr(base as *mut u32)
}
