//! Fixed-capacity manager, 64-bit handle form. Structurally the 32-bit form's twin at double
//! width, plus the two operations only the 64-bit form exposes: `index_to_handle` (§4.7) and a
//! manual `Clone` (§4.8).

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::{
	alloc_block, block_layout, dealloc_block, gen_cell_u32, payload_cell, read_link_u64,
	write_link_u64, zero_cell,
};
use crate::error::HandlePoolError;
use crate::handle::{GenCell64, Handle64, LINK_MARKER_64, MAX_INDEX_64};
use crate::head64::{self, PackedHead64};

const LINK_WIDTH_64: usize = 8;
const GEN_CELL_SIZE: usize = 4;

/// Spin-retry ceiling before `alloc`/`release` give up and log a livelock warning (§4.2).
const FIXED_MAX_ATTEMPTS: u32 = 1_000_000;

pub struct FixedManager64 {
	element_size: usize,
	capacity: u64,
	block: NonNull<u8>,
	layout: Layout,
	head: PackedHead64,
	allocated_count: AtomicU64,
}

// Safety: same reasoning as `FixedManager32`.
unsafe impl Send for FixedManager64 {}
unsafe impl Sync for FixedManager64 {}

impl FixedManager64 {
	pub fn new(element_size: usize, total_count: u64) -> Result<Self, HandlePoolError> {
		debug_assert!(element_size >= LINK_WIDTH_64, "element_size too small for link storage");
		if element_size < LINK_WIDTH_64 {
			return Err(HandlePoolError::ElementTooSmall {
				got: element_size,
				min: LINK_WIDTH_64,
			});
		}
		debug_assert!(
			total_count <= MAX_INDEX_64 + 1,
			"total_count exceeds the 40-bit index space"
		);
		if total_count > MAX_INDEX_64 + 1 {
			return Err(HandlePoolError::CapacityExceedsIndexSpace {
				block_size: total_count as usize,
				max_blocks: 1,
				bits: 40,
			});
		}

		let layout = block_layout(total_count.max(1) as usize, element_size, GEN_CELL_SIZE);
		let block = alloc_block(layout).ok_or(HandlePoolError::OutOfMemory)?;

		for i in 0..total_count {
			// Safety: `i < total_count`, block sized for `total_count` slots.
			let cell = unsafe { payload_cell(block, i as usize, element_size) };
			let next = if i + 1 < total_count {
				(i + 1) | LINK_MARKER_64
			} else {
				0
			};
			unsafe { write_link_u64(cell, next) };
		}

		if total_count > 0 {
			let gen0 =
				unsafe { gen_cell_u32(block, total_count as usize, element_size, 0) };
			gen0.store(GenCell64::from_raw(0).with_generation(1).raw(), Ordering::Relaxed);
		}

		let free_head = if total_count > 0 { LINK_MARKER_64 } else { 0 };

		Ok(Self {
			element_size,
			capacity: total_count,
			block,
			layout,
			head: PackedHead64::new(free_head, 0),
			allocated_count: AtomicU64::new(0),
		})
	}

	fn gen_cell(&self, index: u64) -> &std::sync::atomic::AtomicU32 {
		// Safety: caller guarantees `index < capacity`.
		unsafe {
			gen_cell_u32(self.block, self.capacity as usize, self.element_size, index as usize)
		}
	}

	pub fn alloc(&self) -> Handle64 {
		let mut attempts = 0u32;
		loop {
			if attempts >= FIXED_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} alloc attempts");
				return Handle64::INVALID;
			}
			let current = self.head.load();
			let free_raw = head64::free_part(current);
			if free_raw != 0 {
				let index = free_raw & !LINK_MARKER_64;
				// Safety: `index` came from a link written by `new` or a prior `release`.
				let cell = unsafe { payload_cell(self.block, index as usize, self.element_size) };
				let next = unsafe { read_link_u64(cell) };
				match self.head.try_set_free(current, next) {
					Ok(()) => {
						unsafe { zero_cell(cell, self.element_size) };
						let gen = self.gen_cell(index);
						let raw = gen.load(Ordering::Relaxed);
						let updated = GenCell64::from_raw(raw)
							.with_flag(GenCell64::ALLOCATED, true)
							.with_flag(GenCell64::LEAKED, false);
						gen.store(updated.raw(), Ordering::Relaxed);
						self.allocated_count.fetch_add(1, Ordering::Relaxed);
						return Handle64::new(index, updated.generation());
					}
					Err(_) => {
						attempts += 1;
						std::hint::spin_loop();
						continue;
					}
				}
			}

			let deferred_raw = head64::deferred_part(current);
			if deferred_raw != 0 {
				let _ = self.head.try_set_whole(current, head64::pack(deferred_raw, 0));
				attempts += 1;
				std::hint::spin_loop();
				continue;
			}

			log::warn!("handle pool exhausted: all {} handles allocated", self.capacity);
			return Handle64::INVALID;
		}
	}

	pub fn release(&self, handle: Handle64) {
		debug_assert!(!handle.is_invalid(), "release called with the invalid handle");
		if handle.is_invalid() {
			return;
		}
		let index = handle.index();
		debug_assert!(index < self.capacity, "handle index out of range");
		if index >= self.capacity {
			return;
		}

		let gen = self.gen_cell(index);
		let raw = gen.load(Ordering::Relaxed);
		let cell = GenCell64::from_raw(raw);
		debug_assert_eq!(cell.generation(), handle.generation(), "release called with a stale handle");

		let mut new_gen = cell.generation().wrapping_add(1) & GenCell64::raw_gen_mask();
		if new_gen == 0 && index == 0 {
			new_gen = 1;
		}
		let updated = GenCell64::from_raw(0).with_generation(new_gen).with_flag(GenCell64::ALLOCATED, false);
		gen.store(updated.raw(), Ordering::Relaxed);

		let payload = unsafe { payload_cell(self.block, index as usize, self.element_size) };
		let new_link = index | LINK_MARKER_64;
		let mut attempts = 0u32;
		loop {
			if attempts >= FIXED_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} release attempts");
				return;
			}
			let current = self.head.load();
			let next = head64::deferred_part(current);
			unsafe { write_link_u64(payload, next) };
			match self.head.try_set_deferred(current, new_link) {
				Ok(()) => return,
				Err(_) => {
					attempts += 1;
					std::hint::spin_loop();
				}
			}
		}
	}

	pub fn is_valid(&self, handle: Handle64) -> bool {
		if handle.is_invalid() {
			return false;
		}
		let index = handle.index();
		if index >= self.capacity {
			return false;
		}
		GenCell64::from_raw(self.gen_cell(index).load(Ordering::Relaxed)).generation() == handle.generation()
	}

	pub fn handle_to_ptr(&self, handle: Handle64) -> Option<NonNull<u8>> {
		if !self.is_valid(handle) {
			return None;
		}
		let cell = unsafe { payload_cell(self.block, handle.index() as usize, self.element_size) };
		NonNull::new(cell)
	}

	pub fn copy_to(&self, handle: Handle64, dst: &mut [u8]) -> bool {
		debug_assert_eq!(dst.len(), self.element_size);
		match self.handle_to_ptr(handle) {
			Some(ptr) => {
				unsafe {
					std::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_mut_ptr(), self.element_size)
				};
				true
			}
			None => false,
		}
	}

	pub fn copy_from(&self, handle: Handle64, src: &[u8]) -> bool {
		debug_assert_eq!(src.len(), self.element_size);
		match self.handle_to_ptr(handle) {
			Some(ptr) => {
				unsafe {
					std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), self.element_size)
				};
				true
			}
			None => false,
		}
	}

	pub fn allocated_count(&self) -> u64 {
		self.allocated_count.load(Ordering::Relaxed)
	}

	/// Reconstructs the currently-valid handle for a raw live index, rejecting slots that are
	/// free, deferred, or leaked (§4.7).
	pub fn index_to_handle(&self, index: u64) -> Option<Handle64> {
		if index >= self.capacity {
			return None;
		}
		let cell = GenCell64::from_raw(self.gen_cell(index).load(Ordering::Relaxed));
		if cell.flag(GenCell64::ALLOCATED) && !cell.flag(GenCell64::LEAKED) {
			Some(Handle64::new(index, cell.generation()))
		} else {
			None
		}
	}
}

impl Clone for FixedManager64 {
	/// Deep copy: every handle valid in `self` is also valid in the clone at the moment of
	/// cloning (§4.8). The fixed manager has no growth mutex to take for a consistent snapshot.
	fn clone(&self) -> Self {
		let layout = self.layout;
		let block = alloc_block(layout).expect("clone: backing allocator returned null");
		unsafe {
			std::ptr::copy_nonoverlapping(self.block.as_ptr(), block.as_ptr(), layout.size());
		}
		Self {
			element_size: self.element_size,
			capacity: self.capacity,
			block,
			layout,
			head: PackedHead64::new(
				head64::free_part(self.head.load()),
				head64::deferred_part(self.head.load()),
			),
			allocated_count: AtomicU64::new(self.allocated_count.load(Ordering::Relaxed)),
		}
	}
}

impl Drop for FixedManager64 {
	fn drop(&mut self) {
		unsafe { dealloc_block(self.block, self.layout) };
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_alloc_is_index_zero_generation_one() {
		let m = FixedManager64::new(16, 16).unwrap();
		let h = m.alloc();
		assert_eq!(h.index(), 0);
		assert_eq!(h.generation(), 1);
	}

	#[test]
	fn round_trip_validity() {
		let m = FixedManager64::new(16, 4).unwrap();
		let h = m.alloc();
		assert!(m.is_valid(h));
		m.release(h);
		assert!(!m.is_valid(h));
	}

	#[test]
	fn index_to_handle_rejects_free_slots() {
		let m = FixedManager64::new(16, 4).unwrap();
		let h = m.alloc();
		assert_eq!(m.index_to_handle(h.index()), Some(h));
		m.release(h);
		assert_eq!(m.index_to_handle(h.index()), None);
	}

	#[test]
	fn clone_preserves_validity() {
		let m = FixedManager64::new(16, 4).unwrap();
		let h = m.alloc();
		let payload = [7u8; 16];
		m.copy_from(h, &payload);
		let clone = m.clone();
		assert!(clone.is_valid(h));
		let mut out = [0u8; 16];
		clone.copy_to(h, &mut out);
		assert_eq!(out, payload);
	}

	#[test]
	fn exhaustion_returns_invalid_handle() {
		let m = FixedManager64::new(16, 2).unwrap();
		for _ in 0..2 {
			assert!(!m.alloc().is_invalid());
		}
		assert!(m.alloc().is_invalid());
	}
}
