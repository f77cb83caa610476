//! Fixed-capacity manager, 32-bit handle form. One pre-sized block, allocated once at
//! construction; alloc/release never touch the directory — there is only one block, so there is
//! nothing to decompose a handle's index against.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::block::{
	alloc_block, block_layout, dealloc_block, gen_cell_u8, payload_cell, read_link_u32,
	write_link_u32, zero_cell,
};
use crate::error::HandlePoolError;
use crate::handle::{Handle32, LINK_MARKER_32, MAX_INDEX_32};
use crate::head32::{self, PackedHead32};

const LINK_WIDTH_32: usize = 4;

/// Spin-retry ceiling before `alloc`/`release` give up and log a livelock warning (§4.2).
const FIXED_MAX_ATTEMPTS: u32 = 1_000_000;

pub struct FixedManager32 {
	element_size: usize,
	capacity: u32,
	block: NonNull<u8>,
	layout: Layout,
	head: PackedHead32,
	allocated_count: AtomicU32,
}

// Safety: `block` is heap memory reached only through the atomic `head` transaction and the
// per-slot generation cells, both of which are safe to share across threads.
unsafe impl Send for FixedManager32 {}
unsafe impl Sync for FixedManager32 {}

impl FixedManager32 {
	pub fn new(element_size: usize, total_count: u32) -> Result<Self, HandlePoolError> {
		debug_assert!(element_size >= LINK_WIDTH_32, "element_size too small for link storage");
		if element_size < LINK_WIDTH_32 {
			return Err(HandlePoolError::ElementTooSmall {
				got: element_size,
				min: LINK_WIDTH_32,
			});
		}
		debug_assert!(
			(total_count as u64) <= (MAX_INDEX_32 as u64 + 1),
			"total_count exceeds the 24-bit index space"
		);
		if (total_count as u64) > (MAX_INDEX_32 as u64 + 1) {
			return Err(HandlePoolError::CapacityExceedsIndexSpace {
				block_size: total_count as usize,
				max_blocks: 1,
				bits: 24,
			});
		}

		let layout = block_layout(total_count.max(1) as usize, element_size, 1);
		let block = alloc_block(layout).ok_or(HandlePoolError::OutOfMemory)?;

		for i in 0..total_count {
			// Safety: `i < total_count`, block sized for `total_count` slots.
			let cell = unsafe { payload_cell(block, i as usize, element_size) };
			let next = if i + 1 < total_count {
				(i + 1) | LINK_MARKER_32
			} else {
				0
			};
			unsafe { write_link_u32(cell, next) };
		}

		if total_count > 0 {
			// Index 0 is the anti-null guard: its first handle must be non-zero (§3).
			let gen0 = unsafe { gen_cell_u8(block, total_count as usize, element_size, 0) };
			gen0.store(1, Ordering::Relaxed);
		}

		let free_head = if total_count > 0 { LINK_MARKER_32 } else { 0 };

		Ok(Self {
			element_size,
			capacity: total_count,
			block,
			layout,
			head: PackedHead32::new(free_head, 0),
			allocated_count: AtomicU32::new(0),
		})
	}

	pub fn alloc(&self) -> Handle32 {
		let mut attempts = 0u32;
		loop {
			if attempts >= FIXED_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} alloc attempts");
				return Handle32::INVALID;
			}
			let current = self.head.load();
			let free_raw = head32::free_part(current);
			if free_raw != 0 {
				let index = (free_raw & !LINK_MARKER_32) as usize;
				// Safety: `index` came from a link encoded by `new` or a prior `release`, both of
				// which only ever write indices `< capacity`.
				let cell = unsafe { payload_cell(self.block, index, self.element_size) };
				let next = unsafe { read_link_u32(cell) };
				match self.head.try_set_free(current, next) {
					Ok(()) => {
						unsafe { zero_cell(cell, self.element_size) };
						let gen = unsafe {
							gen_cell_u8(self.block, self.capacity as usize, self.element_size, index)
						};
						let generation = gen.load(Ordering::Relaxed);
						self.allocated_count.fetch_add(1, Ordering::Relaxed);
						return Handle32::new(index as u32, generation);
					}
					Err(_) => {
						attempts += 1;
						std::hint::spin_loop();
						continue;
					}
				}
			}

			let deferred_raw = head32::deferred_part(current);
			if deferred_raw != 0 {
				let _ = self.head.try_set_whole(current, head32::pack(deferred_raw, 0));
				attempts += 1;
				std::hint::spin_loop();
				continue;
			}

			log::warn!("handle pool exhausted: all {} handles allocated", self.capacity);
			return Handle32::INVALID;
		}
	}

	pub fn release(&self, handle: Handle32) {
		debug_assert!(!handle.is_invalid(), "release called with the invalid handle");
		if handle.is_invalid() {
			return;
		}
		let index = handle.index() as usize;
		debug_assert!(index < self.capacity as usize, "handle index out of range");
		if index >= self.capacity as usize {
			return;
		}

		let gen = unsafe {
			gen_cell_u8(self.block, self.capacity as usize, self.element_size, index)
		};
		debug_assert_eq!(
			gen.load(Ordering::Relaxed),
			handle.generation(),
			"release called with a stale handle"
		);

		let mut new_gen = gen.load(Ordering::Relaxed).wrapping_add(1);
		if new_gen == 0 && index == 0 {
			new_gen = 1;
		}
		gen.store(new_gen, Ordering::Relaxed);

		let cell = unsafe { payload_cell(self.block, index, self.element_size) };
		let new_link = (index as u32) | LINK_MARKER_32;
		let mut attempts = 0u32;
		loop {
			if attempts >= FIXED_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} release attempts");
				return;
			}
			let current = self.head.load();
			let next = head32::deferred_part(current);
			unsafe { write_link_u32(cell, next) };
			match self.head.try_set_deferred(current, new_link) {
				Ok(()) => return,
				Err(_) => {
					attempts += 1;
					std::hint::spin_loop();
				}
			}
		}
	}

	pub fn is_valid(&self, handle: Handle32) -> bool {
		if handle.is_invalid() {
			return false;
		}
		let index = handle.index() as usize;
		if index >= self.capacity as usize {
			return false;
		}
		let gen = unsafe {
			gen_cell_u8(self.block, self.capacity as usize, self.element_size, index)
		};
		gen.load(Ordering::Relaxed) == handle.generation()
	}

	pub fn handle_to_ptr(&self, handle: Handle32) -> Option<NonNull<u8>> {
		if !self.is_valid(handle) {
			return None;
		}
		let index = handle.index() as usize;
		let cell = unsafe { payload_cell(self.block, index, self.element_size) };
		NonNull::new(cell)
	}

	pub fn copy_to(&self, handle: Handle32, dst: &mut [u8]) -> bool {
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

	pub fn copy_from(&self, handle: Handle32, src: &[u8]) -> bool {
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

	pub fn allocated_count(&self) -> u32 {
		self.allocated_count.load(Ordering::Relaxed)
	}
}

impl Drop for FixedManager32 {
	fn drop(&mut self) {
		unsafe { dealloc_block(self.block, self.layout) };
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_alloc_is_index_zero_generation_one() {
		let m = FixedManager32::new(8, 16).unwrap();
		let h = m.alloc();
		assert_eq!(h.index(), 0);
		assert_eq!(h.generation(), 1);
	}

	#[test]
	fn release_then_alloc_reuses_index_with_bumped_generation() {
		let m = FixedManager32::new(8, 16).unwrap();
		let h0 = m.alloc();
		m.release(h0);
		let h1 = m.alloc();
		assert_eq!(h1.index(), 1);
		assert_eq!(h1.generation(), 0);
	}

	#[test]
	fn round_trip_validity() {
		let m = FixedManager32::new(8, 4).unwrap();
		let h = m.alloc();
		assert!(m.is_valid(h));
		m.release(h);
		assert!(!m.is_valid(h));
	}

	#[test]
	fn exhaustion_returns_invalid_handle() {
		let m = FixedManager32::new(8, 4).unwrap();
		for _ in 0..4 {
			assert!(!m.alloc().is_invalid());
		}
		assert!(m.alloc().is_invalid());
	}

	#[test]
	fn zero_on_alloc() {
		let m = FixedManager32::new(8, 4).unwrap();
		let h = m.alloc();
		let mut buf = [0xAAu8; 8];
		assert!(m.copy_to(h, &mut buf));
		assert_eq!(buf, [0u8; 8]);
	}

	#[test]
	fn copy_to_and_from_round_trip_payload() {
		let m = FixedManager32::new(8, 4).unwrap();
		let h = m.alloc();
		let payload = [1, 2, 3, 4, 5, 6, 7, 8];
		assert!(m.copy_from(h, &payload));
		let mut out = [0u8; 8];
		assert!(m.copy_to(h, &mut out));
		assert_eq!(out, payload);
	}

	#[test]
	fn element_too_small_is_rejected() {
		let err = FixedManager32::new(2, 4).unwrap_err();
		assert_eq!(
			err,
			HandlePoolError::ElementTooSmall { got: 2, min: LINK_WIDTH_32 }
		);
	}

	#[test]
	fn invalid_handle_is_never_valid() {
		let m = FixedManager32::new(8, 4).unwrap();
		assert!(!m.is_valid(Handle32::INVALID));
	}
}
