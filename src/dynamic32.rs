//! Growable manager, 32-bit handle form. A directory of power-of-two blocks grown on demand; the
//! hot alloc/release path is the same lock-free packed-head transaction as `fixed32`, with a
//! `parking_lot::Mutex`-guarded slow path that serializes growers (§4.3) and meters recycling
//! through the deferred/delayed tiers (§4.3a).

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::block::{
	alloc_block, block_layout, gen_cell_u8, payload_cell, read_link_u32, write_link_u32,
	zero_cell, Directory,
};
use crate::error::HandlePoolError;
use crate::handle::{Handle32, LINK_MARKER_32, MAX_INDEX_32};
use crate::head32::{self, PackedHead32};

const LINK_WIDTH_32: usize = 4;
const DEFAULT_DEFERRED_FLUSH_THRESHOLD: u32 = 2;
const DEFAULT_DELAYED_FLUSH_THRESHOLD: u32 = 100;

/// Spin-retry ceiling before `alloc`/`release` give up and log a livelock warning (§4.2).
const DYNAMIC_MAX_ATTEMPTS: u32 = 1000;

pub struct DynamicManager32 {
	element_size: usize,
	block_len: u32,
	shift: u32,
	mask: u32,
	max_blocks: usize,
	never_reissue: bool,
	layout: Layout,
	directory: Directory,
	head: PackedHead32,
	delayed_head: AtomicU32,
	next_block_index: AtomicUsize,
	allocated_count: AtomicU32,
	growth_lock: Mutex<()>,
	deferred_flush_threshold: AtomicU32,
	delayed_flush_threshold: AtomicU32,
	blocks_grown_since_deferred_flush: AtomicU32,
	delayed_flush_since: AtomicU32,
}

// Safety: directory slots and the packed head are the only shared mutable state, both accessed
// through atomics; `growth_lock` serializes the slow path.
unsafe impl Send for DynamicManager32 {}
unsafe impl Sync for DynamicManager32 {}

impl DynamicManager32 {
	pub fn new(
		element_size: usize,
		block_size: u32,
		max_blocks: usize,
		never_reissue: bool,
	) -> Result<Self, HandlePoolError> {
		if element_size < LINK_WIDTH_32 {
			return Err(HandlePoolError::ElementTooSmall {
				got: element_size,
				min: LINK_WIDTH_32,
			});
		}
		let block_len = block_size.max(1).next_power_of_two();
		let index_space = MAX_INDEX_32 as u64 + 1;
		if (block_len as u64) * (max_blocks as u64) > index_space {
			return Err(HandlePoolError::CapacityExceedsIndexSpace {
				block_size: block_len as usize,
				max_blocks,
				bits: 24,
			});
		}

		let layout = block_layout(block_len as usize, element_size, 1);
		let directory = Directory::new(max_blocks);

		let manager = Self {
			element_size,
			block_len,
			shift: block_len.trailing_zeros(),
			mask: block_len - 1,
			max_blocks,
			never_reissue,
			layout,
			directory,
			head: PackedHead32::new(0, 0),
			delayed_head: AtomicU32::new(0),
			next_block_index: AtomicUsize::new(0),
			allocated_count: AtomicU32::new(0),
			growth_lock: Mutex::new(()),
			deferred_flush_threshold: AtomicU32::new(DEFAULT_DEFERRED_FLUSH_THRESHOLD),
			delayed_flush_threshold: AtomicU32::new(DEFAULT_DELAYED_FLUSH_THRESHOLD),
			blocks_grown_since_deferred_flush: AtomicU32::new(0),
			delayed_flush_since: AtomicU32::new(0),
		};

		// First block allocated through the ordinary growth path rather than a header-trailing
		// inline allocation (§9 "Inline first block").
		let guard = manager.growth_lock.lock();
		if !manager.grow_new_block(&guard) {
			return Err(HandlePoolError::OutOfMemory);
		}
		drop(guard);

		if manager.block_len > 0 {
			let block = manager.directory.get(0).expect("first block just published");
			let gen0 = unsafe {
				gen_cell_u8(block, manager.block_len as usize, manager.element_size, 0)
			};
			gen0.store(1, Ordering::Relaxed);
		}

		Ok(manager)
	}

	fn locate(&self, index: u32) -> Option<(NonNull<u8>, usize)> {
		let block_index = (index >> self.shift) as usize;
		let intra = (index & self.mask) as usize;
		self.directory.get(block_index).map(|block| (block, intra))
	}

	pub fn set_deferred_flush_threshold(&self, n: u32) {
		self.deferred_flush_threshold.store(n, Ordering::Relaxed);
	}

	pub fn set_delayed_flush_threshold(&self, n: u32) {
		self.delayed_flush_threshold.store(n, Ordering::Relaxed);
	}

	pub fn lock_for_pointer_stability(&self) -> PointerStabilityGuard<'_> {
		PointerStabilityGuard {
			_guard: self.growth_lock.lock(),
		}
	}

	pub fn alloc(&self) -> Handle32 {
		let mut attempts = 0u32;
		loop {
			if attempts >= DYNAMIC_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} alloc attempts");
				return Handle32::INVALID;
			}
			let current = self.head.load();
			let free_raw = head32::free_part(current);
			if free_raw != 0 {
				let index = free_raw & !LINK_MARKER_32;
				let Some((block, intra)) = self.locate(index) else {
					attempts += 1;
					continue;
				};
				let cell = unsafe { payload_cell(block, intra, self.element_size) };
				let next = unsafe { read_link_u32(cell) };
				match self.head.try_set_free(current, next) {
					Ok(()) => {
						unsafe { zero_cell(cell, self.element_size) };
						let gen = unsafe {
							gen_cell_u8(block, self.block_len as usize, self.element_size, intra)
						};
						let generation = gen.load(Ordering::Relaxed);
						self.allocated_count.fetch_add(1, Ordering::Relaxed);
						return Handle32::new(index, generation);
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

			// Both halves empty: take the growth slow path (§4.3 / §4.3a).
			let guard = self.growth_lock.lock();
			if !self.grow_or_recycle(&guard) {
				drop(guard);
				log::warn!(
					"handle pool exhausted: reached max_blocks={} at block_size={}",
					self.max_blocks,
					self.block_len
				);
				return Handle32::INVALID;
			}
			drop(guard);
			attempts += 1;
		}
	}

	/// Growth slow path, called with `growth_lock` held. Tries the cheaper recycling strategies
	/// before growing a new block (§4.3a); returns `false` only when growth is genuinely refused.
	fn grow_or_recycle(&self, guard: &MutexGuard<'_, ()>) -> bool {
		let current = self.head.load();
		if head32::free_part(current) != 0 || head32::deferred_part(current) != 0 {
			// Another thread already fixed this while we waited for the lock.
			return true;
		}

		let at_capacity = self.next_block_index.load(Ordering::Relaxed) >= self.max_blocks;
		let flush_due = self.blocks_grown_since_deferred_flush.load(Ordering::Relaxed)
			>= self.deferred_flush_threshold.load(Ordering::Relaxed);
		// Past the growth threshold, or growth is no longer possible at all: drain delayed
		// rather than report exhaustion while slots are merely parked in the delayed tier.
		if flush_due || at_capacity {
			let delayed = self.delayed_head.swap(0, Ordering::Relaxed);
			if delayed != 0 {
				// We own this chain exclusively after the swap, so its interior links are
				// stable; walk to the tail once, then splice the whole chain onto whatever the
				// deferred half currently is instead of discarding a concurrently-pushed
				// deferred chain (§4.3a).
				let mut tail_index = delayed & !LINK_MARKER_32;
				loop {
					let Some((block, intra)) = self.locate(tail_index) else { break };
					let next = unsafe { read_link_u32(payload_cell(block, intra, self.element_size)) };
					if next == 0 {
						break;
					}
					tail_index = next & !LINK_MARKER_32;
				}
				if let Some((tail_block, tail_intra)) = self.locate(tail_index) {
					let tail_cell = unsafe { payload_cell(tail_block, tail_intra, self.element_size) };
					loop {
						let current = self.head.load();
						let prev_deferred = head32::deferred_part(current);
						unsafe { write_link_u32(tail_cell, prev_deferred) };
						if self.head.try_set_deferred(current, delayed).is_ok() {
							break;
						}
					}
				}
				self.blocks_grown_since_deferred_flush.store(0, Ordering::Relaxed);
				self.delayed_flush_since.store(0, Ordering::Relaxed);
				return true;
			}
		}

		self.grow_new_block(guard)
	}

	/// Allocates and publishes one new block, splicing its slots onto the free half. Called with
	/// `growth_lock` held (either from construction or from `grow_or_recycle`).
	fn grow_new_block(&self, _guard: &MutexGuard<'_, ()>) -> bool {
		let block_index = self.next_block_index.load(Ordering::Relaxed);
		if block_index >= self.max_blocks {
			return false;
		}
		let base_index = block_index as u64 * self.block_len as u64;
		if base_index + self.block_len as u64 > MAX_INDEX_32 as u64 + 1 {
			log::warn!("allocated all {} handles", MAX_INDEX_32 as u64 + 1);
			return false;
		}

		let block = match alloc_block(self.layout) {
			Some(block) => block,
			None => {
				log::warn!("out of memory growing handle pool");
				return false;
			}
		};

		let base_index = base_index as u32;
		for i in 0..self.block_len {
			// Safety: `i < block_len`, block sized for `block_len` slots.
			let cell = unsafe { payload_cell(block, i as usize, self.element_size) };
			let next = if i + 1 < self.block_len {
				(base_index + i + 1) | LINK_MARKER_32
			} else {
				0
			};
			unsafe { write_link_u32(cell, next) };
		}

		self.directory.publish(block_index, block);
		self.next_block_index.store(block_index + 1, Ordering::Relaxed);
		self.blocks_grown_since_deferred_flush.fetch_add(1, Ordering::Relaxed);
		self.delayed_flush_since.fetch_add(1, Ordering::Relaxed);

		// Chain the new block's tail onto whatever the free head currently is (§4.3), so slots
		// racily released by other threads in the meantime aren't dropped on the floor.
		loop {
			let current = self.head.load();
			let prev_free = head32::free_part(current);
			let last_cell = unsafe {
				payload_cell(block, (self.block_len - 1) as usize, self.element_size)
			};
			unsafe { write_link_u32(last_cell, prev_free) };
			let new_free = base_index | LINK_MARKER_32;
			if self.head.try_set_free(current, new_free).is_ok() {
				return true;
			}
		}
	}

	pub fn release(&self, handle: Handle32) {
		debug_assert!(!handle.is_invalid(), "release called with the invalid handle");
		if handle.is_invalid() {
			return;
		}
		let index = handle.index();
		let Some((block, intra)) = self.locate(index) else {
			debug_assert!(false, "release called with an out-of-range handle");
			return;
		};

		let gen = unsafe {
			gen_cell_u8(block, self.block_len as usize, self.element_size, intra)
		};
		debug_assert_eq!(
			gen.load(Ordering::Relaxed),
			handle.generation(),
			"release called with a stale handle"
		);

		let mut new_gen = gen.load(Ordering::Relaxed).wrapping_add(1);
		let wrapped = new_gen == 0;
		if wrapped {
			if self.never_reissue {
				let cell = unsafe { payload_cell(block, intra, self.element_size) };
				unsafe { std::ptr::write_bytes(cell, 0xDC, self.element_size) };
				gen.store(new_gen, Ordering::Relaxed);
				return;
			}
			if index == 0 {
				new_gen = 1;
			}
		}
		gen.store(new_gen, Ordering::Relaxed);

		let cell = unsafe { payload_cell(block, intra, self.element_size) };
		let new_link = index | LINK_MARKER_32;

		let use_delayed = self.blocks_grown_since_deferred_flush.load(Ordering::Relaxed)
			< self.deferred_flush_threshold.load(Ordering::Relaxed);

		let mut attempts = 0u32;
		loop {
			if attempts >= DYNAMIC_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} release attempts");
				return;
			}
			if use_delayed {
				let current = self.delayed_head.load(Ordering::Relaxed);
				unsafe { write_link_u32(cell, current) };
				match self.delayed_head.compare_exchange_weak(
					current,
					new_link,
					Ordering::Relaxed,
					Ordering::Relaxed,
				) {
					Ok(_) => return,
					Err(_) => {
						attempts += 1;
						std::hint::spin_loop();
						continue;
					}
				}
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
		let Some((block, intra)) = self.locate(handle.index()) else {
			return false;
		};
		let gen = unsafe {
			gen_cell_u8(block, self.block_len as usize, self.element_size, intra)
		};
		gen.load(Ordering::Relaxed) == handle.generation()
	}

	pub fn handle_to_ptr(&self, handle: Handle32) -> Option<NonNull<u8>> {
		if !self.is_valid(handle) {
			return None;
		}
		let (block, intra) = self.locate(handle.index())?;
		let cell = unsafe { payload_cell(block, intra, self.element_size) };
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

impl Drop for DynamicManager32 {
	fn drop(&mut self) {
		for block in self.directory.published() {
			// Safety: every published block was allocated with `self.layout` in `grow_new_block`.
			unsafe { crate::block::dealloc_block(block, self.layout) };
		}
	}
}

/// RAII guard stalling the growth slow path for as long as it is held, letting a caller that
/// cached a raw pointer from `handle_to_ptr` rely on it not moving (§4.5).
pub struct PointerStabilityGuard<'a> {
	_guard: MutexGuard<'a, ()>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_alloc_is_index_zero_generation_one() {
		let m = DynamicManager32::new(8, 16, 4, false).unwrap();
		let h = m.alloc();
		assert_eq!(h.index(), 0);
		assert_eq!(h.generation(), 1);
	}

	#[test]
	fn block_fill_returns_consecutive_indices() {
		let m = DynamicManager32::new(8, 16, 4, false).unwrap();
		let first = m.alloc();
		assert_eq!(first.index(), 0);
		for expected in 1..64 {
			let h = m.alloc();
			assert_eq!(h.index(), expected);
			assert_eq!(h.generation(), 0);
		}
	}

	#[test]
	fn round_trip_validity() {
		let m = DynamicManager32::new(8, 4, 4, false).unwrap();
		let h = m.alloc();
		assert!(m.is_valid(h));
		m.release(h);
		assert!(!m.is_valid(h));
	}

	#[test]
	fn exhaustion_across_all_blocks_returns_invalid() {
		let m = DynamicManager32::new(8, 4, 2, false).unwrap();
		for _ in 0..8 {
			assert!(!m.alloc().is_invalid());
		}
		assert!(m.alloc().is_invalid());
	}

	#[test]
	fn never_reissue_leaks_slot_after_generation_wraps() {
		// capacity 1: every cycle reuses the same (only) slot, so the generation counter is
		// guaranteed to wrap and trigger the leak within a bounded number of iterations.
		let m = DynamicManager32::new(8, 1, 1, true).unwrap();
		let mut leaked = false;
		for _ in 0..400 {
			let h = m.alloc();
			if h.is_invalid() {
				leaked = true;
				break;
			}
			m.release(h);
		}
		assert!(leaked, "slot should eventually be leaked and never reissued");
		assert!(m.alloc().is_invalid());
	}

	#[test]
	fn capacity_exceeding_index_space_is_rejected() {
		let err = DynamicManager32::new(8, 1 << 31, 2, false).unwrap_err();
		assert!(matches!(err, HandlePoolError::CapacityExceedsIndexSpace { .. }));
	}
}
