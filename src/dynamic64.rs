//! Growable manager, 64-bit handle form. Same directory-growth design as `dynamic32`, at double
//! handle width, plus the two 64-bit-only operations: `index_to_handle` (§4.7) and `Clone` (§4.8).

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::block::{
	alloc_block, block_layout, gen_cell_u32, payload_cell, read_link_u64, write_link_u64,
	zero_cell, Directory,
};
use crate::error::HandlePoolError;
use crate::handle::{GenCell64, Handle64, LINK_MARKER_64, MAX_INDEX_64};
use crate::head64::{self, PackedHead64};

const LINK_WIDTH_64: usize = 8;
const GEN_CELL_SIZE: usize = 4;
const DEFAULT_DEFERRED_FLUSH_THRESHOLD: u32 = 2;
const DEFAULT_DELAYED_FLUSH_THRESHOLD: u32 = 100;

/// Spin-retry ceiling before `alloc`/`release` give up and log a livelock warning (§4.2).
const DYNAMIC_MAX_ATTEMPTS: u32 = 1000;

pub struct DynamicManager64 {
	element_size: usize,
	block_len: u64,
	shift: u32,
	mask: u64,
	max_blocks: usize,
	never_reissue: bool,
	layout: Layout,
	directory: Directory,
	head: PackedHead64,
	delayed_head: AtomicU64,
	next_block_index: AtomicUsize,
	allocated_count: AtomicU64,
	growth_lock: Mutex<()>,
	deferred_flush_threshold: AtomicU32,
	delayed_flush_threshold: AtomicU32,
	blocks_grown_since_deferred_flush: AtomicU32,
	delayed_flush_since: AtomicU32,
}

// Safety: same reasoning as `DynamicManager32`.
unsafe impl Send for DynamicManager64 {}
unsafe impl Sync for DynamicManager64 {}

impl DynamicManager64 {
	pub fn new(
		element_size: usize,
		block_size: u64,
		max_blocks: usize,
		never_reissue: bool,
	) -> Result<Self, HandlePoolError> {
		if element_size < LINK_WIDTH_64 {
			return Err(HandlePoolError::ElementTooSmall {
				got: element_size,
				min: LINK_WIDTH_64,
			});
		}
		let block_len = block_size.max(1).next_power_of_two();
		let index_space = MAX_INDEX_64 + 1;
		if block_len.saturating_mul(max_blocks as u64) > index_space {
			return Err(HandlePoolError::CapacityExceedsIndexSpace {
				block_size: block_len as usize,
				max_blocks,
				bits: 40,
			});
		}

		let layout = block_layout(block_len as usize, element_size, GEN_CELL_SIZE);
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
			head: PackedHead64::new(0, 0),
			delayed_head: AtomicU64::new(0),
			next_block_index: AtomicUsize::new(0),
			allocated_count: AtomicU64::new(0),
			growth_lock: Mutex::new(()),
			deferred_flush_threshold: AtomicU32::new(DEFAULT_DEFERRED_FLUSH_THRESHOLD),
			delayed_flush_threshold: AtomicU32::new(DEFAULT_DELAYED_FLUSH_THRESHOLD),
			blocks_grown_since_deferred_flush: AtomicU32::new(0),
			delayed_flush_since: AtomicU32::new(0),
		};

		let guard = manager.growth_lock.lock();
		if !manager.grow_new_block(&guard) {
			return Err(HandlePoolError::OutOfMemory);
		}
		drop(guard);

		if manager.block_len > 0 {
			let block = manager.directory.get(0).expect("first block just published");
			let gen0 = unsafe {
				gen_cell_u32(block, manager.block_len as usize, manager.element_size, 0)
			};
			gen0.store(GenCell64::from_raw(0).with_generation(1).raw(), Ordering::Relaxed);
		}

		Ok(manager)
	}

	fn locate(&self, index: u64) -> Option<(NonNull<u8>, usize)> {
		let block_index = (index >> self.shift) as usize;
		let intra = (index & self.mask) as usize;
		self.directory.get(block_index).map(|block| (block, intra))
	}

	fn gen_cell_at(&self, block: NonNull<u8>, intra: usize) -> &std::sync::atomic::AtomicU32 {
		unsafe { gen_cell_u32(block, self.block_len as usize, self.element_size, intra) }
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

	pub fn alloc(&self) -> Handle64 {
		let mut attempts = 0u32;
		loop {
			if attempts >= DYNAMIC_MAX_ATTEMPTS {
				log::warn!("handle pool livelock guard tripped after {attempts} alloc attempts");
				return Handle64::INVALID;
			}
			let current = self.head.load();
			let free_raw = head64::free_part(current);
			if free_raw != 0 {
				let index = free_raw & !LINK_MARKER_64;
				let Some((block, intra)) = self.locate(index) else {
					attempts += 1;
					continue;
				};
				let cell = unsafe { payload_cell(block, intra, self.element_size) };
				let next = unsafe { read_link_u64(cell) };
				match self.head.try_set_free(current, next) {
					Ok(()) => {
						unsafe { zero_cell(cell, self.element_size) };
						let gen = self.gen_cell_at(block, intra);
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

			let guard = self.growth_lock.lock();
			if !self.grow_or_recycle(&guard) {
				drop(guard);
				log::warn!(
					"handle pool exhausted: reached max_blocks={} at block_size={}",
					self.max_blocks,
					self.block_len
				);
				return Handle64::INVALID;
			}
			drop(guard);
			attempts += 1;
		}
	}

	fn grow_or_recycle(&self, guard: &MutexGuard<'_, ()>) -> bool {
		let current = self.head.load();
		if head64::free_part(current) != 0 || head64::deferred_part(current) != 0 {
			return true;
		}

		let at_capacity = self.next_block_index.load(Ordering::Relaxed) >= self.max_blocks;
		let flush_due = self.blocks_grown_since_deferred_flush.load(Ordering::Relaxed)
			>= self.deferred_flush_threshold.load(Ordering::Relaxed);
		if flush_due || at_capacity {
			let delayed = self.delayed_head.swap(0, Ordering::Relaxed);
			if delayed != 0 {
				// We own this chain exclusively after the swap, so its interior links are
				// stable; walk to the tail once, then splice the whole chain onto whatever the
				// deferred half currently is instead of discarding a concurrently-pushed
				// deferred chain (§4.3a).
				let mut tail_index = delayed & !LINK_MARKER_64;
				loop {
					let Some((block, intra)) = self.locate(tail_index) else { break };
					let next = unsafe { read_link_u64(payload_cell(block, intra, self.element_size)) };
					if next == 0 {
						break;
					}
					tail_index = next & !LINK_MARKER_64;
				}
				if let Some((tail_block, tail_intra)) = self.locate(tail_index) {
					let tail_cell = unsafe { payload_cell(tail_block, tail_intra, self.element_size) };
					loop {
						let current = self.head.load();
						let prev_deferred = head64::deferred_part(current);
						unsafe { write_link_u64(tail_cell, prev_deferred) };
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

	fn grow_new_block(&self, _guard: &MutexGuard<'_, ()>) -> bool {
		let block_index = self.next_block_index.load(Ordering::Relaxed);
		if block_index >= self.max_blocks {
			return false;
		}
		let base_index = block_index as u64 * self.block_len;
		if base_index + self.block_len > MAX_INDEX_64 + 1 {
			log::warn!("allocated all {} handles", MAX_INDEX_64 + 1);
			return false;
		}

		let block = match alloc_block(self.layout) {
			Some(block) => block,
			None => {
				log::warn!("out of memory growing handle pool");
				return false;
			}
		};

		for i in 0..self.block_len {
			// Safety: `i < block_len`, block sized for `block_len` slots.
			let cell = unsafe { payload_cell(block, i as usize, self.element_size) };
			let next = if i + 1 < self.block_len {
				(base_index + i + 1) | LINK_MARKER_64
			} else {
				0
			};
			unsafe { write_link_u64(cell, next) };
		}

		self.directory.publish(block_index, block);
		self.next_block_index.store(block_index + 1, Ordering::Relaxed);
		self.blocks_grown_since_deferred_flush.fetch_add(1, Ordering::Relaxed);
		self.delayed_flush_since.fetch_add(1, Ordering::Relaxed);

		loop {
			let current = self.head.load();
			let prev_free = head64::free_part(current);
			let last_cell = unsafe {
				payload_cell(block, (self.block_len - 1) as usize, self.element_size)
			};
			unsafe { write_link_u64(last_cell, prev_free) };
			let new_free = base_index | LINK_MARKER_64;
			if self.head.try_set_free(current, new_free).is_ok() {
				return true;
			}
		}
	}

	pub fn release(&self, handle: Handle64) {
		debug_assert!(!handle.is_invalid(), "release called with the invalid handle");
		if handle.is_invalid() {
			return;
		}
		let index = handle.index();
		let Some((block, intra)) = self.locate(index) else {
			debug_assert!(false, "release called with an out-of-range handle");
			return;
		};

		let gen = self.gen_cell_at(block, intra);
		let raw = gen.load(Ordering::Relaxed);
		let cell = GenCell64::from_raw(raw);
		debug_assert_eq!(cell.generation(), handle.generation(), "release called with a stale handle");

		let mut new_gen = cell.generation().wrapping_add(1) & GenCell64::raw_gen_mask();
		let wrapped = new_gen == 0;
		if wrapped {
			if self.never_reissue {
				let payload = unsafe { payload_cell(block, intra, self.element_size) };
				unsafe { std::ptr::write_bytes(payload, 0xDC, self.element_size) };
				let leaked = GenCell64::from_raw(0)
					.with_generation(new_gen)
					.with_flag(GenCell64::LEAKED, true);
				gen.store(leaked.raw(), Ordering::Relaxed);
				return;
			}
			if index == 0 {
				new_gen = 1;
			}
		}
		let updated = GenCell64::from_raw(0).with_generation(new_gen).with_flag(GenCell64::ALLOCATED, false);
		gen.store(updated.raw(), Ordering::Relaxed);

		let payload = unsafe { payload_cell(block, intra, self.element_size) };
		let new_link = index | LINK_MARKER_64;

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
				unsafe { write_link_u64(payload, current) };
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
		let Some((block, intra)) = self.locate(handle.index()) else {
			return false;
		};
		GenCell64::from_raw(self.gen_cell_at(block, intra).load(Ordering::Relaxed)).generation()
			== handle.generation()
	}

	pub fn handle_to_ptr(&self, handle: Handle64) -> Option<NonNull<u8>> {
		if !self.is_valid(handle) {
			return None;
		}
		let (block, intra) = self.locate(handle.index())?;
		let cell = unsafe { payload_cell(block, intra, self.element_size) };
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

	/// Reconstructs the currently-valid handle for a raw live index (§4.7).
	pub fn index_to_handle(&self, index: u64) -> Option<Handle64> {
		let (block, intra) = self.locate(index)?;
		let cell = GenCell64::from_raw(self.gen_cell_at(block, intra).load(Ordering::Relaxed));
		if cell.flag(GenCell64::ALLOCATED) && !cell.flag(GenCell64::LEAKED) {
			Some(Handle64::new(index, cell.generation()))
		} else {
			None
		}
	}
}

impl Clone for DynamicManager64 {
	/// Deep copy under the growth lock: every handle valid in `self` stays valid in the clone
	/// (§4.8). The clone gets a freshly initialized mutex rather than a cloned one.
	fn clone(&self) -> Self {
		let _guard = self.growth_lock.lock();

		let directory = Directory::new(self.max_blocks);
		let published_count = self.next_block_index.load(Ordering::Relaxed);
		for block_index in 0..published_count {
			let src = self
				.directory
				.get(block_index)
				.expect("published_count tracks directory publications");
			let dst = alloc_block(self.layout).expect("clone: backing allocator returned null");
			unsafe {
				std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), self.layout.size());
			}
			directory.publish(block_index, dst);
		}

		let current = self.head.load();
		Self {
			element_size: self.element_size,
			block_len: self.block_len,
			shift: self.shift,
			mask: self.mask,
			max_blocks: self.max_blocks,
			never_reissue: self.never_reissue,
			layout: self.layout,
			directory,
			head: PackedHead64::new(head64::free_part(current), head64::deferred_part(current)),
			delayed_head: AtomicU64::new(self.delayed_head.load(Ordering::Relaxed)),
			next_block_index: AtomicUsize::new(published_count),
			allocated_count: AtomicU64::new(self.allocated_count.load(Ordering::Relaxed)),
			growth_lock: Mutex::new(()),
			deferred_flush_threshold: AtomicU32::new(
				self.deferred_flush_threshold.load(Ordering::Relaxed),
			),
			delayed_flush_threshold: AtomicU32::new(
				self.delayed_flush_threshold.load(Ordering::Relaxed),
			),
			blocks_grown_since_deferred_flush: AtomicU32::new(
				self.blocks_grown_since_deferred_flush.load(Ordering::Relaxed),
			),
			delayed_flush_since: AtomicU32::new(self.delayed_flush_since.load(Ordering::Relaxed)),
		}
	}
}

impl Drop for DynamicManager64 {
	fn drop(&mut self) {
		for block in self.directory.published() {
			// Safety: every published block was allocated with `self.layout` in `grow_new_block`.
			unsafe { crate::block::dealloc_block(block, self.layout) };
		}
	}
}

/// RAII guard stalling the growth slow path for as long as it is held (§4.5).
pub struct PointerStabilityGuard<'a> {
	_guard: MutexGuard<'a, ()>,
}

#[cfg(test)]
impl DynamicManager64 {
	/// Test-only: pokes a slot's generation cell directly so wraparound can be exercised without
	/// spinning through the full 24-bit generation range.
	fn debug_force_generation(&self, index: u64, generation: u32) {
		let (block, intra) = self.locate(index).expect("index must be in a published block");
		let gen = self.gen_cell_at(block, intra);
		let current = GenCell64::from_raw(gen.load(Ordering::Relaxed));
		gen.store(current.with_generation(generation).raw(), Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_alloc_is_index_zero_generation_one() {
		let m = DynamicManager64::new(16, 16, 4, false).unwrap();
		let h = m.alloc();
		assert_eq!(h.index(), 0);
		assert_eq!(h.generation(), 1);
	}

	#[test]
	fn round_trip_validity() {
		let m = DynamicManager64::new(16, 4, 4, false).unwrap();
		let h = m.alloc();
		assert!(m.is_valid(h));
		m.release(h);
		assert!(!m.is_valid(h));
	}

	#[test]
	fn index_to_handle_rejects_released_slots() {
		let m = DynamicManager64::new(16, 4, 4, false).unwrap();
		let h = m.alloc();
		assert_eq!(m.index_to_handle(h.index()), Some(h));
		m.release(h);
		assert_eq!(m.index_to_handle(h.index()), None);
	}

	#[test]
	fn clone_preserves_validity_and_payload() {
		let m = DynamicManager64::new(16, 4, 4, false).unwrap();
		let h = m.alloc();
		let payload = [9u8; 16];
		m.copy_from(h, &payload);
		let clone = m.clone();
		assert!(clone.is_valid(h));
		let mut out = [0u8; 16];
		clone.copy_to(h, &mut out);
		assert_eq!(out, payload);
	}

	#[test]
	fn exhaustion_across_all_blocks_returns_invalid() {
		let m = DynamicManager64::new(16, 4, 2, false).unwrap();
		for _ in 0..8 {
			assert!(!m.alloc().is_invalid());
		}
		assert!(m.alloc().is_invalid());
	}

	#[test]
	fn never_reissue_leaks_slot_after_generation_wraps() {
		let m = DynamicManager64::new(16, 1, 1, true).unwrap();
		let h = m.alloc();
		assert_eq!(h.index(), 0);
		let max_gen = GenCell64::raw_gen_mask();
		m.debug_force_generation(0, max_gen);
		m.release(Handle64::new(0, max_gen));
		assert!(m.alloc().is_invalid());
	}
}
