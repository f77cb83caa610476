//! Runtime dispatch between the fixed and dynamic variants, replacing the source's vtable
//! registry with a plain two-variant enum (§9 "Virtualized dispatch layer").

use std::ptr::NonNull;

use crate::dynamic32::{DynamicManager32, PointerStabilityGuard as PointerStabilityGuard32};
use crate::dynamic64::{DynamicManager64, PointerStabilityGuard as PointerStabilityGuard64};
use crate::fixed32::FixedManager32;
use crate::fixed64::FixedManager64;
use crate::handle::{Handle32, Handle64};

/// Either a fixed or a dynamic 32-bit-handle manager, dispatched by `match`.
pub enum AnyManager32 {
	Fixed(FixedManager32),
	Dynamic(DynamicManager32),
}

impl AnyManager32 {
	pub fn alloc(&self) -> Handle32 {
		match self {
			Self::Fixed(m) => m.alloc(),
			Self::Dynamic(m) => m.alloc(),
		}
	}

	pub fn release(&self, handle: Handle32) {
		match self {
			Self::Fixed(m) => m.release(handle),
			Self::Dynamic(m) => m.release(handle),
		}
	}

	pub fn is_valid(&self, handle: Handle32) -> bool {
		match self {
			Self::Fixed(m) => m.is_valid(handle),
			Self::Dynamic(m) => m.is_valid(handle),
		}
	}

	pub fn handle_to_ptr(&self, handle: Handle32) -> Option<NonNull<u8>> {
		match self {
			Self::Fixed(m) => m.handle_to_ptr(handle),
			Self::Dynamic(m) => m.handle_to_ptr(handle),
		}
	}

	pub fn copy_to(&self, handle: Handle32, dst: &mut [u8]) -> bool {
		match self {
			Self::Fixed(m) => m.copy_to(handle, dst),
			Self::Dynamic(m) => m.copy_to(handle, dst),
		}
	}

	pub fn copy_from(&self, handle: Handle32, src: &[u8]) -> bool {
		match self {
			Self::Fixed(m) => m.copy_from(handle, src),
			Self::Dynamic(m) => m.copy_from(handle, src),
		}
	}

	pub fn allocated_count(&self) -> u32 {
		match self {
			Self::Fixed(m) => m.allocated_count(),
			Self::Dynamic(m) => m.allocated_count(),
		}
	}

	/// Only meaningful for the dynamic variant; a no-op that always succeeds on fixed, which has
	/// no growth path to stall.
	pub fn lock_for_pointer_stability(&self) -> Option<PointerStabilityGuard32<'_>> {
		match self {
			Self::Fixed(_) => None,
			Self::Dynamic(m) => Some(m.lock_for_pointer_stability()),
		}
	}

	pub fn set_deferred_flush_threshold(&self, n: u32) {
		if let Self::Dynamic(m) = self {
			m.set_deferred_flush_threshold(n);
		}
	}

	pub fn set_delayed_flush_threshold(&self, n: u32) {
		if let Self::Dynamic(m) = self {
			m.set_delayed_flush_threshold(n);
		}
	}
}

/// Either a fixed or a dynamic 64-bit-handle manager, dispatched by `match`.
pub enum AnyManager64 {
	Fixed(FixedManager64),
	Dynamic(DynamicManager64),
}

impl AnyManager64 {
	pub fn alloc(&self) -> Handle64 {
		match self {
			Self::Fixed(m) => m.alloc(),
			Self::Dynamic(m) => m.alloc(),
		}
	}

	pub fn release(&self, handle: Handle64) {
		match self {
			Self::Fixed(m) => m.release(handle),
			Self::Dynamic(m) => m.release(handle),
		}
	}

	pub fn is_valid(&self, handle: Handle64) -> bool {
		match self {
			Self::Fixed(m) => m.is_valid(handle),
			Self::Dynamic(m) => m.is_valid(handle),
		}
	}

	pub fn handle_to_ptr(&self, handle: Handle64) -> Option<NonNull<u8>> {
		match self {
			Self::Fixed(m) => m.handle_to_ptr(handle),
			Self::Dynamic(m) => m.handle_to_ptr(handle),
		}
	}

	pub fn copy_to(&self, handle: Handle64, dst: &mut [u8]) -> bool {
		match self {
			Self::Fixed(m) => m.copy_to(handle, dst),
			Self::Dynamic(m) => m.copy_to(handle, dst),
		}
	}

	pub fn copy_from(&self, handle: Handle64, src: &[u8]) -> bool {
		match self {
			Self::Fixed(m) => m.copy_from(handle, src),
			Self::Dynamic(m) => m.copy_from(handle, src),
		}
	}

	pub fn allocated_count(&self) -> u64 {
		match self {
			Self::Fixed(m) => m.allocated_count(),
			Self::Dynamic(m) => m.allocated_count(),
		}
	}

	pub fn index_to_handle(&self, index: u64) -> Option<Handle64> {
		match self {
			Self::Fixed(m) => m.index_to_handle(index),
			Self::Dynamic(m) => m.index_to_handle(index),
		}
	}

	pub fn lock_for_pointer_stability(&self) -> Option<PointerStabilityGuard64<'_>> {
		match self {
			Self::Fixed(_) => None,
			Self::Dynamic(m) => Some(m.lock_for_pointer_stability()),
		}
	}

	pub fn set_deferred_flush_threshold(&self, n: u32) {
		if let Self::Dynamic(m) = self {
			m.set_deferred_flush_threshold(n);
		}
	}

	pub fn set_delayed_flush_threshold(&self, n: u32) {
		if let Self::Dynamic(m) = self {
			m.set_delayed_flush_threshold(n);
		}
	}
}

impl Clone for AnyManager64 {
	fn clone(&self) -> Self {
		match self {
			Self::Fixed(m) => Self::Fixed(m.clone()),
			Self::Dynamic(m) => Self::Dynamic(m.clone()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dispatches_to_fixed_variant() {
		let m = AnyManager32::Fixed(FixedManager32::new(8, 4).unwrap());
		let h = m.alloc();
		assert!(m.is_valid(h));
		assert!(m.lock_for_pointer_stability().is_none());
	}

	#[test]
	fn dispatches_to_dynamic_variant() {
		let m = AnyManager32::Dynamic(DynamicManager32::new(8, 4, 4, false).unwrap());
		let h = m.alloc();
		assert!(m.is_valid(h));
		assert!(m.lock_for_pointer_stability().is_some());
	}
}
