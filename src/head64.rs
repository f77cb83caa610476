//! The packed free-head for the 64-bit handle form: one `portable_atomic::AtomicU128` holding
//! two 64-bit chain heads, free list in the low half and deferred list in the high half (§4.1a).
//! `std::sync::atomic` has no stable 128-bit CAS, so this uses the same crate real-world
//! lock-free allocators (e.g. MMTk) reach for when they need a wider-than-pointer CAS.

use portable_atomic::{AtomicU128, Ordering};

#[inline]
pub(crate) fn free_part(word: u128) -> u64 {
	word as u64
}

#[inline]
pub(crate) fn deferred_part(word: u128) -> u64 {
	(word >> 64) as u64
}

#[inline]
pub(crate) fn pack(free: u64, deferred: u64) -> u128 {
	(free as u128) | ((deferred as u128) << 64)
}

pub(crate) struct PackedHead64 {
	word: AtomicU128,
}

impl PackedHead64 {
	pub(crate) fn new(free: u64, deferred: u64) -> Self {
		Self {
			word: AtomicU128::new(pack(free, deferred)),
		}
	}

	#[inline]
	pub(crate) fn load(&self) -> u128 {
		self.word.load(Ordering::Relaxed)
	}

	#[inline]
	pub(crate) fn try_set_free(&self, current: u128, new_free: u64) -> Result<(), u128> {
		let new_word = pack(new_free, deferred_part(current));
		self.word
			.compare_exchange_weak(current, new_word, Ordering::Relaxed, Ordering::Relaxed)
			.map(|_| ())
	}

	#[inline]
	pub(crate) fn try_set_deferred(&self, current: u128, new_deferred: u64) -> Result<(), u128> {
		let new_word = pack(free_part(current), new_deferred);
		self.word
			.compare_exchange_weak(current, new_word, Ordering::Relaxed, Ordering::Relaxed)
			.map(|_| ())
	}

	#[inline]
	pub(crate) fn try_set_whole(&self, current: u128, new_word: u128) -> Result<(), u128> {
		self.word
			.compare_exchange_weak(current, new_word, Ordering::Relaxed, Ordering::Relaxed)
			.map(|_| ())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pack_and_unpack_round_trip() {
		let word = pack(0xFFFF_FF00_0000_0001, 0xFFFF_FF00_0000_0002);
		assert_eq!(free_part(word), 0xFFFF_FF00_0000_0001);
		assert_eq!(deferred_part(word), 0xFFFF_FF00_0000_0002);
	}

	#[test]
	fn try_set_deferred_preserves_free() {
		let head = PackedHead64::new(11, 22);
		let current = head.load();
		head.try_set_deferred(current, 33).unwrap();
		assert_eq!(free_part(head.load()), 11);
		assert_eq!(deferred_part(head.load()), 33);
	}
}
