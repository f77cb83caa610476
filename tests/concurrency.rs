//! End-to-end concurrency scenarios (§8 S5, S6).

use std::sync::Arc;
use std::thread;

use handle_pool::{DynamicManager32, FixedManager32};

#[test]
fn exhaustion_emits_one_warning_per_failed_alloc() {
	let m = FixedManager32::new(8, 16).unwrap();
	for _ in 0..16 {
		assert!(!m.alloc().is_invalid());
	}
	assert!(m.alloc().is_invalid());
	assert!(m.alloc().is_invalid());
}

/// Scaled-down version of S6: many threads cycle alloc -> write -> alloc -> read -> release,
/// leaking a fraction of handles, and every payload read must equal the cycle number written
/// immediately before it.
#[test]
fn concurrent_alloc_write_read_release_never_observes_a_foreign_cycle() {
	const THREADS: u32 = 8;
	const CYCLES_PER_THREAD: u32 = 2_000;

	let manager = Arc::new(DynamicManager32::new(8, 64, 64, false).unwrap());

	let handles: Vec<_> = (0..THREADS)
		.map(|thread_id| {
			let manager = Arc::clone(&manager);
			thread::spawn(move || {
				for cycle in 0..CYCLES_PER_THREAD {
					let tag = (thread_id as u64)
						.wrapping_mul(1_000_003)
						.wrapping_add(cycle as u64);
					let h = manager.alloc();
					assert!(!h.is_invalid());
					assert!(manager.copy_from(h, &tag.to_le_bytes()));

					let mut out = [0u8; 8];
					assert!(manager.copy_to(h, &mut out));
					assert_eq!(u64::from_le_bytes(out), tag, "read back a foreign cycle's payload");

					if cycle % 1000 != 999 {
						manager.release(h);
					}
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}
}

#[test]
fn concurrent_allocations_never_hand_out_the_same_handle_twice() {
	use std::collections::HashSet;
	use std::sync::Mutex;

	const THREADS: u32 = 8;
	const ALLOCS_PER_THREAD: u32 = 500;

	// No handle is released during this test, so capacity must cover every allocation made by
	// every thread: block_size * max_blocks >= THREADS * ALLOCS_PER_THREAD.
	let manager = Arc::new(DynamicManager32::new(8, 256, 64, false).unwrap());
	let seen = Arc::new(Mutex::new(HashSet::new()));

	let handles: Vec<_> = (0..THREADS)
		.map(|_| {
			let manager = Arc::clone(&manager);
			let seen = Arc::clone(&seen);
			thread::spawn(move || {
				let mut mine = Vec::with_capacity(ALLOCS_PER_THREAD as usize);
				for _ in 0..ALLOCS_PER_THREAD {
					let h = manager.alloc();
					assert!(!h.is_invalid());
					mine.push(h.raw());
				}
				let mut seen = seen.lock().unwrap();
				for raw in mine {
					assert!(seen.insert(raw), "the same handle was allocated twice concurrently");
				}
			})
		})
		.collect();

	for h in handles {
		h.join().unwrap();
	}
}
