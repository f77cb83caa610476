//! Concurrent generational handle allocator.
//!
//! A handle pool is a slab of fixed-size records addressed by opaque tokens that carry a
//! generation counter, so a token referring to a freed record reliably reads back as invalid
//! instead of silently aliasing whatever now occupies that slot. Allocation and release are
//! lock-free on the hot path, for both a pre-sized [`FixedManager32`]/[`FixedManager64`] and a
//! growable [`DynamicManager32`]/[`DynamicManager64`] that adds blocks on demand.
//!
//! The 32-bit handle form packs a 24-bit index with an 8-bit generation; the 64-bit form packs a
//! 40-bit index with a 24-bit generation plus status flags used by [`DynamicManager64::index_to_handle`].
//! Pick whichever handle width fits the expected slot count and generation churn.

mod any;
mod block;
mod dynamic32;
mod dynamic64;
mod error;
mod fixed32;
mod fixed64;
mod handle;
mod head32;
mod head64;

pub use any::{AnyManager32, AnyManager64};
pub use dynamic32::{DynamicManager32, PointerStabilityGuard as PointerStabilityGuard32};
pub use dynamic64::{DynamicManager64, PointerStabilityGuard as PointerStabilityGuard64};
pub use error::HandlePoolError;
pub use fixed32::FixedManager32;
pub use fixed64::FixedManager64;
pub use handle::{Handle32, Handle64};

/// Shared by this crate's own `#[test]` modules; wraps `env_logger::builder().is_test(true)` so
/// `log::warn!` call sites (capacity exhaustion, livelock, OOM) are visible under `cargo test --
/// --nocapture` without the crate initializing a logger itself outside of tests (§7).
#[cfg(test)]
pub(crate) fn init_test_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}
