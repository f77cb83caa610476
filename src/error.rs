use thiserror::Error;

/// Construction-time configuration errors. Runtime failures (capacity exhaustion, invalid
/// handles, livelock) are never represented here — they are returned in-band as an invalid
/// handle, `None`, or `false`, and logged through the `log` facade instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandlePoolError {
	#[error("element size {got} is smaller than the handle link width {min}")]
	ElementTooSmall { got: usize, min: usize },

	#[error("block size {block_size} * max blocks {max_blocks} exceeds the {bits}-bit index space")]
	CapacityExceedsIndexSpace {
		block_size: usize,
		max_blocks: usize,
		bits: u32,
	},

	#[error("backing memory allocator returned null")]
	OutOfMemory,
}
