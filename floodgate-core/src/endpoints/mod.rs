pub mod admission;
pub mod fallback;
pub mod rules;
pub mod status;
pub mod sync_queue;
