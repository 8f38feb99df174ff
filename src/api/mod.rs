pub mod delivery;
pub mod enqueue;
