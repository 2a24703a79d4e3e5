pub mod atomic_map;
pub mod heap_buf;
pub mod memory_pool;
