pub mod buffer_pool;
pub mod encryption;
pub mod fixed_buffer;
