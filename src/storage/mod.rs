pub mod buffer_pool;
pub mod disk_manager;
pub mod schema;
pub mod tuple;
