pub mod in_memory;
pub mod mock_node;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
