pub mod repo_file;
pub mod repo_mem;

pub use repo_file::FileDeviceRegistry;
pub use repo_mem::InMemoryDeviceRepository;
