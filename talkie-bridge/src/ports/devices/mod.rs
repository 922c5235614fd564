pub mod repo_port;

pub use repo_port::DeviceRepository;
