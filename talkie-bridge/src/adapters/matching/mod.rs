pub mod mapping_file;

pub use mapping_file::FileMappingRepository;
