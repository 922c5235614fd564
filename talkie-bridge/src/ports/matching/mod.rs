pub mod mapping_repo;
pub mod terminal_source;

pub use mapping_repo::ConfirmedMappingRepository;
pub use terminal_source::TerminalSource;
