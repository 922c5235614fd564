pub mod delivery;
pub mod devices;
pub mod matching;
pub mod sessions;
