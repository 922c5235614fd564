pub mod delivery;
pub mod matching;
pub mod pairing;
pub mod sessions;
