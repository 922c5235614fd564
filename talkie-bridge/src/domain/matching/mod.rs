pub mod value_object;

pub use value_object::{
    MatchMethod, MatchReport, MatchResult, TerminalDescriptor, TerminalFingerprint,
    CONFIRMED_CONFIDENCE, MATCH_THRESHOLD,
};
