/// Tail reader for the growing voltage log
pub mod tail_reader;

/// Line parser for voltage readings
pub mod record_parser;

pub use record_parser::parse_record;
pub use tail_reader::{LineSource, TailFuture, TailLine, TailReader};
