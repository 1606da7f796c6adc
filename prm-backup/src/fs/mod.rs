//! Source directory scanning.

pub mod selector;

pub use selector::{select, select_as_of, CandidateFile, SelectionPolicy};
