//! Commit-time validation.

pub mod conflict_gate;
pub mod validator;

pub use conflict_gate::{ConflictValidator, ConflictValidatorProvider};
pub use validator::{Validator, ValidatorPipeline, ValidatorProvider};
