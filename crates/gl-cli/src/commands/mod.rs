//! Command implementations

pub(crate) mod common;
pub mod report;
pub mod run;
pub mod status;
pub mod validate;
