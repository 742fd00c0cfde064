//! Query helpers over a borrowed meta connection.
//!
//! Free functions taking `&Connection` so they compose inside
//! [`MetaDb::transaction`](crate::MetaDb::transaction).

pub mod baselines;
pub mod key_index;
pub mod runs;
pub mod watermarks;
