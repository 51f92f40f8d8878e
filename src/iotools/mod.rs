// SPDX-License-Identifier: Apache-2.0

//! Utility types for dealing with readers and writers

mod tally;
mod tee;

pub use tally::{Counter, Tally};
pub use tee::{Outcome, Tee};
