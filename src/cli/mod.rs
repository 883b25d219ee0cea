//! Operator-facing CLI helpers.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `prompt` | Yes/no confirmation before deleting |
//! | `report` | Byte sizes, repository count table, run summary |

mod prompt;
mod report;

pub use prompt::{Confirm, FixedAnswer, StdinConfirm, parse_answer};
pub use report::{format_bytes, render_repository_counts, render_summary};
