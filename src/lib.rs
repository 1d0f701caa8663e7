#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating many pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Style preference — keeping format!("{}", x) over format!("{x}") for readability with complex exprs
#![allow(clippy::uninlined_format_args)]
// Intentional casts in timestamp/usage bookkeeping
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Scheduler lifecycle functions are naturally long; splitting would be artificial
#![allow(clippy::too_many_lines)]

pub mod agent;
pub mod approval;
pub mod bus;
pub mod chat_lock;
pub mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod history;
pub mod inject;
pub mod progress;
pub mod runner;
pub mod safety;
pub mod sandbox;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
