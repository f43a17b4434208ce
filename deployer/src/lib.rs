//! Template deployer for Proxmox hosts and LXC containers.
//!
//! An application is resolved from its `extends` chain into an ordered list of
//! commands, its parameters are resolved against operator input, and the
//! commands run one by one on the control host or inside a container, with a
//! checkpoint after every step so a halted run can resume.
//!
//! - **[`core`]**: Pure resolution logic (applications, parameters, variables,
//!   output contract). No I/O.
//! - **[`io`]**: Files, configuration, and child processes.
//! - **[`engine`]**: The resumable execution loop.
//! - **[`deploy`]**: Orchestration used by the CLI.

pub mod core;
pub mod deploy;
pub mod engine;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
