//! CLI command implementations.
//!
//! | Module     | Commands handled            |
//! |------------|-----------------------------|
//! | `run`      | `Start`, `Resume`, `Abort`  |
//! | `status`   | `Status`, `Trace`           |
//! | `decision` | `Decide`, `Gates`           |

pub mod decision;
pub mod run;
pub mod status;

pub use decision::{cmd_decide, cmd_gates};
pub use run::{cmd_abort, cmd_resume, cmd_start};
pub use status::{cmd_status, cmd_trace};

/// Wrap text for terminal display with a hanging indent.
pub(crate) fn wrap(text: &str, indent: &str) -> String {
    let options = textwrap::Options::new(88)
        .initial_indent(indent)
        .subsequent_indent(indent);
    textwrap::fill(text, options)
}
