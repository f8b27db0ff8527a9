pub mod errors;
pub mod fscheck;
pub mod logger;

use std::process::Command;

/// Render a command for debug logging, program first, arguments space-joined.
pub fn command_line(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}
