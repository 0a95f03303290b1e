//! Standalone worker process for the render pool.

use std::process::ExitCode;

fn main() -> ExitCode {
    leafpress_scheduler::worker::main()
}
