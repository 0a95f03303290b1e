use std::process::ExitCode;

fn main() -> ExitCode {
    // Worker processes re-run this binary; they never reach the CLI.
    leafpress_scheduler::run_if_requested();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let _library = pdf_engine::LibraryGuard::new();

    match leafpress_cli::run(std::env::args_os()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}
