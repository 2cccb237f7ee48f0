use std::process::ExitCode;

fn main() -> ExitCode {
    gtmlake_cli::run()
}
