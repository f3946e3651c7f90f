use std::process::ExitCode;

fn main() -> ExitCode {
    baton_cli::run()
}
