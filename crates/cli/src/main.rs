use std::process::ExitCode;

fn main() -> ExitCode {
    boardwright_cli::run()
}
