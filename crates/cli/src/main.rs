use std::process::ExitCode;

fn main() -> ExitCode {
    salesguard_cli::run()
}
