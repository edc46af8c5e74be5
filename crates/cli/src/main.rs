use std::process::ExitCode;

fn main() -> ExitCode {
    propline_cli::init_logging();
    propline_cli::run()
}
