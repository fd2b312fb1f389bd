use mimalloc::MiMalloc;
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    strainsep::init_tracing();
    match strainsep::cli::parse_from_env().and_then(strainsep::run_from_args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("strainsep: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}
