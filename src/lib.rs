pub mod cli;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod external_tools;
pub mod filter;
pub mod merge;
pub mod pipeline;
pub mod reference;
pub mod stage;
pub mod strategy;
pub mod variant;
pub mod writer;

use cli::PipelineArgs;
use errors::Result;
use pipeline::PipelineReport;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

pub fn run_from_args(args: PipelineArgs) -> Result<PipelineReport> {
    pipeline::run(&args)
}

#[cfg(test)]
mod tests {
    use crate::cli::parse_args;
    use crate::errors::{AppError, EXIT_ARGUMENT_ERROR};

    #[test]
    fn wiring_rejects_unreadable_inputs_before_any_stage() {
        let dir = tempfile::tempdir().expect("expected temp dir");
        let missing = dir.path().join("missing.fasta").to_string_lossy().to_string();
        let out = dir.path().join("out").to_string_lossy().to_string();

        let args = parse_args([
            "strainsep", "-r", &missing, "-b", &missing, "-o", &out, "-s", "3",
        ])
        .expect("expected valid args");
        let error = crate::run_from_args(args).expect_err("expected unreadable reference");
        assert!(matches!(error, AppError::InputUnreadable { .. }));
        assert_eq!(error.exit_code(), EXIT_ARGUMENT_ERROR);
        assert!(!dir.path().join("out").exists());
    }
}
