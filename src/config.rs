use crate::cli::PipelineArgs;
use crate::errors::{AppError, Result};
use crate::external_tools::ExternalTools;
use crate::stage::StageLayout;
use crate::strategy::Strategy;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Everything a run needs, resolved once and shared read-only by all stages.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub reference: PathBuf,
    pub alignment: PathBuf,
    pub strategy: Strategy,
    pub strains: u32,
    pub quality: f64,
    pub workers: usize,
    pub chunk_size: u64,
    pub tools: ExternalTools,
    pub layout: StageLayout,
    pub progress: bool,
}

impl PipelineConfig {
    pub fn from_args(args: &PipelineArgs) -> Result<Self> {
        args.validate()?;
        let reference = readable_input("--reference", &args.reference)?;
        let alignment = readable_input("--bam", &args.alignment)?;

        Ok(Self {
            reference,
            alignment,
            strategy: Strategy::select(args.strains, args.freebayes_only),
            strains: args.strains,
            quality: args.quality,
            workers: args.workers.max(1),
            chunk_size: args.chunk_size.max(1),
            tools: args.tools.clone(),
            layout: StageLayout::new(&args.output),
            progress: args.progress,
        })
    }
}

fn readable_input(flag: &str, path: &Path) -> Result<PathBuf> {
    let unreadable = |reason: String| AppError::InputUnreadable {
        flag: flag.to_string(),
        path: path.to_path_buf(),
        reason,
    };
    let resolved = fs::canonicalize(path).map_err(|err| unreadable(err.to_string()))?;
    if !resolved.is_file() {
        return Err(unreadable("not a regular file".to_string()));
    }
    File::open(&resolved).map_err(|err| unreadable(err.to_string()))?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::PipelineConfig;
    use crate::cli::PipelineArgs;
    use crate::errors::{AppError, EXIT_ARGUMENT_ERROR};
    use crate::strategy::Strategy;
    use std::fs;

    fn args_in(dir: &std::path::Path) -> PipelineArgs {
        let reference = dir.join("ref.fa");
        let alignment = dir.join("reads.bam");
        fs::write(&reference, ">chr1\nACGT\n").expect("expected reference write");
        fs::write(&alignment, b"BAM").expect("expected alignment write");
        PipelineArgs {
            reference,
            alignment,
            output: dir.join("out"),
            ..PipelineArgs::default()
        }
    }

    #[test]
    fn resolves_inputs_and_selects_strategy() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let mut args = args_in(dir.path());
        args.strains = 5;

        let config = PipelineConfig::from_args(&args).expect("expected config");
        assert!(config.reference.is_absolute());
        assert!(config.alignment.is_absolute());
        assert_eq!(config.strategy, Strategy::TwoPassJoint);
        assert_eq!(config.layout.root, dir.path().join("out"));
    }

    #[test]
    fn unreadable_reference_is_an_argument_error() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let mut args = args_in(dir.path());
        args.reference = dir.path().join("absent.fa");

        let error = PipelineConfig::from_args(&args).expect_err("expected unreadable input");
        assert!(matches!(error, AppError::InputUnreadable { .. }));
        assert_eq!(error.exit_code(), EXIT_ARGUMENT_ERROR);
    }

    #[test]
    fn directory_is_not_an_alignment() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let mut args = args_in(dir.path());
        args.alignment = dir.path().to_path_buf();
        assert!(PipelineConfig::from_args(&args).is_err());
    }
}
