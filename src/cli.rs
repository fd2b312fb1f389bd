use crate::errors::{AppError, Result};
use crate::external_tools::ExternalTools;
use crate::reference::DEFAULT_CHUNK_SIZE;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_STRAINS: u32 = 2;
pub const DEFAULT_QUALITY: f64 = 50.0;
pub const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Clone, Parser)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct CliArgs {
    #[arg(short = 'r', long = "reference")]
    reference: Option<String>,
    #[arg(short = 'b', long = "bam")]
    bam: Option<String>,
    #[arg(short = 'o', long = "output")]
    output: Option<String>,
    #[arg(short = 's', long = "strains", default_value = "2")]
    strains: String,
    #[arg(short = 'q', long = "quality", default_value = "50")]
    quality: String,
    #[arg(short = 't', long = "threads", allow_hyphen_values = true)]
    threads: Option<String>,
    #[arg(long = "freebayes-only", action = ArgAction::SetTrue)]
    freebayes_only: bool,
    #[arg(long = "chunk-size", default_value = "50000")]
    chunk_size: String,
    #[arg(long = "samtools", default_value = "samtools")]
    samtools: String,
    #[arg(long = "longshot", default_value = "longshot")]
    longshot: String,
    #[arg(long = "freebayes", default_value = "freebayes")]
    freebayes: String,
    #[arg(long = "bgzip", default_value = "bgzip")]
    bgzip: String,
    #[arg(long = "tabix", default_value = "tabix")]
    tabix: String,
    #[arg(long = "progress", action = ArgAction::SetTrue)]
    progress: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineArgs {
    pub reference: PathBuf,
    pub alignment: PathBuf,
    pub output: PathBuf,
    pub strains: u32,
    pub quality: f64,
    pub workers: usize,
    pub freebayes_only: bool,
    pub chunk_size: u64,
    pub tools: ExternalTools,
    pub progress: bool,
}

impl Default for PipelineArgs {
    fn default() -> Self {
        Self {
            reference: PathBuf::new(),
            alignment: PathBuf::new(),
            output: PathBuf::new(),
            strains: DEFAULT_STRAINS,
            quality: DEFAULT_QUALITY,
            workers: DEFAULT_WORKERS,
            freebayes_only: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            tools: ExternalTools::default(),
            progress: false,
        }
    }
}

impl PipelineArgs {
    pub fn validate(&self) -> Result<()> {
        if self.reference.as_os_str().is_empty() {
            return Err(AppError::MissingRequired {
                field: "--reference".to_string(),
            });
        }
        if self.alignment.as_os_str().is_empty() {
            return Err(AppError::MissingRequired {
                field: "--bam".to_string(),
            });
        }
        if self.output.as_os_str().is_empty() {
            return Err(AppError::MissingRequired {
                field: "--output".to_string(),
            });
        }
        if self.strains == 0 {
            return Err(AppError::InvalidValue {
                flag: "--strains".to_string(),
                value: self.strains.to_string(),
                reason: "must be a positive integer".to_string(),
            });
        }
        if !self.quality.is_finite() || self.quality < 0.0 {
            return Err(AppError::InvalidValue {
                flag: "--quality".to_string(),
                value: self.quality.to_string(),
                reason: "must be a non-negative number".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(AppError::InvalidValue {
                flag: "--chunk-size".to_string(),
                value: "0".to_string(),
                reason: "must be a positive integer".to_string(),
            });
        }
        Ok(())
    }
}

pub fn parse_from_env() -> Result<PipelineArgs> {
    parse_args(std::env::args())
}

pub fn parse_args<I, S>(args: I) -> Result<PipelineArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    if tokens.is_empty() {
        tokens.push("strainsep".to_string());
    }

    let cli = CliArgs::try_parse_from(tokens).map_err(map_clap_error)?;

    let parsed = PipelineArgs {
        reference: cli.reference.map(PathBuf::from).unwrap_or_default(),
        alignment: cli.bam.map(PathBuf::from).unwrap_or_default(),
        output: cli.output.map(PathBuf::from).unwrap_or_default(),
        strains: parse_u32("--strains", &cli.strains)?,
        quality: parse_f64("--quality", &cli.quality)?,
        workers: parse_workers(cli.threads.as_deref()),
        freebayes_only: cli.freebayes_only,
        chunk_size: parse_u64("--chunk-size", &cli.chunk_size)?,
        tools: ExternalTools {
            samtools: cli.samtools,
            longshot: cli.longshot,
            freebayes: cli.freebayes,
            bgzip: cli.bgzip,
            tabix: cli.tabix,
        },
        progress: cli.progress,
    };

    parsed.validate()?;
    Ok(parsed)
}

/// Worker count never fails the run: anything that is not a positive
/// integer falls back to the default with a warning.
pub fn parse_workers(raw: Option<&str>) -> usize {
    let Some(value) = raw else {
        return DEFAULT_WORKERS;
    };
    match value.trim().parse::<usize>() {
        Ok(workers) if workers >= 1 => workers,
        _ => {
            warn!(
                value,
                fallback = DEFAULT_WORKERS,
                "invalid --threads value; using default worker count"
            );
            DEFAULT_WORKERS
        }
    }
}

fn map_clap_error(error: clap::Error) -> AppError {
    let kind = error.kind();
    let rendered = error.to_string();
    match kind {
        ErrorKind::UnknownArgument => AppError::UnsupportedArgument {
            arg: first_quoted_token(&rendered).unwrap_or(rendered),
        },
        ErrorKind::TooFewValues | ErrorKind::WrongNumberOfValues => AppError::MissingValue {
            flag: first_quoted_token(&rendered).unwrap_or_else(|| "argument".to_string()),
        },
        // clap reports a flag given without its value as InvalidValue too.
        ErrorKind::InvalidValue if rendered.contains("a value is required") => {
            AppError::MissingValue {
                flag: first_quoted_token(&rendered).unwrap_or_else(|| "argument".to_string()),
            }
        }
        _ => AppError::Cli {
            message: clap_error_message(&rendered),
        },
    }
}

fn first_quoted_token(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let end = message[start + 1..].find('\'')?;
    Some(message[start + 1..start + 1 + end].to_string())
}

fn clap_error_message(message: &str) -> String {
    message
        .lines()
        .find_map(|line| line.strip_prefix("error: "))
        .or_else(|| message.lines().next())
        .unwrap_or("failed to parse arguments")
        .to_string()
}

fn parse_u32(flag: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a positive integer".to_string(),
    })
}

fn parse_u64(flag: &str, value: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a positive integer".to_string(),
    })
}

fn parse_f64(flag: &str, value: &str) -> Result<f64> {
    value.parse::<f64>().map_err(|_| AppError::InvalidValue {
        flag: flag.to_string(),
        value: value.to_string(),
        reason: "must be a floating-point number".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_WORKERS, map_clap_error, parse_args, parse_workers};
    use clap::error::ErrorKind;
    use crate::errors::{AppError, EXIT_ARGUMENT_ERROR};
    use std::path::PathBuf;

    #[test]
    fn parses_minimal_arguments_with_defaults() {
        let args = parse_args(["strainsep", "-r", "ref.fa", "-b", "reads.bam", "-o", "out"])
            .expect("expected parse success");

        assert_eq!(args.reference, PathBuf::from("ref.fa"));
        assert_eq!(args.alignment, PathBuf::from("reads.bam"));
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.strains, 2);
        assert_eq!(args.quality, 50.0);
        assert_eq!(args.workers, 1);
        assert_eq!(args.chunk_size, 50_000);
        assert!(!args.freebayes_only);
        assert_eq!(args.tools.longshot, "longshot");
    }

    #[test]
    fn parses_full_flag_set() {
        let args = parse_args([
            "strainsep",
            "--reference",
            "ref.fa",
            "--bam",
            "reads.bam",
            "--output",
            "out",
            "--strains",
            "4",
            "--quality",
            "20.5",
            "--threads",
            "8",
            "--freebayes-only",
            "--chunk-size",
            "10000",
            "--freebayes",
            "/opt/bin/freebayes",
            "--progress",
        ])
        .expect("expected parse success");

        assert_eq!(args.strains, 4);
        assert_eq!(args.quality, 20.5);
        assert_eq!(args.workers, 8);
        assert!(args.freebayes_only);
        assert_eq!(args.chunk_size, 10_000);
        assert_eq!(args.tools.freebayes, "/opt/bin/freebayes");
        assert!(args.progress);
    }

    #[test]
    fn invalid_threads_degrade_to_one_worker() {
        for raw in ["0", "-3", "many", "2.5", "1e3"] {
            let args = parse_args([
                "strainsep", "-r", "ref.fa", "-b", "reads.bam", "-o", "out", "-t", raw,
            ])
            .expect("expected invalid threads to be tolerated");
            assert_eq!(args.workers, DEFAULT_WORKERS, "threads={raw:?}");
        }
        assert_eq!(parse_workers(Some(" 3 ")), 3);
        assert_eq!(parse_workers(None), DEFAULT_WORKERS);
    }

    #[test]
    fn rejects_missing_mandatory_inputs() {
        for args in [
            vec!["strainsep", "-b", "reads.bam", "-o", "out"],
            vec!["strainsep", "-r", "ref.fa", "-o", "out"],
            vec!["strainsep", "-r", "ref.fa", "-b", "reads.bam"],
        ] {
            let error = parse_args(args).expect_err("expected missing argument error");
            assert!(matches!(error, AppError::MissingRequired { .. }));
            assert_eq!(error.exit_code(), EXIT_ARGUMENT_ERROR);
        }
    }

    #[test]
    fn rejects_zero_strains_and_negative_quality() {
        let zero = parse_args([
            "strainsep", "-r", "ref.fa", "-b", "reads.bam", "-o", "out", "-s", "0",
        ]);
        assert!(matches!(zero, Err(AppError::InvalidValue { .. })));

        let negative = parse_args([
            "strainsep", "-r", "ref.fa", "-b", "reads.bam", "-o", "out", "-q=-1",
        ]);
        assert!(negative.is_err());
    }

    #[test]
    fn rejects_unknown_flags() {
        let result = parse_args([
            "strainsep", "-r", "ref.fa", "-b", "reads.bam", "-o", "out", "--bogus",
        ]);
        assert!(matches!(result, Err(AppError::UnsupportedArgument { .. })));
    }

    #[test]
    fn malformed_values_are_not_reported_as_missing() {
        let error = map_clap_error(clap::Error::raw(
            ErrorKind::InvalidValue,
            "invalid value 'abc' for '--quality <QUALITY>'\n",
        ));
        assert!(matches!(error, AppError::Cli { .. }));
        assert_eq!(error.exit_code(), EXIT_ARGUMENT_ERROR);

        let missing = parse_args(["strainsep", "-r", "ref.fa", "-b", "reads.bam", "-o"]);
        assert!(matches!(missing, Err(AppError::MissingValue { .. })));
    }
}
