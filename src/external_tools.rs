use crate::errors::{AppError, Result};
use crate::strategy::Strategy;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Paths of the external programs the pipeline drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTools {
    pub samtools: String,
    pub longshot: String,
    pub freebayes: String,
    pub bgzip: String,
    pub tabix: String,
}

impl Default for ExternalTools {
    fn default() -> Self {
        Self {
            samtools: "samtools".to_string(),
            longshot: "longshot".to_string(),
            freebayes: "freebayes".to_string(),
            bgzip: "bgzip".to_string(),
            tabix: "tabix".to_string(),
        }
    }
}

/// One external command: program, arguments, optional stdout redirection
/// and the log file that receives its stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdout: Option<PathBuf>,
    pub log: PathBuf,
}

impl ToolInvocation {
    pub fn new(program: &str, log: &Path) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdout: None,
            log: log.to_path_buf(),
        }
    }

    pub fn arg(mut self, value: impl AsRef<str>) -> Self {
        self.args.push(value.as_ref().to_string());
        self
    }

    pub fn path_arg(self, value: &Path) -> Self {
        let rendered = value.to_string_lossy().into_owned();
        self.arg(rendered)
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout = Some(path.to_path_buf());
        self
    }

    /// Value following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|index| self.args.get(index + 1))
            .map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(path) = &self.stdout {
            line.push_str(" > ");
            line.push_str(&path.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    Success,
    Failed { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub log: PathBuf,
}

impl ToolOutcome {
    pub fn success(log: &Path) -> Self {
        Self {
            status: ToolStatus::Success,
            log: log.to_path_buf(),
        }
    }

    pub fn failed(code: Option<i32>, log: &Path) -> Self {
        Self {
            status: ToolStatus::Failed { code },
            log: log.to_path_buf(),
        }
    }

    pub fn into_result(self, phase: &str, target: &str) -> Result<()> {
        match self.status {
            ToolStatus::Success => Ok(()),
            ToolStatus::Failed { code } => Err(AppError::ToolFailed {
                phase: phase.to_string(),
                target: target.to_string(),
                code,
                log: self.log,
            }),
        }
    }
}

/// Executes external invocations. The pipeline only ever talks to tools
/// through this seam.
pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome>;

    fn ensure_available(&self, _program: &str) -> Result<()> {
        Ok(())
    }
}

/// Runs invocations as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&invocation.log)?;
        writeln!(log, "$ {}", invocation.command_line())?;
        log.flush()?;

        let stdout = match &invocation.stdout {
            Some(path) => Stdio::from(File::create(path)?),
            None => Stdio::from(log.try_clone()?),
        };

        debug!(command = %invocation.command_line(), "running external tool");
        let status = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::from(log))
            .status()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    AppError::CommandNotFound {
                        command: invocation.program.clone(),
                    }
                } else {
                    AppError::Io(err)
                }
            })?;

        if status.success() {
            Ok(ToolOutcome::success(&invocation.log))
        } else {
            Ok(ToolOutcome::failed(status.code(), &invocation.log))
        }
    }

    fn ensure_available(&self, program: &str) -> Result<()> {
        if exists_command(program) {
            Ok(())
        } else {
            Err(AppError::CommandNotFound {
                command: program.to_string(),
            })
        }
    }
}

pub fn exists_command(cmd: &str) -> bool {
    if Path::new(cmd).exists() {
        return true;
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(cmd))
            .any(|full| full.exists())
    })
}

impl ExternalTools {
    pub fn required_for(&self, strategy: Strategy) -> Vec<&str> {
        let mut programs = vec![self.samtools.as_str()];
        match strategy {
            Strategy::JointOnly => programs.push(&self.freebayes),
            Strategy::PhasedDiploid => programs.push(&self.longshot),
            Strategy::TwoPassJoint => {
                programs.push(&self.longshot);
                programs.push(&self.freebayes);
            }
        }
        programs.push(&self.bgzip);
        programs.push(&self.tabix);
        programs
    }

    pub fn faidx(&self, reference: &Path, log: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.samtools, log)
            .arg("faidx")
            .path_arg(reference)
    }

    pub fn index_alignment(&self, alignment: &Path, log: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.samtools, log)
            .arg("index")
            .path_arg(alignment)
    }

    /// Per-contig longshot call. With `haplotagged` the reads are written back
    /// tagged by haplotype; without it phasing is disabled.
    pub fn longshot(
        &self,
        alignment: &Path,
        reference: &Path,
        contig: &str,
        output: &Path,
        haplotagged: Option<&Path>,
        log: &Path,
    ) -> ToolInvocation {
        let invocation = ToolInvocation::new(&self.longshot, log)
            .arg("--bam")
            .path_arg(alignment)
            .arg("--ref")
            .path_arg(reference)
            .arg("--region")
            .arg(contig)
            .arg("--out")
            .path_arg(output)
            .arg("--force_overwrite");
        match haplotagged {
            Some(path) => invocation.arg("--out_bam").path_arg(path),
            None => invocation.arg("--no_haps"),
        }
    }

    /// Joint freebayes call over one region. A `prior` restricts calling to
    /// the alleles of that variant set.
    #[allow(clippy::too_many_arguments)]
    pub fn freebayes(
        &self,
        alignment: &Path,
        reference: &Path,
        ploidy: u32,
        region: &str,
        prior: Option<&Path>,
        output: &Path,
        log: &Path,
    ) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(&self.freebayes, log)
            .arg("-f")
            .path_arg(reference)
            .arg("-p")
            .arg(ploidy.to_string())
            .arg("-r")
            .arg(region);
        if let Some(path) = prior {
            invocation = invocation.arg("-@").path_arg(path).arg("-l");
        }
        invocation.path_arg(alignment).stdout_to(output)
    }

    pub fn bgzip_to(&self, input: &Path, output: &Path, log: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.bgzip, log)
            .arg("-c")
            .path_arg(input)
            .stdout_to(output)
    }

    pub fn tabix_vcf(&self, path: &Path, log: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.tabix, log)
            .arg("-f")
            .arg("-p")
            .arg("vcf")
            .path_arg(path)
    }
}

pub fn tabix_index_path(compressed: &Path) -> PathBuf {
    let mut path = compressed.as_os_str().to_os_string();
    path.push(".tbi");
    PathBuf::from(path)
}
