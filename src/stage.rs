use crate::errors::{AppError, Result};
use crate::external_tools::tabix_index_path;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PREPROCESS_DIR: &str = "00-preprocess";
pub const VARIANTS_DIR: &str = "10-variants";
pub const SEPARATION_DIR: &str = "20-separation";
const LOCK_FILE: &str = ".strainsep.lock";

/// Stage-numbered directory layout under the output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    pub root: PathBuf,
    pub preprocess: PathBuf,
    pub variants: PathBuf,
    pub separation: PathBuf,
}

impl StageLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            preprocess: root.join(PREPROCESS_DIR),
            variants: root.join(VARIANTS_DIR),
            separation: root.join(SEPARATION_DIR),
        }
    }

    pub fn reference(&self) -> PathBuf {
        self.preprocess.join("reference.fasta")
    }

    pub fn alignment(&self) -> PathBuf {
        self.preprocess.join("alignment.bam")
    }

    pub fn alignment_index(&self) -> PathBuf {
        self.preprocess.join("alignment.bam.bai")
    }

    pub fn regions(&self) -> PathBuf {
        self.preprocess.join("regions.txt")
    }

    pub fn preprocess_log(&self) -> PathBuf {
        self.preprocess.join("preprocess.log")
    }

    pub fn logs(&self) -> PathBuf {
        self.variants.join("logs")
    }

    pub fn phase_log(&self, phase: &str) -> PathBuf {
        self.logs().join(format!("{phase}.log"))
    }

    pub fn work(&self) -> PathBuf {
        self.variants.join("work")
    }

    pub fn pass_dir(&self, pass: u8) -> PathBuf {
        self.work().join(format!("pass{pass}"))
    }

    pub fn merged(&self, pass: u8) -> PathBuf {
        self.work().join(format!("merged_{pass}.vcf.gz"))
    }

    pub fn filtered(&self, pass: u8) -> PathBuf {
        self.work().join(format!("filtered_{pass}.vcf.gz"))
    }

    pub fn prior(&self) -> PathBuf {
        self.work().join("prior.vcf.gz")
    }

    pub fn final_variants(&self) -> PathBuf {
        self.variants.join("variants.vcf.gz")
    }

    pub fn phased_variants(&self) -> PathBuf {
        self.separation.join("phased.vcf.gz")
    }

    pub fn haplotagged_alignment(&self, partition_id: &str) -> PathBuf {
        self.separation.join(format!("{partition_id}.bam"))
    }

    pub fn create(&self, with_separation: bool) -> Result<()> {
        fs::create_dir_all(&self.preprocess)?;
        fs::create_dir_all(self.logs())?;
        fs::create_dir_all(self.work())?;
        if with_separation {
            fs::create_dir_all(&self.separation)?;
        }
        Ok(())
    }
}

/// A phase with the artifacts it consumes and produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub requires: Option<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl StageSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn after(mut self, stage: &str) -> Self {
        self.requires = Some(stage.to_string());
        self
    }

    pub fn input(mut self, path: PathBuf) -> Self {
        self.inputs.push(path);
        self
    }

    pub fn output(mut self, path: PathBuf) -> Self {
        self.outputs.push(path);
        self
    }

    /// Declares a compressed variant set together with its tabix index.
    pub fn indexed_output(self, path: PathBuf) -> Self {
        let index = tabix_index_path(&path);
        self.output(path).output(index)
    }

    pub fn indexed_input(self, path: PathBuf) -> Self {
        let index = tabix_index_path(&path);
        self.input(path).input(index)
    }
}

/// Record of committed stages; enforces predecessor and artifact checks.
#[derive(Debug, Default)]
pub struct StageLedger {
    committed: Vec<String>,
}

impl StageLedger {
    pub fn begin(&self, stage: &StageSpec) -> Result<()> {
        if let Some(requires) = &stage.requires
            && !self.is_committed(requires)
        {
            return Err(AppError::StageOrder {
                stage: stage.name.clone(),
                requires: requires.clone(),
            });
        }
        for input in &stage.inputs {
            if !input.exists() {
                return Err(AppError::MissingArtifact {
                    stage: stage.name.clone(),
                    path: input.clone(),
                });
            }
        }
        debug!(stage = %stage.name, inputs = stage.inputs.len(), "stage inputs present");
        Ok(())
    }

    pub fn commit(&mut self, stage: &StageSpec) -> Result<()> {
        for output in &stage.outputs {
            if !output.exists() {
                return Err(AppError::MissingArtifact {
                    stage: stage.name.clone(),
                    path: output.clone(),
                });
            }
        }
        self.committed.push(stage.name.clone());
        info!(stage = %stage.name, outputs = stage.outputs.len(), "stage committed");
        Ok(())
    }

    pub fn is_committed(&self, stage: &str) -> bool {
        self.committed.iter().any(|name| name == stage)
    }

    pub fn committed(&self) -> &[String] {
        &self.committed
    }
}

/// Exclusive claim on an output root for the lifetime of one run.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AppError::OutputInUse {
                    root: root.to_path_buf(),
                    lock: path,
                });
            }
            Err(err) => return Err(AppError::Io(err)),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to release output lock");
        }
    }
}
