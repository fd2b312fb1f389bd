use crate::cli::PipelineArgs;
use crate::config::PipelineConfig;
use crate::dispatch::{self, DispatchPlan, Partition};
use crate::errors::{AppError, Result};
use crate::external_tools::{ProcessRunner, ToolRunner, tabix_index_path};
use crate::filter::{self, FilterStats};
use crate::merge;
use crate::reference::{self, Contig, ReferenceIndex, fai_path};
use crate::stage::{RunLock, StageLedger, StageSpec};
use crate::strategy::Strategy;
use crate::writer::{self, PhaseLog};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

const PREPROCESS: &str = "preprocess";
const FINALIZE: &str = "finalize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Preprocess,
    Call(u8),
    MergeSort(u8),
    Filter(u8),
    Finalize,
    Success,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preprocess => f.write_str(PREPROCESS),
            Self::Call(pass) => write!(f, "call_{pass}"),
            Self::MergeSort(pass) => write!(f, "merge_sort_{pass}"),
            Self::Filter(pass) => write!(f, "filter_{pass}"),
            Self::Finalize => f.write_str(FINALIZE),
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub strategy: Strategy,
    pub final_variants: PathBuf,
    pub phased_variants: Option<PathBuf>,
    pub regions: usize,
    pub final_filter: FilterStats,
    pub states: Vec<PipelineState>,
}

/// Outputs of the preprocess stage every branch starts from.
#[derive(Debug, Clone)]
struct Staged {
    reference: ReferenceIndex,
    region_count: usize,
}

impl Staged {
    fn callable_contigs(&self) -> Vec<Contig> {
        self.reference
            .contigs()
            .iter()
            .filter(|contig| contig.length > 0)
            .cloned()
            .collect()
    }
}

pub fn run(args: &PipelineArgs) -> Result<PipelineReport> {
    let config = PipelineConfig::from_args(args)?;
    run_with_runner(&config, &ProcessRunner)
}

/// Runs the whole pipeline for `config`, driving external tools through
/// `runner`. Any error leaves partial artifacts on disk and no final
/// variant set.
pub fn run_with_runner(config: &PipelineConfig, runner: &dyn ToolRunner) -> Result<PipelineReport> {
    info!(
        strategy = config.strategy.name(),
        passes = config.strategy.calling_passes(),
        strains = config.strains,
        quality = config.quality,
        workers = config.workers,
        output = %config.layout.root.display(),
        "starting pipeline run"
    );
    let _lock = RunLock::acquire(&config.layout.root)?;
    for program in config.tools.required_for(config.strategy) {
        runner.ensure_available(program)?;
    }

    let mut pipeline = Pipeline::new(config, runner);
    match pipeline.execute() {
        Ok(report) => Ok(report),
        Err(err) => {
            let failed_in = pipeline.state;
            pipeline.transition(PipelineState::Failed);
            error!(
                phase = %failed_in,
                log = ?err.log_path(),
                error = %err,
                "pipeline failed"
            );
            Err(err)
        }
    }
}

struct Pipeline<'a> {
    config: &'a PipelineConfig,
    runner: &'a dyn ToolRunner,
    ledger: StageLedger,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<'a> Pipeline<'a> {
    fn new(config: &'a PipelineConfig, runner: &'a dyn ToolRunner) -> Self {
        Self {
            config,
            runner,
            ledger: StageLedger::default(),
            state: PipelineState::Preprocess,
            history: Vec::new(),
        }
    }

    fn transition(&mut self, next: PipelineState) {
        if let Some(previous) = self.history.last() {
            info!(from = %previous, to = %next, "pipeline transition");
        } else {
            info!(to = %next, "pipeline transition");
        }
        self.state = next;
        self.history.push(next);
    }

    /// Region partitions read back from the committed `regions.txt`.
    fn region_partitions(&self) -> Result<Vec<Partition>> {
        let path = self.config.layout.regions();
        writer::require_artifact(PREPROCESS, &path)?;
        let regions = reference::read_region_list(&path)?;
        Ok(dispatch::region_partitions(&regions))
    }

    fn execute(&mut self) -> Result<PipelineReport> {
        self.transition(PipelineState::Preprocess);
        let staged = self.preprocess()?;

        let (filtered, final_filter) = match self.config.strategy {
            Strategy::JointOnly => self.run_joint_only(&staged)?,
            Strategy::PhasedDiploid => self.run_phased_diploid(&staged)?,
            Strategy::TwoPassJoint => self.run_two_pass_joint(&staged)?,
        };

        let last_pass = self.config.strategy.calling_passes();
        let final_variants = self.finalize(last_pass, &filtered)?;
        self.transition(PipelineState::Success);
        info!(
            strategy = self.config.strategy.name(),
            output = %final_variants.display(),
            kept = final_filter.kept,
            "pipeline completed"
        );

        Ok(PipelineReport {
            strategy: self.config.strategy,
            final_variants,
            phased_variants: self
                .config
                .strategy
                .produces_separation()
                .then(|| self.config.layout.phased_variants()),
            regions: staged.region_count,
            final_filter,
            states: self.history.clone(),
        })
    }

    fn preprocess(&mut self) -> Result<Staged> {
        let config = self.config;
        let layout = &config.layout;
        let tools = &config.tools;
        layout.create(config.strategy.produces_separation())?;

        let stage = StageSpec::new(PREPROCESS)
            .input(config.reference.clone())
            .input(config.alignment.clone())
            .output(layout.reference())
            .output(fai_path(&layout.reference()))
            .output(layout.alignment())
            .output(layout.alignment_index())
            .output(layout.regions());
        self.ledger.begin(&stage)?;

        let log = layout.preprocess_log();
        link_input(&config.reference, &layout.reference())?;
        link_input(&config.alignment, &layout.alignment())?;

        self.runner
            .run(&tools.faidx(&layout.reference(), &log))?
            .into_result(PREPROCESS, &format!("{} faidx", tools.samtools))?;
        self.runner
            .run(&tools.index_alignment(&layout.alignment(), &log))?
            .into_result(PREPROCESS, &format!("{} index", tools.samtools))?;

        let reference = ReferenceIndex::load(&layout.reference())?;
        reference.verify_against_sequence()?;

        let regions = reference::region_list(&reference, config.chunk_size);
        reference::write_region_list(&layout.regions(), &regions)?;
        info!(
            contigs = reference.contigs().len(),
            regions = regions.len(),
            chunk_size = config.chunk_size,
            "reference partitioned"
        );

        self.ledger.commit(&stage)?;
        Ok(Staged {
            reference,
            region_count: regions.len(),
        })
    }

    fn run_joint_only(&mut self, staged: &Staged) -> Result<(PathBuf, FilterStats)> {
        let config = self.config;
        let layout = &config.layout;
        let partitions = self.region_partitions()?;
        let outputs = self.call_freebayes(1, &partitions, None)?;

        let merged = layout.merged(1);
        self.merge_sort(1, &outputs, &staged.reference, &merged)?;

        let filtered = layout.filtered(1);
        let stats = self.filter(1, &merged, &filtered)?;
        Ok((filtered, stats))
    }

    fn run_phased_diploid(&mut self, staged: &Staged) -> Result<(PathBuf, FilterStats)> {
        let config = self.config;
        let layout = &config.layout;
        let partitions = dispatch::contig_partitions(&staged.callable_contigs());
        let outputs = self.call_longshot(1, &partitions, true)?;

        let phased = layout.phased_variants();
        self.merge_sort(1, &outputs, &staged.reference, &phased)?;

        let filtered = layout.filtered(1);
        let stats = self.filter(1, &phased, &filtered)?;
        Ok((filtered, stats))
    }

    fn run_two_pass_joint(&mut self, staged: &Staged) -> Result<(PathBuf, FilterStats)> {
        let config = self.config;
        let layout = &config.layout;
        let contigs = dispatch::contig_partitions(&staged.callable_contigs());
        let first_outputs = self.call_longshot(1, &contigs, false)?;

        let first_merged = layout.merged(1);
        self.merge_sort(1, &first_outputs, &staged.reference, &first_merged)?;

        let prior = layout.prior();
        self.filter(1, &first_merged, &prior)?;

        let regions = self.region_partitions()?;
        let second_outputs = self.call_freebayes(2, &regions, Some(&prior))?;

        let second_merged = layout.merged(2);
        self.merge_sort(2, &second_outputs, &staged.reference, &second_merged)?;

        let filtered = layout.filtered(2);
        let stats = self.filter(2, &second_merged, &filtered)?;
        Ok((filtered, stats))
    }

    fn calling_stage(&self, pass: u8, partitions: &[Partition]) -> (StageSpec, DispatchPlan) {
        let layout = &self.config.layout;
        let phase = PipelineState::Call(pass).to_string();
        let work_dir = layout.pass_dir(pass);

        let mut stage = StageSpec::new(&phase)
            .after(&calling_predecessor(pass))
            .input(layout.reference())
            .input(fai_path(&layout.reference()))
            .input(layout.alignment())
            .input(layout.alignment_index())
            .input(layout.regions());
        for partition in partitions {
            stage = stage.output(partition.output_in(&work_dir));
        }

        let plan = DispatchPlan {
            log: layout.phase_log(&phase),
            phase,
            work_dir,
            workers: self.config.workers,
            progress: self.config.progress,
        };
        (stage, plan)
    }

    fn call_longshot(
        &mut self,
        pass: u8,
        partitions: &[Partition],
        haplotag: bool,
    ) -> Result<Vec<PathBuf>> {
        self.transition(PipelineState::Call(pass));
        let (stage, plan) = self.calling_stage(pass, partitions);
        self.ledger.begin(&stage)?;

        let config = self.config;
        let layout = &config.layout;
        let tools = &config.tools;
        let reference = layout.reference();
        let alignment = layout.alignment();
        let outputs = dispatch::dispatch(&plan, partitions, self.runner, |partition, output, log| {
            let haplotagged = haplotag.then(|| layout.haplotagged_alignment(&partition.id));
            tools.longshot(
                &alignment,
                &reference,
                &partition.locus,
                output,
                haplotagged.as_deref(),
                log,
            )
        })?;

        self.ledger.commit(&stage)?;
        Ok(outputs)
    }

    fn call_freebayes(
        &mut self,
        pass: u8,
        partitions: &[Partition],
        prior: Option<&Path>,
    ) -> Result<Vec<PathBuf>> {
        self.transition(PipelineState::Call(pass));
        let (mut stage, plan) = self.calling_stage(pass, partitions);
        if let Some(path) = prior {
            stage = stage.indexed_input(path.to_path_buf());
            info!(prior = %path.display(), "joint calling restricted to prior variants");
        }
        self.ledger.begin(&stage)?;

        let config = self.config;
        let tools = &config.tools;
        let reference = config.layout.reference();
        let alignment = config.layout.alignment();
        let ploidy = config.strains;
        let outputs = dispatch::dispatch(&plan, partitions, self.runner, |partition, output, log| {
            tools.freebayes(
                &alignment,
                &reference,
                ploidy,
                &partition.locus,
                prior,
                output,
                log,
            )
        })?;

        self.ledger.commit(&stage)?;
        Ok(outputs)
    }

    fn merge_sort(
        &mut self,
        pass: u8,
        partitions: &[PathBuf],
        reference: &ReferenceIndex,
        output: &Path,
    ) -> Result<()> {
        self.transition(PipelineState::MergeSort(pass));
        let phase = PipelineState::MergeSort(pass).to_string();
        let mut stage = StageSpec::new(&phase)
            .after(&PipelineState::Call(pass).to_string())
            .indexed_output(output.to_path_buf());
        for partition in partitions {
            stage = stage.input(partition.clone());
        }
        self.ledger.begin(&stage)?;

        let log = self.config.layout.phase_log(&phase);
        let records = merge::merge_to_file(
            partitions,
            reference,
            output,
            &self.config.tools,
            self.runner,
            PhaseLog {
                phase: &phase,
                log: &log,
            },
        )?;
        info!(phase = %phase, records, output = %output.display(), "merge/sort complete");

        self.ledger.commit(&stage)
    }

    fn filter(&mut self, pass: u8, input: &Path, output: &Path) -> Result<FilterStats> {
        self.transition(PipelineState::Filter(pass));
        let phase = PipelineState::Filter(pass).to_string();
        let stage = StageSpec::new(&phase)
            .after(&PipelineState::MergeSort(pass).to_string())
            .indexed_input(input.to_path_buf())
            .indexed_output(output.to_path_buf());
        self.ledger.begin(&stage)?;

        let log = self.config.layout.phase_log(&phase);
        let stats = filter::filter_file(
            input,
            output,
            self.config.quality,
            &self.config.tools,
            self.runner,
            PhaseLog {
                phase: &phase,
                log: &log,
            },
        )?;

        self.ledger.commit(&stage)?;
        Ok(stats)
    }

    fn finalize(&mut self, last_pass: u8, filtered: &Path) -> Result<PathBuf> {
        self.transition(PipelineState::Finalize);
        let destination = self.config.layout.final_variants();
        let stage = StageSpec::new(FINALIZE)
            .after(&PipelineState::Filter(last_pass).to_string())
            .indexed_input(filtered.to_path_buf())
            .indexed_output(destination.clone());
        self.ledger.begin(&stage)?;

        writer::publish_indexed(filtered, &destination)?;
        info!(
            output = %destination.display(),
            index = %tabix_index_path(&destination).display(),
            "final variant set published"
        );

        self.ledger.commit(&stage)?;
        Ok(destination)
    }
}

/// Pass 1 calls on the staged inputs; later passes need the previous
/// pass's filtered set.
fn calling_predecessor(pass: u8) -> String {
    if pass <= 1 {
        PREPROCESS.to_string()
    } else {
        PipelineState::Filter(pass - 1).to_string()
    }
}

/// Places `source` at `destination` as a symlink, replacing whatever a
/// previous run left there.
fn link_input(source: &Path, destination: &Path) -> Result<()> {
    if fs::symlink_metadata(destination).is_ok() {
        fs::remove_file(destination)?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(source, destination)?;
    }
    #[cfg(not(unix))]
    {
        fs::copy(source, destination)?;
    }

    if !destination.exists() {
        return Err(AppError::MissingArtifact {
            stage: PREPROCESS.to_string(),
            path: destination.to_path_buf(),
        });
    }
    Ok(())
}
