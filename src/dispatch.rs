use crate::errors::{AppError, Result};
use crate::external_tools::{ToolInvocation, ToolRunner, ToolStatus};
use crate::reference::{Contig, Region};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::{Builder, NamedTempFile};
use tracing::{error, info, warn};

const LOG_CHANNEL_FACTOR: usize = 2;
const LOG_RECV_TIMEOUT: Duration = Duration::from_secs(30);

/// A unit of parallel calling work: a whole contig or one region of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// File-name safe identifier; names the partition's output.
    pub id: String,
    pub contig: String,
    /// Locus string handed to the caller.
    pub locus: String,
}

impl Partition {
    pub fn contig(contig: &Contig) -> Self {
        Self {
            id: sanitize_id(&contig.name),
            contig: contig.name.clone(),
            locus: contig.name.clone(),
        }
    }

    pub fn region(region: &Region) -> Self {
        let locus = region.to_string();
        Self {
            id: sanitize_id(&locus),
            contig: region.contig.clone(),
            locus,
        }
    }

    pub fn output_in(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.vcf", self.id))
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.replace([':', '-', '/', '\\', '|', '*', ' '], "_")
}

pub fn contig_partitions(contigs: &[Contig]) -> Vec<Partition> {
    disambiguate(contigs.iter().map(Partition::contig).collect())
}

pub fn region_partitions(regions: &[Region]) -> Vec<Partition> {
    disambiguate(regions.iter().map(Partition::region).collect())
}

fn disambiguate(mut partitions: Vec<Partition>) -> Vec<Partition> {
    let mut seen = HashSet::new();
    for (index, partition) in partitions.iter_mut().enumerate() {
        let base = partition.id.clone();
        let mut suffix = index;
        while !seen.insert(partition.id.clone()) {
            partition.id = format!("{base}_{suffix}");
            suffix += 1;
        }
    }
    partitions
}

#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub phase: String,
    /// Receives one `<partition id>.vcf` per partition.
    pub work_dir: PathBuf,
    /// Aggregated log for the whole phase.
    pub log: PathBuf,
    pub workers: usize,
    pub progress: bool,
}

#[derive(Debug)]
struct PartitionLog {
    index: usize,
    partition: Partition,
    status: String,
    capture: NamedTempFile,
}

/// Runs one invocation per partition on a pool of `plan.workers` threads and
/// returns the partition outputs in partition order once all have finished.
///
/// The first failure stops new launches; invocations already running are
/// allowed to finish. Nothing is retried.
pub fn dispatch<F>(
    plan: &DispatchPlan,
    partitions: &[Partition],
    runner: &dyn ToolRunner,
    build: F,
) -> Result<Vec<PathBuf>>
where
    F: Fn(&Partition, &Path, &Path) -> ToolInvocation + Sync,
{
    fs::create_dir_all(&plan.work_dir)?;
    if let Some(parent) = plan.log.parent() {
        fs::create_dir_all(parent)?;
    }

    let outputs = partitions
        .iter()
        .map(|partition| partition.output_in(&plan.work_dir))
        .collect::<Vec<_>>();
    let work = partitions
        .iter()
        .zip(outputs.iter())
        .enumerate()
        .collect::<Vec<_>>();

    let workers = plan.workers.max(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|err| {
            AppError::Io(std::io::Error::other(format!(
                "failed to initialize rayon thread pool: {err}"
            )))
        })?;
    info!(
        phase = %plan.phase,
        partitions = partitions.len(),
        workers,
        log = %plan.log.display(),
        "dispatching partitions"
    );

    let channel_capacity = (workers * LOG_CHANNEL_FACTOR).max(4);
    let (log_sender, log_receiver) = bounded::<PartitionLog>(channel_capacity);
    let writer_log = plan.log.clone();
    let expected_logs = partitions.len();
    let writer_handle =
        thread::spawn(move || write_ordered_logs(&writer_log, expected_logs, log_receiver));

    let progress = DispatchProgress::new(plan.progress, &plan.phase, partitions.len());
    let abort = AtomicBool::new(false);
    let started = Instant::now();

    let worker_result = pool.install(|| {
        work.par_iter().try_for_each_init(
            || log_sender.clone(),
            |tx, (index, (partition, output))| -> Result<()> {
                if abort.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let result = run_partition(plan, runner, &build, *index, partition, output, tx);
                progress.on_finished();
                if let Err(err) = &result {
                    abort.store(true, Ordering::SeqCst);
                    error!(
                        phase = %plan.phase,
                        partition = %partition.locus,
                        error = %err,
                        "partition failed; no further partitions will be launched"
                    );
                }
                result
            },
        )
    });
    drop(log_sender);

    let writer_result = writer_handle.join().map_err(|_| {
        AppError::Io(std::io::Error::other("phase log writer thread panicked"))
    })?;
    progress.finish();

    if let Err(error) = worker_result {
        if let Err(writer_error) = writer_result {
            warn!(
                worker_error = %error,
                writer_error = %writer_error,
                "phase log could not be completed after partition failure"
            );
        }
        return Err(error);
    }
    writer_result?;

    info!(
        phase = %plan.phase,
        partitions = partitions.len(),
        elapsed_ms = started.elapsed().as_millis(),
        "all partitions completed"
    );
    Ok(outputs)
}

fn run_partition<F>(
    plan: &DispatchPlan,
    runner: &dyn ToolRunner,
    build: &F,
    index: usize,
    partition: &Partition,
    output: &Path,
    tx: &crossbeam_channel::Sender<PartitionLog>,
) -> Result<()>
where
    F: Fn(&Partition, &Path, &Path) -> ToolInvocation,
{
    let capture = Builder::new()
        .prefix(&format!(".{}_", partition.id))
        .suffix(".log")
        .tempfile_in(&plan.work_dir)?;
    let invocation = build(partition, output, capture.path());
    let outcome = runner.run(&invocation);

    let status = match &outcome {
        Ok(outcome) => match outcome.status {
            ToolStatus::Success => "ok".to_string(),
            ToolStatus::Failed { code } => format!("failed (exit: {code:?})"),
        },
        Err(err) => format!("error: {err}"),
    };
    let message = PartitionLog {
        index,
        partition: partition.clone(),
        status,
        capture,
    };
    if tx.send(message).is_err() {
        warn!(partition = %partition.locus, "phase log writer is gone; partition log dropped");
    }

    let outcome = outcome?;
    if let ToolStatus::Failed { code } = outcome.status {
        return Err(AppError::ToolFailed {
            phase: plan.phase.clone(),
            target: partition.locus.clone(),
            code,
            log: plan.log.clone(),
        });
    }
    if !output.is_file() {
        return Err(AppError::MissingArtifact {
            stage: plan.phase.clone(),
            path: output.to_path_buf(),
        });
    }
    Ok(())
}

/// Appends partition logs to the phase log in partition order. Logs of
/// partitions that never ran are simply absent.
fn write_ordered_logs(
    path: &Path,
    expected: usize,
    receiver: Receiver<PartitionLog>,
) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut out = BufWriter::new(file);
    let mut pending = HashMap::new();
    let mut next_expected = 0usize;
    let mut wait_cycles = 0u64;

    loop {
        match receiver.recv_timeout(LOG_RECV_TIMEOUT) {
            Ok(message) => {
                wait_cycles = 0;
                pending.insert(message.index, message);
                while let Some(ordered) = pending.remove(&next_expected) {
                    append_partition_log(&mut out, &ordered)?;
                    next_expected += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                wait_cycles += 1;
                info!(
                    log = %path.display(),
                    next_expected,
                    expected,
                    pending = pending.len(),
                    waited_seconds = wait_cycles * LOG_RECV_TIMEOUT.as_secs(),
                    "partitions still running"
                );
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let mut leftovers = pending.into_values().collect::<Vec<_>>();
    leftovers.sort_by_key(|message| message.index);
    for message in &leftovers {
        append_partition_log(&mut out, message)?;
    }
    out.flush()?;
    Ok(())
}

fn append_partition_log(out: &mut dyn Write, message: &PartitionLog) -> Result<()> {
    writeln!(
        out,
        "### {} [{}] {}",
        message.partition.id, message.partition.locus, message.status
    )?;
    let mut input = File::open(message.capture.path())?;
    std::io::copy(&mut input, out)?;
    Ok(())
}

#[derive(Debug)]
struct DispatchProgress {
    progress_bar: Option<ProgressBar>,
}

impl DispatchProgress {
    fn new(enabled: bool, phase: &str, total: usize) -> Self {
        let progress_bar = enabled.then(|| {
            let bar = ProgressBar::new(total as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(4));
            let style = ProgressStyle::with_template(
                "{spinner:.green} {elapsed_precise} [{bar:30}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.set_message(phase.to_string());
            bar
        });
        Self { progress_bar }
    }

    fn on_finished(&self) {
        if let Some(bar) = &self.progress_bar {
            bar.inc(1);
        }
    }

    fn finish(&self) {
        if let Some(bar) = &self.progress_bar {
            bar.finish();
        }
    }
}

impl Drop for DispatchProgress {
    fn drop(&mut self) {
        if let Some(bar) = &self.progress_bar
            && !bar.is_finished()
        {
            bar.finish_and_clear();
        }
    }
}
