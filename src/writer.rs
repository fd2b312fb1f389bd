use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::errors::{AppError, Result};
use crate::external_tools::{ExternalTools, ToolRunner, tabix_index_path};
use tempfile::Builder;
use tracing::info;

/// Where compression and indexing failures get reported.
#[derive(Debug, Clone, Copy)]
pub struct PhaseLog<'a> {
    pub phase: &'a str,
    pub log: &'a Path,
}

/// Streams plain VCF text through `write_fn`, compresses it with bgzip into
/// `output` and builds its tabix index.
pub fn with_indexed_vcf_writer<F, T>(
    output: &Path,
    tools: &ExternalTools,
    runner: &dyn ToolRunner,
    phase: PhaseLog<'_>,
    write_fn: F,
) -> Result<T>
where
    F: FnOnce(&mut dyn Write) -> Result<T>,
{
    let parent_dir = output.parent().unwrap_or_else(|| Path::new("."));
    let plain_file = Builder::new()
        .prefix(".strainsep_")
        .suffix(".vcf")
        .tempfile_in(parent_dir)?;

    let value = {
        let mut buf = BufWriter::new(plain_file.as_file());
        let value = write_fn(&mut buf)?;
        buf.flush()?;
        value
    };

    compress_and_index(plain_file.path(), output, tools, runner, phase)?;
    Ok(value)
}

pub fn compress_and_index(
    plain: &Path,
    output: &Path,
    tools: &ExternalTools,
    runner: &dyn ToolRunner,
    phase: PhaseLog<'_>,
) -> Result<()> {
    runner
        .run(&tools.bgzip_to(plain, output, phase.log))?
        .into_result(phase.phase, &tools.bgzip)?;
    require_artifact(phase.phase, output)?;

    runner
        .run(&tools.tabix_vcf(output, phase.log))?
        .into_result(phase.phase, &tools.tabix)?;
    require_artifact(phase.phase, &tabix_index_path(output))?;

    info!(output = %output.display(), phase = phase.phase, "compressed and indexed variants");
    Ok(())
}

pub fn require_artifact(stage: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(AppError::MissingArtifact {
            stage: stage.to_string(),
            path: path.to_path_buf(),
        })
    }
}

/// Publishes an indexed variant set under its final name. The source stays
/// in place; the copy only becomes visible once complete.
///
/// The index lands first, so a visible data file always has its index.
pub fn publish_indexed(source: &Path, destination: &Path) -> Result<()> {
    let parent_dir = destination.parent().unwrap_or_else(|| Path::new("."));
    let pairs = [
        (tabix_index_path(source), tabix_index_path(destination)),
        (source.to_path_buf(), destination.to_path_buf()),
    ];

    let mut staged = Vec::with_capacity(pairs.len());
    for (from, to) in &pairs {
        let temp = Builder::new()
            .prefix(".strainsep_publish_")
            .tempfile_in(parent_dir)?;
        {
            let mut input = File::open(from)?;
            let mut out = BufWriter::new(temp.as_file());
            std::io::copy(&mut input, &mut out)?;
            out.flush()?;
        }
        staged.push((temp, to.clone()));
    }

    let mut persisted = Vec::with_capacity(staged.len());
    for (temp, to) in staged {
        if let Err(err) = temp.persist(&to) {
            for path in &persisted {
                let _ = fs::remove_file(path);
            }
            return Err(AppError::Io(err.error));
        }
        persisted.push(to);
    }
    info!(destination = %destination.display(), "published indexed variant set");
    Ok(())
}
