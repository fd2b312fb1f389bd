use crate::errors::Result;
use crate::external_tools::{ExternalTools, ToolRunner};
use crate::variant::{VariantRecord, is_header_line, open_variant_reader, record_error};
use crate::writer::{self, PhaseLog};
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub header_lines: u64,
    pub kept: u64,
    pub dropped: u64,
}

/// Copies header lines and every record whose quality is at least
/// `threshold`, one line at a time. Records keep their input order.
pub fn filter_stream<R: BufRead, W: Write + ?Sized>(
    mut reader: R,
    writer: &mut W,
    threshold: f64,
    source_name: &str,
) -> Result<FilterStats> {
    let mut stats = FilterStats::default();
    let mut buf = String::new();
    let mut line_number = 0usize;

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        line_number += 1;
        let line = buf.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }

        if is_header_line(line) {
            stats.header_lines += 1;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            continue;
        }

        let record = VariantRecord::parse(line)
            .map_err(|reason| record_error(source_name, line_number, reason))?;
        if record.passes(threshold) {
            stats.kept += 1;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
        } else {
            stats.dropped += 1;
        }
    }

    Ok(stats)
}

/// Filters `input` into a bgzip-compressed, tabix-indexed `output`.
pub fn filter_file(
    input: &Path,
    output: &Path,
    threshold: f64,
    tools: &ExternalTools,
    runner: &dyn ToolRunner,
    phase: PhaseLog<'_>,
) -> Result<FilterStats> {
    writer::require_artifact(phase.phase, input)?;
    let reader = open_variant_reader(input)?;
    let source_name = input.display().to_string();

    let stats = writer::with_indexed_vcf_writer(output, tools, runner, phase, |out| {
        filter_stream(reader, out, threshold, &source_name)
    })?;

    info!(
        phase = phase.phase,
        input = %input.display(),
        output = %output.display(),
        threshold,
        kept = stats.kept,
        dropped = stats.dropped,
        "quality filter complete"
    );
    Ok(stats)
}
