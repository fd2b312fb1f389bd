use crate::errors::Result;
use crate::external_tools::{ExternalTools, ToolRunner};
use crate::reference::ReferenceIndex;
use crate::variant::{VariantRecord, is_header_line, open_variant_reader, record_error};
use crate::writer::{self, PhaseLog};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderedLine {
    rank: usize,
    position: u64,
    line: String,
}

/// All partition records in reference order under a single header block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedVariantSet {
    pub header: Vec<String>,
    records: Vec<OrderedLine>,
}

impl MergedVariantSet {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_lines(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.line.as_str())
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        for line in &self.header {
            out.write_all(line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        for record in &self.records {
            out.write_all(record.line.as_bytes())?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Reads the partition outputs in the given order, keeps the first header
/// block and sorts records by (contig rank, position). The sort is stable,
/// so equal keys keep partition order.
pub fn merge_partitions(
    stage: &str,
    partitions: &[PathBuf],
    reference: &ReferenceIndex,
) -> Result<MergedVariantSet> {
    let mut merged = MergedVariantSet::default();

    for path in partitions {
        writer::require_artifact(stage, path)?;
        let header = read_partition(path, reference, &mut merged.records)?;
        if merged.header.is_empty() && !header.is_empty() {
            merged.header = header;
        }
    }

    merged
        .records
        .sort_by(|left, right| (left.rank, left.position).cmp(&(right.rank, right.position)));

    info!(
        stage,
        partitions = partitions.len(),
        records = merged.records.len(),
        "merged partition outputs"
    );
    Ok(merged)
}

fn read_partition(
    path: &Path,
    reference: &ReferenceIndex,
    records: &mut Vec<OrderedLine>,
) -> Result<Vec<String>> {
    let source_name = path.display().to_string();
    let mut reader = open_variant_reader(path)?;
    let mut header = Vec::new();
    let mut buf = String::new();
    let mut line_number = 0usize;

    loop {
        buf.clear();
        if reader.read_line(&mut buf)? == 0 {
            break;
        }
        line_number += 1;
        let line = buf.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        if is_header_line(line) {
            header.push(line.to_string());
            continue;
        }

        let record = VariantRecord::parse(line)
            .map_err(|reason| record_error(&source_name, line_number, reason))?;
        let Some(rank) = reference.rank(&record.contig) else {
            return Err(record_error(
                &source_name,
                line_number,
                format!("contig {} is not in the reference index", record.contig),
            ));
        };
        let length = reference.contigs()[rank].length;
        if record.position > length {
            return Err(record_error(
                &source_name,
                line_number,
                format!(
                    "position {} lies outside {} (length {length})",
                    record.position, record.contig
                ),
            ));
        }

        records.push(OrderedLine {
            rank,
            position: record.position,
            line: line.to_string(),
        });
    }

    Ok(header)
}

/// Merges `partitions` into a compressed, indexed `output`.
pub fn merge_to_file(
    partitions: &[PathBuf],
    reference: &ReferenceIndex,
    output: &Path,
    tools: &ExternalTools,
    runner: &dyn ToolRunner,
    phase: PhaseLog<'_>,
) -> Result<usize> {
    let merged = merge_partitions(phase.phase, partitions, reference)?;
    writer::with_indexed_vcf_writer(output, tools, runner, phase, |out| merged.write_to(out))?;
    Ok(merged.len())
}

#[cfg(test)]
mod tests {
    use super::merge_partitions;
    use crate::errors::AppError;
    use crate::reference::ReferenceIndex;
    use std::fs;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};

    const HEADER_A: &str = "##fileformat=VCFv4.2\n##source=partA\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n";
    const HEADER_B: &str = "##fileformat=VCFv4.2\n##source=partB\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n";

    fn reference() -> ReferenceIndex {
        ReferenceIndex::from_reader(
            Path::new("ref.fa"),
            Path::new("ref.fa.fai"),
            Cursor::new("chr2\t1000\t6\t60\t61\nchr10\t500\t1030\t60\t61\nchr1\t800\t1545\t60\t61\n".to_string()),
        )
        .expect("expected index parse success")
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).expect("expected partition write");
        path
    }

    fn record(contig: &str, position: u64, qual: u32) -> String {
        format!("{contig}\t{position}\t.\tA\tC\t{qual}\tPASS\t.\n")
    }

    #[test]
    fn orders_by_reference_rank_then_position() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let first = write(
            dir.path(),
            "chr1.vcf",
            &format!("{HEADER_A}{}{}", record("chr1", 40, 30), record("chr1", 7, 30)),
        );
        let second = write(
            dir.path(),
            "chr10.vcf",
            &format!("{HEADER_B}{}", record("chr10", 300, 30)),
        );
        let third = write(
            dir.path(),
            "chr2.vcf",
            &format!("{HEADER_B}{}{}", record("chr2", 900, 30), record("chr2", 12, 30)),
        );

        let merged = merge_partitions("merge_sort_1", &[first, second, third], &reference())
            .expect("expected merge success");
        let keys = merged
            .record_lines()
            .map(|line| {
                let mut fields = line.split('\t');
                let contig = fields.next().expect("contig").to_string();
                let position = fields.next().expect("position").to_string();
                format!("{contig}:{position}")
            })
            .collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec!["chr2:12", "chr2:900", "chr10:300", "chr1:7", "chr1:40"]
        );
    }

    #[test]
    fn keeps_only_the_first_header_block() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let empty = write(dir.path(), "empty.vcf", "");
        let first = write(dir.path(), "a.vcf", &format!("{HEADER_A}{}", record("chr2", 5, 30)));
        let second = write(dir.path(), "b.vcf", &format!("{HEADER_B}{}", record("chr1", 5, 30)));

        let merged = merge_partitions("merge_sort_1", &[empty, first, second], &reference())
            .expect("expected merge success");
        let mut out = Vec::new();
        merged.write_to(&mut out).expect("expected write success");
        let text = String::from_utf8(out).expect("expected utf8");
        assert_eq!(text.matches("#CHROM").count(), 1);
        assert!(text.contains("##source=partA"));
        assert!(!text.contains("##source=partB"));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn equal_keys_keep_partition_order() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let first = write(dir.path(), "a.vcf", &format!("{HEADER_A}{}", record("chr2", 5, 11)));
        let second = write(dir.path(), "b.vcf", &format!("{HEADER_A}{}", record("chr2", 5, 22)));

        let merged = merge_partitions("merge_sort_1", &[first, second], &reference())
            .expect("expected merge success");
        let lines = merged.record_lines().collect::<Vec<_>>();
        assert!(lines[0].contains("\t11\t"));
        assert!(lines[1].contains("\t22\t"));
    }

    #[test]
    fn merging_twice_is_byte_identical() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let parts = vec![
            write(
                dir.path(),
                "a.vcf",
                &format!("{HEADER_A}{}{}", record("chr1", 9, 30), record("chr2", 3, 30)),
            ),
            write(dir.path(), "b.vcf", &format!("{HEADER_B}{}", record("chr10", 1, 30))),
        ];
        let render = || {
            let mut out = Vec::new();
            merge_partitions("merge_sort_1", &parts, &reference())
                .expect("expected merge success")
                .write_to(&mut out)
                .expect("expected write success");
            out
        };
        assert_eq!(render(), render());
    }

    #[test]
    fn absent_partition_is_a_missing_artifact() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let present = write(dir.path(), "a.vcf", HEADER_A);
        let absent = dir.path().join("chr10.vcf");
        let result = merge_partitions("merge_sort_1", &[present, absent.clone()], &reference());
        match result {
            Err(AppError::MissingArtifact { path, .. }) => assert_eq!(path, absent),
            other => panic!("expected missing artifact, got {other:?}"),
        }
    }

    #[test]
    fn rejects_positions_outside_contig_bounds() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let beyond = write(dir.path(), "a.vcf", &format!("{HEADER_A}{}", record("chr10", 501, 30)));
        assert!(matches!(
            merge_partitions("merge_sort_1", &[beyond], &reference()),
            Err(AppError::InvalidRecord { .. })
        ));

        let unknown = write(dir.path(), "b.vcf", &format!("{HEADER_A}{}", record("chrUn", 1, 30)));
        assert!(matches!(
            merge_partitions("merge_sort_1", &[unknown], &reference()),
            Err(AppError::InvalidRecord { .. })
        ));
    }
}
