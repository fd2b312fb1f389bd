use crate::errors::{AppError, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MIN_RECORD_COLUMNS: usize = 6;

/// One called variant, parsed from a VCF data line.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRecord {
    pub contig: String,
    pub position: u64,
    pub reference: String,
    pub alternate: Vec<String>,
    /// `None` when the caller emitted `.`.
    pub quality: Option<f64>,
    pub genotype: Option<String>,
    pub phased: bool,
}

impl VariantRecord {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let fields = line.split('\t').collect::<Vec<_>>();
        if fields.len() < MIN_RECORD_COLUMNS {
            return Err(format!(
                "expected at least {MIN_RECORD_COLUMNS} columns, found {}",
                fields.len()
            ));
        }

        let contig = fields[0];
        if contig.is_empty() {
            return Err("empty contig name".to_string());
        }
        let position = fields[1]
            .parse::<u64>()
            .map_err(|_| format!("position {:?} is not an integer", fields[1]))?;
        if position == 0 {
            return Err("position must be 1-based".to_string());
        }

        let quality = match fields[5] {
            "." => None,
            raw => {
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| format!("quality {raw:?} is not a number"))?;
                if !value.is_finite() || value < 0.0 {
                    return Err(format!("quality {raw:?} must be a non-negative number"));
                }
                Some(value)
            }
        };

        let genotype = genotype_of(&fields);
        let phased = genotype.as_deref().is_some_and(|gt| gt.contains('|'));

        Ok(Self {
            contig: contig.to_string(),
            position,
            reference: fields[3].to_string(),
            alternate: fields[4]
                .split(',')
                .filter(|allele| !allele.is_empty() && *allele != ".")
                .map(str::to_string)
                .collect(),
            quality,
            genotype,
            phased,
        })
    }

    pub fn passes(&self, threshold: f64) -> bool {
        self.quality.is_some_and(|quality| quality >= threshold)
    }
}

fn genotype_of(fields: &[&str]) -> Option<String> {
    let format = fields.get(8)?;
    let sample = fields.get(9)?;
    let gt_index = format.split(':').position(|key| key == "GT")?;
    sample
        .split(':')
        .nth(gt_index)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn is_header_line(line: &str) -> bool {
    line.starts_with('#')
}

/// Opens a VCF for line reading, transparently decoding gzip/bgzip content.
pub fn open_variant_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let read = read_prefix(&mut file, &mut magic)?;
    let file = File::open(path)?;
    if read == magic.len() && magic == GZIP_MAGIC {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

pub(crate) fn record_error(source_name: &str, line: usize, reason: String) -> AppError {
    AppError::InvalidRecord {
        source_name: source_name.to_string(),
        line,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::{VariantRecord, open_variant_reader};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{BufRead, Write};

    #[test]
    fn parses_phased_sample_genotype() {
        let record = VariantRecord::parse(
            "chr1\t1042\t.\tA\tG,T\t87.5\tPASS\tDP=20\tGT:GQ:PS\t0|1:40:1000",
        )
        .expect("expected record parse");
        assert_eq!(record.contig, "chr1");
        assert_eq!(record.position, 1042);
        assert_eq!(record.alternate, vec!["G".to_string(), "T".to_string()]);
        assert_eq!(record.quality, Some(87.5));
        assert_eq!(record.genotype.as_deref(), Some("0|1"));
        assert!(record.phased);
    }

    #[test]
    fn missing_quality_never_passes() {
        let record = VariantRecord::parse("chr1\t5\t.\tA\tC\t.\tPASS\t.")
            .expect("expected record parse");
        assert_eq!(record.quality, None);
        assert!(!record.passes(0.0));
        assert!(record.genotype.is_none());
        assert!(!record.phased);
    }

    #[test]
    fn threshold_is_inclusive() {
        let record = VariantRecord::parse("chr1\t5\t.\tA\tC\t50\tPASS\t.")
            .expect("expected record parse");
        assert!(record.passes(50.0));
        assert!(!record.passes(50.01));
    }

    #[test]
    fn rejects_negative_quality_and_zero_position() {
        assert!(VariantRecord::parse("chr1\t5\t.\tA\tC\t-3\tPASS\t.").is_err());
        assert!(VariantRecord::parse("chr1\t0\t.\tA\tC\t30\tPASS\t.").is_err());
        assert!(VariantRecord::parse("chr1\t5\t.\tA").is_err());
    }

    #[test]
    fn reads_gzip_and_plain_files_alike() {
        let dir = tempfile::tempdir().expect("expected tempdir");
        let plain = dir.path().join("plain.vcf");
        let packed = dir.path().join("packed.vcf.gz");
        let body = "##fileformat=VCFv4.2\nchr1\t5\t.\tA\tC\t30\tPASS\t.\n";
        std::fs::write(&plain, body).expect("expected plain write");

        let mut encoder = GzEncoder::new(
            std::fs::File::create(&packed).expect("expected gz create"),
            Compression::default(),
        );
        encoder.write_all(body.as_bytes()).expect("expected gz write");
        encoder.finish().expect("expected gz finish");

        for path in [&plain, &packed] {
            let lines = open_variant_reader(path)
                .expect("expected reader")
                .lines()
                .collect::<std::io::Result<Vec<_>>>()
                .expect("expected lines");
            assert_eq!(lines.len(), 2);
            assert!(lines[1].starts_with("chr1\t5"));
        }
    }
}
