use crate::errors::{AppError, Result};
use bio::io::fasta;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_CHUNK_SIZE: u64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contig {
    pub name: String,
    pub length: u64,
    pub offset: u64,
}

/// Contig table of a reference sequence, in `.fai` order.
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    pub sequence: PathBuf,
    contigs: Vec<Contig>,
    ranks: HashMap<String, usize>,
}

/// Half-open, 0-based interval on one contig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub contig: String,
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub fn parse(raw: &str) -> Option<Self> {
        let (contig, span) = raw.trim().rsplit_once(':')?;
        let (start, end) = span.split_once('-')?;
        let start = start.parse::<u64>().ok()?;
        let end = end.parse::<u64>().ok()?;
        if contig.is_empty() || end <= start {
            return None;
        }
        Some(Self {
            contig: contig.to_string(),
            start,
            end,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}-{}", self.contig, self.start, self.end)
    }
}

pub fn fai_path(sequence: &Path) -> PathBuf {
    let mut path = sequence.as_os_str().to_os_string();
    path.push(".fai");
    PathBuf::from(path)
}

impl ReferenceIndex {
    pub fn load(sequence: &Path) -> Result<Self> {
        let index_path = fai_path(sequence);
        let file = File::open(&index_path).map_err(|err| AppError::InvalidIndex {
            path: index_path.clone(),
            reason: err.to_string(),
        })?;
        Self::from_reader(sequence, &index_path, BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(sequence: &Path, index_path: &Path, reader: R) -> Result<Self> {
        let mut contigs = Vec::new();
        let mut ranks = HashMap::new();

        for (line_index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.trim().is_empty() {
                continue;
            }
            let invalid = |reason: &str| AppError::InvalidIndex {
                path: index_path.to_path_buf(),
                reason: format!("line {}: {reason}", line_index + 1),
            };

            let fields = trimmed.split('\t').collect::<Vec<_>>();
            if fields.len() < 5 {
                return Err(invalid("expected 5 tab-separated columns"));
            }
            let length = fields[1]
                .parse::<u64>()
                .map_err(|_| invalid("length is not an integer"))?;
            let offset = fields[2]
                .parse::<u64>()
                .map_err(|_| invalid("offset is not an integer"))?;
            let name = fields[0].to_string();
            if ranks.insert(name.clone(), contigs.len()).is_some() {
                return Err(invalid(&format!("duplicate contig {name}")));
            }
            contigs.push(Contig {
                name,
                length,
                offset,
            });
        }

        if contigs.is_empty() {
            return Err(AppError::InvalidIndex {
                path: index_path.to_path_buf(),
                reason: "index lists no contigs".to_string(),
            });
        }

        Ok(Self {
            sequence: sequence.to_path_buf(),
            contigs,
            ranks,
        })
    }

    pub fn contigs(&self) -> &[Contig] {
        &self.contigs
    }

    pub fn rank(&self, contig: &str) -> Option<usize> {
        self.ranks.get(contig).copied()
    }

    pub fn length(&self, contig: &str) -> Option<u64> {
        self.rank(contig).map(|rank| self.contigs[rank].length)
    }

    /// Opens the sequence through its index and checks that both agree on
    /// contig names, lengths and that every contig is fetchable.
    pub fn verify_against_sequence(&self) -> Result<()> {
        let index_path = fai_path(&self.sequence);
        let mut reader =
            fasta::IndexedReader::from_file(&self.sequence).map_err(|err| AppError::InvalidIndex {
                path: index_path.clone(),
                reason: format!("failed to open indexed reference: {err}"),
            })?;

        let sequences = reader.index.sequences();
        if sequences.len() != self.contigs.len() {
            return Err(AppError::InvalidIndex {
                path: index_path,
                reason: format!(
                    "index lists {} contigs but reader sees {}",
                    self.contigs.len(),
                    sequences.len()
                ),
            });
        }

        let mut first_base = Vec::with_capacity(1);
        for (contig, sequence) in self.contigs.iter().zip(sequences.iter()) {
            if contig.name != sequence.name || contig.length != sequence.len {
                return Err(AppError::InvalidIndex {
                    path: index_path,
                    reason: format!(
                        "contig {} ({} bp) does not match {} ({} bp)",
                        contig.name, contig.length, sequence.name, sequence.len
                    ),
                });
            }
            if contig.length == 0 {
                continue;
            }
            first_base.clear();
            reader
                .fetch(&contig.name, 0, 1)
                .and_then(|_| reader.read(&mut first_base))
                .map_err(|err| AppError::InvalidIndex {
                    path: index_path.clone(),
                    reason: format!("cannot fetch {}: {err}", contig.name),
                })?;
            if first_base.len() != 1 {
                return Err(AppError::InvalidIndex {
                    path: index_path,
                    reason: format!("contig {} is empty in the sequence file", contig.name),
                });
            }
        }

        info!(
            reference = %self.sequence.display(),
            contigs = self.contigs.len(),
            "reference index verified"
        );
        Ok(())
    }
}

/// Splits every contig into consecutive chunks of at most `chunk_size` bases.
pub fn region_list(index: &ReferenceIndex, chunk_size: u64) -> Vec<Region> {
    let chunk_size = chunk_size.max(1);
    let mut regions = Vec::new();
    for contig in index.contigs() {
        let mut start = 0u64;
        while start < contig.length {
            let end = start.saturating_add(chunk_size).min(contig.length);
            regions.push(Region {
                contig: contig.name.clone(),
                start,
                end,
            });
            start = end;
        }
    }
    regions
}

pub fn write_region_list(path: &Path, regions: &[Region]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for region in regions {
        writeln!(out, "{region}")?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_region_list(path: &Path) -> Result<Vec<Region>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            Region::parse(line).ok_or_else(|| AppError::InvalidRecord {
                source_name: path.display().to_string(),
                line: index + 1,
                reason: format!("malformed region {line:?}"),
            })
        })
        .collect()
}
