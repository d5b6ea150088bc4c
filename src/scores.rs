//! Functional-impact score lookup for an element's background.
//!
//! The score file is consumed as a range-query service: every segment of an
//! element issues one half-open query `[start-1, stop)` and the returned rows
//! are decoded according to [`ScoreConfig`]. The result is a positional index
//! `position -> [ScoreEntry]` shared read-only by every mutation of the
//! element.
//!
//! Query failures never abort the element: rows read before the fault are
//! kept and the failure is logged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use rust_htslib::tbx::{self, Read as TbxRead};
use serde::{Deserialize, Serialize};

use crate::config::{IndelConfig, ScoreConfig};
use crate::reference::GenomeSequence;
use crate::regions::{normalize_chrom, Element};
use crate::signature::{alt_triplet, SignatureTable};

pub const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

// Empirical fit of stop-gain score against the mean element score, used when
// an element has too few stop-creating positions of its own.
const STOP_FALLBACK_A: f64 = 8.916_866_894_614_731;
const STOP_FALLBACK_B: f64 = 0.082_688_007_694_096_19;

// ============================================================================
// Range-query collaborators
// ============================================================================

pub trait RangeQuery {
    /// Append every row overlapping the 0-based half-open range to `rows`.
    /// On error, rows already appended stay valid.
    fn query(&mut self, chrom: &str, start: u64, stop: u64, rows: &mut Vec<Vec<String>>) -> Result<()>;
}

/// Factory for per-worker query handles.
pub trait RangeSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn RangeQuery>>;
}

pub struct TabixSource {
    path: PathBuf,
}

impl TabixSource {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl RangeSource for TabixSource {
    fn open(&self) -> Result<Box<dyn RangeQuery>> {
        let reader = tbx::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open tabix file {:?}. Make sure .tbi exists.", self.path))?;
        Ok(Box::new(TabixQuery { reader }))
    }
}

struct TabixQuery {
    reader: tbx::Reader,
}

impl RangeQuery for TabixQuery {
    fn query(&mut self, chrom: &str, start: u64, stop: u64, rows: &mut Vec<Vec<String>>) -> Result<()> {
        let tid = self.reader.tid(chrom).with_context(|| format!("Sequence {} not in tabix index", chrom))?;
        self.reader
            .fetch(tid, start, stop)
            .with_context(|| format!("Tabix fetch failed for {}:{}-{}", chrom, start, stop))?;
        for record in self.reader.records() {
            let record = record.with_context(|| format!("Corrupt tabix record in {}:{}-{}", chrom, start, stop))?;
            let line = String::from_utf8_lossy(&record);
            rows.push(line.trim_end().split('\t').map(str::to_string).collect());
        }
        Ok(())
    }
}

/// Rows held in memory, queried by their 1-based position column.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: HashMap<String, Vec<(u64, Vec<String>)>>,
}

impl MemorySource {
    pub fn from_lines(lines: &[&str], chr: usize, pos: usize) -> Self {
        let mut rows: HashMap<String, Vec<(u64, Vec<String>)>> = HashMap::new();
        for line in lines {
            let fields: Vec<String> = line.split('\t').map(str::to_string).collect();
            let (Some(c), Some(p)) = (fields.get(chr), fields.get(pos).and_then(|p| p.parse::<u64>().ok())) else {
                continue;
            };
            rows.entry(c.clone()).or_default().push((p, fields));
        }
        Self { rows }
    }
}

impl RangeQuery for MemorySource {
    fn query(&mut self, chrom: &str, start: u64, stop: u64, rows: &mut Vec<Vec<String>>) -> Result<()> {
        let Some(chrom_rows) = self.rows.get(chrom) else {
            anyhow::bail!("Sequence {} not in score source", chrom);
        };
        rows.extend(chrom_rows.iter().filter(|(p, _)| *p > start && *p <= stop).map(|(_, r)| r.clone()));
        Ok(())
    }
}

impl RangeSource for MemorySource {
    fn open(&self) -> Result<Box<dyn RangeQuery>> {
        Ok(Box::new(self.clone()))
    }
}

// ============================================================================
// Positional index
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub ref_base: u8,
    pub alt_base: u8,
    pub value: f64,
    /// Substitution probability per signature bucket; empty without a signature
    pub probs: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreIndex {
    pub chrom: String,
    pub positions: BTreeMap<u64, Vec<ScoreEntry>>,
    /// Randomization segment -> positions it owns
    pub segments: BTreeMap<String, Vec<u64>>,
    pub missing_signatures: usize,
    pub mismatches: usize,
    /// Rows dropped for a NaN or infinite score
    #[serde(default)]
    pub invalid_scores: usize,
}

impl ScoreIndex {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn entries(&self, pos: u64) -> &[ScoreEntry] {
        self.positions.get(&pos).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// First entry at `pos` matching both alleles.
    pub fn lookup(&self, pos: u64, ref_base: u8, alt_base: u8) -> Option<&ScoreEntry> {
        self.entries(pos).iter().find(|e| e.ref_base == ref_base && e.alt_base == alt_base)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.positions.values().flatten().map(|e| e.value)
    }

    pub fn segment_entries<'a>(&'a self, segment: &str) -> impl Iterator<Item = (u64, &'a ScoreEntry)> + 'a {
        self.segments
            .get(segment)
            .into_iter()
            .flatten()
            .flat_map(move |p| self.entries(*p).iter().map(move |e| (*p, e)))
    }
}

/// Builds [`ScoreIndex`]es on one worker.
pub struct ScoreLoader<'a> {
    config: &'a ScoreConfig,
    query: Box<dyn RangeQuery>,
    genome: Option<&'a dyn GenomeSequence>,
    signature: Option<&'a SignatureTable>,
}

impl<'a> ScoreLoader<'a> {
    pub fn new(
        config: &'a ScoreConfig,
        query: Box<dyn RangeQuery>,
        genome: Option<&'a dyn GenomeSequence>,
        signature: Option<&'a SignatureTable>,
    ) -> Self {
        Self { config, query, genome, signature }
    }

    pub fn load(&mut self, element: &Element) -> ScoreIndex {
        let mut index = ScoreIndex::default();
        let Some(first) = element.segments.first() else { return index };
        index.chrom = first.chrom.clone();
        let mut decode_errors = 0usize;

        for segment in &element.segments {
            if segment.chrom != index.chrom {
                warn!(
                    "{}: segment {}:{}-{} is on a different chromosome than {} and is ignored",
                    element.id, segment.chrom, segment.start, segment.stop, index.chrom
                );
                continue;
            }
            let chrom = format!("{}{}", self.config.chr_prefix, normalize_chrom(&segment.chrom));
            let mut rows = Vec::new();
            if let Err(e) = self.query.query(&chrom, segment.start - 1, segment.stop, &mut rows) {
                warn!("{}: score query {}:{}-{} failed: {:#}", element.id, chrom, segment.start, segment.stop, e);
            }

            let mut owned = BTreeSet::new();
            for row in &rows {
                match self.decode_row(element, row, &mut index) {
                    Some((pos, entries)) => {
                        let claimed = index.positions.contains_key(&pos) && !owned.contains(&pos);
                        if pos < segment.start || pos > segment.stop || claimed {
                            // Outside this segment, or already claimed by an earlier overlapping one
                            continue;
                        }
                        owned.insert(pos);
                        index.positions.entry(pos).or_default().extend(entries);
                    }
                    None => decode_errors += 1,
                }
            }
            index.segments.entry(segment.segment_id.clone()).or_default().extend(owned);
        }

        for positions in index.segments.values_mut() {
            positions.sort_unstable();
            positions.dedup();
        }
        if decode_errors > 0 {
            debug!("{}: {} undecodable score rows skipped", element.id, decode_errors);
        }
        if index.invalid_scores > 0 {
            warn!("{}: {} score rows with a non-finite value skipped", element.id, index.invalid_scores);
        }
        if index.mismatches > 0 {
            warn!("{}: background mismatch at {} rows between score file and reference", element.id, index.mismatches);
        }
        if index.missing_signatures > 0 {
            debug!("{}: {} signature lookups missing, probability set to 0", element.id, index.missing_signatures);
        }
        index
    }

    /// Decode one row into its position and the entries it contributes.
    /// `None` marks a row that cannot be decoded or belongs to another element.
    fn decode_row(&self, element: &Element, row: &[String], index: &mut ScoreIndex) -> Option<(u64, Vec<ScoreEntry>)> {
        let cfg = self.config;
        let pos: u64 = row.get(cfg.pos)?.trim().parse().ok()?;
        if let Some(col) = cfg.element {
            if row.get(col).map(|s| s.trim()) != Some(element.id.as_str()) {
                return None;
            }
        }
        let value = match row.get(cfg.score).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(field) => field.parse::<f64>().ok()?,
            None => cfg.extra.and_then(|col| row.get(col)).and_then(|extra| extra_score(extra, &element.id)).unwrap_or(0.0),
        };
        if !value.is_finite() {
            index.invalid_scores += 1;
            return None;
        }

        let chrom = &index.chrom;
        let ref_triplet = self.genome.and_then(|g| g.triplet(chrom, pos));
        let stated_ref = cfg.ref_col.and_then(|c| row.get(c)).and_then(|s| s.trim().bytes().next()).map(|b| b.to_ascii_uppercase());
        let genome_ref = ref_triplet.as_ref().map(|t| t.as_bytes()[1]);
        let ref_base = match (stated_ref, genome_ref) {
            (Some(stated), Some(genomic)) => {
                if stated != genomic {
                    index.mismatches += 1;
                }
                stated
            }
            (Some(stated), None) => stated,
            (None, Some(genomic)) => genomic,
            (None, None) => return None,
        };

        let alt_field = cfg.alt.and_then(|c| row.get(c)).map(|s| s.trim()).unwrap_or(".");
        let alts: Vec<u8> = if alt_field == "." || alt_field.is_empty() {
            BASES.iter().copied().filter(|b| *b != ref_base).collect()
        } else {
            vec![alt_field.as_bytes()[0].to_ascii_uppercase()]
        };

        let mut entries = Vec::with_capacity(alts.len());
        for alt_base in alts {
            let probs = match self.signature {
                Some(sig) => {
                    let n = sig.bucket_names().len();
                    match &ref_triplet {
                        Some(tri) => {
                            let alt_tri = alt_triplet(tri, alt_base);
                            (0..n)
                                .map(|b| {
                                    sig.probability(b, tri, &alt_tri).unwrap_or_else(|| {
                                        index.missing_signatures += 1;
                                        0.0
                                    })
                                })
                                .collect()
                        }
                        None => {
                            index.missing_signatures += n;
                            vec![0.0; n]
                        }
                    }
                }
                None => Vec::new(),
            };
            entries.push(ScoreEntry { ref_base, alt_base, value, probs });
        }
        Some((pos, entries))
    }
}

/// Value for `element` in an `element:value,element:value` field.
fn extra_score(field: &str, element: &str) -> Option<f64> {
    field
        .split(',')
        .filter_map(|kv| kv.split_once(':'))
        .find(|(k, _)| k.trim() == element)
        .and_then(|(_, v)| v.trim().parse().ok())
}

// ============================================================================
// Stop-gain scores
// ============================================================================

/// Score population used for frameshift indels by the stop strategy.
///
/// Stop-creating substitutions are read from `stops` (columns chrom, pos, ref,
/// alt, element). With fewer than `minimum_number_of_stops` distinct stop
/// positions, or no stops source, the population is the single empirical value
/// derived from the element's mean score.
pub fn load_stop_scores(
    element: &Element,
    index: &ScoreIndex,
    stops: Option<&mut dyn RangeQuery>,
    config: &IndelConfig,
    chr_prefix: &str,
) -> Vec<f64> {
    let mut stop_sites: Vec<(u64, u8)> = Vec::new();
    if let Some(query) = stops {
        for segment in &element.segments {
            let chrom = format!("{}{}", chr_prefix, normalize_chrom(&segment.chrom));
            let mut rows = Vec::new();
            if let Err(e) = query.query(&chrom, segment.start - 1, segment.stop, &mut rows) {
                warn!("{}: stops query {}:{}-{} failed: {:#}", element.id, chrom, segment.start, segment.stop, e);
            }
            for row in rows {
                if row.get(4).map(|s| s.trim()) != Some(element.id.as_str()) {
                    continue;
                }
                let pos = row.get(1).and_then(|p| p.trim().parse::<u64>().ok());
                let alt = row.get(3).and_then(|a| a.trim().bytes().next());
                if let (Some(pos), Some(alt)) = (pos, alt) {
                    stop_sites.push((pos, alt.to_ascii_uppercase()));
                }
            }
        }
    }

    let distinct: BTreeSet<u64> = stop_sites.iter().map(|(p, _)| *p).collect();
    if distinct.len() >= config.minimum_number_of_stops {
        let scores: Vec<f64> = stop_sites
            .iter()
            .flat_map(|(pos, alt)| index.entries(*pos).iter().filter(move |e| e.alt_base == *alt).map(|e| e.value))
            .collect();
        if !scores.is_empty() {
            return scores;
        }
    }

    let values: Vec<f64> = index.values().collect();
    if values.is_empty() {
        return Vec::new();
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    vec![STOP_FALLBACK_A * (STOP_FALLBACK_B * mean).exp()]
}
