//! Somatic mutations: typed records, the tabular reader and element mapping.
//!
//! Mutation files are tab-separated with a header. Required columns are
//! CHROMOSOME, POSITION, REF, ALT and SAMPLE (matched case-insensitively,
//! with a few common aliases). TYPE is optional and inferred from the alleles
//! when absent. The signature bucket of each mutation is read from the column
//! named by the classifier, or is the classifier itself when no such column
//! exists.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{bail, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::io::{data_lines, get_reader, require_file, RowErrors};
use crate::regions::{normalize_chrom, RegionTree, Regions};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MutationType {
    Substitution,
    Mnp,
    Indel,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Substitution => "subs",
            MutationType::Mnp => "mnp",
            MutationType::Indel => "indel",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subs" | "snp" | "snv" => Some(MutationType::Substitution),
            "mnp" | "mnv" => Some(MutationType::Mnp),
            "indel" | "ins" | "del" => Some(MutationType::Indel),
            _ => None,
        }
    }
}

/// Allele change of one mutation. Indels use dash notation: an insertion has
/// `ref_allele == "-"`, a deletion has `alt_allele == "-"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    Substitution { ref_base: u8, alt_base: u8 },
    Mnp { ref_allele: String, alt_allele: String },
    Indel { ref_allele: String, alt_allele: String },
}

impl Variant {
    pub fn kind(&self) -> MutationType {
        match self {
            Variant::Substitution { .. } => MutationType::Substitution,
            Variant::Mnp { .. } => MutationType::Mnp,
            Variant::Indel { .. } => MutationType::Indel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub chrom: String,
    /// 1-based
    pub pos: u64,
    pub sample: String,
    /// Signature bucket key
    pub signature: String,
    pub variant: Variant,
    /// Randomization segment assigned when mapped onto an element
    pub segment: String,
}

impl Mutation {
    pub fn kind(&self) -> MutationType {
        self.variant.kind()
    }

    pub fn is_insertion(&self) -> bool {
        matches!(&self.variant, Variant::Indel { ref_allele, .. } if ref_allele == "-")
    }

    /// Inserted or deleted bases of an indel.
    pub fn indel_sequence(&self) -> Option<&str> {
        match &self.variant {
            Variant::Indel { ref_allele, alt_allele } => {
                Some(if ref_allele == "-" { alt_allele.as_str() } else { ref_allele.as_str() })
            }
            _ => None,
        }
    }

    pub fn indel_size(&self) -> usize {
        self.indel_sequence().map(|s| s.len()).unwrap_or(0)
    }
}

/// A mutation that received a functional-impact score. `pos` is the position
/// the score was taken from, which for MNPs may differ from the call position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored<M> {
    pub inner: M,
    pub score: f64,
    pub pos: u64,
}

// ============================================================================
// Reader
// ============================================================================

struct MutationColumns {
    chrom: usize,
    pos: usize,
    ref_allele: usize,
    alt_allele: usize,
    sample: usize,
    mut_type: Option<usize>,
    signature: Option<usize>,
}

fn parse_mutation_header(line: &str, classifier: &str) -> Result<MutationColumns> {
    let fields: Vec<String> = line.split('\t').map(|f| f.trim().to_ascii_uppercase()).collect();
    let find = |names: &[&str]| fields.iter().position(|f| names.contains(&f.as_str()));
    let require = |names: &[&str]| match find(names) {
        Some(idx) => Ok(idx),
        None => bail!("Mutations header missing required column: {}", names[0]),
    };
    let classifier_upper = classifier.to_ascii_uppercase();
    let columns = MutationColumns {
        chrom: require(&["CHROMOSOME", "CHROM", "CHR"])?,
        pos: require(&["POSITION", "POS", "START"])?,
        ref_allele: require(&["REF", "REFERENCE"])?,
        alt_allele: require(&["ALT", "ALTERNATE"])?,
        sample: require(&["SAMPLE", "SAMPLE_ID"])?,
        mut_type: find(&["TYPE"]),
        signature: find(&[classifier_upper.as_str()]),
    };
    debug!(
        "Mutation columns resolved: chrom={}, pos={}, ref={}, alt={}, sample={}, type={:?}, signature={:?}",
        columns.chrom, columns.pos, columns.ref_allele, columns.alt_allele, columns.sample, columns.mut_type,
        columns.signature
    );
    Ok(columns)
}

fn is_valid_chromosome(chrom: &str) -> bool {
    match normalize_chrom(chrom) {
        "X" | "Y" => true,
        c => matches!(c.parse::<u8>(), Ok(1..=22)),
    }
}

fn is_valid_allele(allele: &str) -> bool {
    allele.bytes().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'-'))
}

/// Build the typed variant, normalizing VCF-style anchored indels to dash
/// notation. Returns the (possibly shifted) position.
fn classify(pos: u64, ref_allele: &str, alt_allele: &str, declared: Option<MutationType>) -> Result<(u64, Variant), String> {
    let (mut pos, mut r, mut a) = (pos, ref_allele.to_string(), alt_allele.to_string());
    let is_indel = r.contains('-') || a.contains('-') || r.len() != a.len();

    if is_indel && !r.contains('-') && !a.contains('-') {
        let shared = r.bytes().zip(a.bytes()).take_while(|(x, y)| x == y).count();
        r.drain(..shared);
        a.drain(..shared);
        pos += shared as u64;
        if r.is_empty() {
            r.push('-');
        }
        if a.is_empty() {
            a.push('-');
        }
        if r != "-" && a != "-" {
            return Err(format!("complex indel {}>{} is not supported", ref_allele, alt_allele));
        }
    }

    let variant = if is_indel {
        if (r.len() > 1 && r.contains('-')) || (a.len() > 1 && a.contains('-')) {
            return Err(format!("malformed indel alleles {}>{}", ref_allele, alt_allele));
        }
        Variant::Indel { ref_allele: r, alt_allele: a }
    } else if r.len() == 1 {
        Variant::Substitution { ref_base: r.as_bytes()[0], alt_base: a.as_bytes()[0] }
    } else {
        Variant::Mnp { ref_allele: r, alt_allele: a }
    };

    if let Some(declared) = declared {
        if declared != variant.kind() {
            return Err(format!("TYPE {} does not match alleles {}>{}", declared.as_str(), ref_allele, alt_allele));
        }
    }
    Ok((pos, variant))
}

/// Sample ids to drop, one per line.
pub fn read_blacklist(path: &Path) -> Result<HashSet<String>> {
    require_file(path, "Samples blacklist")?;
    let mut samples = HashSet::new();
    for line in data_lines(get_reader(path)?) {
        samples.insert(line?.trim().to_string());
    }
    info!("Loaded {} blacklisted samples", samples.len());
    Ok(samples)
}

/// Read and validate a mutations file.
pub fn read_mutations(path: &Path, classifier: &str, blacklist: &HashSet<String>) -> Result<Vec<Mutation>> {
    require_file(path, "Mutations file")?;
    let mut lines = data_lines(get_reader(path)?);
    let header = match lines.next() {
        Some(h) => h?,
        None => bail!("Mutations file is empty: {:?}", path),
    };
    let cols = parse_mutation_header(&header, classifier)?;

    let mut mutations = Vec::new();
    let mut errors = RowErrors::default();
    let mut blacklisted = 0usize;

    for (i, line) in lines.enumerate() {
        let line = line?;
        let line_no = i + 2;
        let fields: Vec<&str> = line.split('\t').map(|f| f.trim()).collect();
        let field = |idx: usize| fields.get(idx).copied().unwrap_or("");

        let chrom = field(cols.chrom);
        if !is_valid_chromosome(chrom) {
            errors.record(path, line_no, &format!("invalid chromosome '{}'", chrom));
            continue;
        }
        let pos = match field(cols.pos).parse::<u64>() {
            Ok(p) if p > 0 => p,
            _ => {
                errors.record(path, line_no, &format!("invalid position '{}'", field(cols.pos)));
                continue;
            }
        };
        let ref_allele = field(cols.ref_allele).to_ascii_uppercase();
        let alt_allele = field(cols.alt_allele).to_ascii_uppercase();
        if ref_allele.is_empty() || alt_allele.is_empty() || !is_valid_allele(&ref_allele) || !is_valid_allele(&alt_allele) {
            errors.record(path, line_no, &format!("invalid alleles '{}'>'{}'", ref_allele, alt_allele));
            continue;
        }
        if ref_allele == alt_allele {
            errors.record(path, line_no, "ALT equals REF");
            continue;
        }
        let sample = field(cols.sample).to_string();
        if blacklist.contains(&sample) {
            blacklisted += 1;
            continue;
        }
        let declared = match cols.mut_type.map(field).filter(|t| !t.is_empty()) {
            Some(t) => match MutationType::parse(t) {
                Some(kind) => Some(kind),
                None => {
                    errors.record(path, line_no, &format!("unknown TYPE '{}'", t));
                    continue;
                }
            },
            None => None,
        };
        let (pos, variant) = match classify(pos, &ref_allele, &alt_allele, declared) {
            Ok(v) => v,
            Err(reason) => {
                errors.record(path, line_no, &reason);
                continue;
            }
        };
        let signature = match cols.signature {
            Some(idx) => field(idx).to_string(),
            None => classifier.to_string(),
        };

        mutations.push(Mutation {
            chrom: normalize_chrom(chrom).to_string(),
            pos,
            sample,
            signature,
            variant,
            segment: String::new(),
        });
    }

    errors.summarize(path, mutations.len());
    if blacklisted > 0 {
        info!("Dropped {} mutations from blacklisted samples", blacklisted);
    }
    info!("Loaded {} mutations from {:?}", mutations.len(), path);
    Ok(mutations)
}

/// Assign mutations to every element containing them.
pub fn map_mutations(mutations: &[Mutation], regions: &Regions, tree: &RegionTree) -> BTreeMap<String, Vec<Mutation>> {
    let mut by_element: BTreeMap<String, Vec<Mutation>> = BTreeMap::new();
    let mut unmapped = 0usize;
    for m in mutations {
        let hits = tree.lookup(&m.chrom, m.pos);
        if hits.is_empty() {
            unmapped += 1;
        }
        for (element_id, seg_idx) in hits {
            let Some(element) = regions.get(element_id) else { continue };
            let mut mapped = m.clone();
            mapped.segment = element.segments[seg_idx].segment_id.clone();
            by_element.entry(element_id.to_string()).or_default().push(mapped);
        }
    }
    debug!("{} mutations fall outside every element", unmapped);
    by_element
}

/// Counts over mapped mutations, used for the indel/substitution odds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CohortCounts {
    pub subs: usize,
    pub mnps: usize,
    pub frameshift_indels: usize,
    pub inframe_indels: usize,
}

impl CohortCounts {
    pub fn count(by_element: &BTreeMap<String, Vec<Mutation>>, frame_length: usize) -> Self {
        let mut counts = CohortCounts::default();
        let mut seen: HashSet<(&str, u64, &str, &Variant)> = HashSet::new();
        for m in by_element.values().flatten() {
            // Overlapping elements must not count a mutation twice
            if !seen.insert((m.chrom.as_str(), m.pos, m.sample.as_str(), &m.variant)) {
                continue;
            }
            match m.kind() {
                MutationType::Substitution => counts.subs += 1,
                MutationType::Mnp => counts.mnps += 1,
                MutationType::Indel => {
                    if crate::indels::is_frameshift(m.indel_size(), frame_length) {
                        counts.frameshift_indels += 1;
                    } else {
                        counts.inframe_indels += 1;
                    }
                }
            }
        }
        counts
    }
}
