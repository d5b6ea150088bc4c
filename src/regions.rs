//! Genomic elements and mapping of mutations onto them.
//!
//! Region files are tab-separated with one segment per row. A header naming
//! the columns is optional; without one the layout is
//! `chrom, start, stop, element [, segment [, strand]]`. Coordinates are
//! 1-based and closed at both ends.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Result;
use coitrees::{COITree, IntervalNode, IntervalTree};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::io::{data_lines, get_reader, require_file, RowErrors};

/// Strip the `chr` prefix so `chr1` and `1` refer to the same sequence.
pub fn normalize_chrom(chrom: &str) -> &str {
    chrom.trim_start_matches("chr")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Strand {
    #[default]
    Plus,
    Minus,
    Unknown,
}

impl Strand {
    fn parse(s: &str) -> Strand {
        match s.trim() {
            "+" | "1" | "+1" => Strand::Plus,
            "-" | "-1" => Strand::Minus,
            _ => Strand::Unknown,
        }
    }

    /// Unknown strand is read in the forward direction.
    pub fn is_reverse(&self) -> bool {
        matches!(self, Strand::Minus)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub chrom: String,
    pub start: u64,
    pub stop: u64,
    /// Randomization pool; segments sharing a tag are sampled together
    pub segment_id: String,
}

impl Segment {
    pub fn contains(&self, chrom: &str, pos: u64) -> bool {
        normalize_chrom(&self.chrom) == normalize_chrom(chrom) && self.start <= pos && pos <= self.stop
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub segments: Vec<Segment>,
    pub strand: Strand,
}

pub type Regions = BTreeMap<String, Element>;

struct RegionColumns {
    chrom: usize,
    start: usize,
    stop: usize,
    element: usize,
    segment: Option<usize>,
    strand: Option<usize>,
}

impl RegionColumns {
    fn positional() -> Self {
        Self { chrom: 0, start: 1, stop: 2, element: 3, segment: Some(4), strand: Some(5) }
    }

    fn from_header(fields: &[&str]) -> Option<Self> {
        let find = |names: &[&str]| {
            fields.iter().position(|f| names.iter().any(|n| f.trim().eq_ignore_ascii_case(n)))
        };
        Some(Self {
            chrom: find(&["CHROMOSOME", "CHROM", "CHR"])?,
            start: find(&["START"])?,
            stop: find(&["END", "STOP"])?,
            element: find(&["ELEMENT", "ELEMENT_ID", "FEATURE", "GENE_ID"])?,
            segment: find(&["SEGMENT"]),
            strand: find(&["STRAND"]),
        })
    }
}

/// Load `{element_id: Element}` from a region definition file.
pub fn read_regions(path: &Path) -> Result<Regions> {
    require_file(path, "Regions file")?;
    let reader = get_reader(path)?;
    let mut regions: Regions = BTreeMap::new();
    let mut errors = RowErrors::default();
    let mut columns: Option<RegionColumns> = None;
    let mut n_segments = 0usize;

    for (i, line) in data_lines(reader).enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split('\t').collect();

        if columns.is_none() {
            match RegionColumns::from_header(&fields) {
                Some(c) => {
                    columns = Some(c);
                    continue;
                }
                None => columns = Some(RegionColumns::positional()),
            }
        }
        let Some(cols) = columns.as_ref() else { continue };

        let (Some(chrom), Some(start), Some(stop), Some(element)) = (
            fields.get(cols.chrom),
            fields.get(cols.start).and_then(|s| s.trim().parse::<u64>().ok()),
            fields.get(cols.stop).and_then(|s| s.trim().parse::<u64>().ok()),
            fields.get(cols.element).map(|s| s.trim()).filter(|s| !s.is_empty()),
        ) else {
            errors.record(path, i + 1, "missing or non-numeric chrom/start/stop/element");
            continue;
        };
        if start == 0 || stop < start {
            errors.record(path, i + 1, &format!("invalid interval {}-{}", start, stop));
            continue;
        }

        let segment_id = cols
            .segment
            .and_then(|c| fields.get(c))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(element)
            .to_string();
        let strand = cols.strand.and_then(|c| fields.get(c)).map(|s| Strand::parse(s)).unwrap_or(Strand::Unknown);

        let entry = regions.entry(element.to_string()).or_insert_with(|| Element {
            id: element.to_string(),
            segments: Vec::new(),
            strand,
        });
        if entry.strand != strand && strand != Strand::Unknown {
            if entry.strand == Strand::Unknown {
                entry.strand = strand;
            } else {
                warn!("Element {} has segments on both strands; keeping {:?}", element, entry.strand);
            }
        }
        entry.segments.push(Segment { chrom: normalize_chrom(chrom.trim()).to_string(), start, stop, segment_id });
        n_segments += 1;
    }

    errors.summarize(path, n_segments);
    info!("Loaded {} elements ({} segments) from {:?}", regions.len(), n_segments, path);
    Ok(regions)
}

/// Interval index answering "which segments contain chrom:pos".
pub struct RegionTree {
    trees: HashMap<String, COITree<usize, u32>>,
    entries: Vec<(String, usize)>,
}

impl RegionTree {
    pub fn build(regions: &Regions) -> Self {
        let mut nodes_by_chrom: HashMap<String, Vec<IntervalNode<usize, u32>>> = HashMap::new();
        let mut entries = Vec::new();
        for element in regions.values() {
            for (seg_idx, seg) in element.segments.iter().enumerate() {
                let idx = entries.len();
                entries.push((element.id.clone(), seg_idx));
                nodes_by_chrom
                    .entry(seg.chrom.clone())
                    .or_default()
                    .push(IntervalNode::new(seg.start as i32, seg.stop as i32, idx));
            }
        }
        let trees = nodes_by_chrom.into_iter().map(|(chrom, nodes)| (chrom, COITree::new(&nodes))).collect();
        Self { trees, entries }
    }

    /// `(element_id, segment index)` for every segment containing the position.
    pub fn lookup(&self, chrom: &str, pos: u64) -> Vec<(&str, usize)> {
        let mut hits = Vec::new();
        if let Some(tree) = self.trees.get(normalize_chrom(chrom)) {
            tree.query(pos as i32, pos as i32, |node| {
                let (element, seg) = &self.entries[node.metadata.to_owned()];
                hits.push((element.as_str(), *seg));
            });
        }
        // Query order is unspecified
        hits.sort_unstable();
        hits.dedup_by(|a, b| a.0 == b.0);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_regions(body: &str) -> NamedTempFile {
        let mut f = NamedTempFile::with_suffix(".tsv").unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_read_regions_with_header() {
        let f = write_regions(
            "CHROMOSOME\tSTART\tEND\tSTRAND\tELEMENT\tSEGMENT\n\
             chr1\t100\t200\t-\tGENE1\t\n\
             1\t300\t350\t-\tGENE1\tGENE1_b\n\
             2\t10\t20\t+\tGENE2\t\n",
        );
        let regions = read_regions(f.path()).unwrap();
        assert_eq!(regions.len(), 2);
        let g1 = &regions["GENE1"];
        assert_eq!(g1.strand, Strand::Minus);
        assert_eq!(g1.segments.len(), 2);
        assert_eq!(g1.segments[0].chrom, "1");
        assert_eq!(g1.segments[0].segment_id, "GENE1", "segment defaults to element id");
        assert_eq!(g1.segments[1].segment_id, "GENE1_b");
    }

    #[test]
    fn test_read_regions_positional_skips_bad_rows() {
        let f = write_regions("1\t100\t200\tGENE1\n1\tabc\t200\tGENE2\n1\t300\t250\tGENE3\n");
        let regions = read_regions(f.path()).unwrap();
        assert_eq!(regions.keys().collect::<Vec<_>>(), vec!["GENE1"]);
        assert_eq!(regions["GENE1"].strand, Strand::Unknown);
        assert!(!regions["GENE1"].strand.is_reverse(), "unknown strand reads forward");
    }

    #[test]
    fn test_region_tree_closed_intervals() {
        let f = write_regions("1\t100\t200\tGENE1\n1\t150\t250\tGENE2\n");
        let regions = read_regions(f.path()).unwrap();
        let tree = RegionTree::build(&regions);

        assert_eq!(tree.lookup("chr1", 100), vec![("GENE1", 0)], "start is inclusive");
        assert_eq!(tree.lookup("1", 200).len(), 2, "stop is inclusive and overlaps are kept");
        assert_eq!(tree.lookup("1", 99), vec![]);
        assert_eq!(tree.lookup("1", 251), vec![]);
        assert_eq!(tree.lookup("2", 150), vec![]);
    }
}
