//! Result tables: writers, reader and gene-symbol lookup.
//!
//! All tables are tab-separated and gzip-compressed. Floats are written with
//! Rust's shortest round-trip formatting so a written table reloads to the
//! same values; undefined values are written as empty fields.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::correction::ElementResult;
use crate::io::{data_lines, finish_gz, get_reader, gz_writer};

pub const RESULT_COLUMNS: [&str; 12] = [
    "GENE_ID",
    "MUTS",
    "MUTS_RECURRENCE",
    "SAMPLES",
    "P_VALUE",
    "Q_VALUE",
    "P_VALUE_NEG",
    "Q_VALUE_NEG",
    "SNP",
    "MNP",
    "INDELS",
    "SYMBOL",
];

const BACKGROUND_COLUMNS: [&str; 5] = ["GENE_ID", "SAMPLING_SIZE", "STATUS", "OBSERVED", "BACKGROUND_MEANS"];

// ============================================================================
// Output naming
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub results: PathBuf,
    pub background: PathBuf,
    pub groups: PathBuf,
}

impl OutputPaths {
    /// `<output_dir>/<mutations stem>-oncodrivefml.tsv.gz` and its siblings.
    pub fn new(output_dir: &Path, mutations_file: &Path) -> Self {
        let name = mutations_file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let name = name.strip_suffix(".gz").or_else(|| name.strip_suffix(".bgz")).unwrap_or(&name);
        let stem = match name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => name,
        };
        let base = format!("{}-oncodrivefml", stem);
        Self {
            results: output_dir.join(format!("{}.tsv.gz", base)),
            background: output_dir.join(format!("{}.bckg.tsv.gz", base)),
            groups: output_dir.join(format!("{}.groups.tsv.gz", base)),
        }
    }
}

// ============================================================================
// Writers
// ============================================================================

fn fmt_float(v: f64) -> String {
    if v.is_nan() {
        String::new()
    } else {
        v.to_string()
    }
}

/// Write the result table. Group tables carry an extra `GENES_IN_GROUP`
/// column. Returns the number of data rows written.
pub fn write_results(path: &Path, results: &[ElementResult], with_groups: bool) -> Result<usize> {
    let mut writer = gz_writer(path)?;
    let mut header = RESULT_COLUMNS.join("\t");
    if with_groups {
        header.push_str("\tGENES_IN_GROUP");
    }
    writeln!(writer, "{}", header)?;

    for r in results {
        write!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            r.element_id,
            r.muts,
            r.muts_recurrence,
            r.samples_mut,
            fmt_float(r.pvalue),
            fmt_float(r.qvalue),
            fmt_float(r.pvalue_neg),
            fmt_float(r.qvalue_neg),
            r.snps,
            r.mnps,
            r.indels,
            r.symbol.as_deref().unwrap_or(&r.element_id),
        )?;
        if with_groups {
            write!(writer, "\t{}", r.genes_in_group.as_deref().unwrap_or_default().join(","))?;
        }
        writeln!(writer)?;
    }
    finish_gz(writer).with_context(|| format!("Writing results to {:?}", path))?;
    Ok(results.len())
}

/// Background diagnostic: final sampling size, status and the raw
/// background statistic distribution of every sampled element.
pub fn write_background(path: &Path, results: &[ElementResult]) -> Result<()> {
    let mut writer = gz_writer(path)?;
    writeln!(writer, "{}", BACKGROUND_COLUMNS.join("\t"))?;
    for r in results.iter().filter(|r| !r.back_means.is_empty()) {
        let means: Vec<String> = r.back_means.iter().map(|v| fmt_float(*v)).collect();
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}",
            r.element_id,
            r.sampling_size,
            r.status.map(|s| s.as_str()).unwrap_or("grouped"),
            fmt_float(r.observed),
            means.join(",")
        )?;
    }
    finish_gz(writer).with_context(|| format!("Writing background to {:?}", path))?;
    info!("Background distributions written to {:?}", path);
    Ok(())
}

// ============================================================================
// Readers
// ============================================================================

fn parse_float(field: &str) -> Result<f64> {
    if field.is_empty() {
        return Ok(f64::NAN);
    }
    field.parse::<f64>().with_context(|| format!("Invalid number '{}'", field))
}

fn parse_count(field: &str) -> Result<usize> {
    field.parse::<usize>().with_context(|| format!("Invalid count '{}'", field))
}

/// Reload a table written by [`write_results`].
pub fn read_results(path: &Path) -> Result<Vec<ElementResult>> {
    let mut lines = get_reader(path)?.lines();
    let header = match lines.next() {
        Some(h) => h.with_context(|| format!("Failed to read {:?}", path))?,
        None => bail!("Empty result file: {:?}", path),
    };
    let columns: Vec<&str> = header.split('\t').collect();
    if columns.len() < RESULT_COLUMNS.len() || columns[..RESULT_COLUMNS.len()] != RESULT_COLUMNS {
        bail!("Unexpected result header in {:?}: {}", path, header);
    }
    let with_groups = columns.get(RESULT_COLUMNS.len()) == Some(&"GENES_IN_GROUP");

    let mut results = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        let f: Vec<&str> = line.split('\t').collect();
        if f.len() < columns.len() {
            bail!("{:?} line {}: expected {} fields, found {}", path, i + 2, columns.len(), f.len());
        }
        let row = || -> Result<ElementResult> {
            Ok(ElementResult {
                element_id: f[0].to_string(),
                muts: parse_count(f[1])?,
                muts_recurrence: parse_count(f[2])?,
                samples_mut: parse_count(f[3])?,
                pvalue: parse_float(f[4])?,
                qvalue: parse_float(f[5])?,
                pvalue_neg: parse_float(f[6])?,
                qvalue_neg: parse_float(f[7])?,
                snps: parse_count(f[8])?,
                mnps: parse_count(f[9])?,
                indels: parse_count(f[10])?,
                symbol: Some(f[11].to_string()),
                observed: f64::NAN,
                scores: Vec::new(),
                sampling_size: 0,
                status: None,
                back_means: Vec::new(),
                genes_in_group: with_groups
                    .then(|| f[12].split(',').filter(|g| !g.is_empty()).map(str::to_string).collect()),
            })
        };
        results.push(row().with_context(|| format!("{:?} line {}", path, i + 2))?);
    }
    Ok(results)
}

/// Element id to symbol, from a TSV whose first column is the id and last
/// column the symbol.
pub fn load_symbols(path: &Path) -> Result<HashMap<String, String>> {
    let mut symbols = HashMap::new();
    for line in data_lines(get_reader(path)?) {
        let line = line.with_context(|| format!("Failed to read {:?}", path))?;
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 2 {
            continue;
        }
        if let (Some(id), Some(symbol)) = (fields.first(), fields.last()) {
            symbols.insert(id.trim().to_string(), symbol.trim().to_string());
        }
    }
    info!("Loaded {} gene symbols from {:?}", symbols.len(), path);
    Ok(symbols)
}

/// Warn when a written table does not hold one row per result.
pub fn check_row_count(path: &Path, expected: usize) -> Result<()> {
    let rows = get_reader(path)?.lines().count().saturating_sub(1);
    if rows != expected {
        warn!("{:?} has {} rows but {} results were computed", path, rows, expected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observed::ObservedStatistics;
    use std::io::Write as _;

    fn sample_result(id: &str) -> ElementResult {
        let stats = ObservedStatistics {
            muts: 3,
            muts_recurrence: 2,
            samples_mut: 2,
            snps: 2,
            mnps: 0,
            indels: 1,
            ..ObservedStatistics::default()
        };
        ElementResult {
            pvalue: 0.000_123_456_789_012_345,
            qvalue: 0.1 + 0.2,
            pvalue_neg: 1.0,
            qvalue_neg: f64::NAN,
            symbol: Some("SYM".into()),
            ..ElementResult::unsampled(id, &stats)
        }
    }

    #[test]
    fn test_output_paths() {
        let paths = OutputPaths::new(Path::new("/out"), Path::new("/data/cohort.tsv.gz"));
        assert_eq!(paths.results, PathBuf::from("/out/cohort-oncodrivefml.tsv.gz"));
        assert_eq!(paths.background, PathBuf::from("/out/cohort-oncodrivefml.bckg.tsv.gz"));
        let plain = OutputPaths::new(Path::new("out"), Path::new("muts.txt"));
        assert_eq!(plain.groups, PathBuf::from("out/muts-oncodrivefml.groups.tsv.gz"));
    }

    #[test]
    fn test_result_round_trip_preserves_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.tsv.gz");
        let written = vec![sample_result("G1"), sample_result("G2")];
        assert_eq!(write_results(&path, &written, false).unwrap(), 2);

        let read = read_results(&path).unwrap();
        assert_eq!(read.len(), 2);
        for (a, b) in written.iter().zip(&read) {
            assert_eq!(a.element_id, b.element_id);
            assert_eq!((a.muts, a.muts_recurrence, a.samples_mut), (b.muts, b.muts_recurrence, b.samples_mut));
            assert_eq!((a.snps, a.mnps, a.indels), (b.snps, b.mnps, b.indels));
            assert_eq!(a.pvalue.to_bits(), b.pvalue.to_bits());
            assert_eq!(a.qvalue.to_bits(), b.qvalue.to_bits());
            assert_eq!(a.pvalue_neg, b.pvalue_neg);
            assert!(b.qvalue_neg.is_nan());
            assert_eq!(b.symbol.as_deref(), Some("SYM"));
        }
        check_row_count(&path, 2).unwrap();
    }

    #[test]
    fn test_group_table_has_member_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.tsv.gz");
        let mut group = sample_result("SET");
        group.symbol = None;
        group.genes_in_group = Some(vec!["A".into(), "B".into()]);
        write_results(&path, &[group], true).unwrap();

        let read = read_results(&path).unwrap();
        assert_eq!(read[0].genes_in_group, Some(vec!["A".to_string(), "B".to_string()]));
        assert_eq!(read[0].symbol.as_deref(), Some("SET"), "symbol defaults to the id");
    }

    #[test]
    fn test_background_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.tsv.gz");
        let mut r = sample_result("G1");
        r.back_means = vec![1.5, 2.0];
        r.sampling_size = 2;
        r.observed = 2.0;
        write_background(&path, &[r, sample_result("UNSAMPLED")]).unwrap();
        let lines: Vec<String> = get_reader(&path).unwrap().lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "G1\t2\tgrouped\t2\t1.5,2");
    }

    #[test]
    fn test_load_symbols() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ENSG01\tprotein_coding\tTP53\nENSG02\tKRAS\n# comment\nLONELY").unwrap();
        let symbols = load_symbols(file.path()).unwrap();
        assert_eq!(symbols["ENSG01"], "TP53");
        assert_eq!(symbols["ENSG02"], "KRAS");
        assert!(!symbols.contains_key("LONELY"));
    }
}
