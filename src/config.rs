//! Run configuration.
//!
//! A JSON document deserialized into [`Config`]. Every field has a default so a
//! configuration only needs to name what differs, typically the score file.
//! Strategy names are closed enums: an unknown name fails deserialization and
//! aborts the run before any computation starts.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::io::{get_reader, require_file};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub genome: GenomeConfig,
    pub score: ScoreConfig,
    pub signature: SignatureConfig,
    pub statistic: StatisticConfig,
    pub depth: SiteWeightConfig,
    pub mutability: SiteWeightConfig,
    pub settings: Settings,
    pub grouping: GroupingConfig,
    pub symbols_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenomeConfig {
    /// faidx-indexed reference FASTA
    pub fasta: Option<PathBuf>,
}

/// Column layout of the functional-impact score file (0-based indices).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreConfig {
    pub file: PathBuf,
    pub chr: usize,
    pub pos: usize,
    #[serde(rename = "ref")]
    pub ref_col: Option<usize>,
    pub alt: Option<usize>,
    pub score: usize,
    pub element: Option<usize>,
    /// `element:value,...` column consulted when the score field is empty
    pub extra: Option<usize>,
    pub chr_prefix: String,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::new(),
            chr: 0,
            pos: 1,
            ref_col: Some(2),
            alt: Some(3),
            score: 4,
            element: None,
            extra: None,
            chr_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMethod {
    #[default]
    None,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    pub method: SignatureMethod,
    pub path: Option<PathBuf>,
    /// Mutation column used as the signature bucket key. When the mutation
    /// file has no such column the name itself is the (single) bucket.
    pub classifier: String,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self { method: SignatureMethod::None, path: None, classifier: "SIGNATURE".to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticMethod {
    #[default]
    Amean,
    Gmean,
    Maxmean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticConfig {
    pub method: StatisticMethod,
    pub per_sample_analysis: bool,
    pub discard_mnp: bool,
    pub sampling: u64,
    pub sampling_max: u64,
    pub sampling_min_obs: u64,
    pub sampling_growth: u64,
    /// Target replicate x mutation cells per partition
    pub sampling_chunk: u64,
    pub recurrence: bool,
    pub indels: IndelConfig,
}

impl Default for StatisticConfig {
    fn default() -> Self {
        Self {
            method: StatisticMethod::Amean,
            per_sample_analysis: false,
            discard_mnp: false,
            sampling: 10_000,
            sampling_max: 1_000_000,
            sampling_min_obs: 5,
            sampling_growth: 10,
            sampling_chunk: 1_000_000,
            recurrence: true,
            indels: IndelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndelMethod {
    #[default]
    Pattern,
    Stop,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightFunction {
    Constant,
    #[default]
    Linear,
    Logistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSummary {
    #[default]
    Mean,
    Median,
    /// Uniform draw between the population minimum and maximum
    Random,
    RandomChoice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndelConfig {
    pub include: bool,
    pub method: IndelMethod,
    pub max_size: usize,
    pub window_size: usize,
    pub weight_function: WeightFunction,
    pub stop_function: StopSummary,
    pub minimum_number_of_stops: usize,
    /// Tabix file of stop-creating substitutions: chrom, pos, ref, alt, element
    pub stops_file: Option<PathBuf>,
    pub enable_frame: bool,
    pub max_repeats: usize,
    pub gene_exomic_frameshift_ratio: bool,
}

impl Default for IndelConfig {
    fn default() -> Self {
        Self {
            include: true,
            method: IndelMethod::Pattern,
            max_size: 20,
            window_size: 10,
            weight_function: WeightFunction::Linear,
            stop_function: StopSummary::Mean,
            minimum_number_of_stops: 3,
            stops_file: None,
            enable_frame: true,
            max_repeats: 3,
            gene_exomic_frameshift_ratio: false,
        }
    }
}

impl IndelConfig {
    pub fn frame_length(&self) -> usize {
        if self.enable_frame {
            3
        } else {
            1
        }
    }
}

/// Depth or mutability track used to reweight background sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteWeightConfig {
    pub adjusting: bool,
    pub file: Option<PathBuf>,
    pub chr_prefix: String,
    pub chr: usize,
    pub pos: usize,
    #[serde(rename = "ref")]
    pub ref_col: Option<usize>,
    pub alt: Option<usize>,
    pub value: usize,
}

impl Default for SiteWeightConfig {
    fn default() -> Self {
        Self {
            adjusting: false,
            file: None,
            chr_prefix: String::new(),
            chr: 0,
            pos: 1,
            ref_col: None,
            alt: None,
            value: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cores: Option<usize>,
    pub seed: Option<u64>,
    pub element_timeout_secs: Option<u64>,
    pub cache_dir: Option<PathBuf>,
    pub store_background: bool,
    pub min_samples_for_significance: usize,
    pub silent: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cores: None,
            seed: None,
            element_timeout_secs: None,
            cache_dir: None,
            store_background: false,
            min_samples_for_significance: 2,
            silent: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub group_genes: bool,
    pub json_file: Option<PathBuf>,
}

impl Config {
    /// Read and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        require_file(path, "Configuration file")?;
        let reader = get_reader(path)?;
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Invalid configuration file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether any stage needs reference sequence.
    pub fn needs_genome(&self) -> bool {
        self.signature.method != SignatureMethod::None
            || self.statistic.indels.include
            || self.score.ref_col.is_none()
    }

    /// Reject option combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        let st = &self.statistic;
        if st.sampling == 0 {
            bail!("statistic.sampling must be positive");
        }
        if st.sampling_max < st.sampling {
            bail!("statistic.sampling_max ({}) is smaller than statistic.sampling ({})", st.sampling_max, st.sampling);
        }
        if st.sampling_growth < 2 {
            bail!("statistic.sampling_growth must be at least 2, got {}", st.sampling_growth);
        }
        if st.sampling_chunk == 0 {
            bail!("statistic.sampling_chunk must be positive");
        }
        if st.indels.window_size == 0 {
            bail!("statistic.indels.window_size must be positive");
        }
        if self.settings.cores == Some(0) {
            bail!("settings.cores must be positive");
        }
        if self.signature.method == SignatureMethod::File && self.signature.path.is_none() {
            bail!("signature.method is 'file' but signature.path is not set");
        }
        for (name, track) in [("depth", &self.depth), ("mutability", &self.mutability)] {
            if track.adjusting && track.file.is_none() {
                bail!("{}.adjusting is enabled but {}.file is not set", name, name);
            }
        }
        if self.grouping.group_genes && self.grouping.json_file.is_none() {
            bail!("grouping.group_genes is enabled but grouping.json_file is not set");
        }
        Ok(())
    }

    /// Check that every referenced input exists. Run once before any element work.
    pub fn check_inputs(&self) -> Result<()> {
        require_file(&self.score.file, "Score file")?;
        if self.needs_genome() {
            match &self.genome.fasta {
                Some(fasta) => require_file(fasta, "Reference FASTA")?,
                None => bail!("genome.fasta is required for signatures, indels or score files without a ref column"),
            }
        }
        if let Some(p) = &self.signature.path {
            require_file(p, "Signature file")?;
        }
        if let Some(p) = &self.statistic.indels.stops_file {
            require_file(p, "Stops file")?;
        }
        for track in [&self.depth, &self.mutability] {
            if let (true, Some(p)) = (track.adjusting, &track.file) {
                require_file(p, "Site weight file")?;
            }
        }
        if let Some(p) = &self.grouping.json_file {
            require_file(p, "Grouping file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.statistic.sampling, 10_000);
        assert_eq!(config.statistic.sampling_max, 1_000_000);
        assert_eq!(config.statistic.indels.window_size, 10);
        assert_eq!(config.statistic.indels.max_size, 20);
        assert_eq!(config.statistic.indels.frame_length(), 3);
        assert_eq!(config.settings.min_samples_for_significance, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let json = r#"{"statistic": {"method": "gmean", "indels": {"method": "stop", "enable_frame": false}},
                       "score": {"file": "scores.tsv.gz", "ref": null, "score": 5}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.statistic.method, StatisticMethod::Gmean);
        assert_eq!(config.statistic.indels.method, IndelMethod::Stop);
        assert_eq!(config.statistic.indels.frame_length(), 1);
        assert_eq!(config.statistic.sampling, 10_000);
        assert_eq!(config.score.ref_col, None);
        assert_eq!(config.score.score, 5);
        assert!(config.needs_genome());
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let json = r#"{"statistic": {"indels": {"method": "nearest"}}}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sampling() {
        let mut config = Config::default();
        config.statistic.sampling_growth = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.statistic.sampling_max = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signature.method = SignatureMethod::File;
        assert!(config.validate().is_err(), "file signature without path");
    }
}
