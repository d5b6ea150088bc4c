//! On-disk memo of per-element score indexes.
//!
//! Entries are gzip-compressed JSON named after the element and a hash of
//! everything the index depends on. Presence of the file is the only check;
//! writers go through a temp file and a rename, so concurrent writers of the
//! same entry simply replace each other with identical content.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::io::{finish_gz, get_reader, gz_writer};
use crate::regions::Element;
use crate::scores::ScoreIndex;

static TMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Serialize)]
struct CacheKey<'a> {
    element: &'a Element,
    score: &'a crate::config::ScoreConfig,
    signature: &'a crate::config::SignatureConfig,
    fasta: Option<&'a Path>,
}

/// First 16 hex digits of the SHA-256 of the encoded key.
fn key_digest(encoded: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(encoded.as_bytes()));
    hex.truncate(16);
    hex
}

#[derive(Debug, Clone)]
pub struct ScoreCache {
    dir: PathBuf,
}

impl ScoreCache {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create cache directory: {:?}", dir))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    /// Cache file of `element` under `config`.
    pub fn entry_path(&self, element: &Element, config: &Config) -> Result<PathBuf> {
        let key = CacheKey {
            element,
            score: &config.score,
            signature: &config.signature,
            fasta: config.genome.fasta.as_deref(),
        };
        let encoded = serde_json::to_string(&key).context("Failed to encode cache key")?;
        let safe_id: String =
            element.id.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();
        Ok(self.dir.join(format!("{}-{}.json.gz", safe_id, key_digest(&encoded))))
    }

    pub fn load(&self, element: &Element, config: &Config) -> Option<ScoreIndex> {
        let path = self.entry_path(element, config).ok()?;
        if !path.is_file() {
            return None;
        }
        let index = get_reader(&path)
            .and_then(|r| serde_json::from_reader::<_, ScoreIndex>(r).with_context(|| format!("Corrupt cache entry {:?}", path)));
        match index {
            Ok(index) => {
                debug!("{}: score index loaded from cache", element.id);
                Some(index)
            }
            Err(e) => {
                warn!("{}: ignoring cache entry: {:#}", element.id, e);
                None
            }
        }
    }

    pub fn store(&self, element: &Element, config: &Config, index: &ScoreIndex) -> Result<()> {
        let path = self.entry_path(element, config)?;
        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut writer = gz_writer(&tmp)?;
        serde_json::to_writer(&mut writer, index).with_context(|| format!("Failed to encode cache entry {:?}", tmp))?;
        finish_gz(writer)?;
        std::fs::rename(&tmp, &path).with_context(|| format!("Failed to move cache entry into place: {:?}", path))?;
        Ok(())
    }
}
