//! Reference genome access.
//!
//! Coordinates are 1-based throughout: `get_ref(chrom, start, len)` returns
//! `len` bases beginning at `start`. Handles are opened per worker through a
//! [`GenomeSource`] since faidx readers are not shareable across threads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_htslib::faidx;

use crate::regions::normalize_chrom;

pub trait GenomeSequence {
    /// `len` upper-case bases starting at 1-based `start`, or `None` when the
    /// chromosome is unknown or the range runs off its end.
    fn get_ref(&self, chrom: &str, start: u64, len: usize) -> Option<String>;

    /// Trinucleotide centred on 1-based `pos`.
    fn triplet(&self, chrom: &str, pos: u64) -> Option<String> {
        if pos < 2 {
            return None;
        }
        self.get_ref(chrom, pos - 1, 3)
    }
}

/// Factory for per-worker genome handles.
pub trait GenomeSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn GenomeSequence>>;
}

// ============================================================================
// FASTA (faidx)
// ============================================================================

pub struct FastaGenome {
    path: PathBuf,
}

impl FastaGenome {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }
}

impl GenomeSource for FastaGenome {
    fn open(&self) -> Result<Box<dyn GenomeSequence>> {
        let reader = faidx::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open reference FASTA {:?}. Make sure .fai exists.", self.path))?;
        Ok(Box::new(FastaSequence { reader }))
    }
}

struct FastaSequence {
    reader: faidx::Reader,
}

impl GenomeSequence for FastaSequence {
    fn get_ref(&self, chrom: &str, start: u64, len: usize) -> Option<String> {
        if start == 0 || len == 0 {
            return None;
        }
        let bare = normalize_chrom(chrom);
        let begin = (start - 1) as usize;
        let end = begin + len - 1;
        // Reference may or may not use the chr prefix
        for name in [bare.to_string(), format!("chr{}", bare)] {
            if let Ok(seq) = self.reader.fetch_seq(&name, begin, end) {
                if seq.len() == len {
                    return Some(String::from_utf8_lossy(&seq).to_ascii_uppercase());
                }
            }
        }
        None
    }
}

// ============================================================================
// In-memory genome
// ============================================================================

/// Whole chromosomes held in memory. Useful for small panels and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryGenome {
    chroms: Arc<HashMap<String, String>>,
}

impl MemoryGenome {
    pub fn new<I, K, V>(chroms: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let chroms = chroms
            .into_iter()
            .map(|(k, v)| (normalize_chrom(k.as_ref()).to_string(), v.as_ref().to_ascii_uppercase()))
            .collect();
        Self { chroms: Arc::new(chroms) }
    }
}

impl GenomeSequence for MemoryGenome {
    fn get_ref(&self, chrom: &str, start: u64, len: usize) -> Option<String> {
        let seq = self.chroms.get(normalize_chrom(chrom))?;
        if start == 0 {
            return None;
        }
        let begin = (start - 1) as usize;
        seq.get(begin..begin + len).map(|s| s.to_string())
    }
}

impl GenomeSource for MemoryGenome {
    fn open(&self) -> Result<Box<dyn GenomeSequence>> {
        Ok(Box::new(self.clone()))
    }
}
