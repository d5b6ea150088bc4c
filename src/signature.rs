//! Trinucleotide signature probabilities.
//!
//! The table is a JSON object of buckets, each mapping `"REF>ALT"` triplet
//! pairs to a probability:
//!
//! ```json
//! {"cohort": {"ACA>AGA": 0.0012, "ACA>ATA": 0.0008}}
//! ```
//!
//! Tables collapsed to pyrimidine reference bases (96 channels) are supported:
//! a pair missing from the table is retried as its reverse complement.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::io::{get_reader, require_file};

pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        other => other,
    }
}

pub fn reverse_complement(seq: &str) -> String {
    seq.bytes().rev().map(|b| complement(b) as char).collect()
}

/// Replace the centre base of a trinucleotide.
pub fn alt_triplet(ref_triplet: &str, alt: u8) -> String {
    let mut bytes = ref_triplet.as_bytes().to_vec();
    if bytes.len() == 3 {
        bytes[1] = alt;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[derive(Debug, Clone, Default)]
pub struct SignatureTable {
    names: Vec<String>,
    buckets: Vec<HashMap<(String, String), f64>>,
}

impl SignatureTable {
    pub fn load(path: &Path) -> Result<Self> {
        require_file(path, "Signature file")?;
        let raw: BTreeMap<String, BTreeMap<String, f64>> = serde_json::from_reader(get_reader(path)?)
            .with_context(|| format!("Invalid signature file: {:?}", path))?;
        let table = Self::from_map(raw)?;
        info!("Loaded signature with {} buckets from {:?}", table.names.len(), path);
        Ok(table)
    }

    pub fn from_map(raw: BTreeMap<String, BTreeMap<String, f64>>) -> Result<Self> {
        if raw.is_empty() {
            bail!("Signature table has no buckets");
        }
        let mut names = Vec::with_capacity(raw.len());
        let mut buckets = Vec::with_capacity(raw.len());
        for (name, probs) in raw {
            let mut bucket = HashMap::with_capacity(probs.len());
            for (key, p) in probs {
                let Some((r, a)) = key.split_once('>') else {
                    bail!("Signature bucket {}: key '{}' is not REF>ALT", name, key);
                };
                if r.len() != 3 || a.len() != 3 || !p.is_finite() || p < 0.0 {
                    bail!("Signature bucket {}: invalid entry {} = {}", name, key, p);
                }
                bucket.insert((r.to_ascii_uppercase(), a.to_ascii_uppercase()), p);
            }
            names.push(name);
            buckets.push(bucket);
        }
        Ok(Self { names, buckets })
    }

    pub fn bucket_names(&self) -> &[String] {
        &self.names
    }

    pub fn bucket_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Probability of `ref_triplet -> alt_triplet` in one bucket.
    pub fn probability(&self, bucket: usize, ref_triplet: &str, alt_triplet: &str) -> Option<f64> {
        let table = self.buckets.get(bucket)?;
        table
            .get(&(ref_triplet.to_string(), alt_triplet.to_string()))
            .or_else(|| table.get(&(reverse_complement(ref_triplet), reverse_complement(alt_triplet))))
            .copied()
    }
}
