//! Transparent file access for plain, gzip and BGZF inputs, plus gzip writers.
//!
//! Score, depth and stop files are usually BGZF (tabix-indexed); mutation,
//! region and symbol files may be plain text or ordinary gzip. Readers pick
//! the right decoder from the file header so callers never care which one
//! they were given.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Check if a file appears to be BGZF format by examining the header.
///
/// BGZF files carry the gzip magic bytes, the FEXTRA flag and a "BC"
/// subfield identifier in the extra block.
fn is_bgzf_file(path: &Path) -> bool {
    let mut header = [0u8; 18];
    match File::open(path).and_then(|mut f| f.read_exact(&mut header)) {
        Ok(()) => {
            header[0] == 0x1f && header[1] == 0x8b && header[3] & 0x04 != 0 && header[12] == b'B' && header[13] == b'C'
        }
        Err(_) => false,
    }
}

fn is_gzip_file(path: &Path) -> bool {
    let mut magic = [0u8; 2];
    match File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == [0x1f, 0x8b],
        Err(_) => false,
    }
}

/// Open a file and return a buffered reader, handling compression transparently.
///
/// Compression is detected from the magic bytes rather than the extension so
/// that `.bgz`, `.gz` and uncompressed inputs all work.
pub fn get_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;
    if is_bgzf_file(path) {
        let bgzf_reader = noodles::bgzf::io::Reader::new(file);
        Ok(Box::new(BufReader::new(bgzf_reader)))
    } else if is_gzip_file(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Create a gzip-compressed writer, creating parent directories as needed.
pub fn gz_writer(path: &Path) -> Result<GzEncoder<BufWriter<File>>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
        }
    }
    let file = File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
}

/// Flush and close a gzip writer, surfacing any deferred I/O error.
pub fn finish_gz(writer: GzEncoder<BufWriter<File>>) -> Result<()> {
    let mut inner = writer.finish().context("Failed to finish gzip stream")?;
    inner.flush().context("Failed to flush output")?;
    Ok(())
}

/// Fail early with a clear message when a required input is missing.
pub fn require_file(path: &Path, what: &str) -> Result<()> {
    if !path.is_file() {
        anyhow::bail!("{} not found: {:?}", what, path);
    }
    Ok(())
}

/// Iterate data lines, skipping blanks and `#` comments.
pub fn data_lines(reader: Box<dyn BufRead>) -> impl Iterator<Item = std::io::Result<String>> {
    reader.lines().filter(|line| match line {
        Ok(l) => {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        }
        Err(_) => true,
    })
}

/// Tally of skipped input rows. The first few are logged verbatim, the rest
/// only contribute to the closing summary.
#[derive(Debug, Default)]
pub struct RowErrors {
    pub count: usize,
}

impl RowErrors {
    const MAX_EXAMPLES: usize = 10;

    pub fn record(&mut self, source: &Path, line_no: usize, reason: &str) {
        self.count += 1;
        if self.count <= Self::MAX_EXAMPLES {
            log::warn!("{:?} line {}: {}", source, line_no, reason);
        }
    }

    pub fn summarize(&self, source: &Path, kept: usize) {
        if self.count > 0 {
            log::warn!("{:?}: skipped {} malformed rows ({} kept)", source, self.count, kept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_plain_and_gzip_read_identically() {
        let mut plain = NamedTempFile::with_suffix(".tsv").unwrap();
        writeln!(plain, "a\tb\n# skip\n\nc\td").unwrap();
        plain.flush().unwrap();

        let gz = NamedTempFile::with_suffix(".tsv.gz").unwrap();
        let mut w = gz_writer(gz.path()).unwrap();
        writeln!(w, "a\tb\n# skip\n\nc\td").unwrap();
        finish_gz(w).unwrap();

        let from_plain: Vec<String> = data_lines(get_reader(plain.path()).unwrap()).map(|l| l.unwrap()).collect();
        let from_gz: Vec<String> = data_lines(get_reader(gz.path()).unwrap()).map(|l| l.unwrap()).collect();
        assert_eq!(from_plain, vec!["a\tb", "c\td"]);
        assert_eq!(from_plain, from_gz);
    }

    #[test]
    fn test_plain_gzip_is_not_bgzf() {
        let gz = NamedTempFile::with_suffix(".gz").unwrap();
        let mut w = gz_writer(gz.path()).unwrap();
        writeln!(w, "x").unwrap();
        finish_gz(w).unwrap();
        assert!(is_gzip_file(gz.path()));
        assert!(!is_bgzf_file(gz.path()), "flate2 output has no BC subfield");
    }

    #[test]
    fn test_require_file_missing() {
        let err = require_file(Path::new("/nonexistent/input.tsv"), "Mutations file").unwrap_err();
        assert!(err.to_string().contains("Mutations file not found"));
    }
}
