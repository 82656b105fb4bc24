//! Day-partition file discovery.
//!
//! Each domain stores one file per day, named by a zero-padded day code
//! (`00042.pq`). Where those files live is the domain's [`DiscoveryRule`];
//! everything downstream only sees the resulting [`DomainFiles`].

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::common::{PipelineError, io_at};
use crate::config::{DayFileNaming, DiscoveryRule, DomainConfig};

/// One day-partition file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayFile {
    pub day: u32,
    pub path: PathBuf,
}

/// Inclusive day-code range. Unbounded ends accept everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayWindow {
    pub begin: Option<u32>,
    pub end: Option<u32>,
}

impl DayWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, day: u32) -> bool {
        self.begin.is_none_or(|b| day >= b) && self.end.is_none_or(|e| day <= e)
    }
}

/// The files discovered for one domain, sorted by day.
#[derive(Debug, Clone)]
pub struct DomainFiles {
    pub domain: String,
    /// Directory that was enumerated.
    pub root: PathBuf,
    pub files: Vec<DayFile>,
}

impl DomainFiles {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect()
    }

    /// `(first, last)` day codes, if any file was found.
    pub fn day_span(&self) -> Option<(u32, u32)> {
        Some((self.files.first()?.day, self.files.last()?.day))
    }
}

/// Directory holding a domain's day files under the given layout rule.
pub fn partition_root(data_dir: &Path, domain: &str, rule: &DiscoveryRule) -> PathBuf {
    let domain_root = data_dir.join(domain);
    match rule {
        DiscoveryRule::Nested { subdir } => domain_root.join(subdir),
        DiscoveryRule::Flat => domain_root,
    }
}

/// Parse a day code out of a file name, e.g. `00042.pq` → 42.
pub fn parse_day_code(file_name: &str, naming: &DayFileNaming) -> Option<u32> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if ext != naming.extension || stem.len() != naming.digits {
        return None;
    }
    if !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Enumerate every day file of a domain that falls inside `window`.
///
/// A missing partition directory yields an empty result rather than an error;
/// the caller decides how loudly to report it.
pub fn discover_day_files(
    domain: &str,
    config: &DomainConfig,
    naming: &DayFileNaming,
    data_dir: &Path,
    window: DayWindow,
) -> Result<DomainFiles, PipelineError> {
    let root = partition_root(data_dir, domain, &config.layout);
    let mut files = Vec::new();

    if root.is_dir() {
        for entry in fs::read_dir(&root).map_err(io_at(&root))? {
            let entry = entry.map_err(io_at(&root))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_day_code(name, naming) {
                Some(day) if window.contains(day) => files.push(DayFile { day, path }),
                Some(_) => {}
                None => debug!("  {domain}: ignoring {}", path.display()),
            }
        }
    } else {
        debug!("  {domain}: partition directory {} does not exist", root.display());
    }

    files.sort_by_key(|f| f.day);
    Ok(DomainFiles {
        domain: domain.to_string(),
        root,
        files,
    })
}
