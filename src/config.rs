//! Static pipeline configuration: catalogs, event domains, sharding and the
//! special token block.
//!
//! Everything the pipeline needs to know about the dataset layout lives here,
//! either loaded from a JSON file or taken from [`PipelineConfig::tecd`].
//!
//! ```json
//! {
//!   "data_dir": "dataset/full",
//!   "output_dir": "dataset/processed",
//!   "shard_count": 50,
//!   "catalogs": {
//!     "marketplace": { "path": "marketplace/items.pq", "id_column": "item_id", "prefix": "MP_" },
//!     "brands":      { "path": "brands.pq",            "id_column": "brand_id", "prefix": "BR_" }
//!   },
//!   "domains": {
//!     "marketplace": { "layout": { "nested": { "subdir": "events" } }, "entity_column": "item_id",
//!                      "catalog": "marketplace", "sample_rate": 0.01 },
//!     "reviews":     { "layout": "flat", "entity_column": "brand_id",
//!                      "catalog": "brands", "sample_rate": 0.1 }
//!   }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::common::{PipelineError, SpecialTokens, io_at};

pub const DEFAULT_SHARD_COUNT: u32 = 50;
pub const DEFAULT_SAMPLE_MAX_ROWS: usize = 10_000;

// ============================================================================
// Catalogs
// ============================================================================

/// A static entity listing that contributes one namespace to the vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Path of the catalog file, relative to `data_dir`.
    pub path: PathBuf,
    /// Column holding the domain-local entity id.
    pub id_column: String,
    /// Namespace prefix prepended to every id of this catalog.
    pub prefix: String,
}

// ============================================================================
// Event Domains
// ============================================================================

/// Where a domain keeps its day-partition files, relative to `<data_dir>/<domain>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryRule {
    /// Day files live in a nested sub-partition, e.g. `marketplace/events/00042.pq`.
    Nested { subdir: String },
    /// Day files live directly under the domain root, e.g. `reviews/00042.pq`.
    Flat,
}

/// Naming convention shared by all day-partition files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayFileNaming {
    /// Number of digits in the zero-padded day code.
    pub digits: usize,
    /// File extension, without the leading dot.
    pub extension: String,
}

impl Default for DayFileNaming {
    fn default() -> Self {
        Self {
            digits: 5,
            extension: "pq".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub layout: DiscoveryRule,
    /// Per-row inclusion probability for exploratory sampling.
    pub sample_rate: f64,
    #[serde(default = "default_user_column")]
    pub user_column: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    /// Column holding the entity reference (item or brand, depending on domain).
    pub entity_column: String,
    /// Name of the catalog whose namespace this domain's entities resolve against.
    pub catalog: String,
}

fn default_user_column() -> String {
    "user_id".to_string()
}

fn default_timestamp_column() -> String {
    "timestamp".to_string()
}

fn default_shard_count() -> u32 {
    DEFAULT_SHARD_COUNT
}

fn default_sample_max_rows() -> usize {
    DEFAULT_SAMPLE_MAX_ROWS
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the raw dataset (catalogs and domain directories).
    pub data_dir: PathBuf,
    /// Where `vocab.parquet` and `shards/` are written.
    pub output_dir: PathBuf,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Upper bound on rows returned by one exploratory sample.
    #[serde(default = "default_sample_max_rows")]
    pub sample_max_rows: usize,
    #[serde(default)]
    pub special_tokens: SpecialTokens,
    #[serde(default)]
    pub file_naming: DayFileNaming,
    /// Vocabulary namespaces, in id-assignment order.
    pub catalogs: IndexMap<String, CatalogConfig>,
    /// Event domains, in union order.
    pub domains: IndexMap<String, DomainConfig>,
}

impl PipelineConfig {
    /// The T-ECD layout: three item catalogs plus the brand registry, and four
    /// event domains where reviews reference brands and sit in a flat layout.
    pub fn tecd(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let item_catalog = |domain: &str, prefix: &str| CatalogConfig {
            path: PathBuf::from(domain).join("items.pq"),
            id_column: "item_id".to_string(),
            prefix: prefix.to_string(),
        };
        let mut catalogs = IndexMap::new();
        catalogs.insert("marketplace".to_string(), item_catalog("marketplace", "MP_"));
        catalogs.insert("retail".to_string(), item_catalog("retail", "RT_"));
        catalogs.insert("offers".to_string(), item_catalog("offers", "OF_"));
        catalogs.insert(
            "brands".to_string(),
            CatalogConfig {
                path: PathBuf::from("brands.pq"),
                id_column: "brand_id".to_string(),
                prefix: "BR_".to_string(),
            },
        );

        let item_domain = |catalog: &str, sample_rate: f64| DomainConfig {
            layout: DiscoveryRule::Nested {
                subdir: "events".to_string(),
            },
            sample_rate,
            user_column: default_user_column(),
            timestamp_column: default_timestamp_column(),
            entity_column: "item_id".to_string(),
            catalog: catalog.to_string(),
        };
        let mut domains = IndexMap::new();
        domains.insert("marketplace".to_string(), item_domain("marketplace", 0.01));
        domains.insert("retail".to_string(), item_domain("retail", 0.01));
        domains.insert("offers".to_string(), item_domain("offers", 0.05));
        domains.insert(
            "reviews".to_string(),
            DomainConfig {
                layout: DiscoveryRule::Flat,
                sample_rate: 0.1,
                user_column: default_user_column(),
                timestamp_column: default_timestamp_column(),
                entity_column: "brand_id".to_string(),
                catalog: "brands".to_string(),
            },
        );

        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
            shard_count: DEFAULT_SHARD_COUNT,
            sample_max_rows: DEFAULT_SAMPLE_MAX_ROWS,
            special_tokens: SpecialTokens::default(),
            file_naming: DayFileNaming::default(),
            catalogs,
            domains,
        }
    }

    /// Load and validate a JSON config.
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(io_at(path))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|source| PipelineError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Config for a binary invocation: the JSON file if given, otherwise the
    /// T-ECD default rooted at `data_dir`. Explicit directories override the
    /// file's; the default output directory is `<data_dir>/processed`.
    pub fn resolve(
        config_path: Option<&Path>,
        data_dir: Option<PathBuf>,
        output_dir: Option<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let mut config = match (config_path, &data_dir) {
            (Some(path), _) => Self::from_json_file(path)?,
            (None, Some(data)) => Self::tecd(data, data.join("processed")),
            (None, None) => {
                return Err(PipelineError::Config(
                    "either a config file or a data directory is required".into(),
                ));
            }
        };
        if let Some(data) = data_dir {
            config.data_dir = data;
        }
        if let Some(out) = output_dir {
            config.output_dir = out;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every rule whose violation would make the run meaningless.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.special_tokens.validate()?;

        if self.shard_count == 0 {
            return Err(PipelineError::Config("shard_count must be at least 1".into()));
        }
        if self.file_naming.digits == 0 {
            return Err(PipelineError::Config(
                "file_naming.digits must be at least 1".into(),
            ));
        }
        if self.catalogs.is_empty() {
            return Err(PipelineError::Config("no catalogs configured".into()));
        }

        // Prefixes must be prefix-free, otherwise "M" + "P_1" == "MP_" + "1".
        let prefixes: Vec<(&String, &str)> = self
            .catalogs
            .iter()
            .map(|(name, c)| (name, c.prefix.as_str()))
            .collect();
        for (i, (name, prefix)) in prefixes.iter().enumerate() {
            if prefix.is_empty() {
                return Err(PipelineError::Config(format!(
                    "catalog '{name}' has an empty prefix"
                )));
            }
            for (other, other_prefix) in &prefixes[i + 1..] {
                if prefix.starts_with(other_prefix) || other_prefix.starts_with(prefix) {
                    return Err(PipelineError::Config(format!(
                        "prefixes of catalogs '{name}' ('{prefix}') and '{other}' ('{other_prefix}') overlap"
                    )));
                }
            }
            for special in &self.special_tokens.names {
                if special.starts_with(prefix) {
                    return Err(PipelineError::Config(format!(
                        "special token '{special}' starts with prefix '{prefix}' of catalog '{name}'"
                    )));
                }
            }
        }

        for (name, domain) in &self.domains {
            if !self.catalogs.contains_key(&domain.catalog) {
                return Err(PipelineError::Config(format!(
                    "domain '{name}' resolves against unknown catalog '{}'",
                    domain.catalog
                )));
            }
            if !(0.0..=1.0).contains(&domain.sample_rate) {
                return Err(PipelineError::Config(format!(
                    "domain '{name}' has sample_rate {} outside [0, 1]",
                    domain.sample_rate
                )));
            }
        }
        Ok(())
    }

    /// Keep only the named domains, preserving configured order.
    pub fn restrict_domains(&mut self, names: &[String]) -> Result<(), PipelineError> {
        for name in names {
            if !self.domains.contains_key(name) {
                return Err(PipelineError::UnknownDomain(name.clone()));
            }
        }
        self.domains.retain(|name, _| names.contains(name));
        Ok(())
    }

    pub fn domain(&self, name: &str) -> Result<&DomainConfig, PipelineError> {
        self.domains
            .get(name)
            .ok_or_else(|| PipelineError::UnknownDomain(name.to_string()))
    }

    /// Namespace prefix applied to a domain's entity column.
    pub fn domain_prefix(&self, domain: &DomainConfig) -> Result<&str, PipelineError> {
        self.catalogs
            .get(&domain.catalog)
            .map(|c| c.prefix.as_str())
            .ok_or_else(|| PipelineError::Config(format!("unknown catalog '{}'", domain.catalog)))
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.output_dir.join(crate::common::VOCAB_FILE)
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.output_dir.join(crate::common::SHARDS_DIR)
    }
}
