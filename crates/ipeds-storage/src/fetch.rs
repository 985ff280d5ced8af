use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use ipeds_core::{validate_source_locations, CatalogError, DatasetDescriptor, SourceLocation};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::extract::{install_archive, is_tabular_member, ExtractError, FetchManifest};
use crate::{sha256_hex, ArchiveTransport, FetchError};

const DATA_DIR: &str = "ipeds_data";

/// Local cache partitioned per (year, dataset key).
#[derive(Debug, Clone)]
pub struct ExtractionCache {
    root: PathBuf,
}

impl ExtractionCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dataset_dir(&self, key: &str, year: i32) -> PathBuf {
        self.root.join(DATA_DIR).join(year.to_string()).join(key)
    }

    /// A directory that exists and holds at least one entry counts as fetched.
    pub async fn is_populated(&self, dir: &Path) -> io::Result<bool> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(entries.next_entry().await?.is_some())
    }

    pub async fn tabular_members(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut entries = fs::read_dir(dir).await?;
        let mut members = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_tabular_member(&name) {
                members.push(name);
            }
        }
        members.sort();
        Ok(members)
    }
}

/// Successful fetch: where the tabular members live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub dataset_key: String,
    pub year: i32,
    pub dir: PathBuf,
    pub members: Vec<String>,
    /// True when the cache satisfied the request without network I/O.
    pub cached: bool,
    pub source_url: Option<String>,
}

pub type ExtractionResult = Result<Extraction, ArchiveFetchError>;

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error(transparent)]
    Content(#[from] ExtractError),
}

#[derive(Debug, Error)]
pub enum ArchiveFetchError {
    #[error("dataset {key} has no candidate identifiers")]
    NoCandidates { key: String },
    #[error("all {attempts} attempts failed for {key}; last was {last_url}: {last}")]
    Exhausted {
        key: String,
        attempts: usize,
        last_url: String,
        #[source]
        last: AttemptError,
    },
    #[error("checking extraction cache {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Tries every (identifier, location) pair in order until one yields an archive
/// with tabular members.
pub struct ArchiveFetcher {
    transport: Arc<dyn ArchiveTransport>,
    locations: Vec<SourceLocation>,
    cache: ExtractionCache,
}

impl ArchiveFetcher {
    pub fn new(
        transport: Arc<dyn ArchiveTransport>,
        locations: Vec<SourceLocation>,
        cache: ExtractionCache,
    ) -> Result<Self, CatalogError> {
        validate_source_locations(&locations)?;
        Ok(Self {
            transport,
            locations,
            cache,
        })
    }

    pub fn cache(&self) -> &ExtractionCache {
        &self.cache
    }

    pub async fn fetch(&self, descriptor: &DatasetDescriptor, year: i32) -> ExtractionResult {
        let key = descriptor.key.as_str();
        let dir = self.cache.dataset_dir(key, year);
        let cache_error = |source| ArchiveFetchError::Cache {
            path: dir.clone(),
            source,
        };

        if self.cache.is_populated(&dir).await.map_err(cache_error)? {
            info!(dataset = key, year, dir = %dir.display(), "already extracted; skipping download");
            let members = self.cache.tabular_members(&dir).await.map_err(cache_error)?;
            return Ok(Extraction {
                dataset_key: key.to_string(),
                year,
                dir,
                members,
                cached: true,
                source_url: None,
            });
        }

        let mut attempts = 0usize;
        let mut last: Option<(String, AttemptError)> = None;

        for identifier in &descriptor.candidate_identifiers {
            for location in &self.locations {
                let url = location.url_for(identifier);
                attempts += 1;
                info!(dataset = key, year, source = %location.name, %url, "trying archive");

                let bytes = match self.transport.get(&location.name, &url).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(dataset = key, %url, error = %err, "retrieval failed");
                        last = Some((url, err.into()));
                        continue;
                    }
                };

                let manifest = FetchManifest {
                    dataset_key: key.to_string(),
                    year,
                    identifier: identifier.clone(),
                    source_name: location.name.clone(),
                    source_url: url.clone(),
                    sha256: sha256_hex(&bytes),
                    bytes: bytes.len(),
                    fetched_at: Utc::now(),
                    members: Vec::new(),
                };
                let target = dir.clone();
                let installed =
                    tokio::task::spawn_blocking(move || install_archive(&bytes, &target, manifest))
                        .await
                        .unwrap_or_else(|join| Err(ExtractError::Worker(join.to_string())));

                match installed {
                    Ok(members) => {
                        info!(dataset = key, year, %url, members = members.len(), "archive extracted");
                        return Ok(Extraction {
                            dataset_key: key.to_string(),
                            year,
                            dir,
                            members,
                            cached: false,
                            source_url: Some(url),
                        });
                    }
                    Err(err) => {
                        warn!(dataset = key, %url, error = %err, "payload rejected");
                        last = Some((url, err.into()));
                    }
                }
            }
        }

        match last {
            Some((last_url, last)) => Err(ArchiveFetchError::Exhausted {
                key: key.to_string(),
                attempts,
                last_url,
                last,
            }),
            None => Err(ArchiveFetchError::NoCandidates {
                key: key.to_string(),
            }),
        }
    }
}
