use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zip::ZipArchive;

pub const MANIFEST_FILE: &str = "fetch.json";

const TABULAR_EXTENSION: &str = "csv";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("payload is not a zip archive: {0}")]
    NotAnArchive(#[source] zip::result::ZipError),
    #[error("reading archive member: {0}")]
    Member(#[source] zip::result::ZipError),
    #[error("archive member {0} escapes the extraction directory")]
    PathTraversal(String),
    #[error("archive has no tabular members ({entries} entries)")]
    NoTabularMembers { entries: usize },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing fetch manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ExtractError + '_ {
    move |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Provenance written next to the extracted members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchManifest {
    pub dataset_key: String,
    pub year: i32,
    pub identifier: String,
    pub source_name: String,
    pub source_url: String,
    pub sha256: String,
    pub bytes: usize,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub members: Vec<String>,
}

pub fn is_tabular_member(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(TABULAR_EXTENSION))
        .unwrap_or(false)
}

/// Writes every tabular member of the zip payload into `dir`, flattened to its
/// file name. Returns the written names, sorted.
pub fn extract_tabular_members(bytes: &[u8], dir: &Path) -> Result<Vec<String>, ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(ExtractError::NotAnArchive)?;
    let mut members = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(ExtractError::Member)?;
        if entry.is_dir() || !is_tabular_member(entry.name()) {
            continue;
        }
        let enclosed = entry
            .enclosed_name()
            .ok_or_else(|| ExtractError::PathTraversal(entry.name().to_string()))?;
        let Some(file_name) = enclosed.file_name().map(|n| n.to_os_string()) else {
            continue;
        };

        let out_path = dir.join(&file_name);
        let mut outfile = fs::File::create(&out_path).map_err(io_error(&out_path))?;
        io::copy(&mut entry, &mut outfile).map_err(io_error(&out_path))?;
        members.push(file_name.to_string_lossy().into_owned());
    }

    if members.is_empty() {
        return Err(ExtractError::NoTabularMembers {
            entries: archive.len(),
        });
    }
    members.sort();
    members.dedup();
    Ok(members)
}

/// Extracts into a hidden staging directory beside `target`, writes the manifest,
/// then renames the staging directory onto `target`. A failure leaves `target`
/// untouched.
pub fn install_archive(
    bytes: &[u8],
    target: &Path,
    mut manifest: FetchManifest,
) -> Result<Vec<String>, ExtractError> {
    let parent = target
        .parent()
        .ok_or_else(|| ExtractError::Io {
            path: target.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"),
        })?;
    fs::create_dir_all(parent).map_err(io_error(parent))?;

    let target_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{target_name}.{}.tmp", Uuid::new_v4()));
    fs::create_dir(&staging).map_err(io_error(&staging))?;

    let staged = extract_tabular_members(bytes, &staging).and_then(|members| {
        manifest.members = members.clone();
        let manifest_path = staging.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&manifest_path, json).map_err(io_error(&manifest_path))?;
        Ok(members)
    });

    let members = match staged {
        Ok(members) => members,
        Err(err) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
    };

    // An empty leftover directory is replaced. A populated one means another
    // worker finished first; its members are kept and ours are discarded.
    if target.is_dir() {
        let _ = fs::remove_dir(target);
    }
    if let Err(source) = fs::rename(&staging, target) {
        let _ = fs::remove_dir_all(&staging);
        if let Some(existing) = installed_members(target) {
            return Ok(existing);
        }
        return Err(ExtractError::Io {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(members)
}

/// Tabular members of an already populated directory, `None` if it is empty or unreadable.
fn installed_members(dir: &Path) -> Option<Vec<String>> {
    let entries = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    if entries.is_empty() {
        return None;
    }
    let mut members = entries
        .into_iter()
        .filter(|name| is_tabular_member(name))
        .collect::<Vec<_>>();
    members.sort();
    Some(members)
}
