use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use ipeds_core::RawTable;
use thiserror::Error;

use crate::extract::is_tabular_member;

/// Suffix of the revised release IPEDS ships next to the original file.
const REVISED_SUFFIX: &str = "_rv";

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no tabular file in {0}")]
    NoTabularFile(PathBuf),
    #[error("{0} has no header row")]
    MissingHeader(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Picks the revised member when present, otherwise the first tabular file by name.
pub fn select_tabular_file(dir: &Path) -> Result<PathBuf, ReadError> {
    let entries = fs::read_dir(dir).map_err(|source| ReadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut names = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| is_tabular_member(name))
        .collect::<Vec<_>>();
    names.sort();

    let revised = names.iter().find(|name| {
        Path::new(name.as_str())
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.to_ascii_lowercase().ends_with(REVISED_SUFFIX))
            .unwrap_or(false)
    });
    revised
        .or_else(|| names.first())
        .map(|name| dir.join(name))
        .ok_or_else(|| ReadError::NoTabularFile(dir.to_path_buf()))
}

pub fn read_extraction_dir(dir: &Path) -> Result<RawTable, ReadError> {
    let path = select_tabular_file(dir)?;
    read_table_file(&path)
}

pub fn read_table_file(path: &Path) -> Result<RawTable, ReadError> {
    let file = fs::File::open(path).map_err(|source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match parse_delimited(file) {
        Ok(Some(table)) => Ok(table),
        Ok(None) => Err(ReadError::MissingHeader(path.to_path_buf())),
        Err(source) => Err(ReadError::Csv {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parses comma-separated input whose first record is the header.
/// Returns `None` for input with no records at all.
pub fn parse_delimited<R: Read>(reader: R) -> Result<Option<RawTable>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut records = reader.byte_records();
    let Some(header) = records.next().transpose()? else {
        return Ok(None);
    };
    let headers = header
        .iter()
        .enumerate()
        .map(|(idx, raw)| {
            let name = decode_cell(raw);
            let name = if idx == 0 {
                name.trim_start_matches('\u{feff}').to_string()
            } else {
                name
            };
            name.trim().to_string()
        })
        .collect::<Vec<_>>();

    let width = headers.len();
    let mut rows = Vec::new();
    for record in records {
        let record = record?;
        let mut row = record.iter().map(decode_cell).collect::<Vec<_>>();
        if row.len() < width {
            row.resize(width, String::new());
        }
        rows.push(row);
    }

    Ok(Some(RawTable::new(headers, rows)))
}

/// UTF-8 when valid, otherwise Latin-1 (the encoding older survey files use).
fn decode_cell(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn header_is_trimmed_and_bom_stripped() {
        let input = "\u{feff}UNITID, INSTNM ,STABBR\n100,Alpha College,CT\n";
        let table = parse_delimited(input.as_bytes()).unwrap().unwrap();
        assert_eq!(table.headers, vec!["UNITID", "INSTNM", "STABBR"]);
        assert_eq!(table.rows, vec![vec!["100", "Alpha College", "CT"]]);
        assert_eq!(table.column_index("INSTNM"), Some(1));
    }

    #[test]
    fn latin1_cells_are_decoded() {
        let mut input = b"UNITID,INSTNM\n1,Universit".to_vec();
        input.push(0xe9);
        input.extend_from_slice(b" Laval\n");
        let table = parse_delimited(input.as_slice()).unwrap().unwrap();
        assert_eq!(table.rows[0][1], "Universit\u{e9} Laval");
    }

    #[test]
    fn short_rows_are_padded_to_header_width() {
        let table = parse_delimited("A,B,C\n1,2\n".as_bytes()).unwrap().unwrap();
        assert_eq!(table.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn empty_input_has_no_table() {
        assert!(parse_delimited("".as_bytes()).unwrap().is_none());
    }

    #[test]
    fn revised_member_is_preferred() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("hd2023.csv"), "UNITID\n1\n").unwrap();
        fs::write(dir.path().join("hd2023_rv.csv"), "UNITID\n2\n").unwrap();
        fs::write(dir.path().join("fetch.json"), "{}").unwrap();

        let table = read_extraction_dir(dir.path()).unwrap();
        assert_eq!(table.rows, vec![vec!["2"]]);
    }

    #[test]
    fn directory_without_tabular_files_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("fetch.json"), "{}").unwrap();
        assert!(matches!(
            read_extraction_dir(dir.path()),
            Err(ReadError::NoTabularFile(_))
        ));
    }
}
