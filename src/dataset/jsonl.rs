//! JSONL loading and writing.
//!
//! Epistemic foundation:
//! - K_i: Input order is output order; downstream tooling indexes records by line
//! - B_i: Any line may be malformed → ParseError naming the line
//!
//! Output is written to a temp sibling and renamed into place.

use crate::models::{Record, RepairError, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Load all records from a JSONL file.
///
/// Blank lines are skipped. A malformed line fails the whole load.
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path)
        .map_err(|e| RepairError::io(format!("opening dataset {}", path.display()), e))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| RepairError::io("reading dataset", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line.trim()).map_err(|e| {
            RepairError::ParseError(format!("{} line {}: {e}", path.display(), line_num + 1))
        })?;
        records.push(record);
    }

    info!(count = records.len(), path = %path.display(), "Loaded records");
    Ok(records)
}

/// Write every record, one JSON document per line, replacing `path`.
pub fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    let temp_path = temp_sibling(path);

    {
        let file = File::create(&temp_path)
            .map_err(|e| RepairError::io("creating temp output", e))?;
        let mut writer = BufWriter::new(file);

        for record in records {
            serde_json::to_writer(&mut writer, record)
                .map_err(|e| RepairError::Internal(format!("Serializing record: {e}")))?;
            writer
                .write_all(b"\n")
                .map_err(|e| RepairError::io("writing output", e))?;
        }

        writer
            .flush()
            .map_err(|e| RepairError::io("flushing output", e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| RepairError::io("renaming output", e))?;

    debug!(count = records.len(), path = %path.display(), "Records written");
    Ok(())
}

/// Count lines of a file that contain `pattern`.
///
/// Lines hold serialized JSON, so the pattern also matches in its
/// JSON-escaped form (quotes, backslashes, control characters).
pub fn count_lines_containing(path: &Path, pattern: &str) -> Result<usize> {
    let escaped = json_escaped(pattern)?;
    let file = File::open(path)
        .map_err(|e| RepairError::io(format!("opening {} for verification", path.display()), e))?;
    let reader = BufReader::new(file);

    let mut count = 0;
    for line in reader.lines() {
        let line = line.map_err(|e| RepairError::io("reading output for verification", e))?;
        if line.contains(pattern) || line.contains(escaped.as_str()) {
            count += 1;
        }
    }
    Ok(count)
}

/// `pattern` as it appears inside a serialized JSON string, without the quotes.
fn json_escaped(pattern: &str) -> Result<String> {
    let quoted = serde_json::to_string(pattern)
        .map_err(|e| RepairError::Internal(format!("Escaping pattern: {e}")))?;
    Ok(quoted[1..quoted.len() - 1].to_string())
}

/// `data.jsonl` → `data.jsonl.tmp`, in the same directory so rename stays atomic.
fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("output"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Field, HYDE, LEX};
    use tempfile::TempDir;

    #[test]
    fn test_load_skips_blank_lines_and_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("in.jsonl");
        fs::write(
            &path,
            concat!(
                r#"{"query":"first","output":[["lex","a"]]}"#,
                "\n\n",
                r#"{"query":"second","output":[]}"#,
                "\n   \n",
                r#"{"query":"third","output":[["hyde","b"]]}"#,
                "\n"
            ),
        )
        .unwrap();

        let records = load_records(&path).unwrap();
        let queries: Vec<_> = records.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(queries, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_load_reports_line_number() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("in.jsonl");
        fs::write(&path, "{\"query\":\"ok\",\"output\":[]}\n{not json}\n").unwrap();

        let err = load_records(&path).unwrap_err();
        assert!(matches!(err, RepairError::ParseError(ref msg) if msg.contains("line 2")));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = load_records(&temp_dir.path().join("absent.jsonl")).unwrap_err();
        assert!(matches!(err, RepairError::Io { .. }));
    }

    #[test]
    fn test_write_then_load_preserves_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        let records = vec![
            Record::new("a", vec![Field::new(LEX, "x"), Field::new(HYDE, "y")]),
            Record::new("b", vec![]),
        ];

        write_records(&path, &records).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!temp_sibling(&path).exists());
        assert_eq!(load_records(&path).unwrap(), records);
    }

    #[test]
    fn test_write_overwrites_existing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        fs::write(&path, "stale\nstale\nstale\n").unwrap();

        write_records(&path, &[Record::new("only", vec![])]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_count_lines_containing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        fs::write(&path, "bad marker\nfine\nmarker bad marker\n").unwrap();

        assert_eq!(count_lines_containing(&path, "marker").unwrap(), 2);
        assert_eq!(count_lines_containing(&path, "absent").unwrap(), 0);
    }

    #[test]
    fn test_count_matches_escaped_pattern_in_written_records() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("out.jsonl");
        let pattern = "the \"ultimate\" guide\\tips";
        write_records(
            &path,
            &[
                Record::new("a", vec![Field::new(HYDE, format!("Read {pattern} now"))]),
                Record::new("b", vec![Field::new(HYDE, "clean text")]),
            ],
        )
        .unwrap();

        assert_eq!(count_lines_containing(&path, pattern).unwrap(), 1);
    }
}
