//! Shared state behind the script API: the cross-worker key/value map and
//! the tick-data feed every worker reads round-robin.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Cross-worker key/value map with per-key numeric accumulation.
#[derive(Default)]
pub struct SharedMap {
    entries: DashMap<String, serde_json::Value>,
}

impl SharedMap {
    pub fn store(&self, key: String, value: serde_json::Value) {
        self.entries.insert(key, value);
    }

    pub fn load(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Add `delta` to the numeric value under `key` (missing or non-numeric
    /// counts as zero) and return the new value.
    pub fn add(&self, key: String, delta: f64) -> f64 {
        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| serde_json::Value::from(0.0));
        let current = entry.value().as_f64().unwrap_or(0.0);
        let next = current + delta;
        *entry.value_mut() = serde_json::Value::from(next);
        next
    }
}

/// One row of tick data handed to the script's `tick` function.
#[derive(Debug, Clone, PartialEq)]
pub enum TickData {
    Line(String),
    Row(Vec<String>),
}

enum TickReader {
    Csv(csv::Reader<File>),
    Lines(BufReader<File>),
}

/// Round-robin feed over a CSV or newline-delimited file. One cursor is
/// shared by every worker; reads wrap at EOF.
#[derive(Default)]
pub struct TickDataFeed {
    path: Mutex<Option<PathBuf>>,
    reader: Mutex<Option<TickReader>>,
}

impl TickDataFeed {
    pub fn set_file(&self, path: impl Into<PathBuf>) {
        *self.path.lock() = Some(path.into());
    }

    /// Open the configured file. Idempotent: later callers see the feed
    /// already open.
    pub fn open(&self) -> anyhow::Result<()> {
        let path = self.path.lock().clone();
        let Some(path) = path else { return Ok(()) };
        let mut reader = self.reader.lock();
        if reader.is_none() {
            *reader = Some(open_reader(&path)?);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.reader.lock().take();
    }

    pub fn next(&self) -> Option<TickData> {
        let path = self.path.lock().clone()?;
        let mut guard = self.reader.lock();
        let reader = guard.as_mut()?;

        // One reopen per call at most: an empty file yields nothing.
        for _ in 0..2 {
            match read_one(reader) {
                Ok(Some(data)) => return Some(data),
                Ok(None) => match open_reader(&path) {
                    Ok(fresh) => *reader = fresh,
                    Err(err) => {
                        tracing::warn!("cannot reopen tick data file {}: {err:#}", path.display());
                        return None;
                    }
                },
                Err(err) => {
                    tracing::debug!("error reading tick data file {}: {err:#}", path.display());
                    return None;
                }
            }
        }
        None
    }
}

fn open_reader(path: &Path) -> anyhow::Result<TickReader> {
    let file =
        File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")) {
            TickReader::Csv(
                csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(file),
            )
        } else {
            TickReader::Lines(BufReader::new(file))
        },
    )
}

fn read_one(reader: &mut TickReader) -> anyhow::Result<Option<TickData>> {
    match reader {
        TickReader::Csv(csv) => {
            let mut record = csv::StringRecord::new();
            if csv.read_record(&mut record)? {
                Ok(Some(TickData::Row(
                    record.iter().map(str::to_string).collect(),
                )))
            } else {
                Ok(None)
            }
        }
        TickReader::Lines(lines) => {
            let mut line = String::new();
            if lines.read_line(&mut line)? == 0 {
                Ok(None)
            } else {
                Ok(Some(TickData::Line(
                    line.strip_suffix('\n').unwrap_or(&line).to_string(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn shared_map_accumulates_per_key() {
        let map = SharedMap::default();
        map.store("name".into(), serde_json::Value::from("worker-1"));
        assert_eq!(
            map.load("name"),
            Some(serde_json::Value::from("worker-1"))
        );
        assert_eq!(map.add("count".into(), 2.0), 2.0);
        assert_eq!(map.add("count".into(), 3.0), 5.0);
        assert!(map.load("missing").is_none());
    }

    #[test]
    fn line_feed_wraps_at_eof() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alpha").unwrap();
        writeln!(file, "beta").unwrap();

        let feed = TickDataFeed::default();
        feed.set_file(file.path());
        feed.open().unwrap();

        assert_eq!(feed.next(), Some(TickData::Line("alpha".into())));
        assert_eq!(feed.next(), Some(TickData::Line("beta".into())));
        assert_eq!(feed.next(), Some(TickData::Line("alpha".into())));
        feed.close();
    }

    #[test]
    fn csv_feed_yields_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "a,b\nc,d\n").unwrap();

        let feed = TickDataFeed::default();
        feed.set_file(&path);
        feed.open().unwrap();

        assert_eq!(
            feed.next(),
            Some(TickData::Row(vec!["a".into(), "b".into()]))
        );
        assert_eq!(
            feed.next(),
            Some(TickData::Row(vec!["c".into(), "d".into()]))
        );
        // wrap-around
        assert_eq!(
            feed.next(),
            Some(TickData::Row(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn unconfigured_feed_yields_nothing() {
        let feed = TickDataFeed::default();
        feed.open().unwrap();
        assert_eq!(feed.next(), None);
    }
}
