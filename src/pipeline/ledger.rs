//! Append-only record of integrated PMIDs (`pmid,integration_date`).

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

use crate::error::CitegraphError;

const LEDGER_COLUMNS: [&str; 2] = ["pmid", "integration_date"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub pmid: String,
    pub integrated_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: Vec<LedgerEntry>,
    seen: HashSet<String>,
}

fn format_timestamp(at: OffsetDateTime) -> Result<String, CitegraphError> {
    at.format(&Rfc3339)
        .map_err(|err| CitegraphError::Config(format!("Unformattable ledger timestamp: {err}")))
}

impl Ledger {
    /// Open the ledger at `path`; a missing file is an empty ledger.
    pub fn open(path: &Path) -> Result<Self, CitegraphError> {
        let mut ledger = Self {
            path: path.to_path_buf(),
            entries: Vec::new(),
            seen: HashSet::new(),
        };
        if !path.exists() {
            return Ok(ledger);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!("skipping unreadable ledger line: {err}");
                    continue;
                }
            };
            let line = record.position().map_or(0, |pos| pos.line());
            let (Some(pmid), Some(stamp)) = (record.get(0), record.get(1)) else {
                warn!(line, "skipping malformed ledger line");
                continue;
            };
            if pmid.is_empty() {
                continue;
            }
            let Ok(integrated_at) = OffsetDateTime::parse(stamp, &Rfc3339) else {
                warn!(line, stamp, "skipping ledger line with bad timestamp");
                continue;
            };
            ledger.insert(LedgerEntry {
                pmid: pmid.to_string(),
                integrated_at,
            });
        }
        Ok(ledger)
    }

    fn insert(&mut self, entry: LedgerEntry) {
        if self.seen.insert(entry.pmid.clone()) {
            self.entries.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, pmid: &str) -> bool {
        self.seen.contains(pmid)
    }

    /// Identifiers not yet integrated, in input order.
    pub fn filter_new(&self, pmids: &[String]) -> Vec<String> {
        pmids
            .iter()
            .filter(|pmid| !self.contains(pmid))
            .cloned()
            .collect()
    }

    pub fn append(&mut self, pmids: &[String], at: OffsetDateTime) -> Result<usize, CitegraphError> {
        let stamp = format_timestamp(at)?;
        let mut batch = HashSet::new();
        let fresh: Vec<String> = pmids
            .iter()
            .filter(|p| !self.contains(p) && batch.insert(p.as_str()))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let needs_header = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            writer.write_record(LEDGER_COLUMNS)?;
        }
        for pmid in &fresh {
            writer.write_record([pmid.as_str(), stamp.as_str()])?;
        }
        writer.flush()?;

        let added = fresh.len();
        for pmid in fresh {
            self.insert(LedgerEntry {
                pmid,
                integrated_at: at,
            });
        }
        Ok(added)
    }

    /// Forget the oldest entries integrated more than `max_age` ago, at most `max_count`
    /// of them, so a later pass re-fetches those articles. Returns the removed PMIDs.
    pub fn refresh(
        &mut self,
        now: OffsetDateTime,
        max_age: time::Duration,
        max_count: usize,
    ) -> Result<Vec<String>, CitegraphError> {
        let cutoff = now - max_age;
        let mut stale: Vec<&LedgerEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.integrated_at < cutoff)
            .collect();
        stale.sort_by_key(|entry| entry.integrated_at);
        let removed: HashSet<String> = stale
            .into_iter()
            .take(max_count)
            .map(|entry| entry.pmid.clone())
            .collect();
        if removed.is_empty() {
            return Ok(Vec::new());
        }

        let mut out_ids = Vec::with_capacity(removed.len());
        let mut kept = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if removed.contains(&entry.pmid) {
                out_ids.push(entry.pmid);
            } else {
                kept.push(entry);
            }
        }
        self.entries = kept;
        self.seen = self.entries.iter().map(|e| e.pmid.clone()).collect();
        self.rewrite()?;
        info!(count = out_ids.len(), "ledger entries scheduled for refresh");
        Ok(out_ids)
    }

    /// Forget every entry, leaving a header-only file.
    pub fn clear(&mut self) -> Result<(), CitegraphError> {
        self.entries.clear();
        self.seen.clear();
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        self.rewrite()
    }

    fn rewrite(&self) -> Result<(), CitegraphError> {
        let tmp = self.path.with_extension("tmp");
        let mut writer = csv::Writer::from_path(&tmp)?;
        writer.write_record(LEDGER_COLUMNS)?;
        for entry in &self.entries {
            let stamp = format_timestamp(entry.integrated_at)?;
            writer.write_record([entry.pmid.as_str(), stamp.as_str()])?;
        }
        writer.flush()?;
        drop(writer);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
