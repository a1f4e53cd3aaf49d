//! JSONL export of the audit log: one `AuditRecord` per line, in append
//! order. Export reads only; the log is never touched.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use morpho_core::AuditRecord;

use crate::error::{Result, StoreError};
use crate::store::{AuditQuery, AuditStore};

impl AuditStore {
    /// Write matching records to `out`. Returns how many were written.
    pub fn export_jsonl(&self, query: &AuditQuery, out: &mut dyn Write) -> Result<usize> {
        let records = self.records(query)?;
        for record in &records {
            serde_json::to_writer(&mut *out, record)?;
            out.write_all(b"\n")
                .map_err(|e| StoreError::io("<output>", e))?;
        }
        out.flush().map_err(|e| StoreError::io("<output>", e))?;
        Ok(records.len())
    }

    pub fn export_jsonl_file(&self, query: &AuditQuery, path: &Path) -> Result<usize> {
        let file = File::create(path).map_err(|e| StoreError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let n = self.export_jsonl(query, &mut writer)?;
        tracing::info!(path = %path.display(), records = n, "audit log exported");
        Ok(n)
    }
}

/// Read an exported JSONL file back. Blank lines are skipped.
pub fn read_jsonl(path: &Path) -> Result<Vec<AuditRecord>> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let mut records = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            StoreError::InvalidData(format!("{}:{}: {e}", path.display(), lineno + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}
