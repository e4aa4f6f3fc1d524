// 📄 CSV export of the row-oriented reconciled table

use crate::model::ReconciledRecord;
use anyhow::{Context, Result};
use std::io;
use std::path::Path;

/// Write rows as CSV with a header line
pub fn write_csv<W: io::Write>(writer: W, records: &[ReconciledRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);

    for record in records {
        wtr.serialize(record).context("Failed to serialize reconciled record")?;
    }

    wtr.flush().context("Failed to flush CSV writer")?;
    Ok(())
}

pub fn write_csv_file(path: &Path, records: &[ReconciledRecord]) -> Result<usize> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create CSV file {}", path.display()))?;

    write_csv(file, records)?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_instant;

    fn rows() -> Vec<ReconciledRecord> {
        vec![
            ReconciledRecord::glucose_only(parse_instant("2024-03-01T00:00:00Z").unwrap(), 100.0),
            ReconciledRecord {
                timestamp: parse_instant("2024-03-01T00:05:00Z").unwrap(),
                bg: 110.0,
                isf_dynamic: 60.0,
                isf_profile: 50.0,
                deviation: 20.0,
            },
        ]
    }

    #[test]
    fn test_write_csv() {
        let mut buf = Vec::new();
        write_csv(&mut buf, &rows()).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();

        assert_eq!(lines.next(), Some("timestamp,bg,isfDynamic,isfProfile,deviation"));
        assert_eq!(lines.next(), Some("2024-03-01T00:00:00Z,100.0,0.0,0.0,0.0"));
        assert_eq!(lines.next(), Some("2024-03-01T00:05:00Z,110.0,60.0,50.0,20.0"));
    }

    #[test]
    fn test_write_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensitivity.csv");

        let written = write_csv_file(&path, &rows()).unwrap();

        assert_eq!(written, 2);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("timestamp,"));
    }
}
