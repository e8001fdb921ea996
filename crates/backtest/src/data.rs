use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// One historical minute bar as stored in the per-symbol CSV files.
/// Columns the export may omit default to zero.
#[derive(Debug, Clone, Deserialize)]
pub struct BarRecord {
    /// Bar close time, epoch milliseconds.
    pub ts: i64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    #[serde(default)]
    pub open_interest: f64,
    #[serde(default)]
    pub funding_rate: f64,
    #[serde(default)]
    pub liquidation_notional: f64,
}

/// Loads a symbol's bar series from a headed CSV file.
///
/// # Errors
/// Returns an error if the file cannot be read or a row fails to parse.
pub fn load_bars(path: &Path) -> Result<Vec<BarRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("open bar file {}", path.display()))?;
    let mut bars = Vec::new();
    for row in reader.deserialize() {
        let bar: BarRecord =
            row.with_context(|| format!("parse bar row in {}", path.display()))?;
        bars.push(bar);
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_bars_with_missing_optional_columns() {
        let mut file = tempfile_path();
        writeln!(file.1, "ts,close,high,low,volume").unwrap();
        writeln!(file.1, "60000,100.5,101.0,99.5,12.25").unwrap();
        writeln!(file.1, "120000,101.0,101.5,100.0,8.0").unwrap();
        file.1.flush().unwrap();

        let bars = load_bars(&file.0).unwrap();
        let _ = std::fs::remove_file(&file.0);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 100.5);
        assert_eq!(bars[0].open_interest, 0.0);
        assert_eq!(bars[1].ts, 120_000);
    }

    fn tempfile_path() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "capflow-bars-{}-{:?}.csv",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
