//! CSV input series loading.

use std::path::Path;

use crate::error::SimError;

/// Reads one numeric column from a CSV file.
///
/// # Errors
///
/// Fails when the file cannot be read, the column is missing, or a value
/// does not parse as a number.
pub fn load_csv_column(path: &Path, column: &str) -> Result<Vec<f64>, SimError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| SimError::InvalidScenario(format!("cannot read \"{}\": {e}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|e| SimError::InvalidScenario(e.to_string()))?;
    let Some(col_idx) = headers.iter().position(|h| h == column) else {
        return Err(SimError::InvalidScenario(format!(
            "\"{column}\" is not a column of {}",
            path.display()
        )));
    };

    let mut values = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| SimError::InvalidScenario(e.to_string()))?;
        let raw = record.get(col_idx).unwrap_or("");
        let value: f64 = raw.parse().map_err(|_| {
            SimError::InvalidScenario(format!(
                "row {} of {}: \"{raw}\" is not a number",
                row_idx + 2,
                path.display()
            ))
        })?;
        values.push(value);
    }
    Ok(values)
}
