//! CSV export for simulation step records.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::sim::types::StepRecord;

/// Exports step records to a CSV file at the given path.
///
/// Columns are derived from the first record: the fixed prefix, one column
/// group per grid connector, the station sum, one column per station, and
/// one SoC column per vehicle and stationary battery. Output is
/// deterministic for identical inputs.
///
/// # Errors
///
/// Returns an `io::Error` when file creation or writing fails.
pub fn export_csv(records: &[StepRecord], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let buf = io::BufWriter::new(file);
    write_csv(records, buf)
}

/// Writes step records as CSV to any writer.
pub fn write_csv(records: &[StepRecord], writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);

    let Some(first) = records.first() else {
        return Ok(());
    };

    // header
    let mut header: Vec<String> = vec!["timestep".into(), "time".into()];
    for gc_id in first.gc.keys() {
        for column in [
            "grid power",
            "fixed load",
            "generation",
            "surplus",
            "price",
            "target",
            "window",
        ] {
            header.push(format!("{gc_id} {column}"));
        }
    }
    header.push("sum cs power".into());
    for cs_id in first.cs_power.keys() {
        header.push(format!("{cs_id} power"));
    }
    for v_id in first.vehicle_soc.keys() {
        header.push(format!("{v_id} soc"));
    }
    for b_id in first.battery_soc.keys() {
        header.push(format!("{b_id} soc"));
    }
    wtr.write_record(&header)?;

    // data rows
    for r in records {
        let mut row: Vec<String> = vec![r.step.to_string(), r.time.to_rfc3339()];
        for gc in r.gc.values() {
            row.push(format!("{:.4}", gc.grid_power));
            row.push(format!("{:.4}", gc.fixed_load));
            row.push(format!("{:.4}", gc.generation));
            row.push(format!("{:.4}", gc.surplus));
            row.push(format!("{:.4}", gc.price));
            row.push(gc.target.map_or(String::new(), |t| format!("{t:.4}")));
            row.push(gc.window.map_or(String::new(), |w| w.to_string()));
        }
        row.push(format!("{:.4}", r.cs_sum));
        for power in r.cs_power.values() {
            row.push(format!("{power:.4}"));
        }
        for soc in r.vehicle_soc.values() {
            row.push(format!("{soc:.4}"));
        }
        for soc in r.battery_soc.values() {
            row.push(format!("{soc:.4}"));
        }
        wtr.write_record(&row)?;
    }

    wtr.flush()?;
    Ok(())
}
