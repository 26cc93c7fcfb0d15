use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use rust_xlsxwriter::{Format, Workbook};

use crate::models::GradeSnapshot;
use crate::utils::table::{rows, COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
    Json,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("xlsx") => Ok(Self::Xlsx),
            Some("json") => Ok(Self::Json),
            _ => bail!(
                "Unsupported export format for {}, use .csv, .xlsx or .json",
                path.display()
            ),
        }
    }
}

/// Writes the snapshot to `path`, picking the format from its extension.
pub fn save(snapshot: &GradeSnapshot, path: &Path) -> Result<ExportFormat> {
    let format = ExportFormat::from_path(path)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    match format {
        ExportFormat::Csv => write_csv(snapshot, path)?,
        ExportFormat::Xlsx => write_xlsx(snapshot, path)?,
        ExportFormat::Json => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), snapshot)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
    }

    info!("Saved {} grade(s) to {}", snapshot.len(), path.display());
    Ok(format)
}

fn write_csv(snapshot: &GradeSnapshot, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(COLUMNS)?;
    for row in rows(snapshot) {
        writer.write_record(&row)?;
    }
    writer.flush().context("Failed to flush CSV")?;
    Ok(())
}

fn write_xlsx(snapshot: &GradeSnapshot, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name("成绩")?;

    for (col, header) in COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &bold)?;
    }
    let rows = rows(snapshot);
    for (r, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            sheet.write_string(r as u32 + 1, col as u16, value)?;
        }
    }

    // Summary lines go below the table, one per row.
    let first = rows.len() as u32 + 2;
    for (offset, line) in snapshot.summary().iter().enumerate() {
        sheet.write_string(first + offset as u32, 0, line)?;
    }

    workbook
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
