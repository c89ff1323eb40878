use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use rust_xlsxwriter::{Color, Format, FormatPattern, Workbook};

use crate::assemble::Record;
use crate::cli::ExportFormat;
use crate::formats::{ERROR_VALUE, SOURCE_URL_FIELD, SiteConfig};

pub const DEFAULT_OUTPUT_DIR: &str = "output_files";

const SHEET_NAME: &str = "properties";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: usize,
    /// `ERROR` cells per column, only for columns that have any.
    pub errors: Vec<(String, usize)>,
}

/// `output_files/<timestamp>_properties.<xlsx|csv>`
pub fn default_output_path(format: ExportFormat) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let extension = match format {
        ExportFormat::Xlsx => "xlsx",
        ExportFormat::Csv => "csv",
    };
    Path::new(DEFAULT_OUTPUT_DIR).join(format!("{stamp}_properties.{extension}"))
}

/// `source_url` followed by the declared fields in order.
pub fn columns(config: &SiteConfig) -> Vec<&str> {
    std::iter::once(SOURCE_URL_FIELD)
        .chain(config.fields.names())
        .collect()
}

/// Writes one row per record under the declared columns.
pub fn write_records(
    records: &[Record],
    config: &SiteConfig,
    out: &Path,
    format: ExportFormat,
    force: bool,
) -> anyhow::Result<ExportSummary> {
    if out.exists() && !force {
        anyhow::bail!("export output already exists: {}", out.display());
    }
    if let Some(parent) = out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create export output dir: {}", parent.display()))?;
    }

    let columns = columns(config);
    let rows = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| record.get(column).unwrap_or(ERROR_VALUE))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    match format {
        ExportFormat::Xlsx => write_xlsx(&columns, &rows, out, force)?,
        ExportFormat::Csv => write_csv(&columns, &rows, out, force)?,
    }

    let mut error_counts = vec![0usize; columns.len()];
    for row in &rows {
        for (count, cell) in error_counts.iter_mut().zip(row) {
            if *cell == ERROR_VALUE {
                *count += 1;
            }
        }
    }
    let errors = columns
        .iter()
        .zip(error_counts)
        .filter(|(_, count)| *count > 0)
        .map(|(column, count)| ((*column).to_owned(), count))
        .collect::<Vec<_>>();
    for (column, count) in &errors {
        tracing::warn!(column = %column, count, rows = records.len(), "column has ERROR cells");
    }
    tracing::info!(out = %out.display(), ?format, rows = records.len(), "wrote export");

    Ok(ExportSummary {
        rows: records.len(),
        errors,
    })
}

fn open_output(out: &Path, force: bool) -> anyhow::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options
        .open(out)
        .with_context(|| format!("open output: {}", out.display()))
}

fn write_csv(columns: &[&str], rows: &[Vec<&str>], out: &Path, force: bool) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(open_output(out, force)?);
    writer.write_record(columns).context("write csv header")?;
    for (index, row) in rows.iter().enumerate() {
        writer
            .write_record(row)
            .with_context(|| format!("write csv row {}", index + 1))?;
    }
    writer
        .flush()
        .with_context(|| format!("flush output: {}", out.display()))
}

/// `ERROR` cells get a solid red fill so they stand out for triage.
fn write_xlsx(columns: &[&str], rows: &[Vec<&str>], out: &Path, force: bool) -> anyhow::Result<()> {
    let header = Format::new().set_bold();
    let error = Format::new()
        .set_pattern(FormatPattern::Solid)
        .set_background_color(Color::Red);

    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name(SHEET_NAME).context("name worksheet")?;
        for (col, name) in columns.iter().enumerate() {
            let col = u16::try_from(col).context("too many columns for xlsx")?;
            sheet
                .write_string_with_format(0, col, *name, &header)
                .context("write xlsx header")?;
        }
        for (index, row) in rows.iter().enumerate() {
            let line = u32::try_from(index + 1).context("too many rows for xlsx")?;
            for (col, cell) in row.iter().enumerate() {
                let col = u16::try_from(col).context("too many columns for xlsx")?;
                let written = if *cell == ERROR_VALUE {
                    sheet.write_string_with_format(line, col, *cell, &error)
                } else {
                    sheet.write_string(line, col, *cell)
                };
                written.with_context(|| format!("write xlsx row {line}"))?;
            }
        }
        sheet.set_freeze_panes(1, 0).context("freeze xlsx header")?;
    }

    let bytes = workbook.save_to_buffer().context("encode xlsx")?;
    let mut file = open_output(out, force)?;
    file.write_all(&bytes)
        .with_context(|| format!("write output: {}", out.display()))?;
    file.flush()
        .with_context(|| format!("flush output: {}", out.display()))
}
