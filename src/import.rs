//! Bulk import from a spreadsheet (`.csv`, `.xlsx`, `.xls`, `.ods`).
//!
//! The whole sheet is validated before anything is written: one bad row
//! rejects the import. Rows without a title are treated as blank and skipped.
//! Accepted rows go through the coordinator like any other write, so they are
//! audited and fall back to the flat file when the database is down.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::audit::AuditContext;
use crate::error::{ErrorContext, Operation, StoreError, StoreKind};
use crate::flatfile::row::{self, HeaderIndex};
use crate::status::MeetingStatus;
use crate::store::{MeetingStore, PendingSync};
use crate::sync::SyncCoordinator;
use crate::types::{Meeting, MeetingFields, MeetingFilter, MeetingId};

/// How many row errors are listed before summarising the rest.
const MAX_LISTED_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Only rows whose Meeting ID is not already stored.
    AddNewOnly,
    /// Only rows whose Meeting ID matches a stored meeting.
    UpdateExisting,
    UpdateAndAddNew,
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s
            .to_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        match key.as_str() {
            "add-new-only" | "add-new" | "add" => Ok(ImportMode::AddNewOnly),
            "update-existing" | "update" => Ok(ImportMode::UpdateExisting),
            "update-and-add-new" | "update-add-new" | "both" => Ok(ImportMode::UpdateAndAddNew),
            _ => Err(format!("Unknown import mode: {}", s.trim())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    pub mode: ImportMode,
    /// Take the sheet's Completed state for meetings that already exist.
    /// Off keeps their stored override.
    pub overwrite_status: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            mode: ImportMode::UpdateAndAddNew,
            overwrite_status: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Rows left out by the mode (existing in add-only, new in update-only).
    pub skipped: usize,
    /// Title-less rows.
    pub blank: usize,
    /// Writes that only reached the flat file.
    pub degraded: usize,
}

/// Raw sheet contents: header lookup plus cell text per data row.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub index: HeaderIndex,
    pub rows: Vec<Vec<String>>,
}

/// One validated data row.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    /// 1-based data row number (header excluded).
    pub row: usize,
    pub id: Option<MeetingId>,
    pub fields: MeetingFields,
}

fn import_ctx() -> ErrorContext {
    ErrorContext::new(Operation::Import, StoreKind::FlatFile)
}

/// Read the first worksheet (or the CSV) at `path`.
pub fn read_sheet(path: &Path) -> Result<Sheet, StoreError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => read_csv(path),
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path),
        other => Err(StoreError::validation(
            import_ctx(),
            format!("Unsupported import format '.{other}'; use .csv or .xlsx"),
        )),
    }
}

fn read_csv(path: &Path) -> Result<Sheet, StoreError> {
    let ctx = import_ctx();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| StoreError::validation(ctx, format!("{}: {}", path.display(), e)))?;
    let headers = reader
        .headers()
        .map_err(|e| StoreError::validation(ctx, format!("{}: {}", path.display(), e)))?
        .clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| StoreError::validation(ctx, format!("{}: {}", path.display(), e)))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(Sheet {
        index: HeaderIndex::new(headers.iter()),
        rows,
    })
}

fn read_workbook(path: &Path) -> Result<Sheet, StoreError> {
    use calamine::{open_workbook_auto, Reader};

    let ctx = import_ctx();
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| StoreError::validation(ctx, format!("{}: {}", path.display(), e)))?;
    let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
        return Ok(Sheet::default());
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| StoreError::validation(ctx, format!("{sheet_name}: {e}")))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Sheet::default());
    };
    let headers: Vec<String> = header.iter().map(cell_to_string).collect();
    Ok(Sheet {
        index: HeaderIndex::new(headers.iter().map(String::as_str)),
        rows: rows
            .map(|r| r.iter().map(cell_to_string).collect())
            .collect(),
    })
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => excel_serial_to_string(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// Excel serial day number (1900 system) as `YYYY-MM-DD HH:MM:SS`, or
/// `HH:MM:SS` for a time-of-day cell.
fn excel_serial_to_string(serial: f64) -> String {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return serial.to_string();
    };
    let seconds = (serial * 86_400.0).round() as i64;
    let Some(ts) = Duration::try_seconds(seconds).and_then(|d| epoch.checked_add_signed(d)) else {
        return serial.to_string();
    };
    if serial < 1.0 {
        ts.format("%H:%M:%S").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

fn has_title(index: &HeaderIndex, row: &[String]) -> bool {
    index
        .cell(row, row::TITLE)
        .is_some_and(|t| !matches!(t.to_lowercase().as_str(), "nan" | "none" | "null"))
}

/// Parse and validate every titled row. Errors carry the data row number.
pub fn parse_rows(sheet: &Sheet) -> Result<(Vec<ImportRow>, usize), Vec<String>> {
    let mut rows = Vec::new();
    let mut errors = Vec::new();
    let mut blank = 0;

    for (i, cells) in sheet.rows.iter().enumerate() {
        let line = i + 1;
        if !has_title(&sheet.index, cells) {
            blank += 1;
            continue;
        }
        let id = match sheet.index.cell(cells, row::ID) {
            None => None,
            Some(raw) => match row::parse_id(raw) {
                Some(id) => Some(id),
                None => {
                    errors.push(format!("Row {line}: Meeting ID '{raw}' is not a positive integer"));
                    continue;
                }
            },
        };
        let mut fields = match row::fields_from_row(&sheet.index, cells) {
            Ok(fields) => fields,
            Err(e) => {
                errors.push(format!("Row {line}: {e}"));
                continue;
            }
        };
        if sheet
            .index
            .cell(cells, row::STATUS)
            .and_then(|s| s.parse::<MeetingStatus>().ok())
            == Some(MeetingStatus::Completed)
        {
            fields.status_override = true;
        }
        let fields = fields.normalized();
        if let Err(problems) = fields.validate() {
            errors.extend(problems.into_iter().map(|p| format!("Row {line}: {p}")));
            continue;
        }
        rows.push(ImportRow {
            row: line,
            id,
            fields,
        });
    }

    if errors.is_empty() {
        Ok((rows, blank))
    } else {
        Err(errors)
    }
}

/// First few errors, then a count of the rest.
pub fn summarize_errors(errors: &[String]) -> String {
    let mut lines: Vec<String> = errors
        .iter()
        .take(MAX_LISTED_ERRORS)
        .map(|e| format!("- {e}"))
        .collect();
    if errors.len() > MAX_LISTED_ERRORS {
        lines.push(format!(
            "- ... and {} more errors",
            errors.len() - MAX_LISTED_ERRORS
        ));
    }
    format!(
        "{} validation error(s) found; nothing imported\n{}",
        errors.len(),
        lines.join("\n")
    )
}

impl<P, B> SyncCoordinator<P, B>
where
    P: MeetingStore,
    B: MeetingStore + PendingSync,
{
    /// Import a spreadsheet file.
    pub fn import_file(
        &self,
        path: &Path,
        options: ImportOptions,
        audit: &AuditContext,
    ) -> Result<ImportReport, StoreError> {
        let sheet = read_sheet(path)?;
        self.import(&sheet, options, audit)
    }

    /// Validate the sheet, then write each row according to `options`.
    pub fn import(
        &self,
        sheet: &Sheet,
        options: ImportOptions,
        audit: &AuditContext,
    ) -> Result<ImportReport, StoreError> {
        let (rows, blank) = parse_rows(sheet)
            .map_err(|errors| StoreError::validation(import_ctx(), summarize_errors(&errors)))?;

        let existing: HashMap<MeetingId, Meeting> = self
            .read(&MeetingFilter::default())?
            .value
            .into_iter()
            .map(|view| (view.meeting.id, view.meeting))
            .collect();

        let mut report = ImportReport {
            blank,
            ..Default::default()
        };
        for row in rows {
            let current = row.id.and_then(|id| existing.get(&id));
            let outcome = match (current, options.mode) {
                (Some(_), ImportMode::AddNewOnly) | (None, ImportMode::UpdateExisting) => {
                    report.skipped += 1;
                    continue;
                }
                (Some(current), _) => {
                    let mut fields = row.fields;
                    if !options.overwrite_status {
                        fields.status_override = current.fields.status_override;
                    }
                    let outcome = self.update(current.id, fields, audit)?;
                    if outcome.meeting.sync_version == current.sync_version && !outcome.degraded {
                        report.unchanged += 1;
                    } else {
                        report.updated += 1;
                    }
                    outcome
                }
                (None, _) => {
                    let outcome = self.create(row.fields, audit)?;
                    report.added += 1;
                    outcome
                }
            };
            if outcome.degraded {
                report.degraded += 1;
            }
        }

        log::info!(
            "Import finished: {} added, {} updated, {} unchanged, {} skipped",
            report.added,
            report.updated,
            report.unchanged,
            report.skipped
        );
        Ok(report)
    }
}
