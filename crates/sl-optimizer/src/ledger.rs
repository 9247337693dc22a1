//! Append-only CSV record of every scored candidate.

use comfy_table::{presets, ContentArrangement, Table};
use sl_types::{LedgerError, SlResult};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::search::ParameterValue;
use crate::tracker::ValidLoss;

pub const PARAMETERS_FILE: &str = "parameters.csv";
pub const ERRORS_FILE: &str = "loss_function_errors.csv";

const ERROR_COLUMNS: [&str; 4] = ["iteration", "subiteration", "valid_energy", "valid_force"];

/// One ledger file plus the `(iteration, subiteration)` keys already in it.
#[derive(Debug)]
struct LedgerFile {
    path: PathBuf,
    written: HashSet<(u32, u32)>,
}

impl LedgerFile {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn csv_error(&self, e: impl std::fmt::Display) -> LedgerError {
        LedgerError::Csv {
            file: self.name(),
            message: e.to_string(),
        }
    }

    fn create(path: PathBuf, header: &[String]) -> SlResult<Self> {
        let file = Self {
            path,
            written: HashSet::new(),
        };
        let mut writer = csv::Writer::from_path(&file.path).map_err(|e| file.csv_error(e))?;
        writer.write_record(header).map_err(|e| file.csv_error(e))?;
        writer.flush()?;
        Ok(file)
    }

    /// Reopen an existing file, reading back the keys it already holds.
    fn open(path: PathBuf, header: &[String]) -> SlResult<Self> {
        if !path.is_file() {
            return Self::create(path, header);
        }
        let mut file = Self {
            path,
            written: HashSet::new(),
        };
        let mut reader = csv::Reader::from_path(&file.path).map_err(|e| file.csv_error(e))?;
        let found = reader.headers().map_err(|e| file.csv_error(e))?.len();
        if found != header.len() {
            return Err(file
                .csv_error(format!("expected {} columns, found {found}", header.len()))
                .into());
        }
        for record in reader.records() {
            let record = record.map_err(|e| file.csv_error(e))?;
            let key = |i: usize| -> SlResult<u32> {
                record
                    .get(i)
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| file.csv_error(format!("bad key in row {record:?}")).into())
            };
            let row = (key(0)?, key(1)?);
            file.written.insert(row);
        }
        Ok(file)
    }

    fn append(&mut self, iteration: u32, sub_iteration: u32, row: Vec<String>) -> SlResult<()> {
        if self.written.contains(&(iteration, sub_iteration)) {
            return Err(LedgerError::Duplicate {
                file: self.name(),
                iteration,
                sub_iteration,
            }
            .into());
        }
        let handle = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(handle);
        writer.write_record(&row).map_err(|e| self.csv_error(e))?;
        writer.flush()?;
        self.written.insert((iteration, sub_iteration));
        Ok(())
    }

    /// Render the table into `<stem>_final.txt`, replacing an earlier
    /// rendering.
    fn tabulate(&self) -> SlResult<PathBuf> {
        let mut reader = csv::Reader::from_path(&self.path).map_err(|e| self.csv_error(e))?;
        let mut table = Table::new();
        table
            .load_preset(presets::ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Disabled)
            .set_header(reader.headers().map_err(|e| self.csv_error(e))?.iter());
        for record in reader.records() {
            let record = record.map_err(|e| self.csv_error(e))?;
            table.add_row(record.iter());
        }

        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = self.path.with_file_name(format!("{stem}_final.txt"));
        fs::write(&target, format!("{table}\n"))?;
        Ok(target)
    }
}

/// The two result tables of a sweep: the parameters with their scalar loss,
/// and the energy/force errors behind it.
#[derive(Debug)]
pub struct ResultLedger {
    parameter_names: Vec<String>,
    parameters: LedgerFile,
    errors: LedgerFile,
}

impl ResultLedger {
    fn headers(parameter_names: &[String]) -> (Vec<String>, Vec<String>) {
        let params = ["iteration", "subiteration", "loss"]
            .iter()
            .map(|s| s.to_string())
            .chain(parameter_names.iter().cloned())
            .collect();
        let errors = ERROR_COLUMNS.iter().map(|s| s.to_string()).collect();
        (params, errors)
    }

    /// Start a fresh ledger in `dir`, truncating any previous one.
    pub fn create(dir: &Path, parameter_names: Vec<String>) -> SlResult<Self> {
        fs::create_dir_all(dir)?;
        let (params, errors) = Self::headers(&parameter_names);
        let ledger = Self {
            parameters: LedgerFile::create(dir.join(PARAMETERS_FILE), &params)?,
            errors: LedgerFile::create(dir.join(ERRORS_FILE), &errors)?,
            parameter_names,
        };
        info!(dir = %dir.display(), "result ledger created");
        Ok(ledger)
    }

    /// Reopen the ledger in `dir` after a restart.
    pub fn open(dir: &Path, parameter_names: Vec<String>) -> SlResult<Self> {
        fs::create_dir_all(dir)?;
        let (params, errors) = Self::headers(&parameter_names);
        let ledger = Self {
            parameters: LedgerFile::open(dir.join(PARAMETERS_FILE), &params)?,
            errors: LedgerFile::open(dir.join(ERRORS_FILE), &errors)?,
            parameter_names,
        };
        info!(
            dir = %dir.display(),
            rows = ledger.len(),
            "result ledger reopened"
        );
        Ok(ledger)
    }

    /// Whether `(iteration, sub_iteration)` is already in both tables.
    pub fn contains(&self, iteration: u32, sub_iteration: u32) -> bool {
        let key = (iteration, sub_iteration);
        self.parameters.written.contains(&key) && self.errors.written.contains(&key)
    }

    /// Number of candidates in the parameter table.
    pub fn len(&self) -> usize {
        self.parameters.written.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.written.is_empty()
    }

    /// Append one candidate to both tables.
    pub fn record(
        &mut self,
        iteration: u32,
        sub_iteration: u32,
        loss: f64,
        valid: ValidLoss,
        values: &[ParameterValue],
    ) -> SlResult<()> {
        if values.len() != self.parameter_names.len() {
            return Err(LedgerError::ParameterCount {
                expected: self.parameter_names.len(),
                actual: values.len(),
            }
            .into());
        }

        let key = [iteration.to_string(), sub_iteration.to_string()];
        let param_row = key
            .iter()
            .cloned()
            .chain([loss.to_string()])
            .chain(values.iter().map(ToString::to_string))
            .collect();
        let error_row = key
            .iter()
            .cloned()
            .chain([valid.energy.to_string(), valid.force.to_string()])
            .collect();

        // A restart between the two appends leaves one table a row ahead.
        if self.contains(iteration, sub_iteration) {
            return self.parameters.append(iteration, sub_iteration, param_row);
        }
        if !self.parameters.written.contains(&(iteration, sub_iteration)) {
            self.parameters.append(iteration, sub_iteration, param_row)?;
        }
        if !self.errors.written.contains(&(iteration, sub_iteration)) {
            self.errors.append(iteration, sub_iteration, error_row)?;
        }
        debug!(iteration, sub_iteration, loss, "ledger row written");
        Ok(())
    }

    /// Render both tables into `<name>_final.txt` files. A report from an
    /// earlier run is overwritten, so it always shows the full ledger once.
    pub fn tabulate(&self) -> SlResult<Vec<PathBuf>> {
        let reports = vec![self.parameters.tabulate()?, self.errors.tabulate()?];
        info!(reports = ?reports, "final tables written");
        Ok(reports)
    }
}
