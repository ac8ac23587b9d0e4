use std::collections::BTreeSet;

use camino::Utf8Path;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::domain::{CompoundName, InputCompound};
use crate::error::DockError;
use crate::runner::ItemOutcome;

pub const SMILES_COLUMN: &str = "SMILES";
pub const NAME_COLUMN: &str = "Name";
pub const SUMMARY_HEADER: [&str; 4] = ["name", "smiles", "score", "efficiency"];

/// Rows with an empty structure (or an empty name, when names are given) are
/// dropped. Without a `Name` column the surviving rows are named `agan1..`.
pub fn read_input_table(path: &Utf8Path) -> Result<Vec<InputCompound>, DockError> {
    let content = std::fs::read(path.as_std_path())
        .map_err(|err| DockError::MalformedInput(format!("read {path}: {err}")))?;
    parse_input_table(&content)
}

pub fn parse_input_table(content: &[u8]) -> Result<Vec<InputCompound>, DockError> {
    let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_reader(content);
    let headers = reader
        .headers()
        .map_err(|err| DockError::MalformedInput(err.to_string()))?
        .clone();
    let smiles_idx = column_index(&headers, SMILES_COLUMN)
        .ok_or_else(|| DockError::MissingColumn(SMILES_COLUMN.to_string()))?;
    let name_idx = column_index(&headers, NAME_COLUMN);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| DockError::MalformedInput(err.to_string()))?;
        let smiles = record.get(smiles_idx).unwrap_or_default();
        let name = name_idx.map(|idx| record.get(idx).unwrap_or_default());
        if smiles.is_empty() || name.is_some_and(str::is_empty) {
            continue;
        }
        rows.push((name.map(str::to_string), smiles.to_string()));
    }

    let compounds = rows
        .into_iter()
        .enumerate()
        .map(|(index, (name, smiles))| {
            let name = match name {
                Some(name) => name.parse()?,
                None => CompoundName::generated(index),
            };
            Ok(InputCompound { name, smiles })
        })
        .collect::<Result<Vec<_>, DockError>>()?;
    ensure_unique(&compounds)?;
    if compounds.is_empty() {
        return Err(DockError::EmptyInput);
    }
    Ok(compounds)
}

pub fn single_compound(smiles: &str) -> Result<Vec<InputCompound>, DockError> {
    let smiles = smiles.trim();
    if smiles.is_empty() {
        return Err(DockError::EmptyInput);
    }
    Ok(vec![InputCompound {
        name: CompoundName::generated(0),
        smiles: smiles.to_string(),
    }])
}

fn ensure_unique(compounds: &[InputCompound]) -> Result<(), DockError> {
    let mut seen = BTreeSet::new();
    for compound in compounds {
        if !seen.insert(&compound.name) {
            return Err(DockError::DuplicateIdentity(compound.name.to_string()));
        }
    }
    Ok(())
}

fn column_index(headers: &StringRecord, column: &str) -> Option<usize> {
    headers.iter().position(|header| header == column)
}

pub fn write_compounds(compounds: &[InputCompound]) -> Result<Vec<u8>, DockError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record([NAME_COLUMN, SMILES_COLUMN])
        .map_err(table_error)?;
    for compound in compounds {
        writer
            .write_record([compound.name.as_str(), compound.smiles.as_str()])
            .map_err(table_error)?;
    }
    finish(writer)
}

pub fn parse_round_trip(content: &str) -> ItemOutcome<String> {
    let Some(line) = content.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return ItemOutcome::Malformed("empty SMILES file".to_string());
    };
    match line.split_whitespace().next() {
        Some(smiles) => ItemOutcome::Ok(smiles.to_string()),
        None => ItemOutcome::Malformed("no SMILES on first line".to_string()),
    }
}

pub fn write_scores(rows: &[(CompoundName, f64)]) -> Result<Vec<u8>, DockError> {
    write_values("Affinity", rows)
}

pub fn write_values(column: &str, rows: &[(CompoundName, f64)]) -> Result<Vec<u8>, DockError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record([NAME_COLUMN, column])
        .map_err(table_error)?;
    for (name, score) in rows {
        writer
            .write_record([name.as_str(), &score.to_string()])
            .map_err(table_error)?;
    }
    finish(writer)
}

pub fn read_scores(content: &[u8]) -> Result<Vec<(CompoundName, f64)>, DockError> {
    let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_reader(content);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(table_error)?;
        let name: CompoundName = record.get(0).unwrap_or_default().parse()?;
        let score = parse_number(record.get(1).unwrap_or_default())?;
        rows.push((name, score));
    }
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityRow {
    pub name: CompoundName,
    pub checks: usize,
    pub passes: u32,
}

/// Reduces the validity tool's boolean table to a pass count per molecule.
///
/// The `file` column is ignored, every other column besides `molecule` is a
/// check. Repeated rows for one molecule collapse to the first, and a
/// trailing `_out` in the molecule name is dropped.
pub fn parse_validity_table(content: &[u8]) -> Result<Vec<ValidityRow>, DockError> {
    let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_reader(content);
    let headers = reader.headers().map_err(table_error)?.clone();
    let molecule_idx = column_index(&headers, "molecule")
        .ok_or_else(|| DockError::Table("validity table has no molecule column".to_string()))?;
    let check_columns: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(idx, header)| *idx != molecule_idx && *header != "file")
        .map(|(idx, _)| idx)
        .collect();

    let mut seen = BTreeSet::new();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(table_error)?;
        let raw = record.get(molecule_idx).unwrap_or_default();
        let name: CompoundName = raw.strip_suffix("_out").unwrap_or(raw).parse()?;
        if !seen.insert(name.clone()) {
            continue;
        }
        let passes = check_columns
            .iter()
            .filter(|idx| record.get(**idx) == Some("True"))
            .count();
        rows.push(ValidityRow {
            name,
            checks: check_columns.len(),
            passes: u32::try_from(passes).unwrap_or(u32::MAX),
        });
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rows)
}

pub fn write_validity(rows: &[ValidityRow]) -> Result<Vec<u8>, DockError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer
        .write_record([NAME_COLUMN, "checks", "passes"])
        .map_err(table_error)?;
    for row in rows {
        writer
            .write_record([
                row.name.as_str(),
                &row.checks.to_string(),
                &row.passes.to_string(),
            ])
            .map_err(table_error)?;
    }
    finish(writer)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub name: CompoundName,
    pub smiles: Option<String>,
    pub score: f64,
    pub efficiency: Option<f64>,
}

pub fn write_summary(rows: &[SummaryRow]) -> Result<Vec<u8>, DockError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(SUMMARY_HEADER).map_err(table_error)?;
    for row in rows {
        writer
            .write_record([
                row.name.as_str().to_string(),
                row.smiles.clone().unwrap_or_default(),
                format!("{:.2}", row.score),
                row.efficiency
                    .map(|value| format!("{value:.2}"))
                    .unwrap_or_default(),
            ])
            .map_err(table_error)?;
    }
    finish(writer)
}

pub fn read_summary(content: &[u8]) -> Result<Vec<SummaryRow>, DockError> {
    let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_reader(content);
    let headers = reader.headers().map_err(table_error)?.clone();
    if headers.iter().ne(SUMMARY_HEADER) {
        return Err(DockError::Table(format!(
            "unexpected summary header: {}",
            headers.iter().collect::<Vec<_>>().join(",")
        )));
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(table_error)?;
        let smiles = record.get(1).unwrap_or_default();
        let efficiency = record.get(3).unwrap_or_default();
        rows.push(SummaryRow {
            name: record.get(0).unwrap_or_default().parse()?,
            smiles: (!smiles.is_empty()).then(|| smiles.to_string()),
            score: parse_number(record.get(2).unwrap_or_default())?,
            efficiency: if efficiency.is_empty() {
                None
            } else {
                Some(parse_number(efficiency)?)
            },
        });
    }
    Ok(rows)
}

fn parse_number(value: &str) -> Result<f64, DockError> {
    value
        .parse::<f64>()
        .map_err(|_| DockError::Table(format!("not a number: {value:?}")))
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, DockError> {
    writer
        .into_inner()
        .map_err(|err| DockError::Table(err.to_string()))
}

fn table_error(err: csv::Error) -> DockError {
    DockError::Table(err.to_string())
}
