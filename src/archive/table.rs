//! Data component reading and per-column aggregation.
//!
//! Header rows are split by hand (names and optional units, quotes
//! stripped); the remaining rows are read with polars without a header.

use polars::prelude::*;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

use super::description::FileDescription;
use crate::error::{GhgError, Result};

/// The data rows of one file plus the header it was described with
#[derive(Debug)]
pub struct DataTable {
    /// Column names after label removal, one per frame column
    pub names: Vec<String>,
    /// Units from the unit row, when the header has one
    pub units: Option<Vec<String>>,
    pub frame: DataFrame,
}

impl DataTable {
    pub fn width(&self) -> usize {
        self.frame.width()
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    /// Finite values of a numeric column, `None` for non-numeric columns.
    /// Text columns count as numeric when every cell parses as a float,
    /// which covers spellings like `inf` the reader leaves as text.
    pub fn numeric_values(&self, index: usize) -> Result<Option<Vec<f64>>> {
        let column = &self.frame.get_columns()[index];
        let values: Vec<f64> = if is_numeric(column.dtype()) {
            let series = column.as_materialized_series().cast(&DataType::Float64)?;
            series.f64()?.into_iter().flatten().collect()
        } else if column.dtype() == &DataType::String {
            let parsed: Option<Vec<f64>> = column
                .as_materialized_series()
                .str()?
                .into_iter()
                .flatten()
                .map(|v| v.trim().parse::<f64>().ok())
                .collect();
            match parsed {
                Some(values) => values,
                None => return Ok(None),
            }
        } else {
            return Ok(None);
        };
        Ok(Some(values.into_iter().filter(|v| v.is_finite()).collect()))
    }

    /// True when every value in the column is missing
    pub fn is_empty_column(&self, index: usize) -> bool {
        let column = &self.frame.get_columns()[index];
        column.null_count() == column.len()
    }
}

fn is_numeric(dtype: &DataType) -> bool {
    matches!(
        dtype,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
    )
}

/// Split one header line, stripping whitespace and surrounding quotes
fn split_header_line(line: &str, separator: u8) -> Vec<String> {
    line.trim_end_matches(['\r', '\n'])
        .split(char::from(separator))
        .map(|cell| cell.trim().trim_matches('"').trim().to_string())
        .collect()
}

/// Byte offset just past the first `rows` lines
fn offset_after_lines(bytes: &[u8], rows: usize) -> Option<usize> {
    if rows == 0 {
        return Some(0);
    }
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .nth(rows - 1)
        .map(|(i, _)| i + 1)
}

/// Read a data component into a [`DataTable`].
///
/// The label column is removed from both header and data when the
/// description carries a `data_label`.
pub fn read_data_component(
    bytes: &[u8],
    description: &FileDescription,
    path: &Path,
) -> Result<DataTable> {
    let data_start = offset_after_lines(bytes, description.header_rows).ok_or_else(|| {
        GhgError::invalid_archive(
            path,
            format!("fewer than {} header rows", description.header_rows),
        )
    })?;

    let header_text = String::from_utf8_lossy(&bytes[..data_start]);
    let header_lines: Vec<&str> = header_text.lines().collect();
    let row = |index: Option<usize>| {
        index
            .and_then(|i| header_lines.get(i))
            .map(|line| split_header_line(line, description.separator))
    };
    let mut names = row(description.name_row());
    let mut units = row(description.unit_row());

    let mut parse_options = CsvParseOptions::default()
        .with_separator(description.separator)
        .with_truncate_ragged_lines(true);
    if !description.na_values.is_empty() {
        let null_values = description
            .na_values
            .iter()
            .map(|v| PlSmallStr::from(v.as_str()))
            .collect();
        parse_options = parse_options.with_null_values(Some(NullValues::AllColumns(null_values)));
    }

    let mut frame = CsvReadOptions::default()
        .with_has_header(false)
        .with_infer_schema_length(None)
        .with_parse_options(parse_options)
        .into_reader_with_file_handle(Cursor::new(bytes[data_start..].to_vec()))
        .finish()?;

    let header_width = names.as_ref().map(Vec::len).unwrap_or(0);
    if frame.width() == 1 && header_width > 1 {
        return Err(GhgError::Delimiter {
            path: path.to_path_buf(),
            reason: format!(
                "data rows split into one column but the header has {}",
                header_width
            ),
        });
    }

    if description.data_label.is_some() && frame.width() > 0 {
        let label = frame.get_column_names()[0].clone();
        frame = frame.drop(label.as_str())?;
        for header in [names.as_mut(), units.as_mut()].into_iter().flatten() {
            if !header.is_empty() {
                header.remove(0);
            }
        }
    }

    let width = frame.width();
    let names = reconcile_names(names.unwrap_or_default(), width);
    let units = units.map(|mut u| {
        u.resize(width, String::new());
        u
    });

    debug!(
        "Read {} rows x {} columns from {}",
        frame.height(),
        width,
        path.display()
    );

    Ok(DataTable {
        names,
        units,
        frame,
    })
}

/// Pad or truncate header names to the data width and make them unique.
/// Missing names are left empty for the caller to synthesize.
fn reconcile_names(mut names: Vec<String>, width: usize) -> Vec<String> {
    names.resize(width, String::new());
    let mut seen = std::collections::HashSet::new();
    for (i, name) in names.iter_mut().enumerate() {
        if !name.is_empty() && !seen.insert(name.clone()) {
            *name = format!("{}_{}", name, i + 1);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Statistic;

    fn ghg_description() -> FileDescription {
        FileDescription {
            separator: b'\t',
            header_rows: 3,
            skip_rows: 2,
            data_label: Some("DATA".to_string()),
            na_values: Vec::new(),
        }
    }

    #[test]
    fn test_offset_after_lines() {
        let bytes = b"a\nb\nc\n";
        assert_eq!(offset_after_lines(bytes, 0), Some(0));
        assert_eq!(offset_after_lines(bytes, 2), Some(4));
        assert_eq!(offset_after_lines(bytes, 4), None);
    }

    #[test]
    fn test_reads_labelled_table() {
        let text = "Model:\tLI-7500\nTimezone:\tUTC\n\
                    DATAH\tSeconds\t\"CO2 (mmol/m^3)\"\tEmpty\n\
                    DATA\t1\t15.5\t\n\
                    DATA\t2\t16.5\t\n";
        let table =
            read_data_component(text.as_bytes(), &ghg_description(), Path::new("x.data"))
                .unwrap();

        assert_eq!(table.names, vec!["Seconds", "CO2 (mmol/m^3)", "Empty"]);
        assert_eq!(table.height(), 2);
        assert_eq!(table.numeric_values(1).unwrap(), Some(vec![15.5, 16.5]));
        assert!(table.is_empty_column(2));
        assert!(table.units.is_none());
    }

    #[test]
    fn test_unit_row_and_na_values() {
        let description = FileDescription {
            separator: b',',
            header_rows: 4,
            skip_rows: 1,
            data_label: None,
            na_values: vec!["NAN".to_string()],
        };
        let text = "\"TOA5\",\"site\"\n\"TIMESTAMP\",\"Ts\"\n\"TS\",\"degC\"\n\"\",\"Avg\"\n\
                    \"2024-01-01 00:00:00\",NAN\n\"2024-01-01 00:00:05\",12.5\n";
        let table =
            read_data_component(text.as_bytes(), &description, Path::new("x.dat")).unwrap();

        assert_eq!(table.names, vec!["TIMESTAMP", "Ts"]);
        assert_eq!(
            table.units,
            Some(vec!["TS".to_string(), "degC".to_string()])
        );
        assert_eq!(table.numeric_values(0).unwrap(), None);
        assert_eq!(table.numeric_values(1).unwrap(), Some(vec![12.5]));
    }

    #[test]
    fn test_non_finite_values_are_left_out_of_statistics() {
        let text = "a\nb\nDATAH\tSeconds\tCO2\tH2O\n\
                    DATA\t1\t1.0\tinf\n\
                    DATA\t2\tinf\t-inf\n\
                    DATA\t3\t-inf\tnan\n\
                    DATA\t4\tNaN\tNaN\n\
                    DATA\t5\t3.0\tinf\n";
        let table =
            read_data_component(text.as_bytes(), &ghg_description(), Path::new("x.data"))
                .unwrap();

        let co2 = table.numeric_values(1).unwrap().unwrap();
        assert_eq!(co2, vec![1.0, 3.0]);
        assert_eq!(Statistic::Mean.compute(&co2), Some(2.0));
        assert_eq!(Statistic::Min.compute(&co2), Some(1.0));
        assert_eq!(Statistic::Max.compute(&co2), Some(3.0));
        assert_eq!(Statistic::Std.compute(&co2), Some(2f64.sqrt()));

        let h2o = table.numeric_values(2).unwrap().unwrap();
        assert!(h2o.is_empty());
        assert_eq!(Statistic::Mean.compute(&h2o), None);
        assert_eq!(Statistic::Count.compute(&h2o), Some(0.0));
    }

    #[test]
    fn test_delimiter_mismatch() {
        let text = "a\nb\nDATAH,Seconds,CO2\nDATA,1,2\n";
        let mut description = ghg_description();
        description.separator = b',';
        let matching = read_data_component(text.as_bytes(), &description, Path::new("x")).unwrap();
        assert_eq!(matching.names, vec!["Seconds", "CO2"]);

        let text = "a\nb\nDATAH\tSeconds\tCO2\nDATA,1,2\n";
        match read_data_component(text.as_bytes(), &ghg_description(), Path::new("x")) {
            Err(GhgError::Delimiter { .. }) => {}
            other => panic!("Expected Delimiter error, got {:?}", other.map(|t| t.names)),
        }
    }

    #[test]
    fn test_duplicate_and_missing_names() {
        assert_eq!(
            reconcile_names(vec!["a".into(), "a".into()], 3),
            vec!["a".to_string(), "a_2".to_string(), String::new()]
        );
    }
}
