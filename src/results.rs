use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;

/// One line on a set of axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub label: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub x_label: String,
    #[serde(default)]
    pub y_label: String,
    pub series: Vec<Series>,
}

/// Portable description of a figure. Rendering is done on demand from this.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FigureDescriptor {
    #[serde(default)]
    pub title: String,
    pub axes: Vec<Axes>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|row| row.get(idx)).collect())
    }
}

/// Validated result of an experiment routine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentOutput {
    pub plots: BTreeMap<String, FigureDescriptor>,
    pub tables: BTreeMap<String, TableDescriptor>,
}

impl ExperimentOutput {
    /// Checks a routine's raw output against the `{plots, tables}` shape.
    ///
    /// Nothing is coerced: a missing key, a wrong type, mismatched series
    /// lengths or ragged table rows are all reported as contract violations.
    pub fn from_value(routine: &str, value: Value) -> Result<Self, JobError> {
        let violation = |detail: String| JobError::ContractViolation {
            routine: routine.to_owned(),
            detail,
        };
        let Value::Object(mut object) = value else {
            return Err(violation(format!(
                "experiment output must be a mapping with `plots` and `tables`, got {}",
                type_name(&value)
            )));
        };
        let plots = take_mapping(&mut object, "plots").map_err(&violation)?;
        let tables = take_mapping(&mut object, "tables").map_err(&violation)?;

        let mut output = ExperimentOutput::default();
        for (name, raw) in plots {
            let figure: FigureDescriptor = serde_json::from_value(raw)
                .map_err(|e| violation(format!("plot `{name}` is not a figure: {e}")))?;
            for axes in &figure.axes {
                for series in &axes.series {
                    if series.x.len() != series.y.len() {
                        return Err(violation(format!(
                            "plot `{name}` series `{}` has {} x values and {} y values",
                            series.label,
                            series.x.len(),
                            series.y.len()
                        )));
                    }
                }
            }
            output.plots.insert(name, figure);
        }
        for (name, raw) in tables {
            let table: TableDescriptor = serde_json::from_value(raw)
                .map_err(|e| violation(format!("table `{name}` is not a table: {e}")))?;
            if let Some((idx, row)) = table
                .rows
                .iter()
                .enumerate()
                .find(|(_, row)| row.len() != table.columns.len())
            {
                return Err(violation(format!(
                    "table `{name}` row {idx} has {} cells for {} columns",
                    row.len(),
                    table.columns.len()
                )));
            }
            output.tables.insert(name, table);
        }
        Ok(output)
    }
}

fn take_mapping(
    object: &mut serde_json::Map<String, Value>,
    key: &str,
) -> Result<serde_json::Map<String, Value>, String> {
    match object.remove(key) {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(format!("`{key}` must be a mapping, got {}", type_name(&other))),
        None => Err(format!("experiment output is missing `{key}`")),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Output of one processing job, shared by every dataset it was run over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub job: u64,
    pub routine: String,
    pub inputs: Vec<String>,
    pub data: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub job: u64,
    pub routine: String,
    pub inputs: Vec<String>,
    pub output: ExperimentOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn violation_detail(result: Result<ExperimentOutput, JobError>) -> String {
        match result {
            Err(JobError::ContractViolation { detail, .. }) => detail,
            other => panic!("expected contract violation, got {other:?}"),
        }
    }

    #[test]
    fn accepts_well_formed_output() {
        let raw = json!({
            "plots": {
                "alpha": {
                    "title": "Alpha power",
                    "axes": [{ "series": [{ "label": "AF7", "x": [0.0, 1.0], "y": [3.5, 4.0] }] }]
                }
            },
            "tables": {
                "summary": { "columns": ["channel", "mean"], "rows": [["AF7", 3.75]] }
            }
        });
        let output = ExperimentOutput::from_value("alpha", raw).unwrap();
        assert_eq!(output.plots["alpha"].axes[0].series[0].y, vec![3.5, 4.0]);
        assert_eq!(
            output.tables["summary"].column("mean"),
            Some(vec![&json!(3.75)])
        );
    }

    #[test]
    fn rejects_missing_keys_and_wrong_types() {
        let detail = violation_detail(ExperimentOutput::from_value("r", json!({ "plots": {} })));
        assert!(detail.contains("missing `tables`"));

        let detail = violation_detail(ExperimentOutput::from_value("r", json!([1, 2])));
        assert!(detail.contains("a list"));

        let detail = violation_detail(ExperimentOutput::from_value(
            "r",
            json!({ "plots": [], "tables": {} }),
        ));
        assert!(detail.contains("`plots` must be a mapping"));
    }

    #[test]
    fn rejects_ragged_tables_and_series() {
        let ragged = json!({
            "plots": {},
            "tables": { "t": { "columns": ["a", "b"], "rows": [[1, 2], [3]] } }
        });
        assert!(violation_detail(ExperimentOutput::from_value("r", ragged)).contains("row 1"));

        let uneven = json!({
            "plots": { "p": { "axes": [{ "series": [{ "x": [1.0], "y": [] }] }] } },
            "tables": {}
        });
        assert!(violation_detail(ExperimentOutput::from_value("r", uneven)).contains("1 x values"));
    }
}
