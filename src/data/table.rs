//! Restricted row-oriented table engine.
//!
//! A [`SafeTable`] is an ordered list of rows sharing one column list.
//! Cells are JSON values; a column missing from a source record reads as
//! `null`. Rows are reference counted and never mutated, so `filter`,
//! `sort_values` and friends reuse the rows they keep.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::array::{SafeArray, Summary};
use crate::data::value::{
    as_number, compare_values, composite_key, float_value, hash_key, sort_cmp, values_equal,
    HashKey,
};
use crate::error::{Result, SandboxError};

type Row = Arc<[Value]>;

/// Row-oriented table of JSON cells.
#[derive(Debug, Clone, PartialEq)]
pub struct SafeTable {
    columns: Arc<[String]>,
    rows: Arc<[Row]>,
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    /// Cell for `column`; `None` only if the table has no such column.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Numeric cell for `column`.
    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(as_number)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    /// `(column, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        let columns = self.columns;
        let values = self.values;
        columns.iter().map(String::as_str).zip(values.iter())
    }

    /// Row as a JSON object in column order.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

/// Comparison operators accepted by [`SafeTable::where_`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    In,
}

impl Operator {
    /// Parse one of `==`, `!=`, `>`, `<`, `>=`, `<=`, `in`.
    pub fn parse(op: &str) -> Result<Self> {
        match op {
            "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            ">" => Ok(Operator::Gt),
            "<" => Ok(Operator::Lt),
            ">=" => Ok(Operator::Ge),
            "<=" => Ok(Operator::Le),
            "in" => Ok(Operator::In),
            other => Err(SandboxError::validation(format!(
                "unknown operator '{other}', expected one of ==, !=, >, <, >=, <=, in"
            ))),
        }
    }

    fn matches(&self, cell: &Value, operand: &Value) -> bool {
        let ordering = || compare_values(cell, operand);
        match self {
            Operator::Eq => values_equal(cell, operand),
            Operator::Ne => !values_equal(cell, operand),
            Operator::Gt => ordering() == Some(Ordering::Greater),
            Operator::Lt => ordering() == Some(Ordering::Less),
            Operator::Ge => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            Operator::Le => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            Operator::In => operand
                .as_array()
                .is_some_and(|items| items.iter().any(|item| values_equal(cell, item))),
        }
    }
}

impl std::str::FromStr for Operator {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Operator::parse(s)
    }
}

/// Reductions applied to the non-null values of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Mean,
    Median,
    Std,
    Count,
    Min,
    Max,
    First,
    Last,
}

impl Aggregation {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sum" => Ok(Aggregation::Sum),
            "mean" => Ok(Aggregation::Mean),
            "median" => Ok(Aggregation::Median),
            "std" => Ok(Aggregation::Std),
            "count" => Ok(Aggregation::Count),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "first" => Ok(Aggregation::First),
            "last" => Ok(Aggregation::Last),
            other => Err(SandboxError::validation(format!(
                "unknown aggregation '{other}'"
            ))),
        }
    }

    /// Apply to already null-filtered values. Empty input is `None`.
    fn apply(&self, values: &[&Value]) -> Option<Value> {
        if values.is_empty() {
            return None;
        }
        match self {
            Aggregation::Count => Some(Value::from(values.len())),
            Aggregation::First => values.first().map(|v| (*v).clone()),
            Aggregation::Last => values.last().map(|v| (*v).clone()),
            Aggregation::Min => extreme(values, Ordering::Less),
            Aggregation::Max => extreme(values, Ordering::Greater),
            Aggregation::Sum => sum_values(values),
            Aggregation::Mean => numeric(values).and_then(|a| float_value(a.mean())),
            Aggregation::Median => numeric(values).and_then(|a| float_value(a.median())),
            Aggregation::Std => numeric(values).and_then(|a| float_value(a.std(0))),
        }
    }
}

/// Join flavours for [`SafeTable::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinHow {
    /// Matched pairs only.
    Inner,
    /// Matched pairs plus every unmatched left row.
    Left,
}

impl JoinHow {
    pub fn parse(how: &str) -> Result<Self> {
        match how {
            "inner" => Ok(JoinHow::Inner),
            "left" => Ok(JoinHow::Left),
            other => Err(SandboxError::validation(format!(
                "unsupported join '{other}', expected 'inner' or 'left'"
            ))),
        }
    }
}

/// Column type inferred from the non-null cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Bool,
    Int,
    Float,
    Text,
    Mixed,
    /// Every cell is null.
    Empty,
}

/// Result of [`SafeTable::agg`].
#[derive(Debug, Clone, PartialEq)]
pub enum AggOutput {
    Scalar(Option<Value>),
    Grouped(Vec<GroupValue>),
}

impl AggOutput {
    pub fn scalar(self) -> Option<Value> {
        match self {
            AggOutput::Scalar(value) => value,
            AggOutput::Grouped(_) => None,
        }
    }

    pub fn grouped(self) -> Vec<GroupValue> {
        match self {
            AggOutput::Scalar(_) => Vec::new(),
            AggOutput::Grouped(groups) => groups,
        }
    }
}

/// One group's aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupValue {
    pub key: Vec<Value>,
    pub value: Option<Value>,
}

/// Per-column statistics from [`SafeTable::describe`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub column: String,
    #[serde(flatten)]
    pub summary: Summary,
}

impl SafeTable {
    /// Build from row records, each a JSON object.
    ///
    /// Columns follow the first record's key order; keys first seen in
    /// later records are appended.
    pub fn from_records(records: &[Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        let objects = records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                record
                    .as_object()
                    .ok_or_else(|| SandboxError::validation(format!("record {i} is not an object")))
            })
            .collect::<Result<Vec<_>>>()?;

        for object in &objects {
            for key in object.keys() {
                if !index.contains_key(key) {
                    index.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }

        let rows = objects
            .iter()
            .map(|object| {
                let mut row = vec![Value::Null; columns.len()];
                for (key, value) in object.iter() {
                    row[index[key]] = value.clone();
                }
                Row::from(row)
            })
            .collect();

        Ok(Self::from_parts(columns, rows))
    }

    /// Build from a column-name to values mapping in declared order.
    ///
    /// Shorter columns are padded with nulls.
    pub fn from_columns(columns: Vec<(String, Vec<Value>)>) -> Result<Self> {
        let names: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
        check_unique(&names)?;

        let height = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        let rows = (0..height)
            .map(|i| {
                columns
                    .iter()
                    .map(|(_, values)| values.get(i).cloned().unwrap_or(Value::Null))
                    .collect::<Row>()
            })
            .collect();

        Ok(Self::from_parts(names, rows))
    }

    /// Build from a column list and positional rows.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(SandboxError::validation(format!(
                "row {i} has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
        check_unique(&columns)?;
        Ok(Self::from_parts(
            columns,
            rows.into_iter().map(Row::from).collect(),
        ))
    }

    /// Build from JSON: an array of records or an object of columns.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(records) => Self::from_records(records),
            Value::Object(map) => Self::from_columns(
                map.iter()
                    .map(|(name, values)| {
                        values
                            .as_array()
                            .cloned()
                            .map(|v| (name.clone(), v))
                            .ok_or_else(|| {
                                SandboxError::validation(format!("column '{name}' is not an array"))
                            })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => Err(SandboxError::validation(
                "expected an array of records or an object of columns",
            )),
        }
    }

    fn from_parts(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns: Arc::from(columns),
            rows: Arc::from(rows),
        }
    }

    fn with_rows(&self, rows: Vec<Row>) -> Self {
        Self {
            columns: Arc::clone(&self.columns),
            rows: Arc::from(rows),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(rows, columns)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows.len(), self.columns.len())
    }

    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = RowRef<'_>> + '_ {
        self.rows.iter().map(move |values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    /// Rows as JSON objects.
    pub fn records(&self) -> Vec<Value> {
        self.rows().map(|row| row.to_json()).collect()
    }

    /// The table as a JSON array of records.
    pub fn to_json(&self) -> Value {
        Value::Array(self.records())
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| SandboxError::validation(format!("unknown column '{name}'")))
    }

    fn column_indices(&self, names: &[&str]) -> Result<Vec<usize>> {
        if names.is_empty() {
            return Err(SandboxError::validation("at least one column is required"));
        }
        names.iter().map(|name| self.column_index(name)).collect()
    }

    /// All cells of one column, nulls included.
    pub fn column(&self, name: &str) -> Result<Vec<Value>> {
        let i = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row[i].clone()).collect())
    }

    /// Numeric cells of one column as a [`SafeArray`]; other cells are skipped.
    pub fn column_array(&self, name: &str) -> Result<SafeArray> {
        let i = self.column_index(name)?;
        Ok(self.rows.iter().filter_map(|row| as_number(&row[i])).collect())
    }

    /// Distinct values of a column in first-seen order.
    pub fn unique(&self, name: &str) -> Result<Vec<Value>> {
        let i = self.column_index(name)?;
        let mut seen = std::collections::HashSet::new();
        Ok(self
            .rows
            .iter()
            .filter(|row| seen.insert(hash_key(&row[i])))
            .map(|row| row[i].clone())
            .collect())
    }

    /// Keep only the named columns, in the given order.
    pub fn select(&self, names: &[&str]) -> Result<Self> {
        let indices = self.column_indices(names)?;
        let columns = names.iter().map(|n| n.to_string()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect::<Row>())
            .collect();
        Ok(Self::from_parts(columns, rows))
    }

    /// Drop the named columns; unknown names are an error.
    pub fn drop_columns(&self, names: &[&str]) -> Result<Self> {
        for name in names {
            self.column_index(name)?;
        }
        let keep: Vec<&str> = self
            .columns
            .iter()
            .map(String::as_str)
            .filter(|c| !names.contains(c))
            .collect();
        if keep.is_empty() {
            return Ok(Self::from_parts(Vec::new(), vec![Row::from(Vec::new()); self.len()]));
        }
        self.select(&keep)
    }

    /// Add or replace a column computed from each row.
    pub fn with_column(&self, name: &str, f: impl Fn(RowRef<'_>) -> Value) -> Self {
        let existing = self.columns.iter().position(|c| c == name);
        let mut columns = self.columns.to_vec();
        if existing.is_none() {
            columns.push(name.to_string());
        }

        let rows = self
            .rows()
            .map(|row| {
                let value = f(row);
                let mut values = row.values().to_vec();
                match existing {
                    Some(i) => values[i] = value,
                    None => values.push(value),
                }
                Row::from(values)
            })
            .collect();
        Self::from_parts(columns, rows)
    }

    pub fn head(&self, n: usize) -> Self {
        self.with_rows(self.rows.iter().take(n).cloned().collect())
    }

    pub fn tail(&self, n: usize) -> Self {
        let skip = self.len().saturating_sub(n);
        self.with_rows(self.rows.iter().skip(skip).cloned().collect())
    }

    /// Rows for which `predicate` holds.
    pub fn filter(&self, predicate: impl Fn(RowRef<'_>) -> bool) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|values| {
                predicate(RowRef {
                    columns: &self.columns,
                    values,
                })
            })
            .cloned()
            .collect();
        self.with_rows(rows)
    }

    /// Rows whose `column` satisfies `op` against `value`.
    ///
    /// `op` is one of `==`, `!=`, `>`, `<`, `>=`, `<=`, `in`; anything
    /// else is a validation error. Ordering operators never match cells
    /// that cannot be ordered against `value` (null, or a different type).
    pub fn where_(&self, column: &str, op: &str, value: &Value) -> Result<Self> {
        self.where_op(column, Operator::parse(op)?, value)
    }

    pub fn where_op(&self, column: &str, op: Operator, value: &Value) -> Result<Self> {
        if op == Operator::In && !value.is_array() {
            return Err(SandboxError::validation("'in' requires an array operand"));
        }
        let i = self.column_index(column)?;
        Ok(self.filter(|row| op.matches(&row.values()[i], value)))
    }

    /// Partition rows by the values of one or more columns.
    pub fn groupby(&self, by: &[&str]) -> Result<GroupBy<'_>> {
        let key_columns = self.column_indices(by)?;
        let mut lookup: HashMap<Vec<HashKey>, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();

        for (row_index, row) in self.rows.iter().enumerate() {
            let cells: Vec<&Value> = key_columns.iter().map(|&i| &row[i]).collect();
            let slot = *lookup.entry(composite_key(&cells)).or_insert_with(|| {
                groups.push((cells.iter().map(|v| (*v).clone()).collect(), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(row_index);
        }

        Ok(GroupBy {
            table: self,
            by: by.iter().map(|s| s.to_string()).collect(),
            groups,
        })
    }

    /// Aggregate one column, globally or per group.
    pub fn agg(
        &self,
        column: &str,
        func: Aggregation,
        group_by: Option<&[&str]>,
    ) -> Result<AggOutput> {
        match group_by {
            None => {
                let i = self.column_index(column)?;
                let values = non_null(self.rows.iter().map(|row| &row[i]));
                Ok(AggOutput::Scalar(func.apply(&values)))
            }
            Some(by) => self.groupby(by)?.agg(column, func).map(AggOutput::Grouped),
        }
    }

    pub fn sum(&self, column: &str) -> Result<Option<Value>> {
        self.agg(column, Aggregation::Sum, None).map(AggOutput::scalar)
    }

    pub fn mean(&self, column: &str) -> Result<Option<Value>> {
        self.agg(column, Aggregation::Mean, None).map(AggOutput::scalar)
    }

    pub fn count(&self, column: &str) -> Result<Option<Value>> {
        self.agg(column, Aggregation::Count, None).map(AggOutput::scalar)
    }

    pub fn min(&self, column: &str) -> Result<Option<Value>> {
        self.agg(column, Aggregation::Min, None).map(AggOutput::scalar)
    }

    pub fn max(&self, column: &str) -> Result<Option<Value>> {
        self.agg(column, Aggregation::Max, None).map(AggOutput::scalar)
    }

    /// Stable sort on one or more columns; nulls always sort last.
    pub fn sort_values(&self, by: &[&str], ascending: bool) -> Result<Self> {
        let keys: Vec<(&str, bool)> = by.iter().map(|c| (*c, ascending)).collect();
        self.sort_values_by(&keys)
    }

    /// Stable sort with a direction per key column.
    pub fn sort_values_by(&self, keys: &[(&str, bool)]) -> Result<Self> {
        let names: Vec<&str> = keys.iter().map(|(c, _)| *c).collect();
        let indices = self.column_indices(&names)?;
        let directions: Vec<bool> = keys.iter().map(|(_, asc)| *asc).collect();

        let mut rows = self.rows.to_vec();
        rows.sort_by(|a, b| {
            indices
                .iter()
                .zip(&directions)
                .map(|(&i, &asc)| null_last_cmp(&a[i], &b[i], asc))
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        Ok(self.with_rows(rows))
    }

    /// Equality join on `on`.
    ///
    /// Output rows follow left order, then right order within a left row.
    /// The result has the left columns followed by right-only columns;
    /// where both sides share a column name the right value wins.
    pub fn merge(left: &SafeTable, right: &SafeTable, on: &str, how: JoinHow) -> Result<Self> {
        let left_on = left.column_index(on)?;
        let right_on = right.column_index(on)?;

        let mut columns = left.columns.to_vec();
        let right_slots: Vec<usize> = right
            .columns
            .iter()
            .map(|name| match columns.iter().position(|c| c == name) {
                Some(i) => i,
                None => {
                    columns.push(name.clone());
                    columns.len() - 1
                }
            })
            .collect();

        let mut index: HashMap<HashKey, Vec<usize>> = HashMap::new();
        for (i, row) in right.rows.iter().enumerate() {
            index.entry(hash_key(&row[right_on])).or_default().push(i);
        }

        let width = columns.len();
        let mut rows = Vec::new();
        for left_row in left.rows.iter() {
            let base = || {
                let mut values = left_row.to_vec();
                values.resize(width, Value::Null);
                values
            };
            match index.get(&hash_key(&left_row[left_on])) {
                Some(matches) => {
                    for &j in matches {
                        let mut values = base();
                        for (value, &slot) in right.rows[j].iter().zip(&right_slots) {
                            values[slot] = value.clone();
                        }
                        rows.push(Row::from(values));
                    }
                }
                None if how == JoinHow::Left => rows.push(Row::from(base())),
                None => {}
            }
        }

        Ok(Self::from_parts(columns, rows))
    }

    /// Summary statistics for columns whose non-null cells are all numeric.
    pub fn describe(&self) -> Vec<ColumnSummary> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let cells = non_null(self.rows.iter().map(|row| &row[i]));
                if cells.is_empty() {
                    return None;
                }
                let numbers: Vec<f64> = cells.iter().filter_map(|v| as_number(v)).collect();
                (numbers.len() == cells.len()).then(|| ColumnSummary {
                    column: name.clone(),
                    summary: SafeArray::new(numbers).describe(),
                })
            })
            .collect()
    }

    /// Column types, re-derived from the data on every call.
    pub fn dtypes(&self) -> Vec<(String, Dtype)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), infer_dtype(self.rows.iter().map(|row| &row[i]))))
            .collect()
    }
}

/// Rows of a [`SafeTable`] partitioned by key columns.
///
/// Groups iterate in order of each key's first occurrence.
#[derive(Debug, Clone)]
pub struct GroupBy<'a> {
    table: &'a SafeTable,
    by: Vec<String>,
    groups: Vec<(Vec<Value>, Vec<usize>)>,
}

impl<'a> GroupBy<'a> {
    pub fn by(&self) -> &[String] {
        &self.by
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &[Value]> + '_ {
        self.groups.iter().map(|(key, _)| key.as_slice())
    }

    /// Each key with its rows as a table.
    pub fn groups(&self) -> impl Iterator<Item = (&[Value], SafeTable)> + '_ {
        self.groups
            .iter()
            .map(|(key, members)| (key.as_slice(), self.subtable(members)))
    }

    pub fn get_group(&self, key: &[Value]) -> Option<SafeTable> {
        let wanted = composite_key(&key.iter().collect::<Vec<_>>());
        self.groups
            .iter()
            .find(|(k, _)| composite_key(&k.iter().collect::<Vec<_>>()) == wanted)
            .map(|(_, members)| self.subtable(members))
    }

    /// Row count per group.
    pub fn size(&self) -> Vec<(Vec<Value>, usize)> {
        self.groups
            .iter()
            .map(|(key, members)| (key.clone(), members.len()))
            .collect()
    }

    pub fn agg(&self, column: &str, func: Aggregation) -> Result<Vec<GroupValue>> {
        let i = self.table.column_index(column)?;
        Ok(self
            .groups
            .iter()
            .map(|(key, members)| {
                let values = non_null(members.iter().map(|&r| &self.table.rows[r][i]));
                GroupValue {
                    key: key.clone(),
                    value: func.apply(&values),
                }
            })
            .collect())
    }

    pub fn sum(&self, column: &str) -> Result<Vec<GroupValue>> {
        self.agg(column, Aggregation::Sum)
    }

    pub fn mean(&self, column: &str) -> Result<Vec<GroupValue>> {
        self.agg(column, Aggregation::Mean)
    }

    pub fn count(&self, column: &str) -> Result<Vec<GroupValue>> {
        self.agg(column, Aggregation::Count)
    }

    pub fn min(&self, column: &str) -> Result<Vec<GroupValue>> {
        self.agg(column, Aggregation::Min)
    }

    pub fn max(&self, column: &str) -> Result<Vec<GroupValue>> {
        self.agg(column, Aggregation::Max)
    }

    fn subtable(&self, members: &[usize]) -> SafeTable {
        self.table
            .with_rows(members.iter().map(|&r| Arc::clone(&self.table.rows[r])).collect())
    }
}

fn check_unique(columns: &[String]) -> Result<()> {
    for (i, name) in columns.iter().enumerate() {
        if columns[..i].contains(name) {
            return Err(SandboxError::validation(format!("duplicate column '{name}'")));
        }
    }
    Ok(())
}

fn non_null<'v>(cells: impl Iterator<Item = &'v Value>) -> Vec<&'v Value> {
    cells.filter(|v| !v.is_null()).collect()
}

fn numeric(values: &[&Value]) -> Option<SafeArray> {
    let numbers: SafeArray = values.iter().filter_map(|v| as_number(v)).collect();
    (!numbers.is_empty()).then_some(numbers)
}

fn sum_values(values: &[&Value]) -> Option<Value> {
    let numbers: Vec<&serde_json::Number> = values
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => Some(n),
            _ => None,
        })
        .collect();
    if numbers.is_empty() {
        return None;
    }

    let integral = numbers
        .iter()
        .try_fold(0i64, |acc, n| n.as_i64().and_then(|x| acc.checked_add(x)));
    match integral {
        Some(total) => Some(Value::from(total)),
        None => float_value(numbers.iter().filter_map(|n| n.as_f64()).sum()),
    }
}

fn extreme(values: &[&Value], want: Ordering) -> Option<Value> {
    let mut best: Option<&Value> = None;
    for &value in values {
        best = match best {
            None => Some(value),
            Some(current) if compare_values(value, current) == Some(want) => Some(value),
            keep => keep,
        };
    }
    best.cloned()
}

fn null_last_cmp(a: &Value, b: &Value, ascending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) if ascending => sort_cmp(a, b),
        (false, false) => sort_cmp(b, a),
    }
}

fn infer_dtype<'v>(cells: impl Iterator<Item = &'v Value>) -> Dtype {
    let mut seen: Option<Dtype> = None;
    for cell in cells {
        let kind = match cell {
            Value::Null => continue,
            Value::Bool(_) => Dtype::Bool,
            Value::Number(n) if n.is_f64() => Dtype::Float,
            Value::Number(_) => Dtype::Int,
            Value::String(_) => Dtype::Text,
            _ => return Dtype::Mixed,
        };
        seen = Some(match (seen, kind) {
            (None, k) => k,
            (Some(a), b) if a == b => a,
            (Some(Dtype::Int), Dtype::Float) | (Some(Dtype::Float), Dtype::Int) => Dtype::Float,
            _ => return Dtype::Mixed,
        });
    }
    seen.unwrap_or(Dtype::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trades() -> SafeTable {
        SafeTable::from_records(&[
            json!({"symbol": "AAPL", "side": "buy", "qty": 10, "price": 190.5}),
            json!({"symbol": "MSFT", "side": "sell", "qty": 5, "price": 410.0}),
            json!({"symbol": "AAPL", "side": "sell", "qty": 4, "price": 192.0}),
            json!({"symbol": "TSLA", "side": "buy", "qty": 2}),
        ])
        .unwrap()
    }

    #[test]
    fn test_from_records_keeps_first_row_order() {
        let table = trades();
        assert_eq!(table.columns(), &["symbol", "side", "qty", "price"]);
        assert_eq!(table.shape(), (4, 4));
        assert_eq!(table.row(3).unwrap().get("price"), Some(&Value::Null));
        assert_eq!(table.row(3).unwrap().get("missing"), None);
    }

    #[test]
    fn test_from_records_appends_late_columns() {
        let table =
            SafeTable::from_records(&[json!({"b": 1, "a": 2}), json!({"a": 3, "c": 4})]).unwrap();
        assert_eq!(table.columns(), &["b", "a", "c"]);
        assert_eq!(table.column("c").unwrap(), vec![Value::Null, json!(4)]);
        assert!(SafeTable::from_records(&[json!(1)]).is_err());
    }

    #[test]
    fn test_from_columns_uses_declared_order() {
        let table = SafeTable::from_columns(vec![
            ("z".to_string(), vec![json!(1), json!(2)]),
            ("a".to_string(), vec![json!("x")]),
        ])
        .unwrap();
        assert_eq!(table.columns(), &["z", "a"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[1], json!({"z": 2, "a": null}));

        let dup = SafeTable::from_columns(vec![
            ("a".to_string(), vec![]),
            ("a".to_string(), vec![]),
        ]);
        assert!(dup.is_err());
    }

    #[test]
    fn test_where_operators() {
        let table = trades();
        assert_eq!(table.where_("symbol", "==", &json!("AAPL")).unwrap().len(), 2);
        assert_eq!(table.where_("symbol", "!=", &json!("AAPL")).unwrap().len(), 2);
        assert_eq!(table.where_("qty", ">", &json!(4)).unwrap().len(), 2);
        assert_eq!(table.where_("qty", ">=", &json!(4)).unwrap().len(), 3);
        assert_eq!(table.where_("qty", "<", &json!(4.5)).unwrap().len(), 2);
        assert_eq!(table.where_("price", "<=", &json!(192)).unwrap().len(), 2);
        assert_eq!(
            table
                .where_("symbol", "in", &json!(["MSFT", "TSLA"]))
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_where_rejects_unknown_operator_and_column() {
        let table = trades();
        let err = table.where_("qty", "=~", &json!(1)).unwrap_err();
        assert!(err.is_validation());
        assert!(table.where_("nope", "==", &json!(1)).is_err());
        assert!(table.where_("qty", "in", &json!(1)).is_err());
    }

    #[test]
    fn test_filter_shares_rows() {
        let table = trades();
        let sells = table.filter(|row| row.get("side") == Some(&json!("sell")));
        assert_eq!(sells.len(), 2);
        assert!(Arc::ptr_eq(&sells.rows[0], &table.rows[1]));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_groupby_first_seen_order() {
        let table = trades();
        let groups = table.groupby(&["symbol"]).unwrap();
        let keys: Vec<_> = groups.keys().map(|k| k[0].clone()).collect();
        assert_eq!(keys, vec![json!("AAPL"), json!("MSFT"), json!("TSLA")]);

        let sums = groups.sum("qty").unwrap();
        assert_eq!(sums[0].value, Some(json!(14)));
        assert_eq!(groups.get_group(&[json!("AAPL")]).unwrap().len(), 2);
        assert!(groups.get_group(&[json!("NVDA")]).is_none());
    }

    #[test]
    fn test_groupby_composite_key() {
        let table = trades();
        let groups = table.groupby(&["symbol", "side"]).unwrap();
        assert_eq!(groups.len(), 4);
        let sizes = groups.size();
        assert_eq!(sizes[0], (vec![json!("AAPL"), json!("buy")], 1));
    }

    #[test]
    fn test_groupby_keys_do_not_collide_on_separators() {
        let table = SafeTable::from_records(&[
            json!({"a": "x\u{1f}s:y", "b": "z"}),
            json!({"a": "x", "b": "y\u{1f}s:z"}),
        ])
        .unwrap();
        assert_eq!(table.groupby(&["a", "b"]).unwrap().len(), 2);
    }

    #[test]
    fn test_groupby_and_merge_on_large_integral_numbers() {
        let table = SafeTable::from_records(&[
            json!({"k": 9007199254740992_i64, "v": 1}),
            json!({"k": 9007199254740992.0_f64, "v": 2}),
            json!({"k": 9007199254740993_i64, "v": 4}),
        ])
        .unwrap();
        let groups = table.groupby(&["k"]).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.sum("v").unwrap()[0].value, Some(json!(3)));

        let right =
            SafeTable::from_records(&[json!({"k": 9007199254740992.0_f64, "tag": "even"})]).unwrap();
        let joined = SafeTable::merge(&table, &right, "k", JoinHow::Inner).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.column("v").unwrap(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_agg_skips_nulls_and_reports_absent() {
        let table = trades();
        assert_eq!(table.count("price").unwrap(), Some(json!(3)));
        assert_eq!(table.sum("qty").unwrap(), Some(json!(21)));
        assert_eq!(table.max("price").unwrap(), Some(json!(410.0)));
        assert_eq!(table.min("symbol").unwrap(), Some(json!("AAPL")));

        let by_symbol = table
            .agg("price", Aggregation::Mean, Some(&["symbol"]))
            .unwrap()
            .grouped();
        assert_eq!(by_symbol[2].key, vec![json!("TSLA")]);
        assert_eq!(by_symbol[2].value, None);
        assert_eq!(by_symbol[0].value, Some(json!(191.25)));
    }

    #[test]
    fn test_sum_promotes_to_float() {
        let table =
            SafeTable::from_records(&[json!({"x": 1}), json!({"x": 2.5}), json!({"x": "n/a"})])
                .unwrap();
        assert_eq!(table.sum("x").unwrap(), Some(json!(3.5)));
    }

    #[test]
    fn test_sort_values_is_stable() {
        let table = trades();
        let sorted = table.sort_values(&["side"], true).unwrap();
        let symbols = sorted.column("symbol").unwrap();
        assert_eq!(symbols, vec![json!("AAPL"), json!("TSLA"), json!("MSFT"), json!("AAPL")]);

        let desc = table.sort_values(&["price"], false).unwrap();
        assert_eq!(
            desc.column("price").unwrap(),
            vec![json!(410.0), json!(192.0), json!(190.5), Value::Null]
        );
    }

    #[test]
    fn test_sort_values_composite() {
        let table = trades();
        let sorted = table
            .sort_values_by(&[("symbol", true), ("qty", false)])
            .unwrap();
        let qty = sorted.column("qty").unwrap();
        assert_eq!(qty, vec![json!(10), json!(4), json!(5), json!(2)]);
    }

    #[test]
    fn test_merge_inner_and_left() {
        let left = trades();
        let right = SafeTable::from_records(&[
            json!({"symbol": "AAPL", "sector": "tech", "price": 1.0}),
            json!({"symbol": "MSFT", "sector": "tech"}),
        ])
        .unwrap();

        let inner = SafeTable::merge(&left, &right, "symbol", JoinHow::Inner).unwrap();
        assert_eq!(inner.len(), 3);
        assert_eq!(inner.columns(), &["symbol", "side", "qty", "price", "sector"]);
        // right-hand columns override left-hand columns of the same name
        assert_eq!(inner.row(0).unwrap().get("price"), Some(&json!(1.0)));
        assert_eq!(inner.row(1).unwrap().get("price"), Some(&Value::Null));

        let outer = SafeTable::merge(&left, &right, "symbol", JoinHow::Left).unwrap();
        assert_eq!(outer.len(), 4);
        assert_eq!(outer.row(3).unwrap().get("sector"), Some(&Value::Null));
        assert_eq!(outer.row(3).unwrap().get("qty"), Some(&json!(2)));

        assert!(JoinHow::parse("outer").is_err());
        assert!(SafeTable::merge(&left, &right, "side", JoinHow::Inner).is_err());
    }

    #[test]
    fn test_merge_preserves_nested_loop_order() {
        let left = SafeTable::from_records(&[json!({"k": 1, "l": "a"}), json!({"k": 2, "l": "b"})])
            .unwrap();
        let right = SafeTable::from_records(&[
            json!({"k": 2, "r": "x"}),
            json!({"k": 1, "r": "y"}),
            json!({"k": 1.0, "r": "z"}),
        ])
        .unwrap();
        let merged = SafeTable::merge(&left, &right, "k", JoinHow::Inner).unwrap();
        assert_eq!(
            merged.column("r").unwrap(),
            vec![json!("y"), json!("z"), json!("x")]
        );
    }

    #[test]
    fn test_describe_only_numeric_columns() {
        let summaries = trades().describe();
        let names: Vec<_> = summaries.iter().map(|s| s.column.as_str()).collect();
        assert_eq!(names, vec!["qty", "price"]);
        assert_eq!(summaries[1].summary.count, 3);
    }

    #[test]
    fn test_dtypes() {
        let table = SafeTable::from_records(&[
            json!({"b": true, "i": 1, "f": 1, "t": "x", "m": 1, "e": null}),
            json!({"b": false, "i": 2, "f": 2.5, "t": "y", "m": "1", "e": null}),
        ])
        .unwrap();
        let dtypes: HashMap<_, _> = table.dtypes().into_iter().collect();
        assert_eq!(dtypes["b"], Dtype::Bool);
        assert_eq!(dtypes["i"], Dtype::Int);
        assert_eq!(dtypes["f"], Dtype::Float);
        assert_eq!(dtypes["t"], Dtype::Text);
        assert_eq!(dtypes["m"], Dtype::Mixed);
        assert_eq!(dtypes["e"], Dtype::Empty);
    }

    #[test]
    fn test_select_drop_and_with_column() {
        let table = trades();
        let narrow = table.select(&["qty", "symbol"]).unwrap();
        assert_eq!(narrow.columns(), &["qty", "symbol"]);
        assert!(table.select(&["nope"]).is_err());

        let dropped = table.drop_columns(&["side", "price"]).unwrap();
        assert_eq!(dropped.columns(), &["symbol", "qty"]);

        let notional = table.with_column("notional", |row| {
            match (row.number("qty"), row.number("price")) {
                (Some(q), Some(p)) => float_value(q * p).unwrap_or(Value::Null),
                _ => Value::Null,
            }
        });
        assert_eq!(notional.row(0).unwrap().get("notional"), Some(&json!(1905.0)));
        assert_eq!(table.columns().len(), 4);
    }

    #[test]
    fn test_json_round_shapes() {
        let table = SafeTable::from_json(&json!({"a": [1, 2], "b": ["x", "y"]})).unwrap();
        assert_eq!(table.to_json(), json!([{"a": 1, "b": "x"}, {"a": 2, "b": "y"}]));
        assert!(SafeTable::from_json(&json!("nope")).is_err());
        assert_eq!(table.unique("a").unwrap(), vec![json!(1), json!(2)]);
        assert_eq!(table.head(1).len(), 1);
        assert_eq!(table.tail(5).len(), 2);
    }
}
