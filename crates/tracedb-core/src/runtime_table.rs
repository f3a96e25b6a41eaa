//! Append-only, per-column variant storage with late type promotion, and its
//! finalization into an immutable [`Table`].
//!
//! Grounded directly on the source engine's `RuntimeTable`: each column
//! starts as a bare count of leading nulls and only commits to a concrete
//! storage type (`IntStorage` / `DoubleStorage` / `StringStorage`) on its
//! first non-null append. The promotion rules (§3.3 of the design) are
//! asymmetric by construction: an int column may be promoted in place to a
//! float column, but a float column never demotes back to int.

use crate::status::{Result, TraceDbError};
use crate::string_pool::{StringId, StringPool};
use crate::value::Value;

/// `1u64 << 53`: the largest magnitude at which every integer is exactly
/// representable as an `f64`. Mirrors `kMaxDoubleRepresentable` in the
/// source engine's `runtime_table.cc`.
const MAX_DOUBLE_REPRESENTABLE: i64 = 1i64 << 53;

fn is_perfectly_representable_as_double(value: i64) -> bool {
    value >= -MAX_DOUBLE_REPRESENTABLE && value <= MAX_DOUBLE_REPRESENTABLE
}

/// The state of a single column while rows are still being appended.
#[derive(Debug, Clone)]
enum ColumnStorage {
    LeadingNulls(u32),
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<StringId>),
}

impl ColumnStorage {
    fn len(&self) -> usize {
        match self {
            ColumnStorage::LeadingNulls(n) => *n as usize,
            ColumnStorage::Int(v) => v.len(),
            ColumnStorage::Float(v) => v.len(),
            ColumnStorage::Text(v) => v.len(),
        }
    }
}

/// A column's storage once `finalize` has been called: fixed length, exactly
/// one of three concrete representations.
#[derive(Debug, Clone)]
pub enum FinalizedColumn {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Text(Vec<StringId>),
}

impl FinalizedColumn {
    pub fn len(&self) -> usize {
        match self {
            FinalizedColumn::Int(v) => v.len(),
            FinalizedColumn::Float(v) => v.len(),
            FinalizedColumn::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value_at(&self, row: usize) -> Value {
        match self {
            FinalizedColumn::Int(v) => v[row].map(Value::Integer).unwrap_or(Value::Null),
            FinalizedColumn::Float(v) => v[row].map(Value::Float).unwrap_or(Value::Null),
            FinalizedColumn::Text(v) => {
                let id = v[row];
                if id.is_null() {
                    Value::Null
                } else {
                    Value::Text(id)
                }
            }
        }
    }
}

/// Builder for a runtime column table: rows are appended column-by-column,
/// then [`RuntimeTableBuilder::finalize`] commits the table.
pub struct RuntimeTableBuilder {
    col_names: Vec<String>,
    storage: Vec<ColumnStorage>,
}

impl RuntimeTableBuilder {
    pub fn new(col_names: Vec<String>) -> Self {
        let storage = col_names.iter().map(|_| ColumnStorage::LeadingNulls(0)).collect();
        Self { col_names, storage }
    }

    pub fn column_count(&self) -> usize {
        self.col_names.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.col_names
    }

    fn col_name(&self, idx: usize) -> &str {
        self.col_names.get(idx).map(String::as_str).unwrap_or("<unknown>")
    }

    pub fn append_null(&mut self, idx: usize) -> Result<()> {
        let col = &mut self.storage[idx];
        match col {
            ColumnStorage::LeadingNulls(n) => *n += 1,
            ColumnStorage::Int(v) => v.push(None),
            ColumnStorage::Float(v) => v.push(None),
            ColumnStorage::Text(v) => v.push(StringId::NULL),
        }
        Ok(())
    }

    pub fn append_int(&mut self, idx: usize, value: i64) -> Result<()> {
        if let ColumnStorage::LeadingNulls(n) = &self.storage[idx] {
            let filled = vec![None; *n as usize];
            self.storage[idx] = ColumnStorage::Int(filled);
        }
        match &mut self.storage[idx] {
            ColumnStorage::Float(doubles) => {
                if !is_perfectly_representable_as_double(value) {
                    return Err(TraceDbError::type_coercion(format!(
                        "column {} contains {} which cannot be represented as a double",
                        self.col_name(idx),
                        value
                    )));
                }
                doubles.push(Some(value as f64));
                Ok(())
            }
            ColumnStorage::Int(ints) => {
                ints.push(Some(value));
                Ok(())
            }
            ColumnStorage::Text(_) => Err(TraceDbError::type_coercion(format!(
                "column {} does not have consistent types",
                self.col_name(idx)
            ))),
            ColumnStorage::LeadingNulls(_) => unreachable!("promoted above"),
        }
    }

    pub fn append_float(&mut self, idx: usize, value: f64) -> Result<()> {
        if let ColumnStorage::LeadingNulls(n) = &self.storage[idx] {
            let filled = vec![None; *n as usize];
            self.storage[idx] = ColumnStorage::Float(filled);
        }
        if let ColumnStorage::Int(ints) = &self.storage[idx] {
            let mut doubles = Vec::with_capacity(ints.len());
            for int_val in ints {
                match int_val {
                    None => doubles.push(None),
                    Some(i) => {
                        if !is_perfectly_representable_as_double(*i) {
                            return Err(TraceDbError::type_coercion(format!(
                                "column {} contains {} which cannot be represented as a double",
                                self.col_name(idx),
                                i
                            )));
                        }
                        doubles.push(Some(*i as f64));
                    }
                }
            }
            self.storage[idx] = ColumnStorage::Float(doubles);
        }
        match &mut self.storage[idx] {
            ColumnStorage::Float(doubles) => {
                doubles.push(Some(value));
                Ok(())
            }
            ColumnStorage::Text(_) => Err(TraceDbError::type_coercion(format!(
                "column {} does not have consistent types",
                self.col_name(idx)
            ))),
            ColumnStorage::Int(_) | ColumnStorage::LeadingNulls(_) => {
                unreachable!("promoted above")
            }
        }
    }

    pub fn append_text(&mut self, idx: usize, value: &str, pool: &mut StringPool) -> Result<()> {
        if let ColumnStorage::LeadingNulls(n) = &self.storage[idx] {
            let filled = vec![StringId::NULL; *n as usize];
            self.storage[idx] = ColumnStorage::Text(filled);
        }
        match &mut self.storage[idx] {
            ColumnStorage::Text(strings) => {
                strings.push(pool.intern(value));
                Ok(())
            }
            _ => Err(TraceDbError::type_coercion(format!(
                "column {} does not have consistent types",
                self.col_name(idx)
            ))),
        }
    }

    /// Commits the builder into a [`Table`]. `rows` must equal every
    /// column's logical length; a mismatch is a fatal precondition, not a
    /// user error, because it indicates the caller mis-tracked its own
    /// append count rather than anything about the data itself (IN2).
    pub fn finalize(mut self, rows: u32) -> Table {
        let mut columns = Vec::with_capacity(self.col_names.len());
        for (i, col) in self.storage.drain(..).enumerate() {
            if let ColumnStorage::LeadingNulls(n) = &col {
                assert_eq!(
                    *n, rows,
                    "column {} has {} leading nulls but table has {} rows",
                    self.col_names[i], n, rows
                );
            }
            assert_eq!(
                col.len(),
                rows as usize,
                "column {} has {} rows but table has {} rows",
                self.col_names[i],
                col.len(),
                rows
            );
            let finalized = match col {
                ColumnStorage::LeadingNulls(n) => FinalizedColumn::Int(vec![None; n as usize]),
                ColumnStorage::Int(v) => FinalizedColumn::Int(v),
                ColumnStorage::Float(v) => FinalizedColumn::Float(v),
                ColumnStorage::Text(v) => FinalizedColumn::Text(v),
            };
            columns.push(finalized);
        }
        Table {
            col_names: self.col_names,
            columns,
            row_count: rows,
        }
    }
}

/// An immutable, finalized runtime column table plus its synthetic row-id
/// column (`_auto_id` in the source engine).
#[derive(Debug, Clone)]
pub struct Table {
    col_names: Vec<String>,
    columns: Vec<FinalizedColumn>,
    row_count: u32,
}

impl Table {
    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn column_names(&self) -> &[String] {
        &self.col_names
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_names.iter().position(|n| n == name)
    }

    pub fn column(&self, idx: usize) -> &FinalizedColumn {
        &self.columns[idx]
    }

    pub fn value(&self, col: usize, row: usize) -> Value {
        self.columns[col].value_at(row)
    }

    /// The hidden auto-id value for `row`: simply the row's ordinal, as the
    /// source engine's `_auto_id` column is defined to be.
    pub fn auto_id(&self, row: usize) -> i64 {
        row as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_nulls_promote_to_int_on_first_value() {
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_null(0).unwrap();
        builder.append_null(0).unwrap();
        builder.append_int(0, 42).unwrap();
        let table = builder.finalize(3);
        assert_eq!(table.value(0, 0), Value::Null);
        assert_eq!(table.value(0, 1), Value::Null);
        assert_eq!(table.value(0, 2), Value::Integer(42));
    }

    #[test]
    fn float_then_representable_int_both_succeed() {
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_float(0, 1024.3).unwrap();
        builder.append_int(0, 1i64 << 53).unwrap();
        let table = builder.finalize(2);
        assert_eq!(table.value(0, 0), Value::Float(1024.3));
        assert_eq!(table.value(0, 1), Value::Float((1i64 << 53) as f64));
    }

    #[test]
    fn int_outside_double_range_after_float_fails() {
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_float(0, 1.0).unwrap();
        let err = builder.append_int(0, (1i64 << 53) + 1).unwrap_err();
        assert!(matches!(err, TraceDbError::TypeCoercion { .. }));
    }

    #[test]
    fn int_column_promotes_to_float_in_place() {
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_int(0, 10).unwrap();
        builder.append_int(0, 20).unwrap();
        builder.append_float(0, 2.5).unwrap();
        let table = builder.finalize(3);
        assert_eq!(table.value(0, 0), Value::Float(10.0));
        assert_eq!(table.value(0, 1), Value::Float(20.0));
        assert_eq!(table.value(0, 2), Value::Float(2.5));
    }

    #[test]
    fn promoting_int_column_with_unrepresentable_value_fails() {
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_int(0, (1i64 << 53) + 5).unwrap();
        let err = builder.append_float(0, 1.0).unwrap_err();
        assert!(matches!(err, TraceDbError::TypeCoercion { .. }));
    }

    #[test]
    fn text_and_numeric_do_not_mix() {
        let mut pool = StringPool::new();
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_text(0, "hi", &mut pool).unwrap();
        let err = builder.append_int(0, 1).unwrap_err();
        assert!(matches!(err, TraceDbError::TypeCoercion { .. }));
    }

    #[test]
    fn finalize_populates_auto_id_by_row_ordinal() {
        let mut pool = StringPool::new();
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_text(0, "x", &mut pool).unwrap();
        builder.append_text(0, "y", &mut pool).unwrap();
        let table = builder.finalize(2);
        assert_eq!(table.auto_id(0), 0);
        assert_eq!(table.auto_id(1), 1);
    }

    #[test]
    #[should_panic(expected = "has 1 rows but table has 2 rows")]
    fn finalize_panics_on_length_mismatch() {
        let mut builder = RuntimeTableBuilder::new(vec!["a".into()]);
        builder.append_int(0, 1).unwrap();
        let _ = builder.finalize(2);
    }
}
