//! Column domain accumulation during ingestion.
//!
//! Numeric columns track lower/upper bounds, nominal columns (string,
//! boolean) track the set of possible values until it grows past
//! `max_possible_values`. Parallel workers each fill a private tracker;
//! trackers are merged once at close. Possible values are keyed by
//! `(batch, ordinal)` so the merged set lists values in input order no
//! matter which worker saw them first.

use std::cmp::Ordering;

use crate::data::{Cell, DataType, Row, Value};
use crate::schema::{ColumnDomain, Schema};

/// Batch key used for values seeded from an existing schema domain.
const SEED_BATCH: u64 = 0;

#[derive(Debug, Clone)]
struct ColumnTracker {
    numeric: bool,
    nominal: bool,
    lower: Option<Value>,
    upper: Option<Value>,
    /// `None` once the cap was exceeded.
    values: Option<Vec<(u64, u64, Value)>>,
}

impl ColumnTracker {
    fn new(data_type: &DataType) -> Self {
        let nominal = data_type.is_nominal();
        Self {
            numeric: data_type.is_numeric(),
            nominal,
            lower: None,
            upper: None,
            values: nominal.then(Vec::new),
        }
    }

    fn observe_bounds(&mut self, value: &Value) {
        if value.as_f64().map_or(true, f64::is_nan) {
            return;
        }
        let below = match &self.lower {
            Some(lo) => compare_bounds(value, lo) == Some(Ordering::Less),
            None => true,
        };
        if below {
            self.lower = Some(value.clone());
        }
        let above = match &self.upper {
            Some(hi) => compare_bounds(value, hi) == Some(Ordering::Greater),
            None => true,
        };
        if above {
            self.upper = Some(value.clone());
        }
    }

    fn observe_value(&mut self, batch: u64, ordinal: u64, value: &Value, cap: usize) {
        let Some(values) = self.values.as_mut() else {
            return;
        };
        match values.iter_mut().find(|(_, _, v)| v == value) {
            Some(entry) => {
                if (batch, ordinal) < (entry.0, entry.1) {
                    entry.0 = batch;
                    entry.1 = ordinal;
                }
            }
            None => {
                values.push((batch, ordinal, value.clone()));
                if values.len() > cap {
                    self.values = None;
                }
            }
        }
    }

    fn merge(&mut self, other: &ColumnTracker, cap: usize) {
        if let Some(lo) = &other.lower {
            self.observe_bounds(lo);
        }
        if let Some(hi) = &other.upper {
            self.observe_bounds(hi);
        }
        match &other.values {
            None => self.values = None,
            Some(values) => {
                for (batch, ordinal, v) in values {
                    self.observe_value(*batch, *ordinal, v, cap);
                }
            }
        }
    }

    fn domain(&self, cap: usize) -> ColumnDomain {
        let possible_values = self.values.as_ref().filter(|v| v.len() <= cap).map(|values| {
            let mut sorted: Vec<_> = values.iter().collect();
            sorted.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            sorted.into_iter().map(|(_, _, v)| v.clone()).collect()
        });
        ColumnDomain {
            lower: self.lower.clone(),
            upper: self.upper.clone(),
            possible_values,
        }
    }
}

/// Per-column min/max and possible-value accumulator.
#[derive(Debug, Clone)]
pub struct DomainTracker {
    columns: Vec<ColumnTracker>,
    max_possible_values: usize,
    batch: u64,
    ordinal: u64,
}

impl DomainTracker {
    pub fn new(schema: &Schema, max_possible_values: usize) -> Self {
        Self {
            columns: schema
                .columns
                .iter()
                .map(|c| ColumnTracker::new(&c.data_type))
                .collect(),
            max_possible_values,
            batch: SEED_BATCH + 1,
            ordinal: 0,
        }
    }

    /// Start from the domains already present in `schema`.
    pub fn seeded(schema: &Schema, max_possible_values: usize) -> Self {
        let mut tracker = Self::new(schema, max_possible_values);
        for (col, spec) in tracker.columns.iter_mut().zip(&schema.columns) {
            if col.numeric {
                if let Some(lo) = &spec.domain.lower {
                    col.observe_bounds(lo);
                }
                if let Some(hi) = &spec.domain.upper {
                    col.observe_bounds(hi);
                }
            }
            if let Some(values) = &spec.domain.possible_values {
                for (i, v) in values.iter().enumerate() {
                    col.observe_value(SEED_BATCH, i as u64, v, max_possible_values);
                }
            }
        }
        tracker
    }

    pub fn max_possible_values(&self) -> usize {
        self.max_possible_values
    }

    /// Values seen from now on are ordered after earlier batches.
    ///
    /// Batch indices start at 0; seeded values always come first.
    pub fn begin_batch(&mut self, batch_index: u64) {
        self.batch = batch_index + 1;
        self.ordinal = 0;
    }

    /// Change the cap. Value sets already larger are dropped on `apply`.
    pub fn set_max_possible_values(&mut self, max_possible_values: usize) {
        self.max_possible_values = max_possible_values;
    }

    pub fn update(&mut self, row: &Row) {
        let ordinal = self.ordinal;
        self.ordinal += 1;
        let cap = self.max_possible_values;
        for (col, cell) in self.columns.iter_mut().zip(&row.cells) {
            let Cell::Value(value) = cell else {
                continue;
            };
            if col.numeric {
                col.observe_bounds(value);
            }
            if col.nominal {
                col.observe_value(self.batch, ordinal, value, cap);
            }
        }
    }

    pub fn merge(&mut self, other: &DomainTracker) {
        let cap = self.max_possible_values;
        for (col, theirs) in self.columns.iter_mut().zip(&other.columns) {
            col.merge(theirs, cap);
        }
    }

    /// `schema` with every column domain replaced by the tracked one.
    pub fn apply(&self, schema: &Schema) -> Schema {
        let mut out = schema.clone();
        for (spec, col) in out.columns.iter_mut().zip(&self.columns) {
            spec.domain = col.domain(self.max_possible_values);
        }
        out
    }
}

/// Numeric ordering of two bound values, `None` for non-numeric.
///
/// Integer pairs compare exactly; f64 is used only when a double is involved.
pub fn compare_bounds(a: &Value, b: &Value) -> Option<Ordering> {
    match (integral(a), integral(b)) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Int(v) => Some(i64::from(*v)),
        Value::Long(v) => Some(*v),
        _ => None,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnSpec::new("n", DataType::Double),
            ColumnSpec::new("s", DataType::String),
        ])
    }

    fn row(n: f64, s: &str) -> Row {
        Row::new(
            "r",
            vec![
                Cell::Value(Value::Double(n)),
                Cell::Value(Value::String(s.into())),
            ],
        )
    }

    #[test]
    fn test_bounds_and_values() {
        let mut t = DomainTracker::new(&schema(), 10);
        t.update(&row(3.0, "b"));
        t.update(&row(-1.5, "a"));
        t.update(&row(f64::NAN, "b"));
        let s = t.apply(&schema());
        assert_eq!(s.columns[0].domain.lower, Some(Value::Double(-1.5)));
        assert_eq!(s.columns[0].domain.upper, Some(Value::Double(3.0)));
        assert_eq!(
            s.columns[1].domain.possible_values,
            Some(vec![Value::String("b".into()), Value::String("a".into())])
        );
        assert!(s.columns[0].domain.possible_values.is_none());
    }

    #[test]
    fn test_cap_drops_value_set() {
        let mut t = DomainTracker::new(&schema(), 2);
        for s in ["a", "b", "c"] {
            t.update(&row(0.0, s));
        }
        let s = t.apply(&schema());
        assert!(s.columns[1].domain.possible_values.is_none());
        assert_eq!(s.columns[0].domain.lower, Some(Value::Double(0.0)));
    }

    #[test]
    fn test_merge_keeps_batch_order() {
        let mut late = DomainTracker::new(&schema(), 10);
        late.begin_batch(1);
        late.update(&row(10.0, "z"));
        late.update(&row(0.0, "x"));

        let mut early = DomainTracker::new(&schema(), 10);
        early.begin_batch(0);
        early.update(&row(5.0, "x"));
        early.update(&row(5.0, "y"));

        late.merge(&early);
        let s = late.apply(&schema());
        assert_eq!(
            s.columns[1].domain.possible_values,
            Some(vec![
                Value::String("x".into()),
                Value::String("y".into()),
                Value::String("z".into())
            ])
        );
        assert_eq!(s.columns[0].domain.upper, Some(Value::Double(10.0)));
        assert_eq!(s.columns[0].domain.lower, Some(Value::Double(0.0)));
    }

    #[test]
    fn test_seeded_values_come_first() {
        let mut base = schema();
        base.columns[1].domain.possible_values = Some(vec![Value::String("seed".into())]);
        let mut t = DomainTracker::seeded(&base, 10);
        t.begin_batch(0);
        t.update(&row(1.0, "new"));
        let s = t.apply(&base);
        assert_eq!(
            s.columns[1].domain.possible_values,
            Some(vec![Value::String("seed".into()), Value::String("new".into())])
        );
    }

    #[test]
    fn test_lowered_cap_applies_on_apply() {
        let mut t = DomainTracker::new(&schema(), 10);
        t.update(&row(1.0, "a"));
        t.update(&row(1.0, "b"));
        t.set_max_possible_values(1);
        assert_eq!(t.max_possible_values(), 1);
        let s = t.apply(&schema());
        assert!(s.columns[1].domain.possible_values.is_none());
        assert_eq!(s.columns[0].domain.lower, Some(Value::Double(1.0)));
    }

    #[test]
    fn test_compare_bounds() {
        assert_eq!(
            compare_bounds(&Value::Int(1), &Value::Double(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(compare_bounds(&Value::Int(1), &Value::Boolean(true)), None);
        assert_eq!(
            compare_bounds(&Value::Long(i64::MAX), &Value::Long(i64::MAX - 1)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare_bounds(&Value::Int(-1), &Value::Long(i64::MIN)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_long_bounds_keep_low_bits() {
        let longs = Schema::new(vec![ColumnSpec::new("n", DataType::Long)]);
        let mut t = DomainTracker::new(&longs, 10);
        for n in [i64::MAX - 1, i64::MAX, i64::MIN + 1, i64::MIN] {
            t.update(&Row::new("r", vec![Cell::Value(Value::Long(n))]));
        }
        let s = t.apply(&longs);
        assert_eq!(s.columns[0].domain.lower, Some(Value::Long(i64::MIN)));
        assert_eq!(s.columns[0].domain.upper, Some(Value::Long(i64::MAX)));
    }
}
