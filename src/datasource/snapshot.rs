use serde::Serialize;
use serde_json::{Map, Value};

/// One table row: field name to value.
pub type Record = Map<String, Value>;

/// Point-in-time read of the data table.
///
/// `columns` is the union of record keys in order of first appearance.
/// Records without fields are dropped, so `columns` is empty iff `records` is.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableSnapshot {
    columns: Vec<String>,
    records: Vec<Record>,
}

impl TableSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let mut columns: Vec<String> = Vec::new();
        let mut kept = Vec::new();

        for record in records {
            if record.is_empty() {
                continue;
            }
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
            kept.push(record);
        }

        Self {
            columns,
            records: kept,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// New snapshot holding only the records matching `keep`.
    pub fn retain<F>(&self, keep: F) -> TableSnapshot
    where
        F: Fn(&Record) -> bool,
    {
        TableSnapshot::from_records(self.records.iter().filter(|r| keep(r)).cloned())
    }
}
