use std::path::Path;

use crate::error::{ProfusionError, Result};
use crate::jet::{JetDatabase, Table, TableSource, Value};
use crate::types::{Event, EventCategory, KindDictionary};
use crate::utils::hi_lo_to_seconds;

pub const EVENT_TABLE: &str = "EEGEvent";
pub const CATEGORY_TABLE: &str = "EEGEventCategory";

const COMPONENT: &str = "event database";

/// Events, categories and event kinds of one study
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventDatabase {
    /// Begin events in table order
    pub events: Vec<Event>,
    pub categories: Vec<EventCategory>,
    pub kinds: KindDictionary,
}

impl EventDatabase {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.categories.is_empty()
    }

    pub fn category(&self, category_id: i64) -> Option<&EventCategory> {
        self.categories.iter().find(|c| c.category_id == category_id)
    }

    /// Events whose category id is listed in `category_ids`
    pub fn events_in_categories<'a>(&'a self, category_ids: &'a [i64]) -> impl Iterator<Item = &'a Event> + 'a {
        self.events
            .iter()
            .filter(move |ev| category_ids.contains(&ev.event_category_id))
    }

    pub fn events_of_kind(&self, kind_id: usize) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter(move |ev| ev.event_kind_id == kind_id)
    }
}

/// Opens the event database file and reads both event tables
///
/// # Errors
///
/// Any failure (unreadable file, not a Jet database, missing table or
/// column) is `ProfusionError::OptionalComponentFailure`.
pub fn parse_event_database<P: AsRef<Path>>(path: P) -> Result<EventDatabase> {
    let path = path.as_ref();
    log::debug!("Parsing event database {}", path.display());

    let mut db = JetDatabase::open(path).map_err(|e| ProfusionError::optional(COMPONENT, e))?;
    log::debug!("Database parsing ok");
    read_event_database(&mut db)
}

/// Builds the event list, kind dictionary and categories from a table source
///
/// Only begin events (`IsEndEvent` false) are kept; end markers are dropped
/// without pairing them into intervals.
pub fn read_event_database<S: TableSource>(source: &mut S) -> Result<EventDatabase> {
    let fail = |reason: String| ProfusionError::optional(COMPONENT, reason);

    log::debug!("Processing {}", EVENT_TABLE);
    let table = source.read_table(EVENT_TABLE).map_err(|e| fail(e.to_string()))?;
    let (events, kinds) = read_events(&table).map_err(fail)?;
    log::debug!("Found {} event(s), {} unique name(s)", events.len(), kinds.len());

    log::debug!("Processing {}", CATEGORY_TABLE);
    let table = source.read_table(CATEGORY_TABLE).map_err(|e| fail(e.to_string()))?;
    let categories = read_categories(&table).map_err(fail)?;
    log::debug!("Found {} event categories", categories.len());

    Ok(EventDatabase {
        events,
        categories,
        kinds,
    })
}

/// Column positions of a table, resolved once
struct Columns<'a> {
    table: &'a Table,
}

impl<'a> Columns<'a> {
    fn index(&self, name: &str) -> std::result::Result<usize, String> {
        self.table
            .column_index(name)
            .ok_or_else(|| format!("table {} has no column {}", self.table.name, name))
    }
}

fn integer(row: &[Value], col: usize, name: &str, row_idx: usize) -> std::result::Result<i64, String> {
    row[col]
        .as_i64()
        .ok_or_else(|| format!("row {}: {} is {:?}, expected an integer", row_idx, name, row[col]))
}

fn word(row: &[Value], col: usize, name: &str, row_idx: usize) -> std::result::Result<i32, String> {
    row[col]
        .as_i32()
        .ok_or_else(|| format!("row {}: {} is {:?}, expected a 32-bit integer", row_idx, name, row[col]))
}

fn text(row: &[Value], col: usize) -> String {
    row[col].as_str().unwrap_or_default().to_string()
}

fn read_events(table: &Table) -> std::result::Result<(Vec<Event>, KindDictionary), String> {
    let cols = Columns { table };
    let id = cols.index("EventID")?;
    let type_id = cols.index("EventTypeID")?;
    let category_id = cols.index("EventCategoryID")?;
    let is_end = cols.index("IsEndEvent")?;
    let name = cols.index("EventString")?;
    let start_hi = cols.index("StartSecondHi")?;
    let start_lo = cols.index("StartSecondLo")?;
    let duration_hi = cols.index("DurationHi")?;
    let duration_lo = cols.index("DurationLo")?;

    let mut kinds = KindDictionary::new();
    let mut events = Vec::new();

    for (row_idx, row) in table.rows.iter().enumerate() {
        if row[is_end].as_bool().unwrap_or(false) {
            continue;
        }

        let event_name = text(row, name);
        let event_kind_id = kinds.intern(&event_name);
        let start_sec = hi_lo_to_seconds(
            word(row, start_hi, "StartSecondHi", row_idx)?,
            word(row, start_lo, "StartSecondLo", row_idx)?,
        );
        let duration_sec = hi_lo_to_seconds(
            word(row, duration_hi, "DurationHi", row_idx)?,
            word(row, duration_lo, "DurationLo", row_idx)?,
        );

        events.push(Event {
            event_id: integer(row, id, "EventID", row_idx)?,
            event_type_id: integer(row, type_id, "EventTypeID", row_idx)?,
            event_category_id: integer(row, category_id, "EventCategoryID", row_idx)?,
            event_kind_id,
            start_sec,
            duration_sec,
            event_name,
        });
    }

    Ok((events, kinds))
}

fn read_categories(table: &Table) -> std::result::Result<Vec<EventCategory>, String> {
    let cols = Columns { table };
    let id = cols.index("EventCategoryID")?;
    let name = cols.index("Name")?;
    let desc = cols.index("Description")?;

    table
        .rows
        .iter()
        .enumerate()
        .map(|(row_idx, row)| {
            Ok(EventCategory {
                category_id: integer(row, id, "EventCategoryID", row_idx)?,
                category_name: text(row, name),
                category_desc: text(row, desc),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jet::{Column, ColumnType};

    fn table(name: &str, columns: &[(&str, ColumnType)], rows: Vec<Vec<Value>>) -> Table {
        Table {
            name: name.to_string(),
            columns: columns
                .iter()
                .enumerate()
                .map(|(i, (col_name, col_type))| Column {
                    name: col_name.to_string(),
                    col_type: *col_type,
                    col_num: i as u16,
                    var_index: 0,
                    fixed_offset: 0,
                    length: 0,
                    flags: 0,
                })
                .collect(),
            rows,
        }
    }

    fn event_row(id: i32, category: i32, is_end: bool, name: &str, hi: i32, lo: i32) -> Vec<Value> {
        vec![
            Value::Long(id),
            Value::Long(1),
            Value::Long(category),
            Value::Bool(is_end),
            Value::Text(name.to_string()),
            Value::Long(hi),
            Value::Long(lo),
            Value::Long(0),
            Value::Long(250_000_000),
        ]
    }

    fn event_table(rows: Vec<Vec<Value>>) -> Table {
        table(
            EVENT_TABLE,
            &[
                ("EventID", ColumnType::Long),
                ("EventTypeID", ColumnType::Long),
                ("EventCategoryID", ColumnType::Long),
                ("IsEndEvent", ColumnType::Bool),
                ("EventString", ColumnType::Text),
                ("StartSecondHi", ColumnType::Long),
                ("StartSecondLo", ColumnType::Long),
                ("DurationHi", ColumnType::Long),
                ("DurationLo", ColumnType::Long),
            ],
            rows,
        )
    }

    fn category_table() -> Table {
        table(
            CATEGORY_TABLE,
            &[
                ("EventCategoryID", ColumnType::Long),
                ("Name", ColumnType::Text),
                ("Description", ColumnType::Memo),
            ],
            vec![
                vec![Value::Long(3), Value::Text("Clinical".into()), Value::Text("Reviewer marks".into())],
                vec![Value::Long(4), Value::Text("Technical".into()), Value::Null],
            ],
        )
    }

    #[test]
    fn test_begin_events_and_kinds() {
        let mut source = vec![
            event_table(vec![
                event_row(1, 3, false, "Spike", 0, 1_000_000_000),
                event_row(2, 3, true, "Spike", 0, 2_000_000_000),
                event_row(3, 4, false, "Artifact", 1, 500_000_000),
                event_row(4, 3, false, "Spike", 0, -1),
            ]),
            category_table(),
        ];

        let db = read_event_database(&mut source).unwrap();
        assert_eq!(db.events.len(), 3);
        assert_eq!(db.kinds.len(), 2);
        assert_eq!(db.kinds.id("Spike"), Some(0));
        assert_eq!(db.kinds.name(1), Some("Artifact"));

        let ids: Vec<_> = db.events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert!((db.events[0].start_sec - 1.0).abs() < 1e-12);
        assert!((db.events[0].duration_sec - 0.25).abs() < 1e-12);
        assert!((db.events[1].start_sec - 4.794967296).abs() < 1e-9);
        // 低位按无符号解释
        assert!((db.events[2].start_sec - 4.294967295).abs() < 1e-9);
        assert_eq!(db.events[2].event_kind_id, 0);

        assert_eq!(db.events_in_categories(&[4]).count(), 1);
        assert_eq!(db.events_of_kind(0).count(), 2);
    }

    #[test]
    fn test_categories_copied() {
        let mut source = vec![event_table(Vec::new()), category_table()];
        let db = read_event_database(&mut source).unwrap();

        assert_eq!(db.categories.len(), 2);
        assert_eq!(db.category(3).map(|c| c.category_name.as_str()), Some("Clinical"));
        assert_eq!(db.category(4).map(|c| c.category_desc.as_str()), Some(""));
        assert!(db.category(9).is_none());
    }

    #[test]
    fn test_missing_table_is_optional_failure() {
        let mut source = vec![category_table()];
        let err = read_event_database(&mut source).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_schema_drift_is_optional_failure() {
        let mut events = event_table(Vec::new());
        events.columns.retain(|c| c.name != "DurationLo");
        let mut source = vec![events, category_table()];

        match read_event_database(&mut source) {
            Err(ProfusionError::OptionalComponentFailure { reason, .. }) => {
                assert!(reason.contains("DurationLo"));
            }
            other => panic!("expected OptionalComponentFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_file_is_optional_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EEGStudyDB.mdb");
        std::fs::write(&path, b"not a database").unwrap();

        assert!(matches!(
            parse_event_database(&path),
            Err(ProfusionError::OptionalComponentFailure { .. })
        ));
    }
}
