use profusion::doctest_utils::{event_database_bytes, BundleBuilder, TestEvent};
use profusion::events::parse_event_database;
use profusion::jet::{JetDatabase, Value};
use profusion::{EventSelection, ExportOptions, ProfusionError, ProfusionReader};
use std::fs;
use std::path::PathBuf;

// 写入测试包并打开的辅助函数
fn open_bundle(builder: &BundleBuilder) -> (tempfile::TempDir, ProfusionReader) {
    let dir = tempfile::tempdir().unwrap();
    let root = builder.write(dir.path().join("Study01")).unwrap();
    let reader = ProfusionReader::open(root).unwrap();
    (dir, reader)
}

fn categories() -> Vec<(i32, String, String)> {
    vec![
        (1, "Clinical".to_string(), "Reviewer marks".to_string()),
        (2, "Technical".to_string(), "Recording artifacts".to_string()),
    ]
}

// 将事件数据库单独写入临时文件
fn write_database(events: &[TestEvent]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("EEGStudyDB.mdb");
    fs::write(&path, event_database_bytes(events, &categories()).unwrap()).unwrap();
    (dir, path)
}

#[test]
fn test_events_loaded_with_bundle() {
    let (_dir, reader) = open_bundle(&BundleBuilder::new());

    // 结束事件被丢弃
    let events = reader.events();
    assert_eq!(events.len(), 3);
    let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![1, 3, 4]);

    assert!((events[0].start_sec - 1.5).abs() < 1e-12);
    assert!((events[0].duration_sec - 0.1).abs() < 1e-12);
    assert!((events[2].start_sec - 2.0).abs() < 1e-12);
    assert_eq!(events[0].event_category_id, 1);
    assert_eq!(events[0].event_type_id, 101);

    let kinds = reader.event_kinds();
    assert_eq!(kinds.len(), 2);
    assert_eq!(kinds.id("Spike"), Some(0));
    assert_eq!(kinds.id("Artifact"), Some(1));
    assert_eq!(events[1].event_kind_id, 1);
    assert_eq!(events[2].event_kind_id, 0);

    let cats = reader.event_categories();
    assert_eq!(cats.len(), 2);
    assert_eq!(cats[1].category_id, 2);
    assert_eq!(cats[1].category_name, "Technical");
    assert_eq!(cats[1].category_desc, "Recording artifacts");
}

#[test]
fn test_start_time_from_hi_lo_words() {
    let (_dir, reader) = open_bundle(&BundleBuilder::new());

    // Hi = 1, Lo = 500000000 纳秒
    let artifact = &reader.events()[1];
    assert_eq!(artifact.event_name, "Artifact");
    assert!((artifact.start_sec - 4.794967296).abs() < 1e-9);
    assert!((artifact.duration_sec - 0.25).abs() < 1e-12);
}

#[test]
fn test_low_word_is_unsigned() {
    let (_dir, path) = write_database(&[TestEvent::new(1, 1, "Late", 0xFFFF_FFFF, 0x8000_0000)]);
    let db = parse_event_database(&path).unwrap();

    assert!((db.events[0].start_sec - 4.294967295).abs() < 1e-9);
    assert!((db.events[0].duration_sec - 2.147483648).abs() < 1e-9);
}

#[test]
fn test_corrupt_database_yields_empty_results() {
    let builder = BundleBuilder {
        corrupt_event_database: true,
        ..BundleBuilder::new()
    };
    let (_dir, mut reader) = open_bundle(&builder);

    assert!(reader.event_database().is_failed());
    assert!(matches!(
        reader.event_database().error(),
        Some(ProfusionError::OptionalComponentFailure { .. })
    ));
    assert!(reader.events().is_empty());
    assert!(reader.event_categories().is_empty());
    assert!(reader.event_kinds().is_empty());

    // 导入和导出都不受影响
    let raw = reader.export(&ExportOptions::default()).unwrap();
    assert!(raw.annotations.is_empty());
    assert_eq!(raw.n_channels(), 5);
}

#[test]
fn test_missing_event_table_yields_failure() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("EEGStudyDB.mdb");
    let image = profusion::doctest_utils::JetBuilder::new()
        .table(profusion::doctest_utils::TestTable::new("Unrelated"))
        .build()
        .unwrap();
    fs::write(&path, image).unwrap();

    match parse_event_database(&path) {
        Err(ProfusionError::OptionalComponentFailure { component, reason }) => {
            assert_eq!(component, "event database");
            assert!(reason.contains("EEGEvent"));
        }
        other => panic!("expected OptionalComponentFailure, got {:?}", other),
    }
}

#[test]
fn test_category_filter() {
    let (_dir, mut reader) = open_bundle(&BundleBuilder::new());

    let raw = reader
        .export(&ExportOptions {
            events: EventSelection::Categories(vec![2]),
            ..ExportOptions::default()
        })
        .unwrap();
    assert_eq!(raw.annotations.len(), 1);
    assert_eq!(raw.annotations[0].description, "Artifact");
    assert!((raw.annotations[0].onset - 4.794967296).abs() < 1e-9);
    assert!((raw.annotations[0].duration - 0.25).abs() < 1e-12);

    let none = reader
        .export(&ExportOptions {
            events: EventSelection::None,
            ..ExportOptions::default()
        })
        .unwrap();
    assert!(none.annotations.is_empty());

    let db = reader.event_database().loaded().unwrap();
    assert_eq!(db.events_in_categories(&[1]).count(), 2);
    assert_eq!(db.category(1).map(|c| c.category_name.as_str()), Some("Clinical"));
}

#[test]
fn test_only_end_events() {
    let events = vec![
        TestEvent::new(1, 1, "Spike", 1_000, 0).end_marker(),
        TestEvent::new(2, 1, "Spike", 2_000, 0).end_marker(),
    ];
    let (_dir, path) = write_database(&events);
    let db = parse_event_database(&path).unwrap();

    assert!(db.events.is_empty());
    assert!(db.kinds.is_empty());
    assert_eq!(db.categories.len(), 2);
}

#[test]
fn test_events_spanning_several_pages() {
    let events: Vec<TestEvent> = (0..300)
        .map(|i| {
            TestEvent::new(
                i,
                1 + i % 2,
                &format!("Kind {}", i % 7),
                i as i64 * 1_000_000_000,
                500_000_000,
            )
        })
        .collect();
    let (_dir, path) = write_database(&events);

    let db = parse_event_database(&path).unwrap();
    assert_eq!(db.events.len(), 300);
    assert_eq!(db.kinds.len(), 7);
    for (i, event) in db.events.iter().enumerate() {
        assert_eq!(event.event_id, i as i64);
        assert_eq!(event.event_kind_id, i % 7);
        assert!((event.start_sec - i as f64).abs() < 1e-9);
    }
}

#[test]
fn test_raw_table_access() {
    let (_dir, path) = write_database(&[TestEvent::new(7, 2, "Sleep spindle", 3_000_000_000, 0)]);
    let db = JetDatabase::open(&path).unwrap();

    let mut names = db.table_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["EEGEvent".to_string(), "EEGEventCategory".to_string()]);

    let table = db.read_table("EEGEvent").unwrap();
    assert_eq!(table.len(), 1);
    assert_eq!(table.get(0, "EventString").and_then(Value::as_str), Some("Sleep spindle"));
    assert_eq!(table.get(0, "IsEndEvent"), Some(&Value::Bool(false)));
    match table.get(0, "CreatedAt") {
        Some(Value::DateTime(created)) => assert_eq!(created.to_string(), "2023-05-04 09:30:00"),
        other => panic!("expected a timestamp, got {:?}", other),
    }

    let categories = db.read_table("EEGEventCategory").unwrap();
    assert_eq!(
        categories.get(0, "Description").and_then(Value::as_str),
        Some("Reviewer marks")
    );
}
