// Internal utilities for documentation tests
// This file contains helper functions to generate synthetic export bundles for doctests

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::jet::{
    ColumnType, JetError, JetResult, Value, CATALOG_PAGE, COLUMN_ENTRY_SIZE, COLUMN_FIXED, COLUMN_NULLABLE,
    JET4_PAGE_SIZE, PAGE_DATA, PAGE_TABLE_DEF, TDEF_COLUMNS_START, TDEF_NUM_COLS, TDEF_NUM_ROWS,
    TDEF_NUM_VAR_COLS,
};
use crate::error::ProfusionError;
use crate::{Result, PAYLOAD_FILE_HEADER_SIZE, SEGMENT_FRAMING_SIZE, SEGMENT_HEADER_SIZE};

/// One segment to write into a synthetic payload file
#[derive(Debug, Clone, PartialEq)]
pub struct TestSegment {
    pub first_sample: i64,
    /// `channels[c][s]`
    pub channels: Vec<Vec<f32>>,
}

impl TestSegment {
    /// Sample `s` of channel `c` is `base + c * n_samples + s`
    pub fn ramp(first_sample: i64, n_channels: usize, n_samples: usize, base: f32) -> Self {
        let channels = (0..n_channels)
            .map(|c| {
                (0..n_samples)
                    .map(|s| base + (c * n_samples + s) as f32)
                    .collect()
            })
            .collect();
        TestSegment {
            first_sample,
            channels,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }
}

/// Encodes a payload (`.rda`) file image
pub fn payload_file_bytes(
    segments: &[TestSegment],
    n_channels: usize,
    sealed: bool,
    pending_deletes: i32,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.push(sealed as u8);
    bytes.extend_from_slice(&pending_deletes.to_le_bytes());
    bytes.resize(PAYLOAD_FILE_HEADER_SIZE as usize, 0);

    for segment in segments {
        let n_samples = segment.n_samples();
        bytes.extend_from_slice(&(-1i64).to_le_bytes());
        bytes.extend_from_slice(&segment.first_sample.to_le_bytes());
        bytes.extend_from_slice(&(n_samples as i64).to_le_bytes());
        bytes.push(1);
        bytes.resize(bytes.len() + (SEGMENT_FRAMING_SIZE - SEGMENT_HEADER_SIZE) as usize, 0);

        // 按采样点优先写入
        for s in 0..n_samples {
            for c in 0..n_channels {
                let value = segment.channels.get(c).and_then(|ch| ch.get(s)).copied().unwrap_or(0.0);
                bytes.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    bytes
}

/// Study header (`.sdy`) document
pub fn study_header_xml(ch_names: &[String], sampling_freq: f64) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<StudyDetails>\n");
    xml.push_str(&format!(
        "  <Study name=\"Doc Study\" eeg_sample_rate=\"{}\">\n    <Channels>\n",
        sampling_freq
    ));
    for (idx, name) in ch_names.iter().enumerate() {
        xml.push_str(&format!("      <Channel index=\"{}\" name=\"{}\"/>\n", idx, name));
    }
    xml.push_str("    </Channels>\n  </Study>\n</StudyDetails>\n");
    xml
}

/// Segment header (`EEGData.ini`) text
pub fn segment_header_ini(max_samples_per_file: i64, n_channels: usize) -> String {
    format!(
        "[EEGData]\nVersion = 3\nIntegral space size in samples = {}\nNumber of Channels = {}\n",
        max_samples_per_file, n_channels
    )
}

/// Electrode placement document
pub fn placement_xml(electrodes: &[(String, f64, f64)]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<ElectrodePlacement>\n  <Electrodes>\n");
    for (label, x, y) in electrodes {
        xml.push_str(&format!(
            "    <Electrode>\n      <Label>{}</Label>\n      <XCoordinate>{}</XCoordinate>\n      <YCoordinate>{}</YCoordinate>\n    </Electrode>\n",
            label, x, y
        ));
    }
    xml.push_str("  </Electrodes>\n</ElectrodePlacement>\n");
    xml
}

/// A table to write into a synthetic Jet 4 database
#[derive(Debug, Clone, PartialEq)]
pub struct TestTable {
    pub name: String,
    pub columns: Vec<(String, ColumnType)>,
    pub rows: Vec<Vec<Value>>,
}

impl TestTable {
    pub fn new(name: &str) -> Self {
        TestTable {
            name: name.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, col_type: ColumnType) -> Self {
        self.columns.push((name.to_string(), col_type));
        self
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }
}

/// Column as laid out by the builder
struct ColumnLayout {
    col_type: ColumnType,
    var_index: Option<u16>,
    fixed_offset: u16,
}

fn layout(columns: &[(String, ColumnType)]) -> (Vec<ColumnLayout>, usize, u16) {
    let mut fixed_len = 0usize;
    let mut num_var = 0u16;
    let layouts = columns
        .iter()
        .map(|(_, col_type)| match col_type.fixed_size() {
            Some(size) => {
                let column = ColumnLayout {
                    col_type: *col_type,
                    var_index: None,
                    fixed_offset: fixed_len as u16,
                };
                fixed_len += size;
                column
            }
            None => {
                let column = ColumnLayout {
                    col_type: *col_type,
                    var_index: Some(num_var),
                    fixed_offset: 0,
                };
                num_var += 1;
                column
            }
        })
        .collect();
    (layouts, fixed_len, num_var)
}

fn encode_text(text: &str) -> Vec<u8> {
    // 全部为单字节字符时使用压缩格式
    if text.chars().all(|c| (1..=255).contains(&(c as u32))) {
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(text.chars().map(|c| c as u32 as u8));
        bytes
    } else {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }
}

fn encode_fixed(col_type: ColumnType, value: &Value) -> Vec<u8> {
    let int = value.as_i64().unwrap_or(0);
    let float = match value {
        Value::Float(v) => *v as f64,
        Value::Double(v) => *v,
        other => other.as_i64().unwrap_or(0) as f64,
    };
    match col_type {
        ColumnType::Byte => vec![int as u8],
        ColumnType::Int => (int as i16).to_le_bytes().to_vec(),
        ColumnType::Long => (int as i32).to_le_bytes().to_vec(),
        ColumnType::Money => int.to_le_bytes().to_vec(),
        ColumnType::Float => (float as f32).to_le_bytes().to_vec(),
        ColumnType::Double => float.to_le_bytes().to_vec(),
        ColumnType::DateTime => {
            let days = match (value, NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))) {
                (Value::DateTime(dt), Some(epoch)) => (*dt - epoch).num_milliseconds() as f64 / 86_400_000.0,
                _ => float,
            };
            days.to_le_bytes().to_vec()
        }
        other => {
            let size = other.fixed_size().unwrap_or(0);
            let mut bytes = match value {
                Value::Binary(b) => b.clone(),
                _ => Vec::new(),
            };
            bytes.resize(size, 0);
            bytes
        }
    }
}

fn encode_variable(col_type: ColumnType, value: &Value) -> Vec<u8> {
    let payload = match value {
        Value::Text(s) => encode_text(s),
        Value::Binary(b) => b.clone(),
        _ => Vec::new(),
    };
    match col_type {
        ColumnType::Memo | ColumnType::Ole => {
            // 内联长值：长度 | 0x80000000，随后 8 字节保留
            let mut bytes = ((payload.len() as u32) | 0x8000_0000).to_le_bytes().to_vec();
            bytes.extend_from_slice(&[0u8; 8]);
            bytes.extend_from_slice(&payload);
            bytes
        }
        _ => payload,
    }
}

fn encode_row(columns: &[ColumnLayout], fixed_len: usize, num_var: u16, values: &[Value]) -> Vec<u8> {
    let num_cols = columns.len();
    let mut row = (num_cols as u16).to_le_bytes().to_vec();
    row.resize(2 + fixed_len, 0);

    let mut bitmap = vec![0u8; (num_cols + 7) / 8];
    let mut var_offsets = vec![0u16; num_var as usize + 1];
    let mut var_data: Vec<Vec<u8>> = vec![Vec::new(); num_var as usize];

    for (col_num, (column, value)) in columns.iter().zip(values).enumerate() {
        let present = match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            _ => true,
        };
        if present {
            bitmap[col_num / 8] |= 1 << (col_num % 8);
        }
        if !present || column.col_type == ColumnType::Bool {
            continue;
        }

        match column.var_index {
            None => {
                let start = 2 + column.fixed_offset as usize;
                let bytes = encode_fixed(column.col_type, value);
                row[start..start + bytes.len()].copy_from_slice(&bytes);
            }
            Some(idx) => var_data[idx as usize] = encode_variable(column.col_type, value),
        }
    }

    if num_var > 0 {
        for (idx, data) in var_data.iter().enumerate() {
            var_offsets[idx] = row.len() as u16;
            row.extend_from_slice(data);
        }
        var_offsets[num_var as usize] = row.len() as u16;
        for offset in var_offsets.iter().rev() {
            row.extend_from_slice(&offset.to_le_bytes());
        }
        row.extend_from_slice(&num_var.to_le_bytes());
    }
    row.extend_from_slice(&bitmap);
    row
}

fn table_def_page(table: &TestTable, num_rows: usize) -> Vec<u8> {
    let (columns, _, num_var) = layout(&table.columns);
    let mut page = vec![0u8; JET4_PAGE_SIZE];
    page[0] = PAGE_TABLE_DEF;
    page[1] = 0x01;
    page[TDEF_NUM_ROWS..TDEF_NUM_ROWS + 4].copy_from_slice(&(num_rows as u32).to_le_bytes());
    page[0x28] = 0x4E;
    page[41..43].copy_from_slice(&(columns.len() as u16).to_le_bytes());
    page[TDEF_NUM_VAR_COLS..TDEF_NUM_VAR_COLS + 2].copy_from_slice(&num_var.to_le_bytes());
    page[TDEF_NUM_COLS..TDEF_NUM_COLS + 2].copy_from_slice(&(columns.len() as u16).to_le_bytes());

    let mut pos = TDEF_COLUMNS_START;
    for (col_num, column) in columns.iter().enumerate() {
        let entry = &mut page[pos..pos + COLUMN_ENTRY_SIZE];
        entry[0] = column.col_type.code();
        entry[5..7].copy_from_slice(&(col_num as u16).to_le_bytes());
        entry[7..9].copy_from_slice(&column.var_index.unwrap_or(0).to_le_bytes());
        entry[9..11].copy_from_slice(&(col_num as u16).to_le_bytes());
        entry[15] = if column.var_index.is_none() { COLUMN_FIXED | COLUMN_NULLABLE } else { COLUMN_NULLABLE };
        entry[21..23].copy_from_slice(&column.fixed_offset.to_le_bytes());
        let length = column.col_type.fixed_size().unwrap_or(255) as u16;
        entry[23..25].copy_from_slice(&length.to_le_bytes());
        pos += COLUMN_ENTRY_SIZE;
    }

    for (name, _) in &table.columns {
        let encoded: Vec<u8> = name.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        page[pos..pos + 2].copy_from_slice(&(encoded.len() as u16).to_le_bytes());
        page[pos + 2..pos + 2 + encoded.len()].copy_from_slice(&encoded);
        pos += 2 + encoded.len();
    }
    page[8..12].copy_from_slice(&(pos as u32).to_le_bytes());
    page
}

fn data_page(tdef_page: u32, rows: &[Vec<u8>]) -> Vec<u8> {
    let mut page = vec![0u8; JET4_PAGE_SIZE];
    page[0] = PAGE_DATA;
    page[1] = 0x01;
    page[4..8].copy_from_slice(&tdef_page.to_le_bytes());
    page[12..14].copy_from_slice(&(rows.len() as u16).to_le_bytes());

    // 行数据从页尾向前排列
    let mut end = JET4_PAGE_SIZE;
    for (idx, row) in rows.iter().enumerate() {
        let start = end - row.len();
        page[start..end].copy_from_slice(row);
        page[14 + idx * 2..16 + idx * 2].copy_from_slice(&(start as u16).to_le_bytes());
        end = start;
    }
    let free = end - (14 + rows.len() * 2);
    page[2..4].copy_from_slice(&(free as u16).to_le_bytes());
    page
}

/// Splits encoded rows into groups that fit on one data page each
fn paginate(rows: Vec<Vec<u8>>) -> JetResult<Vec<Vec<Vec<u8>>>> {
    let mut pages: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
    let mut used = 14;
    for row in rows {
        if row.len() + 16 >= JET4_PAGE_SIZE {
            return Err(JetError::Corrupt(format!("row of {} bytes does not fit a page", row.len())));
        }
        if used + row.len() + 2 > JET4_PAGE_SIZE {
            pages.push(Vec::new());
            used = 14;
        }
        used += row.len() + 2;
        if let Some(page) = pages.last_mut() {
            page.push(row);
        }
    }
    Ok(pages)
}

fn encoded_rows(table: &TestTable) -> Vec<Vec<u8>> {
    let (columns, fixed_len, num_var) = layout(&table.columns);
    table.rows
        .iter()
        .map(|values| encode_row(&columns, fixed_len, num_var, values))
        .collect()
}

/// Builds Jet 4 database images the decoder can read back
///
/// Page 0 carries the signature, page 1 is blank, pages 2 and 3 hold the
/// `MSysObjects` catalog, and each table gets a definition page followed by
/// its data pages.
#[derive(Debug, Clone, Default)]
pub struct JetBuilder {
    tables: Vec<TestTable>,
}

impl JetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: TestTable) -> Self {
        self.tables.push(table);
        self
    }

    /// # Errors
    ///
    /// * `JetError::Corrupt` - a row is too large for one data page
    pub fn build(&self) -> JetResult<Vec<u8>> {
        let mut next_page = CATALOG_PAGE + 2;
        let mut table_pages = Vec::new();
        let mut catalog = TestTable::new("MSysObjects")
            .column("Id", ColumnType::Long)
            .column("Name", ColumnType::Text)
            .column("Type", ColumnType::Int)
            .row(vec![
                Value::Long(CATALOG_PAGE as i32),
                Value::Text("MSysObjects".into()),
                Value::Int(1),
            ]);

        for table in &self.tables {
            let tdef_page = next_page;
            let pages = paginate(encoded_rows(table))?;
            next_page += 1 + pages.len() as u32;
            catalog = catalog.row(vec![
                Value::Long(tdef_page as i32),
                Value::Text(table.name.clone()),
                Value::Int(1),
            ]);
            table_pages.push((table_def_page(table, table.rows.len()), tdef_page, pages));
        }

        let mut image = vec![0u8; JET4_PAGE_SIZE * 2];
        image[1] = 0x01;
        image[4..19].copy_from_slice(b"Standard Jet DB");
        image[0x14] = 0x01;

        image.extend(table_def_page(&catalog, catalog.rows.len()));
        image.extend(data_page(CATALOG_PAGE, &encoded_rows(&catalog)));
        for (tdef, tdef_page, pages) in table_pages {
            image.extend(tdef);
            for rows in pages {
                image.extend(data_page(tdef_page, &rows));
            }
        }
        Ok(image)
    }
}

/// One row of the synthetic event table, times in nanoseconds
#[derive(Debug, Clone, PartialEq)]
pub struct TestEvent {
    pub event_id: i32,
    pub category_id: i32,
    pub is_end: bool,
    pub name: String,
    pub start_ns: i64,
    pub duration_ns: i64,
}

impl TestEvent {
    pub fn new(event_id: i32, category_id: i32, name: &str, start_ns: i64, duration_ns: i64) -> Self {
        TestEvent {
            event_id,
            category_id,
            is_end: false,
            name: name.to_string(),
            start_ns,
            duration_ns,
        }
    }

    pub fn end_marker(mut self) -> Self {
        self.is_end = true;
        self
    }
}

fn split_hi_lo(nanos: i64) -> (Value, Value) {
    (
        Value::Long((nanos >> 32) as i32),
        Value::Long((nanos & 0xFFFF_FFFF) as u32 as i32),
    )
}

/// Event database image holding `EEGEvent` and `EEGEventCategory`
pub fn event_database_bytes(events: &[TestEvent], categories: &[(i32, String, String)]) -> JetResult<Vec<u8>> {
    let created = NaiveDate::from_ymd_opt(2023, 5, 4)
        .and_then(|d| d.and_hms_opt(9, 30, 0))
        .map(Value::DateTime)
        .unwrap_or(Value::Null);

    let mut event_table = TestTable::new("EEGEvent")
        .column("EventID", ColumnType::Long)
        .column("EventTypeID", ColumnType::Long)
        .column("EventCategoryID", ColumnType::Long)
        .column("IsEndEvent", ColumnType::Bool)
        .column("EventString", ColumnType::Text)
        .column("StartSecondHi", ColumnType::Long)
        .column("StartSecondLo", ColumnType::Long)
        .column("DurationHi", ColumnType::Long)
        .column("DurationLo", ColumnType::Long)
        .column("CreatedAt", ColumnType::DateTime);
    for event in events {
        let (start_hi, start_lo) = split_hi_lo(event.start_ns);
        let (duration_hi, duration_lo) = split_hi_lo(event.duration_ns);
        event_table = event_table.row(vec![
            Value::Long(event.event_id),
            Value::Long(100 + event.category_id),
            Value::Long(event.category_id),
            Value::Bool(event.is_end),
            Value::Text(event.name.clone()),
            start_hi,
            start_lo,
            duration_hi,
            duration_lo,
            created.clone(),
        ]);
    }

    let mut category_table = TestTable::new("EEGEventCategory")
        .column("EventCategoryID", ColumnType::Long)
        .column("Name", ColumnType::Text)
        .column("Description", ColumnType::Memo);
    for (id, name, desc) in categories {
        category_table = category_table.row(vec![
            Value::Long(*id),
            Value::Text(name.clone()),
            Value::Text(desc.clone()),
        ]);
    }

    JetBuilder::new().table(event_table).table(category_table).build()
}

/// Writes a complete synthetic bundle
///
/// The defaults describe five channels at 256 Hz in two payload files with
/// one acquisition gap, one placement document and an event database.
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    pub ch_names: Vec<String>,
    pub sampling_freq: f64,
    pub max_samples_per_file: i64,
    /// Overrides the channel count written to the segment header
    pub segment_header_channels: Option<usize>,
    pub payload_files: Vec<Vec<TestSegment>>,
    pub placements: Vec<(String, Vec<(String, f64, f64)>)>,
    /// `None` leaves the event database out
    pub events: Option<Vec<TestEvent>>,
    pub categories: Vec<(i32, String, String)>,
    pub corrupt_event_database: bool,
}

impl Default for BundleBuilder {
    fn default() -> Self {
        let ch_names: Vec<String> = ["Fp1", "Fp2", "C3", "C4", "EMG1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let n = ch_names.len();
        let electrode = |label: &str, x: f64, y: f64| (label.to_string(), x, y);

        BundleBuilder {
            ch_names,
            sampling_freq: 256.0,
            max_samples_per_file: 1024,
            segment_header_channels: None,
            payload_files: vec![
                vec![
                    TestSegment::ramp(0, n, 256, 0.0),
                    TestSegment::ramp(512, n, 128, 10_000.0),
                ],
                vec![TestSegment::ramp(640, n, 64, 20_000.0)],
            ],
            placements: vec![(
                "Standard.xml".to_string(),
                vec![
                    electrode("Fp1", -30.0, 90.0),
                    electrode("Fp2", 30.0, 90.0),
                    electrode("C3", -70.0, 0.0),
                    electrode("C4", 70.0, 0.0),
                    electrode("Cz", 0.0, 0.0),
                    electrode("Trigger", 0.0, -120.0),
                ],
            )],
            events: Some(vec![
                TestEvent::new(1, 1, "Spike", 1_500_000_000, 100_000_000),
                TestEvent::new(2, 1, "Spike", 1_600_000_000, 0).end_marker(),
                TestEvent::new(3, 2, "Artifact", (1i64 << 32) + 500_000_000, 250_000_000),
                TestEvent::new(4, 1, "Spike", 2_000_000_000, 0),
            ]),
            categories: vec![
                (1, "Clinical".to_string(), "Reviewer marks".to_string()),
                (2, "Technical".to_string(), "Recording artifacts".to_string()),
            ],
            corrupt_event_database: false,
        }
    }
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the bundle into `root` (created if needed) and returns `root`
    pub fn write<P: AsRef<Path>>(&self, root: P) -> Result<PathBuf> {
        let root = root.as_ref().to_path_buf();
        let data_root = root.join("EEGData");
        fs::create_dir_all(&data_root)?;

        fs::write(root.join("Study01.sdy"), study_header_xml(&self.ch_names, self.sampling_freq))?;
        let n_channels = self.segment_header_channels.unwrap_or(self.ch_names.len());
        fs::write(
            data_root.join("EEGData.ini"),
            segment_header_ini(self.max_samples_per_file, n_channels),
        )?;

        for (idx, segments) in self.payload_files.iter().enumerate() {
            fs::write(
                data_root.join(format!("{:04}.rda", idx + 1)),
                payload_file_bytes(segments, n_channels, idx + 1 < self.payload_files.len(), 0),
            )?;
        }

        if !self.placements.is_empty() {
            let placement_dir = root.join("ElectrodePlacements");
            fs::create_dir_all(&placement_dir)?;
            for (name, electrodes) in &self.placements {
                fs::write(placement_dir.join(name), placement_xml(electrodes))?;
            }
        }

        if self.corrupt_event_database {
            fs::write(root.join("EEGStudyDB.mdb"), b"\x00\x01\x00\x00Standard Jet DB but truncated")?;
        } else if let Some(events) = &self.events {
            let image = event_database_bytes(events, &self.categories)
                .map_err(|e| ProfusionError::optional("event database", e))?;
            fs::write(root.join("EEGStudyDB.mdb"), image)?;
        }

        Ok(root)
    }
}

/// Creates the default test bundle at `path` for documentation examples
pub fn create_test_bundle<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    BundleBuilder::new().write(path)
}
