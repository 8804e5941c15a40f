//! Read-only access to Jet 4 (Access 2000 and later) database files
//!
//! Only what the event database needs is implemented: the system catalog,
//! table definitions, data pages and the Jet 4 row layout. Indexes, usage
//! maps, writing and encryption are out of reach on purpose: a table is
//! read by scanning every data page that belongs to it.

use std::fs;
use std::io;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Page size of Jet 4 and later databases
pub const JET4_PAGE_SIZE: usize = 4096;

pub(crate) const PAGE_DATA: u8 = 0x01;
pub(crate) const PAGE_TABLE_DEF: u8 = 0x02;
/// Table definition of `MSysObjects`
pub(crate) const CATALOG_PAGE: u32 = 2;

pub(crate) const ROW_OFFSET_MASK: u16 = 0x1FFF;
pub(crate) const ROW_DELETED: u16 = 0x8000;
pub(crate) const ROW_OVERFLOW: u16 = 0x4000;

/// Column flag: stored in the fixed-length area
pub(crate) const COLUMN_FIXED: u8 = 0x01;
/// Column flag: may be null
pub(crate) const COLUMN_NULLABLE: u8 = 0x02;

// 表定义页中的偏移量（Jet 4）
pub(crate) const TDEF_NUM_ROWS: usize = 16;
pub(crate) const TDEF_NUM_VAR_COLS: usize = 43;
pub(crate) const TDEF_NUM_COLS: usize = 45;
pub(crate) const TDEF_NUM_REAL_IDX: usize = 51;
pub(crate) const TDEF_COLUMNS_START: usize = 63;
pub(crate) const TDEF_REAL_IDX_ENTRY: usize = 12;
pub(crate) const COLUMN_ENTRY_SIZE: usize = 25;

const OBJECT_TYPE_TABLE: i64 = 1;
const SIGNATURES: [&[u8]; 2] = [b"Standard Jet DB", b"Standard ACE DB"];
const LVAL_INLINE: u32 = 0x8000_0000;
const LVAL_SINGLE_PAGE: u32 = 0x4000_0000;
const LVAL_LENGTH_MASK: u32 = 0x3FFF_FFFF;

#[derive(Debug, Error)]
pub enum JetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Not a Jet database: {0}")]
    NotJet(String),

    #[error("Unsupported Jet version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Page {0} out of range")]
    PageOutOfRange(u32),

    #[error("Page {page} is not a {expected} page")]
    UnexpectedPage { page: u32, expected: &'static str },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Corrupt database: {0}")]
    Corrupt(String),
}

pub type JetResult<T> = std::result::Result<T, JetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Byte,
    Int,
    Long,
    Money,
    Float,
    Double,
    DateTime,
    Binary,
    Text,
    Ole,
    Memo,
    Guid,
    Numeric,
    Unknown(u8),
}

impl ColumnType {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ColumnType::Bool,
            0x02 => ColumnType::Byte,
            0x03 => ColumnType::Int,
            0x04 => ColumnType::Long,
            0x05 => ColumnType::Money,
            0x06 => ColumnType::Float,
            0x07 => ColumnType::Double,
            0x08 => ColumnType::DateTime,
            0x09 => ColumnType::Binary,
            0x0A => ColumnType::Text,
            0x0B => ColumnType::Ole,
            0x0C => ColumnType::Memo,
            0x0F => ColumnType::Guid,
            0x10 => ColumnType::Numeric,
            other => ColumnType::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ColumnType::Bool => 0x01,
            ColumnType::Byte => 0x02,
            ColumnType::Int => 0x03,
            ColumnType::Long => 0x04,
            ColumnType::Money => 0x05,
            ColumnType::Float => 0x06,
            ColumnType::Double => 0x07,
            ColumnType::DateTime => 0x08,
            ColumnType::Binary => 0x09,
            ColumnType::Text => 0x0A,
            ColumnType::Ole => 0x0B,
            ColumnType::Memo => 0x0C,
            ColumnType::Guid => 0x0F,
            ColumnType::Numeric => 0x10,
            ColumnType::Unknown(code) => code,
        }
    }

    /// Bytes taken in the fixed-length area, `None` for variable columns.
    /// Booleans live in the null bitmap and take no space.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ColumnType::Bool => Some(0),
            ColumnType::Byte => Some(1),
            ColumnType::Int => Some(2),
            ColumnType::Long | ColumnType::Float => Some(4),
            ColumnType::Money | ColumnType::Double | ColumnType::DateTime => Some(8),
            ColumnType::Guid => Some(16),
            ColumnType::Numeric => Some(17),
            _ => None,
        }
    }
}

/// A decoded cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i16),
    Long(i32),
    /// Currency scaled by 10 000
    Money(i64),
    Float(f32),
    Double(f64),
    DateTime(NaiveDateTime),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of any integral cell (booleans count as 0/1)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(*b as i64),
            Value::Byte(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v as i64),
            Value::Money(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        self.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            other => other.as_i64().map(|v| v != 0),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub col_type: ColumnType,
    /// Position in the row null bitmap
    pub col_num: u16,
    /// Slot in the variable-offset table (variable columns only)
    pub var_index: u16,
    /// Offset inside the fixed-length area (fixed columns only)
    pub fixed_offset: u16,
    pub length: u16,
    pub flags: u8,
}

impl Column {
    pub fn is_fixed(&self) -> bool {
        self.flags & COLUMN_FIXED != 0
    }
}

/// A fully read table
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    /// Cells follow `columns` order
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell of `row` in the named column
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row)?.get(col)
    }
}

/// Anything that can hand out whole tables by name
pub trait TableSource {
    fn read_table(&mut self, name: &str) -> JetResult<Table>;
}

impl TableSource for Vec<Table> {
    fn read_table(&mut self, name: &str) -> JetResult<Table> {
        self.iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
            .cloned()
            .ok_or_else(|| JetError::TableNotFound(name.to_string()))
    }
}

struct TableDef {
    num_rows: u32,
    num_var_cols: u16,
    columns: Vec<Column>,
}

/// An in-memory Jet 4 database image
#[derive(Debug, Clone)]
pub struct JetDatabase {
    data: Vec<u8>,
    version: u8,
}

impl JetDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> JetResult<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(data)
    }

    /// Validates the page-0 signature and version
    ///
    /// # Errors
    ///
    /// * `JetError::NotJet` - too short or wrong signature
    /// * `JetError::UnsupportedVersion` - Jet 3 (Access 97) files
    pub fn from_bytes(data: Vec<u8>) -> JetResult<Self> {
        if data.len() < JET4_PAGE_SIZE {
            return Err(JetError::NotJet(format!("{} bytes is shorter than one page", data.len())));
        }
        let signature = &data[4..19];
        if data[0] != 0x00 || !SIGNATURES.iter().any(|s| *s == signature) {
            return Err(JetError::NotJet("missing database signature".to_string()));
        }
        let version = data[0x14];
        if version == 0 {
            return Err(JetError::UnsupportedVersion(version));
        }
        log::debug!("Jet database version {:#04x}, {} page(s)", version, data.len() / JET4_PAGE_SIZE);

        Ok(JetDatabase { data, version })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn page_count(&self) -> u32 {
        (self.data.len() / JET4_PAGE_SIZE) as u32
    }

    fn page(&self, page: u32) -> JetResult<&[u8]> {
        let start = page as usize * JET4_PAGE_SIZE;
        self.data
            .get(start..start + JET4_PAGE_SIZE)
            .ok_or(JetError::PageOutOfRange(page))
    }

    /// Names of all user tables
    pub fn table_names(&self) -> JetResult<Vec<String>> {
        Ok(self
            .catalog()?
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !name.starts_with("MSys"))
            .collect())
    }

    /// Reads a whole table; names compare case-insensitively like Access does
    pub fn read_table(&self, name: &str) -> JetResult<Table> {
        let tdef_page = self
            .catalog()?
            .into_iter()
            .find(|(table, _)| table.eq_ignore_ascii_case(name))
            .map(|(_, page)| page)
            .ok_or_else(|| JetError::TableNotFound(name.to_string()))?;

        let def = self.read_table_def(tdef_page)?;
        let rows = self.read_rows(tdef_page, &def)?;
        if rows.len() != def.num_rows as usize {
            log::debug!(
                "Table {} declares {} row(s), {} found on data pages",
                name,
                def.num_rows,
                rows.len()
            );
        }

        Ok(Table {
            name: name.to_string(),
            columns: def.columns,
            rows,
        })
    }

    /// `(table name, definition page)` for every table object in `MSysObjects`
    fn catalog(&self) -> JetResult<Vec<(String, u32)>> {
        let def = self.read_table_def(CATALOG_PAGE)?;
        let column = |name: &str| {
            def.columns
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| JetError::Corrupt(format!("catalog has no {} column", name)))
        };
        let id_col = column("Id")?;
        let name_col = column("Name")?;
        let type_col = column("Type")?;

        let mut tables = Vec::new();
        for row in self.read_rows(CATALOG_PAGE, &def)? {
            let object_type = row[type_col].as_i64().unwrap_or(0) & 0x7FFF;
            if object_type != OBJECT_TYPE_TABLE {
                continue;
            }
            if let (Some(id), Some(name)) = (row[id_col].as_i64(), row[name_col].as_str()) {
                tables.push((name.to_string(), (id & 0x00FF_FFFF) as u32));
            }
        }
        Ok(tables)
    }

    /// 读取表定义，可能跨越多页
    fn table_def_bytes(&self, page: u32) -> JetResult<Vec<u8>> {
        let first = self.page(page)?;
        if first[0] != PAGE_TABLE_DEF {
            return Err(JetError::UnexpectedPage { page, expected: "table definition" });
        }

        let mut buf = first.to_vec();
        let mut next = LittleEndian::read_u32(&first[4..8]);
        let mut hops = 0;
        while next != 0 {
            hops += 1;
            if hops > self.page_count() {
                return Err(JetError::Corrupt(format!("table definition chain from page {} loops", page)));
            }
            let cont = self.page(next)?;
            if cont[0] != PAGE_TABLE_DEF {
                return Err(JetError::UnexpectedPage { page: next, expected: "table definition" });
            }
            buf.extend_from_slice(&cont[8..]);
            next = LittleEndian::read_u32(&cont[4..8]);
        }
        Ok(buf)
    }

    fn read_table_def(&self, page: u32) -> JetResult<TableDef> {
        let buf = self.table_def_bytes(page)?;

        let num_rows = read_u32(&buf, TDEF_NUM_ROWS)?;
        let num_var_cols = read_u16(&buf, TDEF_NUM_VAR_COLS)?;
        let num_cols = read_u16(&buf, TDEF_NUM_COLS)? as usize;
        let num_real_idx = read_u32(&buf, TDEF_NUM_REAL_IDX)? as usize;

        let cols_start = TDEF_COLUMNS_START + num_real_idx * TDEF_REAL_IDX_ENTRY;
        let mut columns = Vec::with_capacity(num_cols);
        for i in 0..num_cols {
            let base = cols_start + i * COLUMN_ENTRY_SIZE;
            let entry = slice(&buf, base, COLUMN_ENTRY_SIZE)?;
            columns.push(Column {
                name: String::new(),
                col_type: ColumnType::from_code(entry[0]),
                col_num: LittleEndian::read_u16(&entry[5..7]),
                var_index: LittleEndian::read_u16(&entry[7..9]),
                flags: entry[15],
                fixed_offset: LittleEndian::read_u16(&entry[21..23]),
                length: LittleEndian::read_u16(&entry[23..25]),
            });
        }

        let mut pos = cols_start + num_cols * COLUMN_ENTRY_SIZE;
        for column in columns.iter_mut() {
            let len = read_u16(&buf, pos)? as usize;
            column.name = decode_text(slice(&buf, pos + 2, len)?);
            pos += 2 + len;
        }

        columns.sort_by_key(|c| c.col_num);
        Ok(TableDef {
            num_rows,
            num_var_cols,
            columns,
        })
    }

    /// Bytes of one row slot and its raw offset word
    fn row_slot(&self, page_no: u32, row: usize) -> JetResult<(&[u8], u16)> {
        let page = self.page(page_no)?;
        let num_rows = LittleEndian::read_u16(&page[12..14]) as usize;
        if row >= num_rows {
            return Err(JetError::Corrupt(format!("row {} beyond {} on page {}", row, num_rows, page_no)));
        }

        let raw = read_u16(page, 14 + row * 2)?;
        let start = (raw & ROW_OFFSET_MASK) as usize;
        let end = if row == 0 {
            JET4_PAGE_SIZE
        } else {
            (read_u16(page, 14 + (row - 1) * 2)? & ROW_OFFSET_MASK) as usize
        };
        if start > end || end > JET4_PAGE_SIZE {
            return Err(JetError::Corrupt(format!("row {} on page {} spans {}..{}", row, page_no, start, end)));
        }
        Ok((&page[start..end], raw))
    }

    /// Row bytes addressed by a `(page << 8) | row` pointer
    fn row_by_pointer(&self, pointer: u32) -> JetResult<&[u8]> {
        let (bytes, _) = self.row_slot(pointer >> 8, (pointer & 0xFF) as usize)?;
        Ok(bytes)
    }

    fn read_rows(&self, tdef_page: u32, def: &TableDef) -> JetResult<Vec<Vec<Value>>> {
        let mut rows = Vec::new();

        for page_no in 0..self.page_count() {
            let page = self.page(page_no)?;
            if page[0] != PAGE_DATA || LittleEndian::read_u32(&page[4..8]) != tdef_page {
                continue;
            }

            let num_rows = LittleEndian::read_u16(&page[12..14]) as usize;
            for row in 0..num_rows {
                let (bytes, raw) = self.row_slot(page_no, row)?;
                if raw & ROW_DELETED != 0 {
                    continue;
                }
                let bytes = if raw & ROW_OVERFLOW != 0 {
                    self.row_by_pointer(read_u32(bytes, 0)?)?
                } else {
                    bytes
                };
                rows.push(self.crack_row(def, bytes)?);
            }
        }

        Ok(rows)
    }

    /// Splits one Jet 4 row into cells
    ///
    /// ```text
    /// num_cols(2) fixed area | var data | eod(2) var offsets(2 each, reversed) var_count(2) | null bitmap
    /// ```
    fn crack_row(&self, def: &TableDef, row: &[u8]) -> JetResult<Vec<Value>> {
        let row_cols = read_u16(row, 0)? as usize;
        let bitmap_len = (row_cols + 7) / 8;
        if row.len() < 2 + bitmap_len {
            return Err(JetError::Corrupt(format!("{}-byte row cannot hold {} columns", row.len(), row_cols)));
        }
        let bitmap = &row[row.len() - bitmap_len..];

        let mut var_offsets = Vec::new();
        if def.num_var_cols > 0 {
            let count_pos = row
                .len()
                .checked_sub(bitmap_len + 2)
                .ok_or_else(|| JetError::Corrupt("row too short for variable columns".to_string()))?;
            let row_var_cols = read_u16(row, count_pos)? as usize;
            for i in 0..=row_var_cols {
                let pos = count_pos
                    .checked_sub(2 + i * 2)
                    .ok_or_else(|| JetError::Corrupt("variable offset table underflows row".to_string()))?;
                var_offsets.push(read_u16(row, pos)? as usize);
            }
        }

        let mut values = Vec::with_capacity(def.columns.len());
        for column in &def.columns {
            let bit = column.col_num as usize;
            let present = bit < row_cols
                && bitmap
                    .get(bit / 8)
                    .map(|byte| byte & (1 << (bit % 8)) != 0)
                    .unwrap_or(false);

            if column.col_type == ColumnType::Bool {
                values.push(Value::Bool(present));
                continue;
            }
            if !present {
                values.push(Value::Null);
                continue;
            }

            let value = if column.is_fixed() {
                let size = column.col_type.fixed_size().unwrap_or(column.length as usize);
                let field = slice(row, 2 + column.fixed_offset as usize, size)?;
                decode_fixed(column.col_type, field)
            } else {
                let idx = column.var_index as usize;
                if idx + 1 >= var_offsets.len() {
                    Value::Null
                } else {
                    let (start, end) = (var_offsets[idx], var_offsets[idx + 1]);
                    if start > end || end > row.len() {
                        return Err(JetError::Corrupt(format!(
                            "column {} spans {}..{} in a {}-byte row",
                            column.name,
                            start,
                            end,
                            row.len()
                        )));
                    }
                    self.decode_variable(column.col_type, &row[start..end])?
                }
            };
            values.push(value);
        }

        Ok(values)
    }

    fn decode_variable(&self, col_type: ColumnType, field: &[u8]) -> JetResult<Value> {
        Ok(match col_type {
            ColumnType::Text => Value::Text(decode_text(field)),
            ColumnType::Memo => Value::Text(decode_text(&self.read_long_value(field)?)),
            ColumnType::Ole => Value::Binary(self.read_long_value(field)?),
            _ => Value::Binary(field.to_vec()),
        })
    }

    /// Resolves a memo/OLE field: inline, one LVAL row, or a chain of LVAL rows
    fn read_long_value(&self, field: &[u8]) -> JetResult<Vec<u8>> {
        if field.is_empty() {
            return Ok(Vec::new());
        }
        let header = read_u32(field, 0)?;
        let len = (header & LVAL_LENGTH_MASK) as usize;

        if header & LVAL_INLINE != 0 {
            return Ok(slice(field, 12, len)?.to_vec());
        }

        let mut pointer = read_u32(field, 4)?;
        if header & LVAL_SINGLE_PAGE != 0 {
            let row = self.row_by_pointer(pointer)?;
            return Ok(slice(row, 0, len)?.to_vec());
        }

        let mut out = Vec::with_capacity(len);
        let mut hops = 0;
        while pointer != 0 && out.len() < len {
            hops += 1;
            if hops > self.page_count() as usize * 256 {
                return Err(JetError::Corrupt("long value chain loops".to_string()));
            }
            let row = self.row_by_pointer(pointer)?;
            pointer = read_u32(row, 0)?;
            out.extend_from_slice(&row[4..]);
        }
        if out.len() < len {
            return Err(JetError::Corrupt(format!("long value holds {} of {} bytes", out.len(), len)));
        }
        out.truncate(len);
        Ok(out)
    }
}

impl TableSource for JetDatabase {
    fn read_table(&mut self, name: &str) -> JetResult<Table> {
        JetDatabase::read_table(self, name)
    }
}

fn decode_fixed(col_type: ColumnType, field: &[u8]) -> Value {
    match col_type {
        ColumnType::Byte => Value::Byte(field[0]),
        ColumnType::Int => Value::Int(LittleEndian::read_i16(field)),
        ColumnType::Long => Value::Long(LittleEndian::read_i32(field)),
        ColumnType::Money => Value::Money(LittleEndian::read_i64(field)),
        ColumnType::Float => Value::Float(LittleEndian::read_f32(field)),
        ColumnType::Double => Value::Double(LittleEndian::read_f64(field)),
        ColumnType::DateTime => {
            let days = LittleEndian::read_f64(field);
            ole_date(days).map(Value::DateTime).unwrap_or(Value::Double(days))
        }
        _ => Value::Binary(field.to_vec()),
    }
}

/// OLE automation date: days since 1899-12-30
pub fn ole_date(days: f64) -> Option<NaiveDateTime> {
    let millis = (days * 86_400_000.0).round();
    if !millis.is_finite() || millis.abs() > 1e15 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    epoch.checked_add_signed(Duration::milliseconds(millis as i64))
}

/// Decodes Jet 4 text: UCS-2 LE, or "compressed unicode" behind a `FF FE` marker
///
/// In compressed form each non-zero byte is one Latin-1 character and a
/// zero byte toggles between one-byte and two-byte code units.
pub fn decode_text(bytes: &[u8]) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());

    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        let mut compressed = true;
        let mut i = 2;
        while i < bytes.len() {
            if bytes[i] == 0 {
                compressed = !compressed;
                i += 1;
            } else if compressed {
                units.push(bytes[i] as u16);
                i += 1;
            } else if i + 1 < bytes.len() {
                units.push(LittleEndian::read_u16(&bytes[i..i + 2]));
                i += 2;
            } else {
                break;
            }
        }
    } else {
        units.extend(bytes.chunks_exact(2).map(LittleEndian::read_u16));
    }

    String::from_utf16_lossy(&units)
}

fn slice(buf: &[u8], start: usize, len: usize) -> JetResult<&[u8]> {
    buf.get(start..start + len)
        .ok_or_else(|| JetError::Corrupt(format!("{} byte(s) at {} exceed a {}-byte buffer", len, start, buf.len())))
}

fn read_u16(buf: &[u8], pos: usize) -> JetResult<u16> {
    slice(buf, pos, 2).map(LittleEndian::read_u16)
}

fn read_u32(buf: &[u8], pos: usize) -> JetResult<u32> {
    slice(buf, pos, 4).map(LittleEndian::read_u32)
}
