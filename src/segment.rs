use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use ndarray::Array2;

use crate::error::{ProfusionError, Result};
use crate::types::{SegmentFileHeader, SegmentRecord};
use crate::utils::file_name_string;
use crate::{PAYLOAD_FILE_HEADER_SIZE, SEGMENT_FRAMING_SIZE, SEGMENT_HEADER_SIZE};

/// Indexer states while walking the segment records of a payload file
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanState {
    /// Positioned at the byte offset of the next record header
    ExpectHeader(u64),
    /// A header was decoded; its payload still has to be skipped
    ExpectPayload(SegmentRecord),
    /// End of file reached exactly at a record boundary, or after a payload
    /// running past the end (reported later by `load_segment`)
    EndOfFile,
}

/// Per-segment payload cache
///
/// Keyed by segment index within the owning file. There is no eviction:
/// every loaded segment stays resident until [`SegmentCache::clear`] or the
/// owning [`PayloadFile`] is dropped, so memory grows with the amount of
/// data touched.
#[derive(Debug, Default)]
pub struct SegmentCache {
    blocks: HashMap<usize, Array2<f32>>,
}

impl SegmentCache {
    pub fn get(&self, segment: usize) -> Option<&Array2<f32>> {
        self.blocks.get(&segment)
    }

    pub fn contains(&self, segment: usize) -> bool {
        self.blocks.contains_key(&segment)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Cached segment indices in ascending order
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.blocks.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Total number of cached sample values
    pub fn resident_values(&self) -> usize {
        self.blocks.values().map(|block| block.len()).sum()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// One lazily indexed payload (`.rda`) file
///
/// Opening a payload file reads its 100-byte file header and every segment
/// record header, but never the samples. [`load_segment`](Self::load_segment)
/// reads one segment on demand and caches it.
///
/// The file owns exactly one read handle; seeks are stateful, so concurrent
/// use of the same `PayloadFile` needs external locking. The handle is
/// released when the value is dropped, including on error paths of `open`.
///
/// # Binary layout (little-endian)
///
/// ```text
/// 0     1 byte    sealed flag
/// 1     4 bytes   pending-delete count (i32)
/// 5     95 bytes  reserved
/// 100   segment records until EOF:
///       8 bytes   magic (i64)
///       8 bytes   first sample (i64)
///       8 bytes   sample count (i64)
///       1 byte    closed flag
///       175 bytes reserved
///       n_samples * n_channels * 4 bytes of f32, sample-major
/// ```
#[derive(Debug)]
pub struct PayloadFile<R = BufReader<File>> {
    name: String,
    sealed: bool,
    pending_deletes: i32,
    reader: R,
    file_len: u64,
    segments: Vec<SegmentRecord>,
    cache: SegmentCache,
}

impl PayloadFile<BufReader<File>> {
    /// Opens and indexes a payload file
    ///
    /// # Errors
    ///
    /// * `ProfusionError::NotFound` - the file can't be opened
    /// * `ProfusionError::MalformedSegment` - a record header is cut short
    ///   or declares a negative sample count
    pub fn open<P: AsRef<Path>>(path: P, header: &SegmentFileHeader) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Opening payload file {}", path.display());
        let file = File::open(path)
            .map_err(|e| ProfusionError::NotFound(format!("{}: {}", path.display(), e)))?;

        Self::from_reader(file_name_string(path), BufReader::new(file), header)
    }
}

impl<R: Read + Seek> PayloadFile<R> {
    /// Indexes a payload image from any seekable source
    pub fn from_reader(name: String, mut reader: R, header: &SegmentFileHeader) -> Result<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        if file_len < PAYLOAD_FILE_HEADER_SIZE {
            return Err(ProfusionError::MalformedSegment(format!(
                "{}: {} bytes is shorter than the {}-byte file header",
                name, file_len, PAYLOAD_FILE_HEADER_SIZE
            )));
        }

        // 文件头：封存标志 + 待删除计数，其余保留
        reader.seek(SeekFrom::Start(0))?;
        let mut file_header = [0u8; 5];
        reader.read_exact(&mut file_header)?;
        let sealed = file_header[0] != 0;
        let pending_deletes = i32::from_le_bytes([
            file_header[1],
            file_header[2],
            file_header[3],
            file_header[4],
        ]);

        let segments = Self::index_segments(&name, &mut reader, file_len, header)?;
        log::debug!(
            "{}: {} segment(s), n_samples: {:?}",
            name,
            segments.len(),
            segments.iter().map(|s| s.n_samples).collect::<Vec<_>>()
        );

        Ok(PayloadFile {
            name,
            sealed,
            pending_deletes,
            reader,
            file_len,
            segments,
            cache: SegmentCache::default(),
        })
    }

    fn index_segments(
        name: &str,
        reader: &mut R,
        file_len: u64,
        header: &SegmentFileHeader,
    ) -> Result<Vec<SegmentRecord>> {
        let mut segments = Vec::new();
        let mut state = ScanState::ExpectHeader(PAYLOAD_FILE_HEADER_SIZE);

        loop {
            state = match state {
                ScanState::ExpectHeader(offset) if offset == file_len => ScanState::EndOfFile,
                ScanState::ExpectHeader(offset) => {
                    let record = Self::read_record_header(name, reader, offset, file_len, header)?;
                    ScanState::ExpectPayload(record)
                }
                ScanState::ExpectPayload(record) => {
                    let next = record.payload_offset.saturating_add(record.payload_len());
                    let state = if next < file_len {
                        ScanState::ExpectHeader(next)
                    } else {
                        if next > file_len {
                            log::warn!(
                                "{}: segment {} runs {} byte(s) past the end of file",
                                name,
                                segments.len(),
                                next - file_len
                            );
                        }
                        ScanState::EndOfFile
                    };
                    segments.push(record);
                    state
                }
                ScanState::EndOfFile => break,
            };
        }

        Ok(segments)
    }

    /// 读取 25 字节段头，跳过 175 字节保留区
    fn read_record_header(
        name: &str,
        reader: &mut R,
        offset: u64,
        file_len: u64,
        header: &SegmentFileHeader,
    ) -> Result<SegmentRecord> {
        if file_len - offset < SEGMENT_HEADER_SIZE {
            return Err(ProfusionError::MalformedSegment(format!(
                "{}: {} trailing byte(s) at offset {} cannot hold a segment header",
                name,
                file_len - offset,
                offset
            )));
        }

        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        reader.read_exact(&mut buf)?;

        let magic = read_i64_le(&buf[0..8]);
        let first_sample = read_i64_le(&buf[8..16]);
        let n_samples = read_i64_le(&buf[16..24]);
        let closed = buf[24] != 0;

        if n_samples < 0 {
            return Err(ProfusionError::MalformedSegment(format!(
                "{}: negative sample count {} at offset {}",
                name, n_samples, offset
            )));
        }
        if n_samples > header.max_samples_per_file {
            log::warn!(
                "{}: segment has {} samples but the segment header allows {}",
                name,
                n_samples,
                header.max_samples_per_file
            );
        }

        let malformed = || {
            ProfusionError::MalformedSegment(format!(
                "{}: sample count {} at offset {} overflows the payload size",
                name, n_samples, offset
            ))
        };
        let record = SegmentRecord {
            magic,
            first_sample,
            n_samples,
            closed,
            payload_offset: offset.checked_add(SEGMENT_FRAMING_SIZE).ok_or_else(malformed)?,
            shape: (
                header.n_channels,
                usize::try_from(n_samples).map_err(|_| malformed())?,
            ),
        };
        record
            .checked_payload_len()
            .and_then(|len| record.payload_offset.checked_add(len))
            .ok_or_else(malformed)?;

        Ok(record)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn pending_deletes(&self) -> i32 {
        self.pending_deletes
    }

    /// Size of the underlying file in bytes
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Number of indexed segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[SegmentRecord] {
        &self.segments
    }

    /// Gets a segment record without touching its payload
    pub fn segment(&self, index: usize) -> Result<&SegmentRecord> {
        self.segments
            .get(index)
            .ok_or(ProfusionError::InvalidSegmentIndex(index))
    }

    /// Total samples declared by all segments of this file
    pub fn total_samples(&self) -> i64 {
        self.segments.iter().map(|s| s.n_samples).sum()
    }

    /// Loads one segment as a `[n_channels, n_samples]` matrix
    ///
    /// The first call reads the payload from disk; later calls return the
    /// cached block without any I/O.
    ///
    /// # Errors
    ///
    /// * `ProfusionError::InvalidSegmentIndex` - `index` is out of range
    /// * `ProfusionError::Truncated` - fewer bytes remain than the segment
    ///   declares. Only this access fails; cached segments stay valid.
    pub fn load_segment(&mut self, index: usize) -> Result<&Array2<f32>> {
        let record = self
            .segments
            .get(index)
            .ok_or(ProfusionError::InvalidSegmentIndex(index))?;

        if !self.cache.contains(index) {
            let block = read_payload(&self.name, &mut self.reader, index, record)?;
            self.cache.blocks.insert(index, block);
        }

        self.cache
            .get(index)
            .ok_or(ProfusionError::InvalidSegmentIndex(index))
    }

    pub fn is_cached(&self, index: usize) -> bool {
        self.cache.contains(index)
    }

    /// Indices of the segments currently held in memory
    pub fn cached_segments(&self) -> Vec<usize> {
        self.cache.indices()
    }

    pub fn cache(&self) -> &SegmentCache {
        &self.cache
    }

    /// Drops every cached segment; later loads read from disk again
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Returns the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn read_payload<R: Read + Seek>(
    name: &str,
    reader: &mut R,
    index: usize,
    record: &SegmentRecord,
) -> Result<Array2<f32>> {
    let (n_channels, n_samples) = record.shape;
    let expected = record.value_count();
    let payload_len = record.payload_len();

    reader.seek(SeekFrom::Start(record.payload_offset))?;
    let mut bytes = Vec::new();
    reader.by_ref().take(payload_len).read_to_end(&mut bytes)?;

    if bytes.len() as u64 != payload_len {
        return Err(ProfusionError::Truncated {
            file: name.to_string(),
            segment: index,
            expected,
            actual: bytes.len() / 4,
        });
    }

    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    // 磁盘上按采样点优先存储，转置成 [通道, 采样点]
    let sample_major = Array2::from_shape_vec((n_samples, n_channels), values)
        .map_err(|e| ProfusionError::MalformedSegment(format!("{} segment {}: {}", name, index, e)))?;
    Ok(sample_major.reversed_axes().as_standard_layout().into_owned())
}

fn read_i64_le(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}
