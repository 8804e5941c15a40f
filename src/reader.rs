use std::path::Path;
use std::sync::OnceLock;

use ndarray::Array2;

use crate::error::{ProfusionError, Result};
use crate::events::{parse_event_database, EventDatabase};
use crate::export::{
    deduce_channel_kind, select_annotations, select_placement, EventSelection, ExportOptions,
    PlacementSelection, RawSignal,
};
use crate::header::{check_consistency, parse_segment_header, parse_study_header};
use crate::merge::{merge_segments, plan_merge, MergePlan};
use crate::montage::{build_montage, Montage};
use crate::paths::{resolve_bundle, BundlePaths};
use crate::placement::parse_placement_file;
use crate::segment::PayloadFile;
use crate::types::{
    CompumedicsHeader, ElectrodePlacement, Event, EventCategory, KindDictionary, SegmentFileHeader,
};
use crate::utils::file_name_string;

/// State of an optional bundle member
///
/// Keeps "not part of the bundle" apart from "present but unreadable".
#[derive(Debug)]
pub enum Supplement<T> {
    Missing,
    Loaded(T),
    Failed(ProfusionError),
}

impl<T> Supplement<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Supplement::Loaded(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Supplement::Missing)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Supplement::Failed(_))
    }

    pub fn loaded(&self) -> Option<&T> {
        match self {
            Supplement::Loaded(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ProfusionError> {
        match self {
            Supplement::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Import-time options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Fail with `Inconsistent` when the study header and segment header
    /// disagree on the channel count
    pub check_consistency: bool,
}

/// One opened Profusion export bundle
///
/// Opening a bundle parses both headers, indexes every payload file and
/// reads the optional placement documents and event database. Samples stay
/// on disk until a segment is loaded or the signal is merged; loaded
/// segments are cached per payload file until [`clear_cache`](Self::clear_cache).
///
/// Payload file handles belong to the reader and are closed when it is
/// dropped. A reader is not meant to be shared between threads without
/// external locking.
///
/// # Examples
///
/// ```rust
/// use profusion::ProfusionReader;
///
/// # // Generate test bundle (hidden from docs)
/// # let bundle = profusion::doctest_utils::create_test_bundle("reader_doc_bundle")?;
/// #
/// let mut reader = ProfusionReader::open(&bundle)?;
///
/// println!("Channels: {:?}", reader.header().ch_names);
/// println!("Sampling rate: {} Hz", reader.header().sampling_freq);
/// println!("Payload files: {}", reader.payload_files().len());
///
/// // Merge every segment into one [channels, samples] matrix
/// let signal = reader.merge_signal(false)?;
/// println!("Merged shape: {:?}", signal.shape());
///
/// for event in reader.events() {
///     println!("{:.3}s {}", event.start_sec, event.event_name);
/// }
///
/// # // Cleanup (hidden from docs)
/// # drop(reader);
/// # std::fs::remove_dir_all("reader_doc_bundle").ok();
/// # Ok::<(), profusion::ProfusionError>(())
/// ```
#[derive(Debug)]
pub struct ProfusionReader {
    paths: BundlePaths,
    header: CompumedicsHeader,
    segment_header: SegmentFileHeader,
    /// 按导入顺序排列的数据文件
    payload_files: Vec<PayloadFile>,
    placements: Vec<ElectrodePlacement>,
    /// 解析失败的电极位置文件（文件名，错误）
    placement_failures: Vec<(String, ProfusionError)>,
    events: Supplement<EventDatabase>,
}

impl ProfusionReader {
    /// Opens a bundle with default [`ImportOptions`]
    ///
    /// # Arguments
    ///
    /// * `path` - Bundle directory, `.sdy` study header or a single `.rda`
    ///   payload file
    ///
    /// # Errors
    ///
    /// * `ProfusionError::NotFound` - a required bundle member is missing
    /// * `ProfusionError::MalformedHeader` - a header can't be parsed
    /// * `ProfusionError::MalformedSegment` - a payload file's framing is broken
    ///
    /// Placement documents and the event database never fail the import.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_options(path, ImportOptions::default())
    }

    /// Opens a bundle
    ///
    /// # Errors
    ///
    /// As [`open`](Self::open), plus `ProfusionError::Inconsistent` when
    /// `options.check_consistency` is set and the headers disagree.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use profusion::{ImportOptions, ProfusionReader};
    ///
    /// # let bundle = profusion::doctest_utils::create_test_bundle("options_doc_bundle")?;
    /// let options = ImportOptions { check_consistency: true };
    /// let reader = ProfusionReader::open_with_options(&bundle, options)?;
    /// assert_eq!(reader.header().n_channels, reader.segment_header().n_channels);
    /// # drop(reader);
    /// # std::fs::remove_dir_all("options_doc_bundle").ok();
    /// # Ok::<(), profusion::ProfusionError>(())
    /// ```
    pub fn open_with_options<P: AsRef<Path>>(path: P, options: ImportOptions) -> Result<Self> {
        let paths = resolve_bundle(path)?;

        let header = parse_study_header(&paths.study_header)?;
        let segment_header = parse_segment_header(&paths.segment_header)?;
        if options.check_consistency {
            check_consistency(&header, &segment_header)?;
        }

        // 依次索引每个数据文件，只读段头
        let payload_files = paths
            .payload_files
            .iter()
            .map(|path| PayloadFile::open(path, &segment_header))
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "Indexed {} segment(s) in {} payload file(s)",
            payload_files.iter().map(|f| f.len()).sum::<usize>(),
            payload_files.len()
        );

        let mut placements = Vec::new();
        let mut placement_failures = Vec::new();
        for path in &paths.placement_files {
            match parse_placement_file(path, &header.ch_names) {
                Ok(placement) => placements.push(placement),
                Err(err) => {
                    log::warn!("Skipping electrode placement {}: {}", path.display(), err);
                    placement_failures.push((file_name_string(path), err));
                }
            }
        }

        let events = match &paths.event_database {
            None => {
                log::warn!("No event database in bundle {}", paths.root.display());
                Supplement::Missing
            }
            Some(path) => match parse_event_database(path) {
                Ok(db) => Supplement::Loaded(db),
                Err(err) => {
                    log::warn!("Event database {} unusable: {}", path.display(), err);
                    Supplement::Failed(err)
                }
            },
        };

        Ok(ProfusionReader {
            paths,
            header,
            segment_header,
            payload_files,
            placements,
            placement_failures,
            events,
        })
    }

    pub fn paths(&self) -> &BundlePaths {
        &self.paths
    }

    /// Study header; its channel order governs every export
    pub fn header(&self) -> &CompumedicsHeader {
        &self.header
    }

    pub fn segment_header(&self) -> &SegmentFileHeader {
        &self.segment_header
    }

    pub fn payload_files(&self) -> &[PayloadFile] {
        &self.payload_files
    }

    /// Mutable access for per-segment loading
    pub fn payload_files_mut(&mut self) -> &mut [PayloadFile] {
        &mut self.payload_files
    }

    /// Total number of indexed segments over all payload files
    pub fn n_segments(&self) -> usize {
        self.payload_files.iter().map(|f| f.len()).sum()
    }

    /// Successfully parsed placements, in file name order
    pub fn placements(&self) -> &[ElectrodePlacement] {
        &self.placements
    }

    pub fn placement_failures(&self) -> &[(String, ProfusionError)] {
        &self.placement_failures
    }

    pub fn event_database(&self) -> &Supplement<EventDatabase> {
        &self.events
    }

    /// Begin events; empty when the database is missing or unreadable
    pub fn events(&self) -> &[Event] {
        &self.loaded_events().events
    }

    pub fn event_categories(&self) -> &[EventCategory] {
        &self.loaded_events().categories
    }

    pub fn event_kinds(&self) -> &KindDictionary {
        &self.loaded_events().kinds
    }

    fn loaded_events(&self) -> &EventDatabase {
        static EMPTY: OnceLock<EventDatabase> = OnceLock::new();
        self.events
            .loaded()
            .unwrap_or_else(|| EMPTY.get_or_init(EventDatabase::default))
    }

    /// Montage of the placement chosen by `selection`
    ///
    /// # Errors
    ///
    /// * `ProfusionError::AmbiguousPlacement` - `Auto` with several placements
    /// * `ProfusionError::PlacementNotFound` - index or name matches nothing
    pub fn montage(&self, selection: &PlacementSelection) -> Result<Option<Montage>> {
        Ok(select_placement(&self.placements, selection)?.map(build_montage))
    }

    /// Column layout the merge would produce, without loading samples
    ///
    /// # Errors
    ///
    /// * `ProfusionError::MalformedSegment` - sample offsets overflow
    pub fn merge_plan(&self, pad_gaps: bool) -> Result<MergePlan> {
        plan_merge(&self.payload_files, pad_gaps)
    }

    /// Loads every segment and concatenates them into `[n_channels, n_samples]`
    ///
    /// # Arguments
    ///
    /// * `pad_gaps` - Fill acquisition gaps between segments with zeros
    ///
    /// # Errors
    ///
    /// * `ProfusionError::Truncated` - a segment payload is cut short
    /// * `ProfusionError::Inconsistent` - segment rows differ from the
    ///   study header channel count. This is raised here even when the
    ///   bundle was opened with consistency checking off.
    /// * `ProfusionError::MalformedSegment` - sample offsets overflow, or the
    ///   merged matrix is too large to allocate
    pub fn merge_signal(&mut self, pad_gaps: bool) -> Result<Array2<f32>> {
        log::debug!("Loading all payload segments...");
        let merged = merge_segments(&mut self.payload_files, self.header.n_channels, pad_gaps)?;
        log::debug!("Loaded payload segments, shape = {:?}", merged.shape());
        Ok(merged)
    }

    /// Releases every cached segment of every payload file
    pub fn clear_cache(&mut self) {
        for file in &mut self.payload_files {
            file.clear_cache();
        }
    }

    /// Builds the signal container consumed downstream
    ///
    /// Channel kinds are deduced against the selected montage; see
    /// [`deduce_channel_kind`].
    ///
    /// # Errors
    ///
    /// Placement selection errors, merge errors, and
    /// `ProfusionError::InvalidSignal` when the parts don't line up.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use profusion::{EventSelection, ExportOptions, ProfusionReader};
    ///
    /// # let bundle = profusion::doctest_utils::create_test_bundle("export_doc_bundle")?;
    /// let mut reader = ProfusionReader::open(&bundle)?;
    ///
    /// let options = ExportOptions {
    ///     events: EventSelection::Categories(vec![1]),
    ///     pad_gaps: true,
    ///     reference_channel: Some("ref".to_string()),
    ///     ..ExportOptions::default()
    /// };
    /// let raw = reader.export(&options)?;
    /// println!("{} channels, {:.1} s", raw.n_channels(), raw.duration());
    /// # drop(reader);
    /// # std::fs::remove_dir_all("export_doc_bundle").ok();
    /// # Ok::<(), profusion::ProfusionError>(())
    /// ```
    pub fn export(&mut self, options: &ExportOptions) -> Result<RawSignal> {
        log::debug!("Attempting to link electrode placement");
        let montage = self.montage(&options.placement)?;

        let data = self.merge_signal(options.pad_gaps)?;

        let ch_kinds = self
            .header
            .ch_names
            .iter()
            .map(|name| deduce_channel_kind(name, montage.as_ref()))
            .collect();

        if options.events != EventSelection::None && !self.events.is_loaded() {
            log::warn!("Events requested but no event database was loaded");
        }
        let annotations = select_annotations(self.loaded_events(), &options.events);

        let mut raw = RawSignal::new(
            self.header.ch_names.clone(),
            self.header.sampling_freq,
            ch_kinds,
            data,
            montage,
            annotations,
        )?;
        if let Some(reference) = &options.reference_channel {
            raw.add_reference_channel(reference)?;
        }

        log::info!(
            "Exported {} channel(s) x {} sample(s), {} annotation(s)",
            raw.n_channels(),
            raw.n_times(),
            raw.annotations.len()
        );
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supplement_states() {
        let missing: Supplement<u8> = Supplement::Missing;
        assert!(missing.is_missing());
        assert!(missing.loaded().is_none());

        let loaded = Supplement::Loaded(3u8);
        assert!(loaded.is_loaded());
        assert_eq!(loaded.loaded(), Some(&3));
        assert!(loaded.error().is_none());

        let failed: Supplement<u8> = Supplement::Failed(ProfusionError::optional("event database", "corrupt"));
        assert!(failed.is_failed());
        assert!(failed.error().map(|e| !e.is_fatal()).unwrap_or(false));
    }

    #[test]
    fn test_open_test_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = crate::doctest_utils::BundleBuilder::new().write(dir.path()).unwrap();

        let mut reader = ProfusionReader::open(&bundle).unwrap();
        assert_eq!(reader.header().ch_names.len(), reader.segment_header().n_channels);
        assert!(reader.n_segments() > 0);
        assert_eq!(reader.placements().len(), 1);
        assert!(reader.placement_failures().is_empty());
        assert!(reader.event_database().is_loaded());

        let plan = reader.merge_plan(false).unwrap();
        let merged = reader.merge_signal(false).unwrap();
        assert_eq!(merged.ncols(), plan.width);
        assert!(reader.payload_files()[0].is_cached(0));

        reader.clear_cache();
        assert!(!reader.payload_files()[0].is_cached(0));
    }
}
