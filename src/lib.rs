//! # Profusion EEG export reader for Rust
//!
//! A pure Rust library for reading Compumedics Profusion EEG export bundles:
//! the study header, the segmented binary payload files, electrode placement
//! documents and the legacy event database.
//!
//! ## Bundle layout
//!
//! ```text
//! Study01/
//! ├── Study01.sdy                 study header (channel names, sampling rate)
//! ├── EEGStudyDB.mdb              event database (optional)
//! ├── EEGData/
//! │   ├── EEGData.ini             segment header
//! │   ├── 0001.rda                payload files
//! │   └── 0002.rda
//! └── ElectrodePlacements/        placement documents (optional)
//!     └── Standard.xml
//! ```
//!
//! ## Quick Start
//!
//! ### Reading a bundle
//!
//! ```rust
//! use profusion::{ProfusionReader, Result};
//!
//! fn main() -> Result<()> {
//!     # // Create a test bundle first
//!     # let bundle = profusion::doctest_utils::create_test_bundle("quick_start_bundle")?;
//!     // Open the bundle directory, the .sdy file or a single .rda file
//!     let mut reader = ProfusionReader::open(&bundle)?;
//!
//!     let header = reader.header();
//!     println!("Number of channels: {}", header.n_channels);
//!     println!("Sampling rate: {} Hz", header.sampling_freq);
//!
//!     // Segments are indexed on open, samples are read on demand
//!     for file in reader.payload_files() {
//!         println!("{}: {} segment(s)", file.name(), file.len());
//!     }
//!     let first = reader.payload_files_mut()[0].load_segment(0)?;
//!     println!("First segment shape: {:?}", first.shape());
//!
//!     // Concatenate everything, filling acquisition gaps with zeros
//!     let signal = reader.merge_signal(true)?;
//!     println!("Merged shape: {:?}", signal.shape());
//!
//!     # // Cleanup
//!     # drop(reader);
//!     # std::fs::remove_dir_all("quick_start_bundle").ok();
//!     Ok(())
//! }
//! ```
//!
//! ### Exporting a signal container
//!
//! ```rust
//! use profusion::{ExportOptions, PlacementSelection, ProfusionReader, Result};
//!
//! fn main() -> Result<()> {
//!     # let bundle = profusion::doctest_utils::create_test_bundle("export_bundle")?;
//!     let mut reader = ProfusionReader::open(&bundle)?;
//!
//!     let raw = reader.export(&ExportOptions {
//!         placement: PlacementSelection::ByIndex(0),
//!         ..ExportOptions::default()
//!     })?;
//!
//!     for (name, kind) in raw.ch_names.iter().zip(&raw.ch_kinds) {
//!         println!("{}: {}", name, kind.as_str());
//!     }
//!     for annotation in &raw.annotations {
//!         println!("{:.3}s +{:.3}s {}", annotation.onset, annotation.duration, annotation.description);
//!     }
//!
//!     # drop(reader);
//!     # std::fs::remove_dir_all("export_bundle").ok();
//!     Ok(())
//! }
//! ```
//!
//! ## Optional bundle members
//!
//! Placement documents and the event database are supplementary. When they
//! are missing or unreadable the import still succeeds: failed placements are
//! listed by [`ProfusionReader::placement_failures`], and the event database
//! state is reported by [`ProfusionReader::event_database`].
//!
//! ## Logging
//!
//! Every pipeline step logs through the [`log`](https://docs.rs/log) facade.
//! Install any logger in the application to see it.

pub mod error;
pub mod types;
pub mod utils;
pub mod paths;
pub mod header;
pub mod segment;
pub mod merge;
pub mod placement;
pub mod montage;
pub mod jet;
pub mod events;
pub mod export;
pub mod reader;

#[doc(hidden)]
pub mod doctest_utils; // For internal doctest support

// Re-export main types for convenience
pub use error::{ProfusionError, Result};
pub use types::{
    ChannelKind, CompumedicsHeader, ElectrodePlacement, Event, EventCategory, KindDictionary,
    SegmentFileHeader, SegmentRecord,
};
pub use paths::{is_profusion_path, resolve_bundle, BundlePaths};
pub use segment::{PayloadFile, SegmentCache};
pub use merge::MergePlan;
pub use montage::Montage;
pub use events::EventDatabase;
pub use export::{Annotation, EventSelection, ExportOptions, PlacementSelection, RawSignal};
pub use reader::{ImportOptions, ProfusionReader, Supplement};

// Important constants
/// Head radius the placement coordinates are scaled to, in meters
pub const HEAD_RADIUS: f64 = 0.12;
pub const PAYLOAD_FILE_HEADER_SIZE: u64 = 100;
pub const SEGMENT_HEADER_SIZE: u64 = 25;
/// Record header plus reserved bytes before each segment payload
pub const SEGMENT_FRAMING_SIZE: u64 = 200;
pub const NANOSECONDS_PER_SECOND: f64 = 1_000_000_000.0;

/// Library version
///
/// Returns the current version of the profusion library.
///
/// # Examples
///
/// ```rust
/// let version = profusion::version();
/// assert!(!version.is_empty());
/// assert!(version.contains('.'));
/// println!("Profusion reader version: {}", version);
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_segment_framing() {
        assert!(SEGMENT_HEADER_SIZE < SEGMENT_FRAMING_SIZE);
        assert_eq!(SEGMENT_FRAMING_SIZE - SEGMENT_HEADER_SIZE, 175);
    }
}
