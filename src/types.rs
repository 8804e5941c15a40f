use std::collections::HashMap;

/// Channel and sampling metadata from the study header (`.sdy`)
///
/// The order of `ch_names` is authoritative for the whole import: merged
/// rows, montage lookups and exported channels all follow it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompumedicsHeader {
    pub ch_names: Vec<String>,
    pub n_channels: usize,
    pub sampling_freq: f64,
}

impl CompumedicsHeader {
    /// Index of a channel by exact name
    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.ch_names.iter().position(|ch| ch == name)
    }

    pub fn contains_channel(&self, name: &str) -> bool {
        self.channel_index(name).is_some()
    }
}

/// Per-payload-file limits from the segment header (`EEGData.ini`)
///
/// Advisory only: a segment longer than `max_samples_per_file` is logged,
/// never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentFileHeader {
    pub max_samples_per_file: i64,
    pub n_channels: usize,
}

/// One indexed segment of a payload file
///
/// Created while indexing; the samples themselves stay on disk until
/// [`PayloadFile::load_segment`](crate::segment::PayloadFile::load_segment).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    pub magic: i64,
    /// Intended global sample offset of the segment
    pub first_sample: i64,
    pub n_samples: i64,
    pub closed: bool,
    /// Absolute byte offset of the first float of the payload
    pub payload_offset: u64,
    /// `(channels, samples)`
    pub shape: (usize, usize),
}

impl SegmentRecord {
    /// Number of `f32` values in the payload, `None` on overflow
    pub fn checked_value_count(&self) -> Option<usize> {
        self.shape.0.checked_mul(self.shape.1)
    }

    /// Payload length in bytes, `None` on overflow
    pub fn checked_payload_len(&self) -> Option<u64> {
        u64::try_from(self.checked_value_count()?).ok()?.checked_mul(4)
    }

    /// Number of `f32` values in the payload, saturating
    pub fn value_count(&self) -> usize {
        self.checked_value_count().unwrap_or(usize::MAX)
    }

    /// Payload length in bytes, saturating
    pub fn payload_len(&self) -> u64 {
        self.checked_payload_len().unwrap_or(u64::MAX)
    }
}

/// Normalized 2D electrode coordinates from one placement document
#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodePlacement {
    /// File name of the source document
    pub name: String,
    pub ch_names: Vec<String>,
    /// Centered, scaled so the outermost electrode sits at [`HEAD_RADIUS`](crate::HEAD_RADIUS)
    pub positions: Vec<[f64; 2]>,
}

impl ElectrodePlacement {
    pub fn len(&self) -> usize {
        self.ch_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ch_names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: i64,
    pub event_type_id: i64,
    pub event_category_id: i64,
    /// Dense id of `event_name` within its [`KindDictionary`]
    pub event_kind_id: usize,
    pub start_sec: f64,
    pub duration_sec: f64,
    pub event_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCategory {
    pub category_id: i64,
    pub category_name: String,
    pub category_desc: String,
}

/// Bidirectional event name <-> dense kind id mapping
///
/// Ids are handed out from 0 in first-seen order; the first occurrence of a
/// name fixes its id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindDictionary {
    ids: HashMap<String, usize>,
    names: Vec<String>,
}

impl KindDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of `name`, assigning the next free id on first sight
    pub fn intern(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `(id, name)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(id, name)| (id, name.as_str()))
    }
}

/// Channel type tag carried by the exported signal container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Eeg,
    Emg,
    Eog,
    Ecg,
    Misc,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Eeg => "eeg",
            ChannelKind::Emg => "emg",
            ChannelKind::Eog => "eog",
            ChannelKind::Ecg => "ecg",
            ChannelKind::Misc => "misc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dictionary_first_seen_order() {
        let mut kinds = KindDictionary::new();
        assert_eq!(kinds.intern("Spike"), 0);
        assert_eq!(kinds.intern("Sharp Wave"), 1);
        assert_eq!(kinds.intern("Spike"), 0);
        assert_eq!(kinds.intern("Artifact"), 2);

        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds.id("Sharp Wave"), Some(1));
        assert_eq!(kinds.name(2), Some("Artifact"));
        assert_eq!(kinds.name(3), None);
        assert_eq!(kinds.id("Unknown"), None);

        let pairs: Vec<_> = kinds.iter().collect();
        assert_eq!(pairs, vec![(0, "Spike"), (1, "Sharp Wave"), (2, "Artifact")]);
    }

    #[test]
    fn test_segment_record_sizes() {
        let record = SegmentRecord {
            magic: -1,
            first_sample: 0,
            n_samples: 10,
            closed: true,
            payload_offset: 300,
            shape: (3, 10),
        };
        assert_eq!(record.value_count(), 30);
        assert_eq!(record.payload_len(), 120);

        let huge = SegmentRecord {
            shape: (3, usize::MAX / 2),
            ..record
        };
        assert_eq!(huge.checked_value_count(), None);
        assert_eq!(huge.checked_payload_len(), None);
        assert_eq!(huge.payload_len(), u64::MAX);
    }
}
