use ndarray::{concatenate, Array2, Axis};

use crate::error::{ProfusionError, Result};
use crate::events::EventDatabase;
use crate::montage::Montage;
use crate::types::{ChannelKind, ElectrodePlacement, Event};

/// Which electrode placement, if any, becomes the montage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlacementSelection {
    /// No montage
    None,
    /// The only loaded placement; no montage when none was loaded,
    /// `AmbiguousPlacement` when several were
    #[default]
    Auto,
    /// Placement at this position in load order
    ByIndex(usize),
    /// Placement whose source file name matches
    ByName(String),
}

/// Which events become annotations
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventSelection {
    None,
    #[default]
    All,
    /// Only events of these category ids
    Categories(Vec<i64>),
}

/// Caller policy for one export
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportOptions {
    pub placement: PlacementSelection,
    pub events: EventSelection,
    /// Insert zero columns for acquisition gaps between segments
    pub pad_gaps: bool,
    /// Appends an all-zero EEG channel with this name
    pub reference_channel: Option<String>,
}

/// One timed label, all times in seconds
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub onset: f64,
    pub duration: f64,
    pub description: String,
}

impl From<&Event> for Annotation {
    fn from(event: &Event) -> Self {
        Annotation {
            onset: event.start_sec,
            duration: event.duration_sec,
            description: event.event_name.clone(),
        }
    }
}

/// The generic signal container handed to downstream consumers
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    pub ch_names: Vec<String>,
    pub sampling_freq: f64,
    pub ch_kinds: Vec<ChannelKind>,
    /// `[n_channels, n_times]`
    pub data: Array2<f32>,
    pub montage: Option<Montage>,
    pub annotations: Vec<Annotation>,
}

impl RawSignal {
    /// Builds a container after checking that all per-channel parts agree
    ///
    /// # Errors
    ///
    /// * `ProfusionError::InvalidSignal` - channel names, kinds and data rows
    ///   differ in count, a channel name repeats, or the sampling frequency is
    ///   not positive
    pub fn new(
        ch_names: Vec<String>,
        sampling_freq: f64,
        ch_kinds: Vec<ChannelKind>,
        data: Array2<f32>,
        montage: Option<Montage>,
        annotations: Vec<Annotation>,
    ) -> Result<Self> {
        if ch_names.len() != ch_kinds.len() || ch_names.len() != data.nrows() {
            return Err(ProfusionError::InvalidSignal(format!(
                "{} channel name(s), {} channel kind(s), {} data row(s)",
                ch_names.len(),
                ch_kinds.len(),
                data.nrows()
            )));
        }
        if !(sampling_freq.is_finite() && sampling_freq > 0.0) {
            return Err(ProfusionError::InvalidSignal(format!(
                "sampling frequency {} Hz",
                sampling_freq
            )));
        }
        for (i, name) in ch_names.iter().enumerate() {
            if ch_names[..i].contains(name) {
                return Err(ProfusionError::InvalidSignal(format!("duplicate channel '{}'", name)));
            }
        }

        Ok(RawSignal {
            ch_names,
            sampling_freq,
            ch_kinds,
            data,
            montage,
            annotations,
        })
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    /// Signal length in seconds
    pub fn duration(&self) -> f64 {
        self.n_times() as f64 / self.sampling_freq
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.ch_names.iter().position(|ch| ch == name)
    }

    /// Appends an all-zero EEG channel
    ///
    /// # Errors
    ///
    /// * `ProfusionError::InvalidSignal` - a channel with that name exists
    pub fn add_reference_channel(&mut self, name: &str) -> Result<()> {
        if self.channel_index(name).is_some() {
            return Err(ProfusionError::InvalidSignal(format!("duplicate channel '{}'", name)));
        }

        let zeros = Array2::<f32>::zeros((1, self.n_times()));
        self.data = concatenate(Axis(0), &[self.data.view(), zeros.view()])
            .map_err(|e| ProfusionError::InvalidSignal(e.to_string()))?;
        self.ch_names.push(name.to_string());
        self.ch_kinds.push(ChannelKind::Eeg);
        log::debug!("Added reference channel '{}'", name);
        Ok(())
    }
}

const OTHER_KIND_PREFIXES: [(&str, ChannelKind); 3] = [
    ("emg", ChannelKind::Emg),
    ("eog", ChannelKind::Eog),
    ("ecg", ChannelKind::Ecg),
];

/// Guesses a channel's type from its name and the linked montage
///
/// `EMG…`, `EOG…` and `ECG…` names (any case) take that type. A name in the
/// montage is EEG, as is a bipolar name such as `C3-A2` whose first
/// electrode is in the montage. Anything else is `Misc`.
pub fn deduce_channel_kind(ch_name: &str, montage: Option<&Montage>) -> ChannelKind {
    let prefix: String = ch_name.chars().take(3).collect::<String>().to_lowercase();
    if let Some((_, kind)) = OTHER_KIND_PREFIXES.iter().find(|(p, _)| *p == prefix) {
        return *kind;
    }

    if let Some(montage) = montage {
        if montage.contains(ch_name) {
            return ChannelKind::Eeg;
        }
        let first = ch_name.split('-').next().unwrap_or_default().trim();
        if montage.contains(first) {
            log::warn!("Channel {} seems to be a referenced channel", ch_name);
            return ChannelKind::Eeg;
        }
    }

    log::warn!("Cannot deduce the channel type of {}, it is set to 'misc'", ch_name);
    ChannelKind::Misc
}

/// Picks the placement named by `selection`
///
/// # Errors
///
/// * `ProfusionError::AmbiguousPlacement` - `Auto` with several placements
/// * `ProfusionError::PlacementNotFound` - `ByIndex`/`ByName` matches nothing
pub fn select_placement<'a>(
    placements: &'a [ElectrodePlacement],
    selection: &PlacementSelection,
) -> Result<Option<&'a ElectrodePlacement>> {
    match selection {
        PlacementSelection::None => Ok(None),
        PlacementSelection::Auto => match placements.len() {
            0 => {
                log::warn!("No electrode placement was loaded, exporting without montage");
                Ok(None)
            }
            1 => Ok(placements.first()),
            n => Err(ProfusionError::AmbiguousPlacement(n)),
        },
        PlacementSelection::ByIndex(idx) => placements
            .get(*idx)
            .map(Some)
            .ok_or_else(|| ProfusionError::PlacementNotFound(format!("index {} of {}", idx, placements.len()))),
        PlacementSelection::ByName(name) => placements
            .iter()
            .find(|p| &p.name == name)
            .map(Some)
            .ok_or_else(|| ProfusionError::PlacementNotFound(name.clone())),
    }
}

/// Annotations for the events chosen by `selection`
pub fn select_annotations(db: &EventDatabase, selection: &EventSelection) -> Vec<Annotation> {
    match selection {
        EventSelection::None => Vec::new(),
        EventSelection::All => {
            log::debug!("All {} event(s) will be linked", db.events.len());
            db.events.iter().map(Annotation::from).collect()
        }
        EventSelection::Categories(ids) => {
            let names: Vec<&str> = ids
                .iter()
                .filter_map(|id| db.category(*id))
                .map(|c| c.category_name.as_str())
                .collect();
            log::debug!("Only events of categories {:?} ({:?}) will be linked", ids, names);
            db.events_in_categories(ids).map(Annotation::from).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventCategory, KindDictionary};
    use ndarray::array;

    fn montage(names: &[&str]) -> Montage {
        Montage {
            name: "m.xml".to_string(),
            ch_names: names.iter().map(|s| s.to_string()).collect(),
            positions: vec![[0.0, 0.0, 0.12]; names.len()],
            sphere_radius: 0.12,
        }
    }

    fn placement(name: &str) -> ElectrodePlacement {
        ElectrodePlacement {
            name: name.to_string(),
            ch_names: vec!["Fp1".to_string()],
            positions: vec![[0.0, 0.12]],
        }
    }

    #[test]
    fn test_deduce_channel_kind() {
        let m = montage(&["C3", "C4", "Fp1"]);
        assert_eq!(deduce_channel_kind("EMG1", Some(&m)), ChannelKind::Emg);
        assert_eq!(deduce_channel_kind("eog-L", None), ChannelKind::Eog);
        assert_eq!(deduce_channel_kind("Ecg", None), ChannelKind::Ecg);
        assert_eq!(deduce_channel_kind("C3", Some(&m)), ChannelKind::Eeg);
        assert_eq!(deduce_channel_kind("C4-A1", Some(&m)), ChannelKind::Eeg);
        assert_eq!(deduce_channel_kind("Pz", Some(&m)), ChannelKind::Misc);
        assert_eq!(deduce_channel_kind("C3", None), ChannelKind::Misc);
    }

    #[test]
    fn test_raw_signal_validation() {
        let data = array![[1.0f32, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
        let names = vec!["A".to_string(), "B".to_string()];

        let raw = RawSignal::new(
            names.clone(),
            2.0,
            vec![ChannelKind::Eeg, ChannelKind::Misc],
            data.clone(),
            None,
            Vec::new(),
        )
        .unwrap();
        assert_eq!(raw.n_channels(), 2);
        assert_eq!(raw.n_times(), 4);
        assert!((raw.duration() - 2.0).abs() < 1e-12);

        assert!(matches!(
            RawSignal::new(names.clone(), 2.0, vec![ChannelKind::Eeg], data.clone(), None, Vec::new()),
            Err(ProfusionError::InvalidSignal(_))
        ));
        assert!(matches!(
            RawSignal::new(names, 0.0, vec![ChannelKind::Eeg; 2], data.clone(), None, Vec::new()),
            Err(ProfusionError::InvalidSignal(_))
        ));
        assert!(matches!(
            RawSignal::new(
                vec!["A".to_string(), "A".to_string()],
                2.0,
                vec![ChannelKind::Eeg; 2],
                data,
                None,
                Vec::new()
            ),
            Err(ProfusionError::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_add_reference_channel() {
        let mut raw = RawSignal::new(
            vec!["A".to_string()],
            1.0,
            vec![ChannelKind::Eeg],
            array![[1.0f32, 2.0, 3.0]],
            None,
            Vec::new(),
        )
        .unwrap();

        raw.add_reference_channel("ref").unwrap();
        assert_eq!(raw.n_channels(), 2);
        assert_eq!(raw.ch_names[1], "ref");
        assert_eq!(raw.ch_kinds[1], ChannelKind::Eeg);
        assert!(raw.data.row(1).iter().all(|v| *v == 0.0));
        assert_eq!(raw.data[[0, 2]], 3.0);

        assert!(raw.add_reference_channel("A").is_err());
    }

    #[test]
    fn test_select_placement() {
        let none: Vec<ElectrodePlacement> = Vec::new();
        let one = vec![placement("a.xml")];
        let two = vec![placement("a.xml"), placement("b.xml")];

        assert!(select_placement(&none, &PlacementSelection::Auto).unwrap().is_none());
        assert_eq!(
            select_placement(&one, &PlacementSelection::Auto).unwrap().map(|p| p.name.as_str()),
            Some("a.xml")
        );
        assert!(matches!(
            select_placement(&two, &PlacementSelection::Auto),
            Err(ProfusionError::AmbiguousPlacement(2))
        ));
        assert!(select_placement(&two, &PlacementSelection::None).unwrap().is_none());
        assert_eq!(
            select_placement(&two, &PlacementSelection::ByIndex(1)).unwrap().map(|p| p.name.as_str()),
            Some("b.xml")
        );
        assert_eq!(
            select_placement(&two, &PlacementSelection::ByName("a.xml".into()))
                .unwrap()
                .map(|p| p.name.as_str()),
            Some("a.xml")
        );
        assert!(matches!(
            select_placement(&two, &PlacementSelection::ByIndex(2)),
            Err(ProfusionError::PlacementNotFound(_))
        ));
        assert!(matches!(
            select_placement(&two, &PlacementSelection::ByName("c.xml".into())),
            Err(ProfusionError::PlacementNotFound(_))
        ));
    }

    #[test]
    fn test_select_annotations() {
        let mut kinds = KindDictionary::new();
        let event = |id: i64, category: i64, name: &str, kinds: &mut KindDictionary| Event {
            event_id: id,
            event_type_id: 0,
            event_category_id: category,
            event_kind_id: kinds.intern(name),
            start_sec: id as f64,
            duration_sec: 0.5,
            event_name: name.to_string(),
        };
        let events = vec![
            event(1, 3, "Spike", &mut kinds),
            event(2, 4, "Artifact", &mut kinds),
            event(3, 3, "Spike", &mut kinds),
        ];
        let db = EventDatabase {
            events,
            categories: vec![EventCategory {
                category_id: 3,
                category_name: "Clinical".to_string(),
                category_desc: String::new(),
            }],
            kinds,
        };

        assert!(select_annotations(&db, &EventSelection::None).is_empty());
        assert_eq!(select_annotations(&db, &EventSelection::All).len(), 3);

        let clinical = select_annotations(&db, &EventSelection::Categories(vec![3]));
        assert_eq!(clinical.len(), 2);
        assert_eq!(clinical[1].onset, 3.0);
        assert_eq!(clinical[1].duration, 0.5);
        assert_eq!(clinical[1].description, "Spike");
    }

    #[test]
    fn test_default_options() {
        let options = ExportOptions::default();
        assert_eq!(options.placement, PlacementSelection::Auto);
        assert_eq!(options.events, EventSelection::All);
        assert!(!options.pad_gaps);
        assert!(options.reference_channel.is_none());
    }
}
