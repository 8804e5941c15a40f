use std::fs;
use std::path::Path;

use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader as XmlReader;

use crate::error::{ProfusionError, Result};
use crate::types::{CompumedicsHeader, SegmentFileHeader};
use crate::utils::parse_key_value;

/// Key of the per-file sample limit in the segment header
pub const MAX_SAMPLES_KEY: &str = "Integral space size in samples";
/// Key of the channel count in the segment header
pub const CHANNEL_COUNT_KEY: &str = "Number of Channels";

const STUDY_TAG: &[u8] = b"Study";
const CHANNEL_TAG: &[u8] = b"Channel";
const SAMPLE_RATE_ATTR: &[u8] = b"eeg_sample_rate";
const CHANNEL_NAME_ATTR: &[u8] = b"name";

/// Reads the study header (`.sdy`) of a bundle
///
/// Channel names come from the `name` attribute of every `Channel`
/// element in document order; the sampling frequency from the
/// `eeg_sample_rate` attribute of the first `Study` element.
///
/// # Errors
///
/// * `ProfusionError::MalformedHeader` - unreadable XML, no channels, a
///   channel without name, or a missing/unparsable sampling rate
pub fn parse_study_header<P: AsRef<Path>>(path: P) -> Result<CompumedicsHeader> {
    let bytes = fs::read(&path)?;
    let xml = String::from_utf8_lossy(&bytes);
    parse_study_header_str(&xml).map_err(|e| match e {
        ProfusionError::MalformedHeader(reason) => {
            ProfusionError::MalformedHeader(format!("{}: {}", path.as_ref().display(), reason))
        }
        other => other,
    })
}

/// Parses study header XML already held in memory
pub fn parse_study_header_str(xml: &str) -> Result<CompumedicsHeader> {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut ch_names = Vec::new();
    let mut sample_rate: Option<String> = None;
    let mut seen_study = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(e)) | Ok(XmlEvent::Empty(e)) => match e.name().as_ref() {
                CHANNEL_TAG => {
                    let name = attribute(&e, CHANNEL_NAME_ATTR).ok_or_else(|| {
                        ProfusionError::MalformedHeader(format!(
                            "channel #{} has no name",
                            ch_names.len()
                        ))
                    })?;
                    ch_names.push(name);
                }
                STUDY_TAG if !seen_study => {
                    seen_study = true;
                    sample_rate = attribute(&e, SAMPLE_RATE_ATTR);
                }
                _ => {}
            },
            Ok(XmlEvent::Eof) => break,
            Err(e) => {
                return Err(ProfusionError::MalformedHeader(format!(
                    "XML error at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if !seen_study {
        return Err(ProfusionError::MalformedHeader("no Study element".to_string()));
    }
    let sample_rate = sample_rate.ok_or_else(|| {
        ProfusionError::MalformedHeader("Study element has no eeg_sample_rate".to_string())
    })?;
    let sampling_freq: f64 = sample_rate.trim().parse().map_err(|_| {
        ProfusionError::MalformedHeader(format!("invalid sampling rate '{}'", sample_rate))
    })?;
    if !(sampling_freq.is_finite() && sampling_freq > 0.0) {
        return Err(ProfusionError::MalformedHeader(format!(
            "sampling rate must be positive, got {}",
            sampling_freq
        )));
    }
    if ch_names.is_empty() {
        return Err(ProfusionError::MalformedHeader("no Channel element".to_string()));
    }

    log::debug!("{} channel(s): {:?}", ch_names.len(), ch_names);
    log::debug!("Sampling frequency: {}Hz", sampling_freq);

    Ok(CompumedicsHeader {
        n_channels: ch_names.len(),
        ch_names,
        sampling_freq,
    })
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .map(|attr| match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        })
}

/// Reads the segment header (`EEGData.ini`) of a bundle
///
/// # Errors
///
/// * `ProfusionError::MalformedHeader` - a required key is missing or not an integer
pub fn parse_segment_header<P: AsRef<Path>>(path: P) -> Result<SegmentFileHeader> {
    let bytes = fs::read(&path)?;
    let text = String::from_utf8_lossy(&bytes);
    parse_segment_header_str(&text).map_err(|e| match e {
        ProfusionError::MalformedHeader(reason) => {
            ProfusionError::MalformedHeader(format!("{}: {}", path.as_ref().display(), reason))
        }
        other => other,
    })
}

/// Parses segment header `key = value` lines already held in memory
pub fn parse_segment_header_str(text: &str) -> Result<SegmentFileHeader> {
    let mut max_samples: Option<i64> = None;
    let mut n_channels: Option<usize> = None;

    for line in text.lines() {
        let Some((key, value)) = parse_key_value(line) else {
            continue;
        };
        if key == MAX_SAMPLES_KEY {
            max_samples = Some(value.parse().map_err(|_| {
                ProfusionError::MalformedHeader(format!("invalid {} '{}'", MAX_SAMPLES_KEY, value))
            })?);
        } else if key == CHANNEL_COUNT_KEY {
            n_channels = Some(value.parse().map_err(|_| {
                ProfusionError::MalformedHeader(format!("invalid {} '{}'", CHANNEL_COUNT_KEY, value))
            })?);
        }
    }

    let max_samples_per_file = max_samples
        .ok_or_else(|| ProfusionError::MalformedHeader(format!("missing '{}'", MAX_SAMPLES_KEY)))?;
    let n_channels = n_channels
        .ok_or_else(|| ProfusionError::MalformedHeader(format!("missing '{}'", CHANNEL_COUNT_KEY)))?;

    log::debug!("Maximum {} samples for each payload file", max_samples_per_file);
    log::debug!("{} channels in each payload file", n_channels);

    Ok(SegmentFileHeader {
        max_samples_per_file,
        n_channels,
    })
}

/// Compares the channel counts declared by both headers
///
/// # Errors
///
/// * `ProfusionError::Inconsistent` - the counts differ
pub fn check_consistency(study: &CompumedicsHeader, segment: &SegmentFileHeader) -> Result<()> {
    if study.n_channels != segment.n_channels {
        return Err(ProfusionError::Inconsistent(format!(
            "number of channels does not match: {} in study header and {} in segment header",
            study.n_channels, segment.n_channels
        )));
    }
    Ok(())
}
