use std::fs;
use std::path::Path;

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, Event as XmlEvent};
use quick_xml::Reader as XmlReader;

use crate::error::{ProfusionError, Result};
use crate::types::ElectrodePlacement;
use crate::utils::file_name_string;
use crate::HEAD_RADIUS;

/// Label of the non-physical trigger electrode, never placed
pub const TRIGGER_LABEL: &str = "Trigger";

const COMPONENT: &str = "electrode placement";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Label,
    X,
    Y,
}

#[derive(Debug, Default)]
struct RawElectrode {
    label: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Reads one electrode placement document
///
/// Electrodes labelled `Trigger` or absent from `ch_names` are dropped; the
/// rest are normalized with [`normalize_positions`].
///
/// # Errors
///
/// Every failure is `ProfusionError::OptionalComponentFailure`: the
/// document is supplementary and its loss must not abort an import.
pub fn parse_placement_file<P: AsRef<Path>>(path: P, ch_names: &[String]) -> Result<ElectrodePlacement> {
    let path = path.as_ref();
    let name = file_name_string(path);
    log::debug!("Reading electrode placement file {}", path.display());

    let bytes = fs::read(path).map_err(|e| ProfusionError::optional(COMPONENT, format!("{}: {}", name, e)))?;
    parse_placement_str(&name, &String::from_utf8_lossy(&bytes), ch_names)
}

/// Parses a placement document already held in memory
pub fn parse_placement_str(name: &str, xml: &str, ch_names: &[String]) -> Result<ElectrodePlacement> {
    let fail = |reason: String| ProfusionError::optional(COMPONENT, format!("{}: {}", name, reason));

    let electrodes = read_electrodes(xml).map_err(&fail)?;

    let mut kept_names = Vec::new();
    let mut positions = Vec::new();
    for (idx, electrode) in electrodes.into_iter().enumerate() {
        let label = electrode
            .label
            .map(|label| label.trim().to_string())
            .ok_or_else(|| fail(format!("electrode #{} has no Label", idx)))?;

        if label == TRIGGER_LABEL {
            log::debug!("Dropping location of channel '{}' (trigger channel)", label);
            continue;
        }
        if !ch_names.iter().any(|ch| ch == &label) {
            log::debug!("Dropping location of channel '{}' (not in study header)", label);
            continue;
        }

        let x = parse_coordinate(electrode.x.as_deref(), "XCoordinate", &label).map_err(&fail)?;
        let y = parse_coordinate(electrode.y.as_deref(), "YCoordinate", &label).map_err(&fail)?;
        kept_names.push(label);
        positions.push([x, y]);
    }

    normalize_positions(&mut positions).map_err(&fail)?;
    log::debug!("Placement processing complete: {} channels", kept_names.len());

    Ok(ElectrodePlacement {
        name: name.to_string(),
        ch_names: kept_names,
        positions,
    })
}

fn parse_coordinate(value: Option<&str>, field: &str, label: &str) -> std::result::Result<f64, String> {
    let value = value.ok_or_else(|| format!("electrode '{}' has no {}", label, field))?;
    value
        .trim()
        .parse()
        .map_err(|_| format!("electrode '{}' has invalid {} '{}'", label, field, value))
}

fn read_electrodes(xml: &str) -> std::result::Result<Vec<RawElectrode>, String> {
    let mut reader = XmlReader::from_str(xml);

    let mut electrodes = Vec::new();
    let mut current: Option<RawElectrode> = None;
    let mut field: Option<Field> = None;

    loop {
        let value = match reader.read_event() {
            Ok(XmlEvent::Start(e)) => {
                match e.name().as_ref() {
                    b"Electrode" => current = Some(RawElectrode::default()),
                    b"Label" => field = Some(Field::Label),
                    b"XCoordinate" => field = Some(Field::X),
                    b"YCoordinate" => field = Some(Field::Y),
                    _ => field = None,
                }
                continue;
            }
            Ok(XmlEvent::Text(text)) => String::from_utf8_lossy(&text).into_owned(),
            // 实体引用作为独立事件到达
            Ok(XmlEvent::GeneralRef(reference)) => resolve_reference(&reference)?,
            Ok(XmlEvent::End(e)) => {
                if e.name().as_ref() == b"Electrode" {
                    if let Some(electrode) = current.take() {
                        electrodes.push(electrode);
                    }
                }
                field = None;
                continue;
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(format!("XML error at byte {}: {}", reader.buffer_position(), e)),
            _ => continue,
        };

        if let (Some(electrode), Some(field)) = (current.as_mut(), field) {
            let slot = match field {
                Field::Label => &mut electrode.label,
                Field::X => &mut electrode.x,
                Field::Y => &mut electrode.y,
            };
            slot.get_or_insert_with(String::new).push_str(&value);
        }
    }

    Ok(electrodes)
}

fn resolve_reference(reference: &BytesRef<'_>) -> std::result::Result<String, String> {
    if let Some(ch) = reference.resolve_char_ref().map_err(|e| e.to_string())? {
        return Ok(ch.to_string());
    }
    let name = reference.decode().map_err(|e| e.to_string())?;
    resolve_predefined_entity(&name)
        .map(str::to_string)
        .ok_or_else(|| format!("unknown entity reference &{};", name))
}

/// Centers points on their centroid and scales them onto the head radius
///
/// After the call the farthest point lies exactly [`HEAD_RADIUS`] from the
/// origin and every other point keeps its relative distance.
pub fn normalize_positions(points: &mut [[f64; 2]]) -> std::result::Result<(), String> {
    if points.is_empty() {
        return Err("no usable electrode".to_string());
    }

    let n = points.len() as f64;
    let cx = points.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = points.iter().map(|p| p[1]).sum::<f64>() / n;
    for p in points.iter_mut() {
        p[0] -= cx;
        p[1] -= cy;
    }

    let max_norm = points
        .iter()
        .map(|p| p[0].hypot(p[1]))
        .fold(0.0_f64, f64::max);
    if !(max_norm.is_finite() && max_norm > 0.0) {
        return Err(format!("cannot scale electrodes with maximum radius {}", max_norm));
    }

    let scale = HEAD_RADIUS / max_norm;
    for p in points.iter_mut() {
        p[0] *= scale;
        p[1] *= scale;
    }
    Ok(())
}
