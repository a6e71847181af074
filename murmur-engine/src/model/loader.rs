//! Collection preparation and repair
//!
//! Collections arrive from external loaders (HTTP, disk, test fixtures) and
//! may carry stale phase captures: track ids that were deleted, markers out
//! of order, a first marker that drifted off zero. `prepare_collection`
//! normalises all of that so the runtime never sees an invalid reference.

use crate::model::Collection;
use tracing::warn;

/// Normalise a collection for playback
///
/// Repairs applied, in order:
/// 1. Phase markers are sorted by position and the first marker is forced
///    to position 0.
/// 2. Duplicate marker positions are nudged apart (later marker moved up by
///    one percent step) so boundary detection stays deterministic.
/// 3. Phase-state `active_audio` entries referencing unknown tracks are
///    replaced with the layer's first track, or removed when the layer has
///    no tracks (or does not exist).
/// 4. Phase-state volume entries are clamped to `[0, 1]`.
///
/// Every repair is logged; the collection is returned ready for the layer
/// manager and phase controller.
pub fn prepare_collection(mut collection: Collection) -> Collection {
    collection
        .phases
        .sort_by(|a, b| a.position.partial_cmp(&b.position).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(first) = collection.phases.first_mut() {
        if first.position != 0.0 {
            warn!(
                collection = %collection.id,
                phase = %first.id,
                position = first.position,
                "first phase marker adjusted to position 0"
            );
            first.position = 0.0;
        }
    }

    // Positions must be strictly increasing once sorted.
    for i in 1..collection.phases.len() {
        if collection.phases[i].position <= collection.phases[i - 1].position {
            let bumped = collection.phases[i - 1].position + 1.0;
            warn!(
                collection = %collection.id,
                phase = %collection.phases[i].id,
                from = collection.phases[i].position,
                to = bumped,
                "duplicate phase position nudged"
            );
            collection.phases[i].position = bumped.min(100.0);
        }
    }

    // Repair captured state references against an owned snapshot of the
    // layer/track catalogue (phases are mutated below).
    let layer_tracks: std::collections::HashMap<String, Vec<String>> = collection
        .layers
        .iter()
        .map(|l| {
            (
                l.name.clone(),
                l.tracks.iter().map(|t| t.id.clone()).collect(),
            )
        })
        .collect();
    let track_exists = |layer: &str, track_id: &str| {
        layer_tracks
            .get(layer)
            .map(|tracks| tracks.iter().any(|t| t == track_id))
            .unwrap_or(false)
    };

    for phase in &mut collection.phases {
        let Some(state) = phase.state.as_mut() else {
            continue;
        };

        let mut repaired = Vec::new();
        let mut removed = Vec::new();
        for (layer, track_id) in state.active_audio.iter() {
            if track_exists(layer, track_id) {
                continue;
            }
            let substitute = layer_tracks
                .get(layer)
                .and_then(|tracks| tracks.first().cloned());
            match substitute {
                Some(first) => repaired.push((layer.clone(), first)),
                None => removed.push(layer.clone()),
            }
        }
        for (layer, first) in repaired {
            warn!(
                collection = %collection.id,
                phase = %phase.id,
                layer = %layer,
                substitute = %first,
                "phase capture referenced unknown track; substituted layer's first track"
            );
            state.active_audio.insert(layer, first);
        }
        for layer in removed {
            warn!(
                collection = %collection.id,
                phase = %phase.id,
                layer = %layer,
                "phase capture referenced empty or unknown layer; entry removed"
            );
            state.active_audio.remove(&layer);
        }

        for (layer, v) in state.volumes.iter_mut() {
            if !(0.0..=1.0).contains(v) {
                warn!(
                    collection = %collection.id,
                    phase = %phase.id,
                    layer = %layer,
                    volume = *v,
                    "phase volume clamped to [0, 1]"
                );
                *v = v.clamp(0.0, 1.0);
            }
        }
    }

    collection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Layer, PhaseMarker, PhaseState, Track};
    use std::collections::HashMap;

    fn track(id: &str, layer: &str) -> Track {
        Track {
            id: id.into(),
            title: id.into(),
            url: format!("http://audio/{id}.ogg"),
            layer: layer.into(),
            variations: vec![],
        }
    }

    fn marker(id: &str, position: f64, state: Option<PhaseState>) -> PhaseMarker {
        PhaseMarker {
            id: id.into(),
            name: id.into(),
            position,
            color: String::new(),
            locked: false,
            state,
        }
    }

    fn collection(phases: Vec<PhaseMarker>) -> Collection {
        Collection {
            id: "c".into(),
            name: "c".into(),
            description: String::new(),
            cover_url: None,
            layers: vec![
                Layer {
                    name: "drone".into(),
                    tracks: vec![track("d1", "drone"), track("d2", "drone")],
                },
                Layer {
                    name: "empty".into(),
                    tracks: vec![],
                },
            ],
            phases,
            session_duration_ms: 60_000,
            transition_duration_ms: 1_000,
            default_volumes: HashMap::new(),
            default_tracks: HashMap::new(),
        }
    }

    #[test]
    fn test_phases_sorted_and_first_forced_to_zero() {
        let c = prepare_collection(collection(vec![
            marker("peak", 40.0, None),
            marker("pre-onset", 5.0, None),
        ]));
        assert_eq!(c.phases[0].id, "pre-onset");
        assert_eq!(c.phases[0].position, 0.0);
        assert_eq!(c.phases[1].position, 40.0);
    }

    #[test]
    fn test_duplicate_positions_nudged() {
        let c = prepare_collection(collection(vec![
            marker("a", 0.0, None),
            marker("b", 20.0, None),
            marker("c", 20.0, None),
        ]));
        assert_eq!(c.phases[1].position, 20.0);
        assert_eq!(c.phases[2].position, 21.0);
    }

    #[test]
    fn test_unknown_track_substituted_with_first() {
        let state = PhaseState {
            volumes: HashMap::new(),
            active_audio: HashMap::from([("drone".to_string(), "deleted".to_string())]),
        };
        let c = prepare_collection(collection(vec![marker("onset", 0.0, Some(state))]));
        let repaired = c.phases[0].state.as_ref().unwrap();
        assert_eq!(repaired.active_audio["drone"], "d1");
    }

    #[test]
    fn test_empty_layer_entry_removed() {
        let state = PhaseState {
            volumes: HashMap::new(),
            active_audio: HashMap::from([
                ("empty".to_string(), "ghost".to_string()),
                ("nowhere".to_string(), "ghost".to_string()),
            ]),
        };
        let c = prepare_collection(collection(vec![marker("onset", 0.0, Some(state))]));
        let repaired = c.phases[0].state.as_ref().unwrap();
        assert!(repaired.active_audio.is_empty());
    }

    #[test]
    fn test_valid_reference_untouched() {
        let state = PhaseState {
            volumes: HashMap::from([("drone".to_string(), 1.7)]),
            active_audio: HashMap::from([("drone".to_string(), "d2".to_string())]),
        };
        let c = prepare_collection(collection(vec![marker("onset", 0.0, Some(state))]));
        let repaired = c.phases[0].state.as_ref().unwrap();
        assert_eq!(repaired.active_audio["drone"], "d2");
        assert_eq!(repaired.volumes["drone"], 1.0);
    }
}
