//! Collection, track and phase types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named audio stream with a pool of interchangeable tracks
///
/// Layer order is meaningful (mix position, UI order), so layers are a
/// sequence rather than a map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    /// Layer name, unique within the collection (e.g. `drone`, `melody`)
    pub name: String,

    /// Tracks selectable on this layer
    pub tracks: Vec<Track>,
}

/// A piece of audio addressable by id and URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Track id, unique within the collection
    pub id: String,

    pub title: String,

    /// Audio URL fetched by the buffer cache
    pub url: String,

    /// Name of the layer this track belongs to
    pub layer: String,

    /// Alternative renderings of the same track
    #[serde(default)]
    pub variations: Vec<Variation>,
}

/// Alternative rendering of a track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variation {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Captured audio state applied when a phase is entered
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    /// Per-layer target volume, `0.0..=1.0`
    #[serde(default)]
    pub volumes: HashMap<String, f32>,

    /// Per-layer selected track id
    #[serde(default)]
    pub active_audio: HashMap<String, String>,
}

/// A named point on the session timeline
///
/// Positions are percent of session duration. When sorted, positions are
/// strictly increasing and the first marker sits at 0 (the loader enforces
/// both).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMarker {
    pub id: String,

    pub name: String,

    /// Position as percent of the session, `0.0..=100.0`
    pub position: f64,

    /// Display colour (hex string, passed through to UI clients)
    #[serde(default)]
    pub color: String,

    /// Locked markers refuse position edits
    #[serde(default)]
    pub locked: bool,

    /// Captured state, applied via crossfade when the phase is entered
    #[serde(default)]
    pub state: Option<PhaseState>,
}

/// A collection of layers, tracks and phases forming one soundscape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Cover image reference, passed through to UI clients
    #[serde(default)]
    pub cover_url: Option<String>,

    /// Ordered layers, each with its track pool
    pub layers: Vec<Layer>,

    /// Phase markers, sorted by position after `prepare_collection`
    pub phases: Vec<PhaseMarker>,

    /// Default session duration (ms)
    pub session_duration_ms: u64,

    /// Default transition duration (ms)
    pub transition_duration_ms: u64,

    /// Layer volumes applied before the first phase sets its own
    #[serde(default)]
    pub default_volumes: HashMap<String, f32>,

    /// Layer track selections applied before the first phase sets its own
    #[serde(default)]
    pub default_tracks: HashMap<String, String>,
}

impl Collection {
    /// Find a layer by name
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Find a track anywhere in the collection
    pub fn track(&self, track_id: &str) -> Option<&Track> {
        self.layers
            .iter()
            .flat_map(|l| l.tracks.iter())
            .find(|t| t.id == track_id)
    }

    /// Find a track within one layer
    pub fn layer_track(&self, layer: &str, track_id: &str) -> Option<&Track> {
        self.layer(layer)
            .and_then(|l| l.tracks.iter().find(|t| t.id == track_id))
    }

    /// Initial track for a layer: default selection, else the layer's first
    pub fn initial_track(&self, layer: &str) -> Option<&Track> {
        let l = self.layer(layer)?;
        if let Some(id) = self.default_tracks.get(layer) {
            if let Some(t) = l.tracks.iter().find(|t| &t.id == id) {
                return Some(t);
            }
        }
        l.tracks.first()
    }

    /// All distinct audio URLs in the collection, in layer order
    ///
    /// Feed this to `BufferCache::preload` to warm the cache before a
    /// session starts.
    pub fn audio_urls(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut urls = Vec::new();
        for layer in &self.layers {
            for track in &layer.tracks {
                if seen.insert(track.url.clone()) {
                    urls.push(track.url.clone());
                }
                for v in &track.variations {
                    if seen.insert(v.url.clone()) {
                        urls.push(v.url.clone());
                    }
                }
            }
        }
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_collection() -> Collection {
        Collection {
            id: "c1".into(),
            name: "Test".into(),
            description: String::new(),
            cover_url: None,
            layers: vec![Layer {
                name: "drone".into(),
                tracks: vec![
                    Track {
                        id: "t1".into(),
                        title: "One".into(),
                        url: "http://audio/one.ogg".into(),
                        layer: "drone".into(),
                        variations: vec![Variation {
                            id: "t1v1".into(),
                            title: "One (soft)".into(),
                            url: "http://audio/one-soft.ogg".into(),
                        }],
                    },
                    Track {
                        id: "t2".into(),
                        title: "Two".into(),
                        url: "http://audio/two.ogg".into(),
                        layer: "drone".into(),
                        variations: vec![],
                    },
                ],
            }],
            phases: vec![],
            session_duration_ms: 60_000,
            transition_duration_ms: 2_000,
            default_volumes: HashMap::new(),
            default_tracks: HashMap::from([("drone".to_string(), "t2".to_string())]),
        }
    }

    #[test]
    fn test_track_lookup() {
        let c = small_collection();
        assert!(c.track("t1").is_some());
        assert!(c.layer_track("drone", "t2").is_some());
        assert!(c.layer_track("melody", "t2").is_none());
        assert!(c.track("nope").is_none());
    }

    #[test]
    fn test_initial_track_prefers_default() {
        let c = small_collection();
        assert_eq!(c.initial_track("drone").unwrap().id, "t2");
    }

    #[test]
    fn test_audio_urls_deduplicated_in_order() {
        let c = small_collection();
        assert_eq!(
            c.audio_urls(),
            vec![
                "http://audio/one.ogg",
                "http://audio/one-soft.ogg",
                "http://audio/two.ogg"
            ]
        );
    }
}
