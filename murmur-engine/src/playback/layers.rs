//! Per-layer track management
//!
//! Tracks which track is audible on each layer and holds the pool of
//! prepared source nodes. A track switch ensures the target's buffer is
//! cached, builds or reuses its node, and hands the pair to the crossfade
//! engine; the switch either completes or reports failure, never silently
//! dropped.

use crate::cache::{BufferCache, LoadOptions};
use crate::error::{EngineError, Result};
use crate::host::{AudioHost, NodeId};
use crate::model::{Collection, PhaseState, Track};
use crate::playback::{CrossfadeEngine, CrossfadeParams, VolumeController};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

struct LayerRuntime {
    active_track: Option<String>,
    active_source: Option<NodeId>,
    /// Prepared-but-idle nodes by pool key (`track_id` or
    /// `track_id:variation_id`)
    nodes: HashMap<String, NodeId>,
}

/// Layer manager
pub struct LayerManager {
    host: Arc<AudioHost>,
    cache: Arc<BufferCache>,
    volume: Arc<VolumeController>,
    crossfade: Arc<CrossfadeEngine>,
    runtimes: Mutex<HashMap<String, LayerRuntime>>,
    /// Track catalogue by layer, from the registered collection
    catalog: Mutex<HashMap<String, Vec<Track>>>,
}

impl LayerManager {
    pub fn new(
        host: Arc<AudioHost>,
        cache: Arc<BufferCache>,
        volume: Arc<VolumeController>,
        crossfade: Arc<CrossfadeEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            cache,
            volume,
            crossfade,
            runtimes: Mutex::new(HashMap::new()),
            catalog: Mutex::new(HashMap::new()),
        })
    }

    /// Register a collection: build one playing source per layer at the
    /// initial track and apply initial volumes
    ///
    /// The initial track and volume come from the first phase's captured
    /// state where present, else the collection defaults. A layer whose
    /// initial buffer fails to load is registered without a source; a later
    /// switch can still bring it up.
    pub async fn register_collection(&self, collection: &Collection) -> Result<()> {
        self.clear();

        {
            let mut catalog = self.catalog.lock().unwrap();
            for layer in &collection.layers {
                catalog.insert(layer.name.clone(), layer.tracks.clone());
            }
        }

        let initial_state: Option<&PhaseState> =
            collection.phases.first().and_then(|p| p.state.as_ref());

        for layer in &collection.layers {
            let track = initial_state
                .and_then(|s| s.active_audio.get(&layer.name))
                .and_then(|id| collection.layer_track(&layer.name, id))
                .or_else(|| collection.initial_track(&layer.name));
            let Some(track) = track else {
                debug!(layer = %layer.name, "layer has no tracks; skipping");
                continue;
            };

            let volume = initial_state
                .and_then(|s| s.volumes.get(&layer.name))
                .or_else(|| collection.default_volumes.get(&layer.name))
                .copied()
                .unwrap_or(1.0);
            self.volume.set_volume_ramped(&layer.name, volume, 0.0)?;

            match self.prepare_node(&layer.name, &track.url).await {
                Ok(node) => {
                    self.volume.connect_to_layer(&layer.name, node)?;
                    self.host.backend().start_source(node)?;
                    let mut runtimes = self.runtimes.lock().unwrap();
                    runtimes.insert(
                        layer.name.clone(),
                        LayerRuntime {
                            active_track: Some(track.id.clone()),
                            active_source: Some(node),
                            nodes: HashMap::from([(track.id.clone(), node)]),
                        },
                    );
                }
                Err(error) => {
                    warn!(
                        layer = %layer.name,
                        track = %track.id,
                        %error,
                        "initial track failed to load; layer starts silent"
                    );
                    let mut runtimes = self.runtimes.lock().unwrap();
                    runtimes.insert(
                        layer.name.clone(),
                        LayerRuntime {
                            active_track: None,
                            active_source: None,
                            nodes: HashMap::new(),
                        },
                    );
                }
            }
        }

        info!(
            collection = %collection.id,
            layers = collection.layers.len(),
            "collection registered"
        );
        Ok(())
    }

    /// Currently audible track on a layer
    pub fn active_track(&self, layer: &str) -> Option<String> {
        self.runtimes
            .lock()
            .unwrap()
            .get(layer)
            .and_then(|r| r.active_track.clone())
    }

    /// Switch a layer to another track via crossfade
    ///
    /// Returns `Ok(true)` when the switch completed (or the track was
    /// already active), `Ok(false)` when the crossfade was cancelled or
    /// superseded, and an error for unknown layers/tracks or load failures.
    pub async fn switch_to(&self, layer: &str, track_id: &str, duration_ms: u64) -> Result<bool> {
        self.switch_to_url(layer, track_id, None, duration_ms).await
    }

    /// Switch a layer to a specific variation of a track
    pub async fn switch_to_variation(
        &self,
        layer: &str,
        track_id: &str,
        variation_id: &str,
        duration_ms: u64,
    ) -> Result<bool> {
        self.switch_to_url(layer, track_id, Some(variation_id), duration_ms)
            .await
    }

    async fn switch_to_url(
        &self,
        layer: &str,
        track_id: &str,
        variation_id: Option<&str>,
        duration_ms: u64,
    ) -> Result<bool> {
        let (url, pool_key) = self.resolve(layer, track_id, variation_id)?;

        let (already_active, current_source, pooled) = {
            let runtimes = self.runtimes.lock().unwrap();
            let runtime = runtimes.get(layer).ok_or_else(|| EngineError::NotFound {
                kind: "layer",
                id: layer.to_string(),
            })?;
            (
                runtime.active_track.as_deref() == Some(pool_key.as_str()),
                runtime.active_source,
                runtime.nodes.get(&pool_key).copied(),
            )
        };
        if already_active {
            return Ok(true);
        }

        let target = match pooled {
            Some(node) => node,
            None => self.prepare_node(layer, &url).await?,
        };

        let Some(source) = current_source else {
            // Nothing audible on this layer yet; bring the target up
            // directly, no crossfade needed.
            self.volume.connect_to_layer(layer, target)?;
            self.host.backend().start_source(target)?;
            self.commit_switch(layer, &pool_key, target, None);
            return Ok(true);
        };

        let current_volume = self.volume.get_volume(layer);
        let completed = self
            .crossfade
            .crossfade(CrossfadeParams {
                layer: layer.to_string(),
                source_node: source,
                target_node: target,
                current_volume,
                duration_ms,
                sync_position: true,
                on_progress: None,
            })
            .await;

        if completed {
            self.commit_switch(layer, &pool_key, target, Some(source));
            debug!(layer, track = pool_key, "track switch complete");
            Ok(true)
        } else {
            debug!(layer, track = pool_key, "track switch cancelled");
            Ok(false)
        }
    }

    /// Cancel all crossfades on all layers
    pub fn cancel_all(&self) {
        self.crossfade.cancel_all();
    }

    /// Drop every runtime node and the catalogue
    pub fn clear(&self) {
        let backend = self.host.backend();
        let mut runtimes = self.runtimes.lock().unwrap();
        for runtime in runtimes.values() {
            for &node in runtime.nodes.values() {
                let _ = backend.stop_source(node);
                backend.release(node);
            }
        }
        runtimes.clear();
        self.catalog.lock().unwrap().clear();
    }

    /// Resolve `(url, pool_key)` for a track or variation
    fn resolve(
        &self,
        layer: &str,
        track_id: &str,
        variation_id: Option<&str>,
    ) -> Result<(String, String)> {
        let catalog = self.catalog.lock().unwrap();
        let tracks = catalog.get(layer).ok_or_else(|| EngineError::NotFound {
            kind: "layer",
            id: layer.to_string(),
        })?;
        let track = tracks
            .iter()
            .find(|t| t.id == track_id)
            .ok_or_else(|| EngineError::NotFound {
                kind: "track",
                id: track_id.to_string(),
            })?;

        match variation_id {
            None => Ok((track.url.clone(), track.id.clone())),
            Some(vid) => {
                let variation = track
                    .variations
                    .iter()
                    .find(|v| v.id == vid)
                    .ok_or_else(|| EngineError::NotFound {
                        kind: "variation",
                        id: vid.to_string(),
                    })?;
                Ok((variation.url.clone(), format!("{}:{}", track.id, vid)))
            }
        }
    }

    /// Load the buffer for `url` and create an idle source node
    async fn prepare_node(&self, layer: &str, url: &str) -> Result<NodeId> {
        let buffer = self.cache.load(url, LoadOptions::default()).await?;
        let node = self.host.backend().create_source(buffer);
        debug!(layer, url, node, "prepared source node");
        Ok(node)
    }

    /// Record the new active node, retiring the old one
    fn commit_switch(&self, layer: &str, pool_key: &str, target: NodeId, old: Option<NodeId>) {
        let backend = self.host.backend();
        let mut runtimes = self.runtimes.lock().unwrap();
        let Some(runtime) = runtimes.get_mut(layer) else {
            return;
        };
        if let Some(old) = old {
            runtime.nodes.retain(|_, &mut node| node != old);
            backend.release(old);
        }
        runtime.nodes.insert(pool_key.to_string(), target);
        runtime.active_track = Some(pool_key.to_string());
        runtime.active_source = Some(target);
    }
}
