//! Real audio output backend using cpal
//!
//! The node graph is rendered by a mixer thread into a lock-free ring
//! buffer; the cpal callback only drains the ring, so the real-time thread
//! never touches the graph mutex. The audio clock is the mixer's write
//! head, which is also the clock automation is evaluated against, so
//! scheduled ramps land where callers expect (offset from the speaker by
//! one ring buffer of constant latency).
//!
//! `cpal::Stream` is not `Send`, so a dedicated thread owns it and handles
//! suspend/resume commands.

use crate::audio::PcmBuffer;
use crate::error::{EngineError, Result};
use crate::host::graph::{NodeGraph, NodeId};
use crate::host::AudioBackend;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ring capacity in stereo frames (~46 ms at 44.1 kHz)
const RING_FRAMES: usize = 2048;

/// Frames rendered per graph lock
const RENDER_BLOCK: usize = 256;

enum StreamCommand {
    Play(mpsc::Sender<Result<()>>),
    Pause(mpsc::Sender<Result<()>>),
    Shutdown,
}

/// cpal-backed audio backend
pub struct CpalBackend {
    graph: Arc<Mutex<NodeGraph>>,
    /// Stereo frames written by the mixer thread; the audio clock
    frames_written: Arc<AtomicU64>,
    sample_rate: u32,
    suspended: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    commands: mpsc::Sender<StreamCommand>,
    mixer_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CpalBackend {
    /// Open the default output device and start the render pipeline
    ///
    /// Fails with [`EngineError::Unsupported`] when no output device is
    /// available.
    pub fn new(preferred_rate: u32) -> Result<Arc<Self>> {
        let ring = HeapRb::<f32>::new(RING_FRAMES * 2);
        let (producer, mut consumer) = ring.split();

        // The stream-owner thread builds the device so the !Send stream
        // never leaves it. It reports the negotiated config back before
        // entering its command loop.
        let (commands_tx, commands_rx) = mpsc::channel::<StreamCommand>();
        let (setup_tx, setup_rx) = mpsc::channel::<Result<StreamConfig>>();

        std::thread::Builder::new()
            .name("murmur-audio-out".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = setup_tx.send(Err(EngineError::Unsupported(
                        "no default output device".into(),
                    )));
                    return;
                };

                let config = match best_config(&device, preferred_rate) {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = setup_tx.send(Err(e));
                        return;
                    }
                };
                let channels = config.channels as usize;

                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        // Drain the ring; underruns output silence.
                        for frame in data.chunks_mut(channels) {
                            let left = consumer.try_pop().unwrap_or(0.0);
                            let right = consumer.try_pop().unwrap_or(left);
                            frame[0] = left.clamp(-1.0, 1.0);
                            if channels > 1 {
                                frame[1] = right.clamp(-1.0, 1.0);
                            }
                        }
                    },
                    move |err| {
                        warn!("audio stream error: {err}");
                    },
                    None,
                );

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = setup_tx.send(Err(EngineError::Unsupported(format!(
                            "failed to build output stream: {e}"
                        ))));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = setup_tx.send(Err(EngineError::Unsupported(format!(
                        "failed to start output stream: {e}"
                    ))));
                    return;
                }

                let _ = setup_tx.send(Ok(config.clone()));

                while let Ok(command) = commands_rx.recv() {
                    match command {
                        StreamCommand::Play(ack) => {
                            let result = stream
                                .play()
                                .map_err(|e| EngineError::Host(format!("resume rejected: {e}")));
                            let _ = ack.send(result);
                        }
                        StreamCommand::Pause(ack) => {
                            let result = stream
                                .pause()
                                .map_err(|e| EngineError::Host(format!("suspend rejected: {e}")));
                            let _ = ack.send(result);
                        }
                        StreamCommand::Shutdown => break,
                    }
                }
                debug!("audio output thread exiting");
            })
            .map_err(|e| EngineError::Unsupported(format!("cannot spawn audio thread: {e}")))?;

        let config = setup_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| EngineError::Unsupported("audio device setup timed out".into()))??;
        let sample_rate = config.sample_rate.0;
        info!(
            sample_rate,
            channels = config.channels,
            "audio output started"
        );

        let backend = Arc::new(Self {
            graph: Arc::new(Mutex::new(NodeGraph::new())),
            frames_written: Arc::new(AtomicU64::new(0)),
            sample_rate,
            suspended: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            commands: commands_tx,
            mixer_handle: Mutex::new(None),
        });

        backend.spawn_mixer(producer);
        Ok(backend)
    }

    /// Spawn the mixer thread rendering the graph into the ring
    fn spawn_mixer(self: &Arc<Self>, mut producer: impl Producer<Item = f32> + Observer + Send + 'static) {
        let graph = Arc::clone(&self.graph);
        let frames_written = Arc::clone(&self.frames_written);
        let suspended = Arc::clone(&self.suspended);
        let shutdown = Arc::clone(&self.shutdown);
        let sample_rate = self.sample_rate as f64;

        let handle = std::thread::Builder::new()
            .name("murmur-mixer".into())
            .spawn(move || {
                let mut block = vec![0.0f32; RENDER_BLOCK * 2];
                while !shutdown.load(Ordering::Relaxed) {
                    if suspended.load(Ordering::Relaxed)
                        || producer.vacant_len() < RENDER_BLOCK * 2
                    {
                        std::thread::sleep(Duration::from_millis(2));
                        continue;
                    }

                    let start_frame = frames_written.load(Ordering::Relaxed);
                    {
                        let graph = graph.lock().unwrap();
                        render_block(&graph, start_frame, sample_rate, &mut block);
                    }
                    for &sample in &block {
                        // vacancy checked above; a failed push just drops
                        // the sample on shutdown races
                        let _ = producer.try_push(sample);
                    }
                    frames_written.fetch_add(RENDER_BLOCK as u64, Ordering::Relaxed);
                }
                debug!("mixer thread exiting");
            })
            .expect("spawn mixer thread");
        *self.mixer_handle.lock().unwrap() = Some(handle);
    }
}

/// Render one block of stereo frames from the graph
fn render_block(graph: &NodeGraph, start_frame: u64, sample_rate: f64, out: &mut [f32]) {
    out.fill(0.0);
    let frames = out.len() / 2;

    for (id, source) in graph.playing_sources() {
        let buffer = &source.buffer;
        for i in 0..frames {
            let t = (start_frame + i as u64) as f64 / sample_rate;
            let gain = graph.path_gain(id, t);
            if gain <= 0.0 {
                continue;
            }
            let position = source.position_at(t);
            let frame_idx = (position * buffer.sample_rate as f64) as usize;
            let (l, r) = buffer.frame_at_wrapped(frame_idx);
            out[i * 2] += l * gain;
            out[i * 2 + 1] += r * gain;
        }
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.mixer_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Pick a stereo f32 config, preferring the engine's working rate
fn best_config(device: &cpal::Device, preferred_rate: u32) -> Result<StreamConfig> {
    let mut supported = device
        .supported_output_configs()
        .map_err(|e| EngineError::Unsupported(format!("cannot query device configs: {e}")))?;

    let preferred = supported.find(|c| {
        c.channels() == 2
            && c.sample_format() == SampleFormat::F32
            && c.min_sample_rate().0 <= preferred_rate
            && c.max_sample_rate().0 >= preferred_rate
    });

    if let Some(config) = preferred {
        return Ok(config
            .with_sample_rate(cpal::SampleRate(preferred_rate))
            .config());
    }

    let default = device
        .default_output_config()
        .map_err(|e| EngineError::Unsupported(format!("no default output config: {e}")))?;
    if default.sample_format() != SampleFormat::F32 {
        return Err(EngineError::Unsupported(format!(
            "device sample format {:?} not supported",
            default.sample_format()
        )));
    }
    Ok(default.config())
}

impl AudioBackend for CpalBackend {
    fn now(&self) -> f64 {
        self.frames_written.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn destination(&self) -> NodeId {
        self.graph.lock().unwrap().destination()
    }

    fn create_gain(&self, initial: f32) -> NodeId {
        self.graph.lock().unwrap().create_gain(initial)
    }

    fn create_source(&self, buffer: Arc<PcmBuffer>) -> NodeId {
        self.graph.lock().unwrap().create_source(buffer)
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()> {
        self.graph.lock().unwrap().connect(from, to)
    }

    fn disconnect(&self, node: NodeId) -> Result<()> {
        self.graph.lock().unwrap().disconnect(node)
    }

    fn set_gain_at(&self, node: NodeId, value: f32, at: f64) -> Result<()> {
        self.graph.lock().unwrap().set_gain_at(node, value, at)
    }

    fn ramp_gain_to(&self, node: NodeId, value: f32, end_time: f64) -> Result<()> {
        self.graph.lock().unwrap().ramp_gain_to(node, value, end_time)
    }

    fn cancel_ramps(&self, node: NodeId) -> Result<()> {
        let now = self.now();
        self.graph.lock().unwrap().cancel_ramps(node, now)
    }

    fn gain_value(&self, node: NodeId) -> f32 {
        let now = self.now();
        self.graph.lock().unwrap().gain_value(node, now)
    }

    fn start_source(&self, node: NodeId) -> Result<()> {
        let now = self.now();
        self.graph.lock().unwrap().start_source(node, now)
    }

    fn stop_source(&self, node: NodeId) -> Result<()> {
        let now = self.now();
        self.graph.lock().unwrap().stop_source(node, now)
    }

    fn source_playing(&self, node: NodeId) -> bool {
        self.graph.lock().unwrap().source_playing(node)
    }

    fn source_position(&self, node: NodeId) -> f64 {
        let now = self.now();
        self.graph.lock().unwrap().source_position(node, now)
    }

    fn seek_source(&self, node: NodeId, position_secs: f64) -> Result<()> {
        let now = self.now();
        self.graph
            .lock()
            .unwrap()
            .seek_source(node, position_secs, now)
    }

    fn source_duration(&self, node: NodeId) -> f64 {
        self.graph.lock().unwrap().source_duration(node)
    }

    fn release(&self, node: NodeId) {
        self.graph.lock().unwrap().release(node)
    }

    fn resume(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.commands
            .send(StreamCommand::Play(ack_tx))
            .map_err(|_| EngineError::Host("audio output thread gone".into()))?;
        ack_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| EngineError::Host("resume timed out".into()))??;
        self.suspended.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.commands
            .send(StreamCommand::Pause(ack_tx))
            .map_err(|_| EngineError::Host("audio output thread gone".into()))?;
        ack_rx
            .recv_timeout(Duration::from_secs(2))
            .map_err(|_| EngineError::Host("suspend timed out".into()))??;
        self.suspended.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }
}
