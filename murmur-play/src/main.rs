//! # murmur-play
//!
//! Minimal command-line player for the murmur session engine: loads a
//! collection from a TOML file, warms the buffer cache, and plays the
//! session on the default audio output, logging engine events as they
//! happen.

use anyhow::{Context, Result};
use clap::Parser;
use murmur_engine::host::CpalBackend;
use murmur_engine::model::Collection;
use murmur_engine::net::HttpTransport;
use murmur_engine::{EngineConfig, EngineEvent, SessionEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "murmur-play")]
#[command(about = "Session-driven generative soundscape player")]
#[command(version)]
struct Args {
    /// Path to a collection TOML file
    collection: PathBuf,

    /// Session duration override in minutes
    #[arg(short, long)]
    duration: Option<u64>,

    /// Phase transition duration override in seconds
    #[arg(short, long)]
    transition: Option<u64>,

    /// Master volume, 0.0 to 1.0
    #[arg(short, long, default_value_t = 1.0)]
    master_volume: f32,

    /// Skip cache warm-up before starting
    #[arg(long)]
    no_preload: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_play=info,murmur_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    info!("loading collection from {:?}", args.collection);

    let toml_str = tokio::fs::read_to_string(&args.collection)
        .await
        .with_context(|| format!("failed to read {:?}", args.collection))?;
    let mut collection: Collection =
        toml::from_str(&toml_str).context("failed to parse collection TOML")?;

    if let Some(minutes) = args.duration {
        collection.session_duration_ms = minutes * 60_000;
    }
    if let Some(seconds) = args.transition {
        collection.transition_duration_ms = seconds * 1_000;
    }

    let config = EngineConfig::default();
    let backend = CpalBackend::new(config.working_sample_rate)
        .context("no usable audio output; is a sound device available?")?;
    let engine = SessionEngine::new(backend, Arc::new(HttpTransport::new()), config)
        .context("failed to assemble engine")?;

    engine.set_master_volume(args.master_volume);
    engine
        .load_collection(collection)
        .await
        .context("failed to load collection")?;

    if !args.no_preload {
        info!("warming buffer cache");
        let loaded = engine
            .preload_collection(Some(Arc::new(|overall, url, percent| {
                if percent >= 100.0 {
                    info!("  loaded {url} ({overall:.0}% overall)");
                }
            })))
            .await;
        let cache = engine.cache().info();
        info!(
            "cache ready: {loaded} buffers, {:.1} MB, {:.0} s of audio",
            cache.total_bytes as f64 / (1024.0 * 1024.0),
            cache.total_duration_secs
        );
    }

    let mut events = engine.subscribe();
    engine.start(true).context("failed to start session")?;
    info!("session started; ctrl-c to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::PhaseChanged { phase_id, .. }) => {
                    info!("phase: {phase_id}");
                }
                Ok(EngineEvent::TransitionStarted { phase_id, duration_ms, .. }) => {
                    info!("transition to {phase_id} over {:.1} s", duration_ms as f64 / 1000.0);
                }
                Ok(EngineEvent::BufferError { url, kind, message, .. }) => {
                    warn!("buffer error ({kind}) for {url}: {message}");
                }
                Ok(EngineEvent::SessionEnded { .. }) => {
                    info!("session complete");
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged; {skipped} events dropped");
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping");
                engine.stop();
                break;
            }
        }
    }

    engine.teardown();
    Ok(())
}
