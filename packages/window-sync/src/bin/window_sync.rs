//! Window Sync Demo
//!
//! Runs one window of a small music player. `WINDOW_LABEL=main` owns the
//! player state and accepts secondary windows on `SYNC_ADDR`; any other label
//! connects to it, mirrors the state and drives playback remotely.

use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use window_sync::{
    Bridge, Config, EventBus, PrimaryAgent, SecondaryAgent, StatePatch, StateStore, Store,
    SyncConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,window_sync=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        window = %config.window_label,
        addr = %config.sync_addr,
        namespace = config.namespace.as_deref().unwrap_or(""),
        "Starting window sync demo"
    );

    let bus = EventBus::new();
    let store = player_store()?;

    if config.window_label.is_primary() {
        run_primary(config, bus, store).await
    } else {
        run_secondary(config, bus, store).await
    }
}

/// The shared player store. Every window declares the same shape.
fn player_store() -> Result<Store> {
    let songs = NonZeroUsize::new(20).context("cache capacity must be non-zero")?;

    let store = Store::builder()
        .field("isPlaying", json!(false))
        .field("volume", json!(0.8))
        .field("currentTrack", Value::Null)
        .field("windowSize", json!(20))
        .cache_field_with_hint("cachedSongs", songs, "windowSize")
        .local_field("outputDevice", json!("default"))
        .action("play", |store: Store, _args| async move {
            store.set_local(StatePatch::new().with("isPlaying", json!(true)));
            Ok(())
        })
        .action("pause", |store: Store, _args| async move {
            store.set_local(StatePatch::new().with("isPlaying", json!(false)));
            Ok(())
        })
        .action("setVolume", set_volume)
        .action("playSong", play_song)
        .build()?;

    Ok(store)
}

async fn set_volume(store: Store, args: Vec<Value>) -> Result<()> {
    let volume = args
        .first()
        .and_then(Value::as_f64)
        .context("setVolume expects a number")?;
    anyhow::ensure!((0.0..=1.0).contains(&volume), "volume {volume} out of range");
    store.set_local(StatePatch::new().with("volume", json!(volume)));
    Ok(())
}

async fn play_song(store: Store, args: Vec<Value>) -> Result<()> {
    let id = args
        .first()
        .and_then(Value::as_u64)
        .context("playSong expects a song id")?;
    let song = args.get(1).cloned().unwrap_or(Value::Null);
    store.mutate(|state| {
        if let Some(cache) = state.cache_mut("cachedSongs") {
            cache.insert(id, song.clone());
        }
        state.set("currentTrack", song);
        state.set("isPlaying", json!(true));
    });
    Ok(())
}

async fn run_primary(config: Config, bus: EventBus, store: Store) -> Result<()> {
    let _primary = PrimaryAgent::new(store.clone(), bus.clone())
        .with_config(SyncConfig::default())
        .with_channels(config.channels())
        .attach();

    let listener = TcpListener::bind(config.sync_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.sync_addr))?;
    tracing::info!("Primary window listening on {}", config.sync_addr);

    let mut bridges: Vec<Bridge> = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept secondary window")?;
                let bridge = Bridge::connect(&bus, stream);
                tracing::info!(%peer, bridge = %bridge.id(), "Secondary window connected");
                bridges.retain(|bridge| !bridge.is_finished());
                bridges.push(bridge);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down primary window");
                return Ok(());
            }
        }
    }
}

async fn run_secondary(config: Config, bus: EventBus, store: Store) -> Result<()> {
    let stream = TcpStream::connect(config.sync_addr)
        .await
        .with_context(|| format!("Failed to connect to primary window at {}", config.sync_addr))?;
    let bridge = Bridge::connect(&bus, stream);

    let secondary = SecondaryAgent::new(store.clone(), bus.clone())
        .with_channels(config.channels())
        .attach();

    let set_volume = secondary.remote_action("setVolume");
    let play_song = secondary.remote_action("playSong");

    if let Err(e) = set_volume.call_with((0.5,)).await {
        tracing::warn!(error = %e, "setVolume failed");
    }
    if let Err(e) = play_song
        .call_with((7, json!({ "title": "Clair de Lune" })))
        .await
    {
        tracing::warn!(error = %e, "playSong failed");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let closed = bridge.closed();
    tokio::pin!(closed);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = store.state();
                tracing::info!(
                    hydrated = secondary.is_hydrated(),
                    playing = ?state.data("isPlaying"),
                    volume = ?state.data("volume"),
                    track = ?state.data("currentTrack"),
                    "Mirrored state"
                );
            }
            _ = &mut closed => {
                tracing::warn!("Primary window went away");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down secondary window");
                return Ok(());
            }
        }
    }
}
