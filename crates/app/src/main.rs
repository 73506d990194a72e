use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{Parser, Subcommand};
use music_tools_core::{
    audio::write_wav, parse_tempo, playback_rate, render_click_track, volume_gain, AppConfig,
    AudioBackend, AudioSource, BeatDisplay, BeatDisplayUpdate, Metronome, MusicToolsError,
    PeakUpdate, PipelineCoordinator, Settings, SettingsStore, SystemBackend, TrackId,
    TrackLibrary,
};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 44_100;

fn main() -> music_tools_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let store = SettingsStore::new(&cli.settings);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Commands::Metronome {
            bpm,
            accent,
            seconds,
        } => runtime.block_on(run_metronome(&config, &store, bpm.as_deref(), accent, seconds)),
        Commands::ClickTrack {
            bpm,
            accent,
            volume,
            seconds,
            output,
        } => run_click_track(&config, &store, bpm.as_deref(), accent, volume, seconds, &output),
        Commands::Waveform { input, output } => {
            runtime.block_on(run_waveform(&config, input, output.as_deref()))
        }
        Commands::Speed { recorded, target } => run_speed(&config, &store, recorded, target),
    }
}

/// Resolves tempo, accent and volume from the command line, falling back to
/// the last persisted values, and saves whatever was chosen.
fn resolve_settings(
    config: &AppConfig,
    store: &SettingsStore,
    bpm: Option<&str>,
    accent: Option<u32>,
    volume: Option<u8>,
) -> music_tools_core::Result<Settings> {
    let mut settings = store.load();
    if let Some(input) = bpm {
        settings.tempo_bpm = parse_tempo(input, &config.metronome)?;
    }
    if let Some(accent) = accent {
        settings.accent_interval = accent;
    }
    if let Some(volume) = volume {
        settings.volume = volume;
    }
    store.save(&settings);
    Ok(settings)
}

fn duration_arg(seconds: f64) -> music_tools_core::Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        MusicToolsError::InvalidInput("--seconds must be a finite, non-negative number")
    })
}

#[cfg(feature = "device")]
fn live_backend() -> music_tools_core::Result<Arc<dyn AudioBackend>> {
    Ok(Arc::new(music_tools_core::DeviceBackend::open()?))
}

#[cfg(not(feature = "device"))]
fn live_backend() -> music_tools_core::Result<Arc<dyn AudioBackend>> {
    tracing::info!("built without the `device` feature, beats are logged but not played");
    Ok(Arc::new(SystemBackend::new(SAMPLE_RATE)))
}

async fn run_metronome(
    config: &AppConfig,
    store: &SettingsStore,
    bpm: Option<&str>,
    accent: Option<u32>,
    seconds: f64,
) -> music_tools_core::Result<()> {
    let run_for = duration_arg(seconds)?;
    let settings = resolve_settings(config, store, bpm, accent, None)?;
    let (tempo_bpm, accent_interval) = (settings.tempo_bpm, settings.accent_interval);

    let mut metronome = Metronome::new(
        live_backend()?,
        Arc::new(LogDisplay),
        config.metronome.clone(),
        tempo_bpm,
        accent_interval,
    )?;

    metronome.start(tempo_bpm, accent_interval)?;
    tokio::time::sleep(run_for).await;
    metronome.stop()
}

fn run_click_track(
    config: &AppConfig,
    store: &SettingsStore,
    bpm: Option<&str>,
    accent: Option<u32>,
    volume: Option<u8>,
    seconds: f64,
    output: &Path,
) -> music_tools_core::Result<()> {
    let settings = resolve_settings(config, store, bpm, accent, volume)?;
    let mut samples = render_click_track(
        settings.tempo_bpm,
        settings.accent_interval,
        duration_arg(seconds)?.as_secs_f64(),
        SAMPLE_RATE,
        &config.metronome,
    )?;

    let gain = volume_gain(settings.volume);
    samples.iter_mut().for_each(|sample| *sample *= gain);

    write_wav(output, SAMPLE_RATE, &samples)?;
    tracing::info!(
        ?output,
        tempo_bpm = settings.tempo_bpm,
        accent_interval = settings.accent_interval,
        volume = settings.volume,
        "click track written"
    );
    Ok(())
}

async fn run_waveform(
    config: &AppConfig,
    input: PathBuf,
    output: Option<&Path>,
) -> music_tools_core::Result<()> {
    let track = TrackId(0);
    let library = Arc::new(Mutex::new(TrackLibrary::new()));
    if let Ok(mut library) = library.lock() {
        library.insert(track);
        library.set_active(Some(track));
    }

    let backend = Arc::new(SystemBackend::new(SAMPLE_RATE));
    let mut coordinator = PipelineCoordinator::new(backend, library, config.waveform.clone())?;
    let mut extraction = coordinator.extract(AudioSource::File(input.clone()), track)?;

    while let Some(update) = extraction.next().await {
        match update {
            PeakUpdate::Partial(partial) => {
                tracing::debug!(progress = partial.progress_percent, "waveform progress");
            }
            PeakUpdate::Completed(series) => {
                tracing::info!(?input, bars = series.len(), "waveform ready");
                let json = serde_json::to_string_pretty(&series)?;
                match output {
                    Some(path) => std::fs::write(path, json)?,
                    None => println!("{json}"),
                }
            }
            PeakUpdate::Failed(reason) => {
                tracing::warn!(?input, %reason, "waveform extraction failed");
                eprintln!("Waveform unavailable");
                return Err(MusicToolsError::DecodeFailure(reason));
            }
        }
    }
    Ok(())
}

fn run_speed(
    config: &AppConfig,
    store: &SettingsStore,
    recorded: f64,
    target: f64,
) -> music_tools_core::Result<()> {
    let mut settings = store.load();
    settings.recorded_bpm = Some(recorded);
    settings.target_bpm = Some(target);

    match playback_rate(recorded, target, &config.playback) {
        Some(rate) => {
            settings.speed = rate;
            println!("{rate:.2}x");
        }
        None => tracing::warn!(recorded, target, "both tempos must be positive"),
    }

    store.save(&settings);
    Ok(())
}

/// Beat indicator for the terminal.
struct LogDisplay;

impl BeatDisplay for LogDisplay {
    fn show(&self, update: BeatDisplayUpdate) {
        match update {
            BeatDisplayUpdate::Beat {
                number_in_measure,
                accented: true,
            } => tracing::info!("{number_in_measure} *"),
            BeatDisplayUpdate::Beat {
                number_in_measure, ..
            } => tracing::info!("{number_in_measure}"),
            BeatDisplayUpdate::Neutral => tracing::debug!("beat indicator cleared"),
        }
    }

    fn clear_accent(&self) {}
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Metronome and waveform tools", long_about = None)]
struct Cli {
    /// File that remembers tempo, accent and speed between runs.
    #[arg(long, global = true, default_value = "music-tools-settings.json")]
    settings: PathBuf,

    /// Optional JSON file overriding timing and layout constants.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metronome for a fixed duration, logging every beat. Clicks
    /// are audible when built with the `device` feature.
    Metronome {
        /// Tempo in beats per minute; clamped to the configured range.
        #[arg(short, long)]
        bpm: Option<String>,
        /// Accent every N beats, 0 disables accents.
        #[arg(short, long)]
        accent: Option<u32>,
        #[arg(short, long, default_value_t = 10.0)]
        seconds: f64,
    },
    /// Render metronome clicks to a WAV file.
    ClickTrack {
        #[arg(short, long)]
        bpm: Option<String>,
        #[arg(short, long)]
        accent: Option<u32>,
        /// Output level in percent.
        #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=100))]
        volume: Option<u8>,
        #[arg(short, long, default_value_t = 10.0)]
        seconds: f64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Extract peak data from a WAV file.
    Waveform {
        input: PathBuf,
        /// Writes the peaks as JSON here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compute the playback rate that turns one tempo into another.
    Speed {
        #[arg(long)]
        recorded: f64,
        #[arg(long)]
        target: f64,
    },
}
