//! Livevox terminal host: runs one live voice coaching session.
//!
//! ```text
//! livevox [--settings <file>] [--name <athlete>] [--persona <text>] [--save]
//! livevox --list-devices
//! ```
//!
//! Ctrl-C ends the session; a terminal session error exits non-zero.

mod settings;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use livevox_core::{
    audio::device::{list_devices, DeviceDirection},
    LiveConnector, SessionErrorEvent, SessionState, VoiceEngine,
};
use settings::{default_settings_path, load_settings, save_settings};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::info;

const LEVEL_BAR_WIDTH: usize = 30;

#[derive(Debug, Default)]
struct Args {
    settings: Option<PathBuf>,
    persona: Option<String>,
    name: Option<String>,
    list_devices: bool,
    /// Write the merged settings back to the settings file.
    save: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --settings".into());
                };
                parsed.settings = Some(PathBuf::from(v));
            }
            "--persona" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --persona".into());
                };
                parsed.persona = Some(v);
            }
            "--name" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --name".into());
                };
                parsed.name = Some(v);
            }
            "--list-devices" => parsed.list_devices = true,
            "--save" => parsed.save = true,
            "--help" | "-h" => {
                println!(
                    "Usage: livevox [--settings <file.json>] [--name <athlete>] [--persona <text>] [--save]\n       \
                     livevox --list-devices\n\n\
                     The API key is read from LIVEVOX_API_KEY, GEMINI_API_KEY or the settings file."
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(parsed)
}

/// `[#####.....]` style meter for a level in [0, 100].
fn level_bar(level: f32, width: usize) -> String {
    let filled = ((level.clamp(0.0, 100.0) / 100.0) * width as f32).round() as usize;
    format!("[{}{}]", "#".repeat(filled), ".".repeat(width - filled))
}

/// The error event is published on its own channel just before `Closed`,
/// so it may still be queued when the state loop exits.
fn drain_failure(
    errors: &mut broadcast::Receiver<SessionErrorEvent>,
    mut failure: Option<SessionErrorEvent>,
) -> Option<SessionErrorEvent> {
    loop {
        match errors.try_recv() {
            Ok(ev) => failure = Some(ev),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return failure,
        }
    }
}

fn print_devices() {
    let devices = list_devices();
    if devices.is_empty() {
        println!("no audio devices found");
        return;
    }
    for device in devices {
        let direction = match device.direction {
            DeviceDirection::Input => "in ",
            DeviceDirection::Output => "out",
        };
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_loopback_like {
            tags.push("loopback?");
        }
        println!("{direction}  {}  {}", device.name, tags.join(" "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("livevox=info,livevox_core=info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1)).map_err(|e| anyhow::anyhow!(e))?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    if let Some(name) = args.name {
        settings.athlete_name = Some(name);
    }
    if let Some(persona) = args.persona {
        settings.persona = Some(persona);
    }
    settings.normalize();

    if args.save {
        save_settings(&settings_path, &settings)
            .with_context(|| format!("failed to save {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "settings saved");
    }

    let api_key = settings
        .resolve_api_key(|name| std::env::var(name).ok())
        .with_context(|| {
            format!(
                "no API key: set LIVEVOX_API_KEY or apiKey in {}",
                settings_path.display()
            )
        })?;

    let session_config = settings.session_config();
    let engine = VoiceEngine::new(
        session_config.clone(),
        Arc::new(session_config.cpal_backend()),
        Arc::new(LiveConnector::new(settings.live_config(api_key))),
    );

    let mut states = engine.subscribe_state();
    let mut levels = engine.subscribe_level();
    let mut errors = engine.subscribe_errors();

    info!(model = %settings.model, voice = %settings.voice, "livevox starting");
    engine.start_session(Some(settings.system_instruction()))?;

    let mut failure: Option<SessionErrorEvent> = None;
    let mut stopping = false;
    loop {
        tokio::select! {
            biased;

            err = errors.recv() => {
                if let Ok(ev) = err {
                    failure = Some(ev);
                }
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                println!();
                info!("stopping session");
                if let Err(e) = engine.stop_session().await {
                    info!("stop: {e}");
                }
            }
            state = states.recv() => match state {
                Ok(ev) => {
                    println!();
                    match &ev.detail {
                        Some(detail) => println!("session {:?}: {detail}", ev.state),
                        None => println!("session {:?}", ev.state),
                    }
                    if ev.state == SessionState::Active {
                        println!("speak now; Ctrl-C to end");
                    }
                    if ev.state == SessionState::Closed {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            level = levels.recv() => {
                if let Ok(ev) = level {
                    print!("\rmic {} {:>3.0}", level_bar(ev.level, LEVEL_BAR_WIDTH), ev.level);
                    let _ = std::io::stdout().flush();
                }
            },
        }
    }
    failure = drain_failure(&mut errors, failure);

    let diag = engine.diagnostics_snapshot();
    info!(
        frames_sent = diag.frames_sent,
        chunks_scheduled = diag.chunks_scheduled,
        interruptions = diag.interruptions,
        decode_errors = diag.decode_errors,
        "session summary"
    );

    if let Some(err) = failure {
        bail!("session failed ({:?}): {}", err.kind, err.message);
    }
    Ok(())
}
