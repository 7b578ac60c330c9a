use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use thirdeye::api::DetectionClient;
use thirdeye::voice::{
    AudioSink, CpalSink, EspeakEngine, LocalEngine, NullSink, SpeechCoordinator, SpeechHandle,
    Voice,
};
use thirdeye::{Config, Daemon};

/// ThirdEye - scene narration client for a remote object-detection service
#[derive(Parser)]
#[command(name = "thirdeye", version, about)]
struct Cli {
    /// Detection service URL (overrides config)
    #[arg(long, env = "THIRDEYE_SERVER_URL")]
    server: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one image for detection and speak the summary
    Detect {
        /// Path to a JPEG image
        image: PathBuf,

        /// Print detections without speaking them
        #[arg(long)]
        quiet: bool,
    },
    /// Speak a piece of text through the configured voice
    Speak {
        /// Text to speak
        text: String,
    },
    /// List the available voices (remote and local)
    Voices,
    /// Show detection service status
    Status,
    /// Toggle the service-global detection flag
    Toggle,
    /// Re-speak the service's last announcement
    Repeat,
    /// Read or set the "announce scene clear" service setting
    SceneClear {
        /// New value; omit to read the current one
        value: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,thirdeye=info",
        1 => "info,thirdeye=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let Some(command) = cli.command else {
        return Ok(Daemon::new(config).run().await?);
    };

    let client = DetectionClient::new(&config.server_url, config.request_timeout())?;

    match command {
        Command::Detect { image, quiet } => detect(&config, &client, &image, quiet).await,
        Command::Speak { text } => {
            let speech = spawn_speech(&config, &client);
            wait_for_voices(&speech).await;
            speech.speak(&text);
            wait_for_quiet(&speech).await;
            speech.shutdown();
            Ok(())
        }
        Command::Voices => {
            let speech = spawn_speech(&config, &client);
            wait_for_voices(&speech).await;
            let snapshot = speech.snapshot();
            if snapshot.voices.is_empty() {
                println!("no voices available");
            }
            for voice in &snapshot.voices {
                let selected = snapshot.selected == Some(voice.id());
                let marker = if selected { "*" } else { " " };
                match voice {
                    Voice::Remote(v) => println!(
                        "{marker} [{:>3}] remote {} ({}) pitch={}",
                        v.id.0,
                        v.name,
                        v.language_codes.join(","),
                        if v.supports_pitch { "yes" } else { "no" },
                    ),
                    Voice::Local(v) => println!(
                        "{marker} [{:>3}] local  {} ({})",
                        v.id.0, v.name, v.language
                    ),
                }
            }
            speech.shutdown();
            Ok(())
        }
        Command::Status => {
            let status = client.status().await?;
            println!("detection_active: {}", status.detection_active);
            println!("model_loaded:     {}", status.model_loaded);
            if let Some(count) = status.class_names_count {
                println!("classes:          {count}");
            }
            if let Some(shape) = status.model_input_shape {
                println!("input_shape:      {shape}");
            }
            Ok(())
        }
        Command::Toggle => {
            let result = client.toggle_detection().await?;
            println!("{}", result.message);
            Ok(())
        }
        Command::Repeat => {
            match client.repeat_last_announcement().await? {
                Some(text) => {
                    println!("{text}");
                    let speech = spawn_speech(&config, &client);
                    wait_for_voices(&speech).await;
                    speech.speak(&text);
                    wait_for_quiet(&speech).await;
                    speech.shutdown();
                }
                None => println!("no previous announcement"),
            }
            Ok(())
        }
        Command::SceneClear { value } => {
            let current = match value {
                Some(v) => client.set_announce_scene_clear(v).await?,
                None => client.announce_scene_clear().await?,
            };
            println!("announce_scene_clear: {current}");
            Ok(())
        }
    }
}

/// One-shot detection of a still image
async fn detect(
    config: &Config,
    client: &DetectionClient,
    image: &PathBuf,
    quiet: bool,
) -> anyhow::Result<()> {
    let jpeg = std::fs::read(image)?;
    let (result, annotated) = thirdeye::capture::process_still(client, jpeg).await?;

    if let Some(bytes) = annotated {
        let out = image.with_extension("annotated.jpg");
        std::fs::write(&out, bytes)?;
        println!("annotated: {}", out.display());
    }

    for line in &result.detections_text {
        println!("{line}");
    }

    if let Some(text) = &result.speech_output {
        println!("summary: {text}");
        if !quiet {
            let speech = spawn_speech(config, client);
            wait_for_voices(&speech).await;
            speech.speak(text);
            wait_for_quiet(&speech).await;
            speech.shutdown();
        }
    }

    Ok(())
}

/// Spawn a coordinator with whatever backends this machine has
fn spawn_speech(config: &Config, client: &DetectionClient) -> SpeechHandle {
    let engine: Option<Arc<dyn LocalEngine>> =
        match EspeakEngine::locate(config.speech.engine_path.clone()) {
            Ok(engine) => Some(Arc::new(engine)),
            Err(e) => {
                tracing::debug!(error = %e, "no local synthesis engine");
                None
            }
        };

    let sink: Arc<dyn AudioSink> = match CpalSink::new() {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            tracing::warn!(error = %e, "audio output unavailable");
            Arc::new(NullSink)
        }
    };

    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            tracing::warn!(%notice, "notice");
        }
    });

    let (handle, _task) = SpeechCoordinator::spawn(
        client.clone(),
        engine,
        sink,
        config.locale.clone(),
        config.speech.rate,
        config.speech.pitch,
        notice_tx,
    );
    handle
}

/// Wait for the voice inventory load to settle
async fn wait_for_voices(speech: &SpeechHandle) {
    while speech.snapshot().is_loading {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for the coordinator to finish speaking (bounded)
async fn wait_for_quiet(speech: &SpeechHandle) {
    // Grace period for the dispatch to start
    tokio::time::sleep(Duration::from_millis(200)).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while speech.is_speaking() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
