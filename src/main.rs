use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use stagehand::integration::{
    ChannelAudioSink, PipelineEvent, StagehandConfig, Stagehand, StagehandHandle,
};
use stagehand::llm::{MistralTransport, QuantizationType};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interactive scene editor driven by a local model
#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about)]
struct Args {
    /// Config file (defaults to <config dir>/stagehand/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model id
    #[arg(short, long)]
    model: Option<String>,

    /// Override weight quantization (none, q4k, q4_0, q8_0)
    #[arg(short, long)]
    quantization: Option<QuantizationType>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stagehand=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => StagehandConfig::load(path)?,
        None => StagehandConfig::load_default()?,
    };
    if let Some(model) = args.model {
        config.llm.model_id = model;
    }
    if let Some(quantization) = args.quantization {
        config.llm.quantization = quantization;
    }
    config.validate()?;

    info!(
        "Starting Stagehand with model {} ({})",
        config.llm.model_id, config.llm.quantization
    );

    let transport = Arc::new(MistralTransport::new(config.llm.clone()).await?);
    let (audio, utterances) = ChannelAudioSink::bounded(config.dialogue.audio_queue_size);

    // Playback stand-in: print utterances as they arrive
    std::thread::spawn(move || {
        for utterance in utterances {
            println!("  [speak] {}", utterance);
        }
    });

    let handle = Stagehand::builder(transport)
        .with_config(config)
        .with_audio_sink(Arc::new(audio))
        .build()?
        .start();

    spawn_printers(&handle);

    println!("Type an instruction to edit the scene.");
    println!("Commands: /voice <text>, /simulate [requirement], /stop, /scene, /transcript, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" => break,
            "/stop" => handle.stop()?,
            "/scene" => println!("{}", handle.scene().content),
            "/transcript" => println!("{}", handle.transcript().content),
            "/voice" => {
                handle.submit_voice(rest)?;
            }
            "/simulate" => {
                handle.simulate(rest)?;
            }
            _ => {
                handle.submit_text(line)?;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn spawn_printers(handle: &StagehandHandle) {
    let mut scene_events = handle.scene_events();
    tokio::spawn(async move {
        while let Ok(event) = scene_events.recv().await {
            match event {
                PipelineEvent::TurnStarted { instruction, .. } => {
                    println!("... working on: {}", instruction)
                }
                PipelineEvent::TurnCommitted { revision, message, .. } => {
                    println!("scene revision {}: {}", revision, message)
                }
                PipelineEvent::TurnCompleted { message, .. } => println!("{}", message),
                PipelineEvent::TurnFailed { error, .. } => warn!("scene turn failed: {}", error),
                _ => {}
            }
        }
    });

    let mut scenes = handle.observe_scene();
    tokio::spawn(async move {
        while scenes.changed().await.is_ok() {
            let doc = scenes.borrow_and_update().clone();
            println!("--- scene (revision {}) ---\n{}", doc.revision, doc.content);
        }
    });

    let mut images = handle.observe_images();
    tokio::spawn(async move {
        while images.changed().await.is_ok() {
            if let Some(image) = images.borrow_and_update().clone() {
                println!("image: {} ({})", image.url, image.prompt);
            }
        }
    });
}
