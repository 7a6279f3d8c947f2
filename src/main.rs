use anyhow::Result;
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use toolsight::camera::{list_cameras, CaptureOpener, NokhwaOpener};
use toolsight::config::ToolSightConfig;
use toolsight::labels::LabelRegistry;
use toolsight::mock::{SimulatedModelLoader, StillImageOpener};
use toolsight::models::{ModelLoader, OnnxModelLoader};
use toolsight::pipeline::ClassificationLoop;
use toolsight::presentation::{ConsoleSink, PresentationSink};

#[derive(Parser)]
#[command(name = "toolsight")]
#[command(about = "Live camera tool classifier with confidence-gated diagrams")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Camera device index (overrides facing preference)
    #[arg(short = 'd', long)]
    camera_device: Option<u32>,

    /// Model graph path or URL
    #[arg(short, long)]
    model_path: Option<String>,

    /// Model metadata path or URL
    #[arg(long)]
    metadata_path: Option<String>,

    /// Classify a still image instead of the camera feed
    #[arg(long)]
    still: Option<PathBuf>,

    /// Use a simulated classifier instead of loading the model
    #[arg(long)]
    simulate: bool,

    /// Start immediately instead of waiting for Enter
    #[arg(long)]
    auto_start: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List capture devices and exit
    #[arg(long)]
    list_cameras: bool,

    /// Load the model, print its classes and exit
    #[arg(long)]
    check_model: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(format!("toolsight={}", log_level))
        .try_init();

    info!("Starting ToolSight");

    let mut config = ToolSightConfig::load(&args.config).await?;
    if let Some(index) = args.camera_device {
        config.camera.device_index = Some(index);
    }
    if let Some(path) = &args.model_path {
        config.model.model_path = path.clone();
    }
    if let Some(path) = &args.metadata_path {
        config.model.metadata_path = path.clone();
    }
    config.validate()?;
    info!("Configuration loaded successfully");

    if args.list_cameras {
        for device in list_cameras()? {
            println!("{}: {}", device.index, device.name);
        }
        return Ok(());
    }

    let registry = LabelRegistry::tools();
    let loader: Box<dyn ModelLoader> = if args.simulate {
        let labels = registry.keys().into_iter().map(str::to_string).collect();
        Box::new(SimulatedModelLoader::new(labels))
    } else {
        Box::new(OnnxModelLoader::new(
            config.model.input_layout,
            config.fetch_timeout(),
        )?)
    };

    if args.check_model {
        return check_model(loader.as_ref(), &config, &registry).await;
    }

    let opener: Box<dyn CaptureOpener> = match &args.still {
        Some(path) => Box::new(StillImageOpener::from_file(path)),
        None => Box::new(NokhwaOpener),
    };

    let sink = Arc::new(ConsoleSink::new());
    let mut detector = ClassificationLoop::new(config.loop_settings(), registry, sink.clone());
    let mut input = spawn_stdin_reader();

    loop {
        if !args.auto_start {
            println!("Press Enter to start the camera (q to quit)");
            match input.recv().await {
                None => return Ok(()),
                Some(line) if is_quit(&line) => return Ok(()),
                Some(_) => {}
            }
        }

        match detector.start(loader.as_ref(), opener.as_ref()).await {
            Ok(()) => break,
            Err(e) => {
                sink.show_status(&format!("Error: {}", e), true);
                if args.auto_start {
                    return Err(e.into());
                }
                // Blocking alert: nothing happens until the user acknowledges
                eprintln!("\nFailed to start: {}\nPress Enter to acknowledge", e);
                if input.recv().await.is_none() {
                    return Ok(());
                }
            }
        }
    }

    println!("Camera running. Press q + Enter or Ctrl-C to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = input.recv() => match line {
                Some(line) if is_quit(&line) => break,
                Some(_) => {}
                None => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    println!();
    match detector.stop().await {
        Some(stats) => info!(
            "Stopped after {} cycles: {} decisions, {} prediction errors",
            stats.cycles, stats.decisions, stats.failures
        ),
        None => error!("Classification loop did not shut down cleanly"),
    }

    Ok(())
}

async fn check_model(
    loader: &dyn ModelLoader,
    config: &ToolSightConfig,
    registry: &LabelRegistry,
) -> Result<()> {
    let settings = config.loop_settings();
    let classifier = loader.initialize(&settings.model, &settings.metadata).await?;

    println!("{} classes:", classifier.class_labels().len());
    for label in classifier.class_labels() {
        match registry.lookup(label) {
            Some(entry) => println!("  {:<10} -> {} ({})", label, entry.display_name, entry.diagram),
            None => println!("  {:<10} -> (not registered)", label),
        }
    }
    Ok(())
}

fn is_quit(line: &str) -> bool {
    matches!(line.trim(), "q" | "Q" | "quit")
}

/// Interactive stdin lives on its own thread so it never holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}
