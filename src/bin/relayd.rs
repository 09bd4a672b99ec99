//! relayd - multi-camera frame relay daemon
//!
//! This daemon:
//! 1. Loads configuration (file at RELAY_CONFIG, RELAY_* env, CLI flags)
//! 2. Builds the annotator, event notifier and optional push output
//! 3. Starts the configured cameras
//! 4. Serves the HTTP control surface and MJPEG pull transport
//! 5. Stops every worker on Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use frame_relay::{
    api::ApiServer,
    config::{CameraSettings, RelayConfig},
    notify::{MqttNotifier, DEFAULT_TOPIC_PREFIX},
    push, AnnotatorRegistry, Collaborators, DefaultSourceOpener, EventNotifier, LogNotifier,
    SourceDescriptor, StartOutcome, StreamRegistry,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera capture, annotation and frame relay")]
struct Args {
    /// JSON or TOML config file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    api_addr: Option<String>,

    /// MQTT broker for detection events; events are only logged without one.
    #[arg(long)]
    mqtt_broker: Option<String>,

    /// Annotator name.
    #[arg(long)]
    annotator: Option<String>,

    /// Camera to start at boot, as ID=SOURCE (repeatable).
    #[arg(long = "camera", value_name = "ID=SOURCE")]
    cameras: Vec<String>,

    /// Stream annotated frames as RTP/H.264 over UDP.
    #[arg(long)]
    push: bool,

    /// List available annotators and exit.
    #[arg(long)]
    list_annotators: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let annotators = AnnotatorRegistry::with_builtin();
    if args.list_annotators {
        for name in annotators.list() {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut cfg = RelayConfig::load_from(args.config.as_deref())?;
    apply_args(&mut cfg, &args)?;
    cfg.validate()?;

    let annotator = annotators.factory(&cfg.annotator)?;
    let mqtt = match &cfg.mqtt {
        Some(settings) => Some(Arc::new(MqttNotifier::connect(settings)?)),
        None => {
            log::info!("no MQTT broker configured; detection events are logged only");
            None
        }
    };
    let notifier: Arc<dyn EventNotifier> = match &mqtt {
        Some(mqtt) => Arc::clone(mqtt) as Arc<dyn EventNotifier>,
        None => Arc::new(LogNotifier::new(DEFAULT_TOPIC_PREFIX)),
    };

    let mut collaborators = Collaborators::new(
        Arc::new(DefaultSourceOpener::new(cfg.capture.to_settings())),
        annotator,
        notifier,
    );
    if let Some(factory) = push::output_factory(&cfg.push)? {
        collaborators = collaborators.with_push_output(factory, cfg.push.fps);
    }
    let registry = StreamRegistry::new(collaborators, cfg.worker.to_settings());

    for camera in &cfg.cameras {
        match registry.start(&camera.id, camera.source.clone())? {
            StartOutcome::Started => {}
            StartOutcome::AlreadyRunning => log::warn!("[{}] listed twice", camera.id),
            StartOutcome::SourceUnavailable { reason } => {
                log::warn!("[{}] not started: {}", camera.id, reason)
            }
        }
    }

    let api_handle = ApiServer::new(cfg.api.clone(), registry.clone()).spawn()?;
    log::info!(
        "relayd running: annotator={} cameras={:?} api=http://{}",
        cfg.annotator,
        registry.list(),
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping streams...");
    api_handle.stop()?;
    let forced = registry.shutdown();
    if !forced.is_empty() {
        log::warn!("force-released capture for {:?}", forced);
    }
    if let Some(mqtt) = mqtt {
        if let Err(e) = mqtt.disconnect() {
            log::warn!("{}", e);
        }
    }
    Ok(())
}

fn apply_args(cfg: &mut RelayConfig, args: &Args) -> Result<()> {
    if let Some(addr) = &args.api_addr {
        cfg.api.addr = addr.clone();
    }
    if let Some(broker) = &args.mqtt_broker {
        cfg.mqtt.get_or_insert_with(Default::default).broker = broker.clone();
    }
    if let Some(annotator) = &args.annotator {
        cfg.annotator = annotator.clone();
    }
    if args.push {
        cfg.push.enabled = true;
    }
    for entry in &args.cameras {
        let (id, source) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--camera expects ID=SOURCE, got '{}'", entry))?;
        frame_relay::validate_camera_id(id)?;
        cfg.cameras.retain(|camera| camera.id != id);
        cfg.cameras.push(CameraSettings {
            id: id.to_string(),
            source: SourceDescriptor::parse(source),
        });
    }
    Ok(())
}
