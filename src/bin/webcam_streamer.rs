use anyhow::Context;
use picam_streamer::alerts::{LogAlertSink, LogCrashReporter};
use picam_streamer::platform::{ServiceDaemon, SystemHardware};
use picam_streamer::tunnel::LogUpstream;
use picam_streamer::{Collaborators, StreamSupervisor, StreamerConfig};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn usage() -> ! {
    eprintln!("Usage: webcam-streamer [--config <path>] [--print-config]");
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    picam_streamer::init_logging();

    let args: Vec<String> = env::args().collect();
    let mut config_path = StreamerConfig::default_path();
    let mut print_config = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = PathBuf::from(path),
                    None => usage(),
                }
            }
            "--print-config" => print_config = true,
            "--help" | "-h" => usage(),
            other => {
                eprintln!("Unknown argument: {}", other);
                usage();
            }
        }
        i += 1;
    }

    let config = StreamerConfig::load_from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;

    if print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    log::info!(
        "{} {} starting (tier {:?}, compat {:?})",
        picam_streamer::NAME,
        picam_streamer::VERSION,
        config.streaming.tier,
        config.streaming.compatible_mode
    );

    let collaborators = Collaborators {
        hardware: Arc::new(SystemHardware::new(&config.camera)),
        legacy: Arc::new(ServiceDaemon::from_config(&config.legacy)?),
        alerts: Arc::new(LogAlertSink::new(Duration::from_secs(
            config.supervision.alert_dedup_secs,
        ))),
        reporter: Arc::new(LogCrashReporter),
        upstream: Arc::new(LogUpstream),
    };

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("installing signal handler")?;

    let supervisor = StreamSupervisor::new(config, collaborators);
    let pipeline = supervisor.spawn().context("spawning supervisor thread")?;

    let _ = stop_rx.recv();
    log::info!("Shutdown requested");
    supervisor.restore();
    if pipeline.join().is_err() {
        log::error!("Supervisor thread panicked");
    }
    Ok(())
}
