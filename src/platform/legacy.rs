use crate::config::LegacyConfig;
use crate::errors::{Result, StreamError};
use crate::process::CommandLine;

/// The host's pre-existing MJPEG daemon, which owns the camera and the HTTP
/// port whenever this pipeline is not running.
pub trait LegacyDaemon: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Controls the daemon through service manager commands.
#[derive(Debug, Clone)]
pub struct ServiceDaemon {
    start: CommandLine,
    stop: CommandLine,
}

impl ServiceDaemon {
    pub fn new(start: CommandLine, stop: CommandLine) -> Self {
        Self { start, stop }
    }

    pub fn from_config(config: &LegacyConfig) -> Result<Self> {
        let parse = |what: &str, line: &str| {
            CommandLine::parse(line)
                .ok_or_else(|| StreamError::Config(format!("Empty legacy daemon {} command", what)))
        };
        Ok(Self::new(
            parse("start", &config.start_command)?,
            parse("stop", &config.stop_command)?,
        ))
    }

    fn run(command: &CommandLine) -> Result<()> {
        log::debug!("Running {}", command);
        let output = command.to_command().output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(StreamError::start_failure(
            "legacy daemon",
            format!(
                "{} exited with {:?}: {}",
                command,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))
    }
}

impl LegacyDaemon for ServiceDaemon {
    fn start(&self) -> Result<()> {
        Self::run(&self.start)
    }

    fn stop(&self) -> Result<()> {
        Self::run(&self.stop)
    }
}
