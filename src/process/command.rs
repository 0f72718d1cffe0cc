//! Command lines for the external encoder and helpers.

use crate::config::{EncoderConfig, SubscriptionTier};
use std::fmt;
use std::path::Path;
use std::process::Command;

/// Program plus arguments, kept separate from `std::process::Command` so the
/// exact invocation can be logged, compared and relaunched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Split a whitespace-separated command string. No shell quoting.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append whitespace-separated arguments.
    pub fn args_str(mut self, args: &str) -> Self {
        self.args.extend(args.split_whitespace().map(str::to_string));
        self
    }

    /// Run under `nice -n <niceness>`.
    pub fn niced(self, niceness: Option<i32>) -> Self {
        match niceness {
            Some(n) => {
                let mut args = vec!["-n".to_string(), n.to_string(), self.program];
                args.extend(self.args);
                Self {
                    program: "nice".to_string(),
                    args,
                }
            }
            None => self,
        }
    }

    pub fn contains(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Target bitrate in bits per second for a frame size.
pub fn bitrate_for_dim(width: u32, height: u32) -> u32 {
    let dim = u64::from(width) * u64::from(height);
    if dim <= 480 * 270 {
        400 * 1000
    } else if dim <= 960 * 540 {
        1300 * 1000
    } else if dim <= 1280 * 720 {
        2000 * 1000
    } else {
        3000 * 1000
    }
}

/// Frame rate and bitrate used when re-encoding the legacy daemon's stream.
pub fn compat_rate(tier: SubscriptionTier, width: u32, height: u32) -> (u32, u32) {
    let bitrate = bitrate_for_dim(width, height);
    if tier.has_gateway_access() {
        (25, bitrate)
    } else {
        (5, bitrate / 4)
    }
}

/// Builds encoder invocations that all end in the gateway's RTP input.
pub struct EncoderCommands<'a> {
    config: &'a EncoderConfig,
    gateway_host: &'a str,
}

impl<'a> EncoderCommands<'a> {
    pub fn new(config: &'a EncoderConfig, gateway_host: &'a str) -> Self {
        Self {
            config,
            gateway_host,
        }
    }

    fn base(&self, input_args: &str) -> CommandLine {
        let rtp = format!(
            "rtp://{}:{}?pkt_size={}",
            self.gateway_host, self.config.rtp_port, self.config.packet_size
        );
        CommandLine::new(self.config.binary.to_string_lossy())
            .args_str(input_args)
            .args_str("-bsf dump_extra -an -f rtp")
            .arg(rtp)
    }

    /// H.264 from the camera module arrives on stdin and is copied as-is.
    pub fn native(&self) -> CommandLine {
        self.base("-re -i pipe:0 -flags:v +global_header -c:v copy")
            .niced(self.config.niceness)
    }

    /// Encode a USB capture device, with an MJPEG side stream for the ingest loop.
    pub fn usb(&self, device: &Path, ingest_port: u16) -> CommandLine {
        let bitrate = bitrate_for_dim(640, 480);
        let input = format!(
            "-f v4l2 -s 640x480 -i {} -b:v {} -pix_fmt yuv420p -s 640x480 -r 25 \
             -flags:v +global_header -vcodec h264_omx",
            device.display(),
            bitrate
        );
        self.base(&input)
            .args_str("-c:v mjpeg -q:v 1 -s 640x480 -r 5 -an -f mpjpeg")
            .arg(format!("udp://127.0.0.1:{}", ingest_port))
            .niced(self.config.niceness)
    }

    /// Re-encode an existing MJPEG stream.
    pub fn compat(
        &self,
        stream_url: &str,
        tier: SubscriptionTier,
        width: u32,
        height: u32,
    ) -> CommandLine {
        let (fps, bitrate) = compat_rate(tier, width, height);
        let input = format!(
            "-re -i {} -filter:v fps={} -b:v {} -pix_fmt yuv420p -s {}x{} \
             -flags:v +global_header -vcodec h264_omx",
            stream_url, fps, bitrate, width, height
        );
        self.base(&input).niced(self.config.niceness)
    }
}
