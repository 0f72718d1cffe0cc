//! External process supervision: launch, stderr tailing, exit detection,
//! restart under backoff and CPU watchdog.

pub mod command;
pub mod supervisor;
pub mod watchdog;

pub use command::{bitrate_for_dim, compat_rate, CommandLine, EncoderCommands};
pub use supervisor::{
    CpuLimit, ExitReport, LogTail, ManagedProcess, ProcessRole, ProcessSupervisor, RestartPolicy,
};
pub use watchdog::{CpuSampler, CpuWatchdog, ProcStatSampler};
