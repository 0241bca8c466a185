pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod probe;
pub mod process;
pub mod report;
pub mod sequencer;
pub mod service;
pub mod shutdown;
pub mod signal;
pub mod startup;

// Re-export commonly used items
pub use config::{create_sample_config, load_config, StackConfig};
pub use error::LaunchError;
pub use events::{
    ConsoleStatusListener, LaunchEvent, LogStatusListener, SharedListener, StatusListener,
};
pub use probe::{ProbeStatus, ReadinessProbe};
pub use process::{ProcessHandle, ProcessState, StopOutcome};
pub use report::{LaunchOutcome, LaunchReport, ServiceReport};
pub use sequencer::{Sequencer, SequencerConfig};
pub use service::{CommandLine, ServiceSpec, Stack};
pub use shutdown::{ShutdownCoordinator, ShutdownSummary};
pub use signal::{interrupt_channel, forward_os_signals, InterruptListener, InterruptTrigger};
pub use startup::{exit_code, Launcher, SessionEnd, StackSession};
