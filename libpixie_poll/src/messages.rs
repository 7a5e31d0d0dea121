use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::mca::McaArgs;
use super::sink::OutputFormat;

/// The run controller's externally visible mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Acq,
    Mca,
    Rebooting,
    Terminating,
}

/// Edge requests from the command dispatcher to the run controller.
///
/// Each request carries its payload, so nothing but this mailbox and the
/// [Interrupts] tokens is shared between the two threads. Requests are
/// applied at the top of the controller tick; preconditions are checked
/// authoritatively there, whatever the dispatcher already told the
/// operator.
#[derive(Debug, Clone)]
pub enum Request {
    /// Open a fresh output file, enable recording and start acquisition.
    StartRun,
    /// Start acquisition without touching the output file.
    StartAcq,
    /// Disable recording; pairs with the stop token to end the run.
    StopRun,
    /// Dump the current spill regardless of FIFO thresholds.
    ForceSpill,
    /// Safely close the current output file.
    CloseFile,
    /// Reboot the crate once the system is idle.
    Reboot,
    /// Run the multichannel analyzer.
    StartMca(McaArgs),
    SetShm(bool),
    SetDebug(bool),
    SetQuiet(bool),
    SetPrefix(String),
    SetDirectory(PathBuf),
    SetTitle(String),
    SetFacility(String),
    SetRunNumber(u32),
    SetFormat(OutputFormat),
}

/// Cancellation tokens that must be observable in the middle of a drain,
/// where the mailbox is not polled. `stop` ends the active run (list-mode
/// or MCA); `kill` ends the controller itself.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    stop: Arc<AtomicBool>,
    kill: Arc<AtomicBool>,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// The raw stop flag, handed to the drain's threshold wait.
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.stop
    }

    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::Relaxed);
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.load(Ordering::Relaxed)
    }
}

/// Snapshot of the controller's state, rewritten every tick and polled by
/// the command dispatcher for advisory checks and the `status` display.
#[derive(Debug, Clone)]
pub struct PollStatus {
    pub state: RunState,
    pub acq_running: bool,
    pub mca_running: bool,
    pub record_data: bool,
    pub shm_mode: bool,
    pub debug_mode: bool,
    pub is_quiet: bool,
    pub file_open: bool,
    pub had_error: bool,
    pub run_ctrl_exited: bool,
    pub start_pending: bool,
    pub reboot_pending: bool,
    pub force_spill: bool,
    pub run_number: u32,
    pub next_run_number: u32,
    pub file_size: u64,
    pub filename: String,
    pub output_directory: PathBuf,
    pub filename_prefix: String,
    pub output_title: String,
    pub facility: String,
    pub output_format: OutputFormat,
    pub run_time: f64,
    pub data_rate: f64,
    pub status_line: String,
}

impl Default for PollStatus {
    fn default() -> Self {
        PollStatus {
            state: RunState::Idle,
            acq_running: false,
            mca_running: false,
            record_data: false,
            shm_mode: false,
            debug_mode: false,
            is_quiet: false,
            file_open: false,
            had_error: false,
            run_ctrl_exited: false,
            start_pending: false,
            reboot_pending: false,
            force_spill: false,
            run_number: 0,
            next_run_number: 1,
            file_size: 0,
            filename: String::new(),
            output_directory: PathBuf::from("./"),
            filename_prefix: String::from("run"),
            output_title: String::new(),
            facility: String::new(),
            output_format: OutputFormat::Ldf,
            run_time: 0.0,
            data_rate: 0.0,
            status_line: String::from("[IDLE]"),
        }
    }
}
