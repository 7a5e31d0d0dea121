use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use human_bytes::human_bytes;

use super::assembler::SpillAssembler;
use super::broadcast::{broadcast_spill, Broadcaster, CLOSE_FILE, KILL_SOCKET, OPEN_FILE};
use super::config::Config;
use super::constants::{EXTERNAL_FIFO_LENGTH, FILE_CLOSE_OVERHEAD, WORD_SIZE};
use super::error::ControllerError;
use super::hardware::{BootMode, HardwareGateway};
use super::mca::{self, McaArgs};
use super::messages::{Interrupts, PollStatus, Request, RunState};
use super::sink::{OutputFormat, RunFile};
use super::stats::StatsAggregator;

/// The real-time half of the console.
///
/// One instance runs on its own thread. Each loop iteration is one tick:
/// drain the request mailbox, honor kill/reboot/MCA/start edges in priority
/// order, drive the spill assembler while acquiring, and publish a status
/// snapshot for the command thread to poll.
pub struct RunController<G: HardwareGateway> {
    gateway: Arc<Mutex<G>>,
    sink: RunFile,
    broadcaster: Box<dyn Broadcaster>,
    stats: StatsAggregator,
    assembler: SpillAssembler,
    requests: Receiver<Request>,
    interrupts: Interrupts,
    status: Arc<Mutex<PollStatus>>,

    output_directory: PathBuf,
    filename_prefix: String,
    output_title: String,
    next_run_number: u32,

    record_data: bool,
    shm_mode: bool,
    is_quiet: bool,
    debug_mode: bool,
    acq_running: bool,
    mca_running: bool,
    had_error: bool,
    start_pending: bool,
    reboot_pending: bool,
    force_spill: bool,
    run_ctrl_exited: bool,
    mca_pending: Option<McaArgs>,

    start_time: Instant,
    last_spill_time: Duration,
    idle_sleep: Duration,
    residual_wait: Duration,
}

impl<G: HardwareGateway> RunController<G> {
    pub fn new(
        config: &Config,
        gateway: Arc<Mutex<G>>,
        broadcaster: Box<dyn Broadcaster>,
        requests: Receiver<Request>,
        interrupts: Interrupts,
        status: Arc<Mutex<PollStatus>>,
    ) -> Self {
        let mut sink = RunFile::new();
        sink.set_debug(config.debug_mode);
        sink.set_format(OutputFormat::from_id(config.output_format).unwrap_or_default());
        let mut assembler = SpillAssembler::new(config.thresh_words());
        assembler.quiet = config.is_quiet;
        assembler.debug = config.debug_mode;

        RunController {
            gateway,
            sink,
            broadcaster,
            stats: StatsAggregator::new(),
            assembler,
            requests,
            interrupts,
            status,
            output_directory: config.output_directory.clone(),
            filename_prefix: config.filename_prefix.clone(),
            output_title: config.output_title.clone(),
            next_run_number: config.next_run_number,
            record_data: false,
            shm_mode: config.shm_mode,
            is_quiet: config.is_quiet,
            debug_mode: config.debug_mode,
            acq_running: false,
            mca_running: false,
            had_error: false,
            start_pending: false,
            reboot_pending: false,
            force_spill: false,
            run_ctrl_exited: false,
            mca_pending: None,
            start_time: Instant::now(),
            last_spill_time: Duration::ZERO,
            idle_sleep: Duration::from_secs(1),
            residual_wait: Duration::from_secs(1),
        }
    }

    /// Shorten the idle and residual waits; used by tests that run the
    /// controller loop against the crate simulator.
    pub fn set_pacing(&mut self, idle_sleep: Duration, residual_wait: Duration) {
        self.idle_sleep = idle_sleep;
        self.residual_wait = residual_wait;
    }

    /// Bring the crate up: slot discovery, vendor init, boot, and module
    /// synchronization. A failure here is fatal to the process.
    pub fn initialize(&mut self, boot_mode: BootMode) -> Result<(), ControllerError> {
        let mut pif = self.gateway.lock().unwrap();
        pif.discover_slots()?;
        pif.init()?;
        pif.boot(boot_mode)?;

        // Synchronize the modules: the first module leads the clock.
        pif.write_module_param("SYNCH_WAIT", 1, 0)?;
        for module in 0..pif.num_modules() {
            pif.write_module_param("IN_SYNCH", 0, module)?;
        }

        spdlog::info!(
            "Allocating memory to store FIFO data ({} kB)",
            WORD_SIZE * (EXTERNAL_FIFO_LENGTH + 2) * pif.num_modules() / 1024
        );
        Ok(())
    }

    /// The run-control loop. Returns when a kill request is observed while
    /// idle; the operator-facing exit code comes from [PollStatus].
    pub fn run(&mut self) {
        loop {
            self.process_requests();

            // Kill supersedes everything else.
            if self.interrupts.kill_requested() {
                if self.acq_running {
                    self.interrupts.request_stop();
                } else {
                    break;
                }
            }

            if self.reboot_pending {
                if self.acq_running {
                    self.interrupts.request_stop();
                } else {
                    spdlog::info!("Attempting crate reboot");
                    let result = self.gateway.lock().unwrap().boot(BootMode::Full);
                    if let Err(e) = result {
                        spdlog::error!("Crate reboot failed: {e}");
                        self.had_error = true;
                    }
                    self.reboot_pending = false;
                }
            }

            if let Some(args) = self.mca_pending.take() {
                if self.acq_running {
                    self.interrupts.request_stop();
                    self.mca_pending = Some(args);
                } else {
                    self.run_mca(args);
                }
            }

            if self.start_pending && !self.acq_running {
                self.start_list_mode();
                self.start_pending = false;
            } else if self.start_pending && self.acq_running {
                spdlog::warn!("Already running!");
                self.start_pending = false;
            }

            if self.acq_running {
                self.drain();

                if self.interrupts.stop_requested() {
                    self.stop_acquisition();
                }
            }

            self.publish_status();

            // Sleep the run control if idle to reduce CPU utilization.
            if !self.acq_running && self.mca_pending.is_none() {
                std::thread::sleep(self.idle_sleep);
            }
        }

        self.shutdown();
    }

    fn process_requests(&mut self) {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.apply_request(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // The command thread is gone; nothing can reach us.
                    self.interrupts.request_kill();
                    break;
                }
            }
        }
    }

    fn apply_request(&mut self, request: Request) {
        match request {
            Request::StartRun => {
                if self.acq_running || self.mca_running {
                    spdlog::warn!("Cannot start a run while the system is busy");
                    return;
                }
                if self.sink.is_open() {
                    self.close_file(false);
                }
                if self.open_file(false) {
                    self.record_data = true;
                }
                // A failed open degrades to acq-without-record; the start
                // request is still honored.
                self.start_pending = true;
            }
            Request::StartAcq => {
                if self.acq_running {
                    spdlog::warn!("Acquisition is already running");
                } else {
                    self.start_pending = true;
                }
            }
            Request::StopRun => {
                if self.record_data {
                    spdlog::info!(
                        "Run {} time {:.1} s",
                        self.sink.run_number(),
                        self.stats.total_time()
                    );
                }
                self.record_data = false;
            }
            Request::ForceSpill => self.force_spill = true,
            Request::CloseFile => {
                if self.acq_running && self.record_data {
                    spdlog::warn!("Cannot close file while acquisition is running");
                } else {
                    self.close_file(false);
                }
            }
            Request::Reboot => self.reboot_pending = true,
            Request::StartMca(args) => {
                if self.acq_running {
                    spdlog::warn!("Cannot run MCA while acquisition is running");
                } else {
                    self.mca_pending = Some(args);
                }
            }
            Request::SetShm(value) => self.shm_mode = value,
            Request::SetDebug(value) => {
                self.debug_mode = value;
                self.sink.set_debug(value);
                self.assembler.debug = value;
            }
            Request::SetQuiet(value) => {
                self.is_quiet = value;
                self.assembler.quiet = value;
            }
            Request::SetPrefix(prefix) => {
                if self.sink.is_open() {
                    spdlog::warn!("Prefix cannot be changed while a file is open!");
                } else {
                    self.filename_prefix = prefix;
                    self.next_run_number = 1;
                    self.log_next_file();
                }
            }
            Request::SetDirectory(directory) => {
                if self.sink.is_open() {
                    spdlog::warn!("Directory cannot be changed while a file is open!");
                } else {
                    self.output_directory = directory;
                    self.log_next_file();
                }
            }
            Request::SetTitle(title) => {
                if self.sink.is_open() {
                    spdlog::warn!("Run title cannot be changed while a file is open!");
                } else {
                    self.output_title = title;
                }
            }
            Request::SetFacility(facility) => {
                if self.sink.format() != OutputFormat::Pld {
                    spdlog::warn!("Facility may only be changed for pld output format!");
                } else if self.sink.is_open() {
                    spdlog::warn!("Run facility cannot be changed while a file is open!");
                } else {
                    self.sink.set_facility(&facility);
                }
            }
            Request::SetRunNumber(number) => {
                if self.sink.is_open() {
                    spdlog::warn!("Run number cannot be changed while a file is open!");
                } else {
                    self.next_run_number = number;
                    self.log_next_file();
                }
            }
            Request::SetFormat(format) => {
                self.sink.set_format(format);
                if self.sink.is_open() {
                    spdlog::info!("New output format used for new files only");
                }
            }
        }
    }

    fn log_next_file(&mut self) {
        let requested = self.next_run_number;
        let path = RunFile::next_filename(
            &mut self.next_run_number,
            &self.filename_prefix,
            &self.output_directory,
            self.sink.format(),
        );
        if requested != self.next_run_number {
            spdlog::warn!(
                "Run file existed for run {}! Next run number will be {}",
                requested,
                self.next_run_number
            );
        }
        spdlog::info!("Next file will be {:?}", path);
    }

    fn open_file(&mut self, continuation: bool) -> bool {
        open_output_file(
            &mut self.sink,
            self.broadcaster.as_mut(),
            &mut self.stats,
            &self.output_title,
            &mut self.next_run_number,
            &self.filename_prefix,
            &self.output_directory,
            continuation,
        )
    }

    fn close_file(&mut self, continuation: bool) {
        close_output_file(
            &mut self.sink,
            self.broadcaster.as_mut(),
            &mut self.stats,
            &mut self.next_run_number,
            &self.filename_prefix,
            &self.output_directory,
            continuation,
        );
    }

    fn start_list_mode(&mut self) {
        let result = self.gateway.lock().unwrap().start_list_mode();
        match result {
            Ok(()) => {
                if self.record_data {
                    spdlog::info!("Run {} started", self.sink.run_number());
                } else {
                    spdlog::info!("Acq started");
                }
                self.acq_running = true;
                self.start_time = Instant::now();
                self.last_spill_time = Duration::ZERO;
            }
            Err(e) => {
                spdlog::error!("Failed to start list mode run: {e}. Try rebooting the crate");
                self.acq_running = false;
                self.had_error = true;
            }
        }
    }

    /// One drain pass plus the flush of whatever it produced.
    fn drain(&mut self) {
        let force = self.force_spill;
        let mut pif = self.gateway.lock().unwrap();
        let outcome =
            self.assembler
                .drain_once(&mut *pif, &mut self.stats, self.interrupts.stop_flag(), force);
        drop(pif);

        match outcome {
            Ok(None) => {}
            Ok(Some(spill)) => {
                self.force_spill = false;
                let n_words = spill.len();

                if self.record_data && self.sink.is_open() && self.sink.would_exceed_ceiling(n_words)
                {
                    // Rotate before the write so the spill lands whole in
                    // the continuation file.
                    spdlog::info!(
                        "Current filesize is {} bytes",
                        self.sink.size() + FILE_CLOSE_OVERHEAD
                    );
                    spdlog::info!("Opening new file");
                    close_output_file(
                        &mut self.sink,
                        self.broadcaster.as_mut(),
                        &mut self.stats,
                        &mut self.next_run_number,
                        &self.filename_prefix,
                        &self.output_directory,
                        true,
                    );
                    if !open_output_file(
                        &mut self.sink,
                        self.broadcaster.as_mut(),
                        &mut self.stats,
                        &self.output_title,
                        &mut self.next_run_number,
                        &self.filename_prefix,
                        &self.output_directory,
                        true,
                    ) {
                        self.record_data = false;
                        self.had_error = true;
                    }
                }

                if self.record_data {
                    if !self.is_quiet {
                        spdlog::info!("Writing {} words", n_words);
                    }
                    if let Err(e) = self.sink.write(spill) {
                        spdlog::error!("Failed to write spill: {e}");
                        self.had_error = true;
                        self.interrupts.request_stop();
                    }
                }

                let result = if self.shm_mode {
                    broadcast_spill(self.broadcaster.as_mut(), spill, self.debug_mode)
                } else {
                    let packet = self.sink.build_status_packet();
                    self.broadcaster.send(&packet)
                };
                if let Err(e) = result {
                    spdlog::warn!("Failed to broadcast spill: {e}");
                }

                let spill_time = self.start_time.elapsed();
                let duration = spill_time.saturating_sub(self.last_spill_time);
                self.last_spill_time = spill_time;
                self.stats.add_time(duration.as_secs_f64());
            }
            Err(e) => {
                spdlog::error!("Drain aborted: {e}");
                self.force_spill = false;
                self.had_error = true;
                self.interrupts.request_stop();
            }
        }
    }

    /// End the run, flush residual FIFO content, and report per-module
    /// verdicts.
    fn stop_acquisition(&mut self) {
        let end_result = self.gateway.lock().unwrap().end_run();
        if let Err(e) = end_result {
            spdlog::error!("Failed to end the run: {e}");
            self.had_error = true;
        }
        self.interrupts.clear_stop();
        self.acq_running = false;

        let n_cards = self.gateway.lock().unwrap().num_modules();
        for module in 0..n_cards {
            let (active, depth) = {
                let pif = self.gateway.lock().unwrap();
                (pif.run_active(module), pif.fifo_depth(module))
            };
            if active {
                if !self.is_quiet {
                    spdlog::info!("Module {} still has {} words in the FIFO", module, depth);
                }
                // The remaining words may be few; force the flush.
                self.force_spill = true;
                std::thread::sleep(self.residual_wait);
                self.drain();
            }

            if self.gateway.lock().unwrap().run_active(module) {
                spdlog::error!("Run end status in module {}: failed", module);
                self.had_error = true;
            } else {
                spdlog::info!("Run end status in module {}: okay", module);
            }
        }

        if self.record_data {
            spdlog::info!("Run {} stopped", self.sink.run_number());
        } else {
            spdlog::info!("Acq stopped");
        }
    }

    fn run_mca(&mut self, args: McaArgs) {
        let prepared = self.gateway.lock().unwrap().remove_preset_run_length(0);
        if let Err(e) = prepared {
            spdlog::error!("Could not prepare the crate for an MCA run: {e}");
            self.had_error = true;
            return;
        }

        self.mca_running = true;
        self.publish_status();
        match mca::run_mca(&self.gateway, &args, self.interrupts.stop_flag()) {
            Ok(elapsed) => spdlog::info!("MCA run complete after {:.1} s", elapsed),
            Err(e) => {
                spdlog::error!("MCA run failed: {e}");
                self.had_error = true;
            }
        }
        self.interrupts.clear_stop();
        self.mca_running = false;
    }

    fn publish_status(&mut self) {
        let state = if self.interrupts.kill_requested() {
            RunState::Terminating
        } else if self.reboot_pending {
            RunState::Rebooting
        } else if self.mca_running {
            RunState::Mca
        } else if self.acq_running {
            RunState::Acq
        } else {
            RunState::Idle
        };

        let tag = if self.had_error {
            "[ERROR]"
        } else if self.acq_running && self.record_data {
            "[ACQ]"
        } else if self.acq_running {
            "[ACQ-no-record]"
        } else if self.mca_running {
            "[MCA]"
        } else {
            "[IDLE]"
        };

        let mut line = String::from(tag);
        if self.sink.is_open() {
            line.push_str(&format!(" Run {}", self.sink.run_number()));
        }
        line.push_str(&format!(" {:.0}s", self.stats.total_time()));
        line.push_str(&format!(" {}/s", human_bytes(self.stats.total_data_rate())));
        if self.sink.is_open() {
            line.push_str(&format!(
                " {} {}",
                human_bytes(self.sink.size() as f64),
                self.sink.current_path().display()
            ));
        }

        let mut status = self.status.lock().unwrap();
        *status = PollStatus {
            state,
            acq_running: self.acq_running,
            mca_running: self.mca_running,
            record_data: self.record_data,
            shm_mode: self.shm_mode,
            debug_mode: self.debug_mode,
            is_quiet: self.is_quiet,
            file_open: self.sink.is_open(),
            had_error: self.had_error,
            run_ctrl_exited: self.run_ctrl_exited,
            start_pending: self.start_pending,
            reboot_pending: self.reboot_pending,
            force_spill: self.force_spill,
            run_number: self.sink.run_number(),
            next_run_number: self.next_run_number,
            file_size: self.sink.size(),
            filename: self.sink.current_path().display().to_string(),
            output_directory: self.output_directory.clone(),
            filename_prefix: self.filename_prefix.clone(),
            output_title: self.output_title.clone(),
            facility: self.sink.facility().to_string(),
            output_format: self.sink.format(),
            run_time: self.stats.total_time(),
            data_rate: self.stats.total_data_rate(),
            status_line: line,
        };
    }

    /// Ordered teardown: close the file, notify the subscriber, release.
    fn shutdown(&mut self) {
        if self.sink.is_open() {
            self.close_file(false);
        }
        self.record_data = false;
        let _ = self.broadcaster.send(KILL_SOCKET);
        self.run_ctrl_exited = true;
        self.publish_status();
        spdlog::info!("Run control exited");
    }
}

/// Open an output file on the sink and tell the subscriber. Returns false
/// (leaving recording for the caller to disable) when the open fails.
#[allow(clippy::too_many_arguments)]
fn open_output_file(
    sink: &mut RunFile,
    broadcaster: &mut dyn Broadcaster,
    stats: &mut StatsAggregator,
    title: &str,
    next_run_number: &mut u32,
    prefix: &str,
    directory: &Path,
    continuation: bool,
) -> bool {
    if sink.is_open() {
        spdlog::warn!("A file is already open. Close the current file before opening a new one");
        return false;
    }
    if !continuation {
        RunFile::next_filename(next_run_number, prefix, directory, sink.format());
    }
    match sink.open(title, *next_run_number, prefix, directory, continuation) {
        Ok(()) => {
            stats.clear();
            spdlog::info!("Opening output file {:?}", sink.current_path());
            let _ = broadcaster.send(OPEN_FILE);
            true
        }
        Err(e) => {
            spdlog::error!("Failed to open output file: {e}");
            false
        }
    }
}

/// Close the sink's file if one is open. A continuation close keeps the run
/// identity and the statistics for the file that follows.
fn close_output_file(
    sink: &mut RunFile,
    broadcaster: &mut dyn Broadcaster,
    stats: &mut StatsAggregator,
    next_run_number: &mut u32,
    prefix: &str,
    directory: &Path,
    continuation: bool,
) {
    if !sink.is_open() {
        spdlog::info!("No file is open");
        return;
    }
    spdlog::info!("Closing output file");
    let _ = broadcaster.send(CLOSE_FILE);
    if let Err(e) = sink.close(stats.total_time() as f32) {
        spdlog::error!("Failed to close output file: {e}");
    }
    if !continuation {
        stats.clear();
        // Advance the run number past the file that was just written.
        RunFile::next_filename(next_run_number, prefix, directory, sink.format());
    }
}
