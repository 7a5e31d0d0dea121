use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::constants::{CHANNELS_PER_MODULE, CHANNEL_PARAMS, CSRA_BIT_NAMES, MODULE_PARAMS};
use super::hardware::HardwareGateway;
use super::mca::{McaArgs, McaBackend};
use super::messages::{Interrupts, PollStatus, Request};
use super::sink::{OutputFormat, RunFile};

/// Prefix on every operator-facing reply.
pub const SYS_MESSAGE_HEAD: &str = " POLL: ";

const COMMANDS: [&str; 39] = [
    "run", "startacq", "startvme", "stop", "stopacq", "stopvme", "acq", "shm", "spill", "hup",
    "prefix", "fdir", "title", "facility", "runnum", "oform", "close", "clo", "reboot", "mca",
    "dump", "pread", "pmread", "pwrite", "pmwrite", "adjust_offsets", "find_tau", "toggle",
    "toggle_bit", "csr_test", "bit_test", "status", "debug", "quiet", "quit", "exit", "kill",
    "help", "version",
];

/// What the console should do after a command line.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Quit,
}

/// The operator half of the console.
///
/// Parses one command line at a time, performs the advisory state checks
/// against the controller's status snapshot, and signals the run controller
/// through the request mailbox and the interrupt tokens. Parameter I/O goes
/// straight to the gateway, which both threads share; the dispatcher only
/// touches it when the snapshot says the system is idle.
pub struct CommandDispatcher<G: HardwareGateway> {
    requests: Sender<Request>,
    status: Arc<Mutex<PollStatus>>,
    interrupts: Interrupts,
    gateway: Arc<Mutex<G>>,
    poll_wait: Duration,
}

impl<G: HardwareGateway> CommandDispatcher<G> {
    pub fn new(
        requests: Sender<Request>,
        status: Arc<Mutex<PollStatus>>,
        interrupts: Interrupts,
        gateway: Arc<Mutex<G>>,
    ) -> Self {
        CommandDispatcher {
            requests,
            status,
            interrupts,
            gateway,
            poll_wait: Duration::from_secs(1),
        }
    }

    /// Shorten the wait between run-control exit polls; used by tests.
    pub fn set_poll_wait(&mut self, poll_wait: Duration) {
        self.poll_wait = poll_wait;
    }

    /// Verb completion, or parameter-name completion after a parameter I/O
    /// verb. Returns the remainders of the candidate words.
    pub fn tab_complete(&self, line: &str) -> Vec<String> {
        let mut matches = Vec::new();
        if !line.contains(' ') {
            for command in COMMANDS {
                if let Some(rest) = command.strip_prefix(line) {
                    matches.push(String::from(rest));
                }
            }
            return matches;
        }

        let partial = line.rsplit(' ').next().unwrap_or("");
        let params: &[&str] = if line.starts_with("pwrite") || line.starts_with("pread") {
            &CHANNEL_PARAMS
        } else if line.starts_with("pmwrite") || line.starts_with("pmread") {
            &MODULE_PARAMS
        } else {
            &[]
        };
        for param in params {
            if let Some(rest) = param.strip_prefix(partial) {
                matches.push(String::from(rest));
            }
        }
        matches
    }

    /// Interpret one command line.
    pub fn handle_line(&mut self, line: &str) -> Disposition {
        let line = line.trim();
        if line.is_empty() {
            return Disposition::Continue;
        }

        let (cmd, arg) = match line.split_once(' ') {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = arg.split_whitespace().collect();
        let status = self.snapshot();

        match cmd {
            "quit" | "exit" => {
                if status.mca_running {
                    self.reply("Warning! Cannot quit while MCA program is running");
                } else if status.acq_running {
                    self.reply("Warning! Cannot quit while acquisition running");
                } else {
                    self.interrupts.request_kill();
                    self.wait_for_exit();
                    return Disposition::Quit;
                }
            }
            "kill" => {
                if status.acq_running || status.mca_running {
                    self.reply("Sending KILL signal");
                    self.interrupts.request_stop();
                }
                self.interrupts.request_kill();
                self.wait_for_exit();
                return Disposition::Quit;
            }
            "help" | "h" => self.help(),
            "version" | "v" => {
                println!("  pixie_poll v{}", env!("CARGO_PKG_VERSION"));
            }
            "status" => self.print_status(&status),
            "run" => {
                if status.mca_running {
                    self.reply("Warning! Cannot run acquisition while MCA program is running");
                } else if status.acq_running {
                    self.reply("Acquisition is already running");
                } else {
                    self.send(Request::StartRun);
                }
            }
            "startacq" | "startvme" => {
                if status.mca_running {
                    self.reply("Warning! Cannot run acquisition while MCA program is running");
                } else if status.acq_running {
                    self.reply("Acquisition is already running");
                } else {
                    self.send(Request::StartAcq);
                }
            }
            "stop" => {
                if !status.acq_running && !status.mca_running {
                    self.reply("Acquisition is not running");
                } else {
                    self.send(Request::StopRun);
                    self.interrupts.request_stop();
                }
            }
            "stopacq" | "stopvme" => {
                if !status.acq_running && !status.mca_running {
                    self.reply("Acquisition is not running");
                } else {
                    self.interrupts.request_stop();
                }
            }
            "acq" | "shm" => {
                if status.shm_mode {
                    self.reply("Toggling shared-memory mode OFF");
                } else {
                    self.reply("Toggling shared-memory mode ON");
                }
                self.send(Request::SetShm(!status.shm_mode));
            }
            "reboot" => {
                if status.acq_running || status.mca_running {
                    self.reply("Warning! Cannot reboot while acquisition or MCA is running");
                } else {
                    self.send(Request::Reboot);
                }
            }
            "clo" | "close" => {
                if status.mca_running {
                    self.reply("Command not available for MCA run");
                } else if status.acq_running && status.record_data {
                    self.reply("Warning! Cannot close file while acquisition running");
                } else {
                    self.send(Request::CloseFile);
                }
            }
            "hup" | "spill" => {
                if status.mca_running {
                    self.reply("Command not available for MCA run");
                } else if !status.acq_running {
                    self.reply("Acquisition is not running");
                } else {
                    self.send(Request::ForceSpill);
                }
            }
            "debug" => {
                if status.debug_mode {
                    self.reply("Toggling debug mode OFF");
                } else {
                    self.reply("Toggling debug mode ON");
                }
                self.send(Request::SetDebug(!status.debug_mode));
            }
            "quiet" => {
                if status.is_quiet {
                    self.reply("Toggling quiet mode OFF");
                } else {
                    self.reply("Toggling quiet mode ON");
                }
                self.send(Request::SetQuiet(!status.is_quiet));
            }
            "fdir" => {
                if arg.is_empty() {
                    self.reply(format!(
                        "Using output directory '{}'",
                        status.output_directory.display()
                    ));
                } else if status.file_open {
                    self.reply("Warning: Directory cannot be changed while a file is open!");
                } else {
                    let directory = PathBuf::from(arg);
                    self.reply(format!("Set output directory to '{}'", directory.display()));
                    self.log_next_file(&status, &directory, &status.filename_prefix);
                    self.send(Request::SetDirectory(directory));
                }
            }
            "prefix" => {
                if arg.is_empty() {
                    self.reply(format!(
                        "Using output filename prefix '{}'",
                        status.filename_prefix
                    ));
                } else if status.file_open {
                    self.reply("Warning: Prefix cannot be changed while a file is open!");
                } else {
                    self.reply(format!("Set output filename prefix to '{arg}'"));
                    self.log_next_file(&status, &status.output_directory, arg);
                    self.send(Request::SetPrefix(String::from(arg)));
                }
            }
            "title" => {
                if arg.is_empty() {
                    self.reply(format!("Using output file title '{}'", status.output_title));
                } else if status.file_open {
                    self.reply("Warning: Run title cannot be changed while a file is open!");
                } else {
                    self.reply(format!("Set run title to '{arg}'"));
                    self.send(Request::SetTitle(String::from(arg)));
                }
            }
            "facility" => {
                if arg.is_empty() {
                    self.reply(format!("Using output file facility '{}'", status.facility));
                } else if status.output_format != OutputFormat::Pld {
                    self.reply("Facility may only be changed for pld output format!");
                } else if status.file_open {
                    self.reply("Warning: Run facility cannot be changed while a file is open!");
                } else {
                    self.reply(format!("Set run facility to '{arg}'"));
                    self.send(Request::SetFacility(String::from(arg)));
                }
            }
            "runnum" => {
                if arg.is_empty() {
                    self.reply(format!(
                        "Next output file run number '{}' for prefix '{}'",
                        status.next_run_number, status.filename_prefix
                    ));
                } else if status.file_open {
                    self.reply("Warning: Run number cannot be changed while a file is open!");
                } else {
                    match parse_u32(arg) {
                        Some(number) => {
                            self.reply(format!("Set run number to '{number}'"));
                            self.send(Request::SetRunNumber(number));
                        }
                        None => self.reply(format!("Invalid run number '{arg}'")),
                    }
                }
            }
            "oform" => {
                if arg.is_empty() {
                    self.reply(format!(
                        "Using output file format '{}'",
                        status.output_format.id()
                    ));
                } else {
                    match parse_u32(arg).and_then(OutputFormat::from_id) {
                        Some(format) => {
                            self.reply(format!("Set output file format to '{}'", format.id()));
                            if format != OutputFormat::Ldf {
                                println!("  Warning! This output format is experimental and is not recommended for data taking");
                            }
                            self.send(Request::SetFormat(format));
                        }
                        None => {
                            self.reply(format!("Unknown output file format ID '{arg}'"));
                            println!("  Available file formats include:");
                            println!("   0 - .ldf file format (default)");
                            println!("   1 - .pld file format (experimental)");
                            println!("   2 - .root file format (slow, not recommended)");
                        }
                    }
                }
            }
            "mca" | "MCA" => {
                if status.mca_running {
                    self.reply("MCA program is already running");
                } else if status.acq_running {
                    self.reply("Warning! Cannot run MCA program while acquisition is running");
                } else {
                    self.send(Request::StartMca(self.parse_mca_args(&args)));
                }
            }
            "dump" => {
                if status.acq_running || status.mca_running {
                    self.reply("Warning! Cannot dump parameters while acquisition is running");
                } else {
                    let path = if args.is_empty() {
                        PathBuf::from("./Fallback.set")
                    } else {
                        PathBuf::from(args[0])
                    };
                    self.dump_parameters(&path);
                }
            }
            "pread" | "pmread" | "pwrite" | "pmwrite" => {
                self.parameter_io(cmd, &args, &status)
            }
            "adjust_offsets" => {
                if status.acq_running || status.mca_running {
                    self.reply("Warning! Cannot edit parameters while acquisition is running");
                } else if args.is_empty() {
                    self.reply("Invalid number of parameters to adjust_offsets");
                    self.reply(" -SYNTAX- adjust_offsets [module]");
                } else if let Some(module) = parse_usize(args[0]) {
                    let mut pif = self.gateway.lock().unwrap();
                    match pif.adjust_offsets(module).and_then(|_| pif.save_dsp_parameters()) {
                        Ok(()) => self.reply(format!("Adjusted offsets in module {module}")),
                        Err(e) => self.reply(format!("{e}")),
                    }
                } else {
                    self.reply(format!("Invalid module '{}'", args[0]));
                }
            }
            "find_tau" => {
                if status.acq_running || status.mca_running {
                    self.reply("Warning! Cannot edit parameters while acquisition is running");
                } else if args.len() < 2 {
                    self.reply("Invalid number of parameters to find_tau");
                    self.reply(" -SYNTAX- find_tau [module] [channel]");
                } else if let (Some(module), Some(channel)) =
                    (parse_usize(args[0]), parse_usize(args[1]))
                {
                    let result = self.gateway.lock().unwrap().find_tau(module, channel);
                    match result {
                        Ok(tau) => self.reply(format!(
                            "Tau of module {module} channel {channel}: {tau} us"
                        )),
                        Err(e) => self.reply(format!("{e}")),
                    }
                } else {
                    self.reply("Invalid module or channel to find_tau");
                }
            }
            "toggle" => {
                if status.acq_running || status.mca_running {
                    self.reply("Warning! Cannot edit parameters while acquisition is running");
                } else if args.len() < 3 {
                    self.reply("Invalid number of parameters to toggle");
                    self.reply(" -SYNTAX- toggle [module] [channel] [CSRA bit]");
                    self.csra_help();
                } else {
                    self.toggle_bit(&[args[0], args[1], "CHANNEL_CSRA", args[2]]);
                }
            }
            "toggle_bit" => {
                if status.acq_running || status.mca_running {
                    self.reply("Warning! Cannot edit parameters while acquisition is running");
                } else if args.len() < 4 {
                    self.reply("Invalid number of parameters to toggle_bit");
                    self.reply(" -SYNTAX- toggle_bit [module] [channel] [parameter] [bit]");
                } else {
                    self.toggle_bit(&args);
                }
            }
            "csr_test" => {
                if args.is_empty() {
                    self.reply("Invalid number of parameters to csr_test");
                    self.reply(" -SYNTAX- csr_test [number]");
                } else if let Some(value) = parse_u32(args[0]) {
                    for (bit, name) in CSRA_BIT_NAMES.iter().enumerate() {
                        if value & (1 << bit) != 0 {
                            println!("   bit {bit:2}: {name}");
                        }
                    }
                } else {
                    self.reply(format!("Invalid number '{}'", args[0]));
                }
            }
            "bit_test" => {
                if args.len() < 2 {
                    self.reply("Invalid number of parameters to bit_test");
                    self.reply(" -SYNTAX- bit_test [num_bits] [number]");
                } else if let (Some(num_bits), Some(value)) =
                    (parse_u32(args[0]), parse_u32(args[1]))
                {
                    for bit in 0..num_bits.min(32) {
                        if value & (1 << bit) != 0 {
                            println!("   bit {bit} is set");
                        }
                    }
                } else {
                    self.reply("Invalid arguments to bit_test");
                }
            }
            _ => self.reply(format!("Unknown command '{cmd}'")),
        }

        Disposition::Continue
    }

    fn snapshot(&self) -> PollStatus {
        self.status.lock().unwrap().clone()
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            self.reply("Run control is not listening!");
        }
    }

    fn reply(&self, message: impl std::fmt::Display) {
        println!("{SYS_MESSAGE_HEAD}{message}");
    }

    fn wait_for_exit(&self) {
        while !self.status.lock().unwrap().run_ctrl_exited {
            std::thread::sleep(self.poll_wait);
        }
    }

    fn log_next_file(&self, status: &PollStatus, directory: &std::path::Path, prefix: &str) {
        let mut run_number = status.next_run_number;
        let path = RunFile::next_filename(&mut run_number, prefix, directory, status.output_format);
        if run_number != status.next_run_number {
            self.reply(format!(
                "Warning: Run file existed for run {}! Next run number will be {}",
                status.next_run_number, run_number
            ));
        }
        self.reply(format!("Next file will be '{}'", path.display()));
    }

    /// `mca [root|damm] [time] [basename]`. The first token doubles as the
    /// time when it names no backend; a missing or zero time means the
    /// 10-second default, a negative time runs until stopped.
    fn parse_mca_args(&self, args: &[&str]) -> McaArgs {
        let mut backend = McaBackend::Damm;
        let mut total_time: i64 = 0;
        let mut basename = String::from("MCA");

        if !args.is_empty() {
            match McaBackend::from_arg(args[0]) {
                Some(parsed) => backend = parsed,
                None => total_time = args[0].parse().unwrap_or(0),
            }
            if args.len() >= 2 {
                if total_time == 0 {
                    total_time = args[1].parse().unwrap_or(0);
                } else {
                    basename = String::from(args[1]);
                }
                if args.len() >= 3 {
                    basename = String::from(args[2]);
                }
            }
        }
        if total_time == 0 {
            total_time = 10;
            self.reply("Using default MCA time of 10 seconds");
        }

        McaArgs {
            backend,
            duration: (total_time > 0).then(|| Duration::from_secs(total_time as u64)),
            basename,
        }
    }

    fn parameter_io(&self, cmd: &str, args: &[&str], status: &PollStatus) {
        if status.acq_running || status.mca_running {
            self.reply("Warning! Cannot edit parameters while acquisition is running");
            return;
        }
        if !args.is_empty() && args[0] == "help" {
            match cmd {
                "pread" | "pwrite" => self.pchan_help(),
                _ => self.pmod_help(),
            }
            return;
        }

        match cmd {
            "pread" => {
                if args.len() < 3 {
                    self.reply("Invalid number of parameters to pread");
                    self.reply(" -SYNTAX- pread [module] [channel] [parameter]");
                    return;
                }
                match (parse_usize(args[0]), parse_usize(args[1])) {
                    (Some(module), Some(channel)) => {
                        let result = self
                            .gateway
                            .lock()
                            .unwrap()
                            .read_channel_param(args[2], module, channel);
                        match result {
                            Ok(value) => self.reply(format!(
                                "{} in module {} channel {}: {}",
                                args[2], module, channel, value
                            )),
                            Err(e) => self.reply(format!("{e}")),
                        }
                    }
                    _ => self.reply("Invalid module or channel to pread"),
                }
            }
            "pmread" => {
                if args.len() < 2 {
                    self.reply("Invalid number of parameters to pmread");
                    self.reply(" -SYNTAX- pmread [module] [parameter]");
                    return;
                }
                match parse_usize(args[0]) {
                    Some(module) => {
                        let result = self
                            .gateway
                            .lock()
                            .unwrap()
                            .read_module_param(args[1], module);
                        match result {
                            Ok(value) => self.reply(format!(
                                "{} in module {}: {} (0x{:x})",
                                args[1], module, value, value
                            )),
                            Err(e) => self.reply(format!("{e}")),
                        }
                    }
                    None => self.reply("Invalid module to pmread"),
                }
            }
            "pwrite" => {
                if args.len() < 4 {
                    self.reply("Invalid number of parameters to pwrite");
                    self.reply(" -SYNTAX- pwrite [module] [channel] [parameter] [value]");
                    return;
                }
                match (
                    parse_usize(args[0]),
                    parse_usize(args[1]),
                    args[3].parse::<f64>().ok(),
                ) {
                    (Some(module), Some(channel), Some(value)) => {
                        let mut pif = self.gateway.lock().unwrap();
                        let result = pif
                            .write_channel_param(args[2], value, module, channel)
                            .and_then(|_| pif.save_dsp_parameters());
                        match result {
                            Ok(()) => self.reply(format!(
                                "Set {} in module {} channel {} to {}",
                                args[2], module, channel, value
                            )),
                            Err(e) => self.reply(format!("{e}")),
                        }
                    }
                    _ => self.reply("Invalid arguments to pwrite"),
                }
            }
            "pmwrite" => {
                if args.len() < 3 {
                    self.reply("Invalid number of parameters to pmwrite");
                    self.reply(" -SYNTAX- pmwrite [module] [parameter] [value]");
                    return;
                }
                match (parse_usize(args[0]), parse_u32(args[2])) {
                    (Some(module), Some(value)) => {
                        let mut pif = self.gateway.lock().unwrap();
                        let result = pif
                            .write_module_param(args[1], value, module)
                            .and_then(|_| pif.save_dsp_parameters());
                        match result {
                            Ok(()) => self.reply(format!(
                                "Set {} in module {} to {} (0x{:x})",
                                args[1], module, value, value
                            )),
                            Err(e) => self.reply(format!("{e}")),
                        }
                    }
                    _ => self.reply("Invalid arguments to pmwrite"),
                }
            }
            _ => unreachable!(),
        }
    }

    /// `[module] [channel] [parameter] [bit]` with the parameter already
    /// resolved for the CSRA shorthand.
    fn toggle_bit(&self, args: &[&str]) {
        let (module, channel, bit) = match (
            parse_usize(args[0]),
            parse_usize(args[1]),
            parse_u32(args[3]),
        ) {
            (Some(module), Some(channel), Some(bit)) if bit < 32 => (module, channel, bit),
            _ => {
                self.reply("Invalid arguments to toggle");
                return;
            }
        };
        let param = args[2];

        let mut pif = self.gateway.lock().unwrap();
        let result = pif.read_channel_param(param, module, channel).and_then(|old| {
            let new = (old as u32 ^ (1 << bit)) as f64;
            pif.write_channel_param(param, new, module, channel)?;
            pif.save_dsp_parameters()?;
            Ok((old as u32, new as u32))
        });
        match result {
            Ok((old, new)) => {
                self.reply(format!(
                    "Toggled bit {bit} of {param} in module {module} channel {channel}: 0x{old:x} -> 0x{new:x}"
                ));
                if param == "CHANNEL_CSRA" {
                    if let Some(name) = CSRA_BIT_NAMES.get(bit as usize) {
                        self.reply(format!("Bit {bit} is '{name}'"));
                    }
                }
            }
            Err(e) => self.reply(format!("{e}")),
        }
    }

    /// Write every channel and module parameter as plain text lines.
    fn dump_parameters(&self, path: &std::path::Path) {
        let file = match std::fs::File::create(path) {
            Ok(file) => file,
            Err(_) => {
                self.reply(format!("Failed to open output file '{}'", path.display()));
                self.reply("Check that the path is correct");
                return;
            }
        };
        let mut writer = std::io::BufWriter::new(file);
        let pif = self.gateway.lock().unwrap();

        let mut failed = false;
        for param in CHANNEL_PARAMS {
            for module in 0..pif.num_modules() {
                for channel in 0..CHANNELS_PER_MODULE {
                    match pif.read_channel_param(param, module, channel) {
                        Ok(value) => {
                            if writeln!(writer, "{param} {module} {channel} {value}").is_err() {
                                failed = true;
                            }
                        }
                        Err(e) => self.reply(format!("{e}")),
                    }
                }
            }
        }
        for param in MODULE_PARAMS {
            for module in 0..pif.num_modules() {
                match pif.read_module_param(param, module) {
                    Ok(value) => {
                        if writeln!(writer, "{param} {module} {value}").is_err() {
                            failed = true;
                        }
                    }
                    Err(e) => self.reply(format!("{e}")),
                }
            }
        }

        if failed || writer.flush().is_err() {
            self.reply(format!(
                "Errors while writing parameter file '{}'",
                path.display()
            ));
        } else {
            self.reply(format!(
                "Successfully wrote output parameter file '{}'",
                path.display()
            ));
        }
    }

    fn print_status(&self, status: &PollStatus) {
        println!("  Poll Run Status:");
        println!("   Acq starting    - {}", yesno(status.start_pending));
        println!("   Acq running     - {}", yesno(status.acq_running));
        println!("   Shared memory   - {}", yesno(status.shm_mode));
        println!("   Write to disk   - {}", yesno(status.record_data));
        println!("   File open       - {}", yesno(status.file_open));
        println!("   Rebooting       - {}", yesno(status.reboot_pending));
        println!("   Force Spill     - {}", yesno(status.force_spill));
        println!("   Do MCA run      - {}", yesno(status.mca_running));
        println!("   Had error       - {}", yesno(status.had_error));
        println!("   Run ctrl Exited - {}", yesno(status.run_ctrl_exited));
        println!();
        println!("  Poll Options:");
        println!("   Is quiet    - {}", yesno(status.is_quiet));
        println!("   Debug mode  - {}", yesno(status.debug_mode));
        println!();
        println!("  {}", status.status_line);
    }

    fn help(&self) {
        println!("  Help:");
        println!("   run              - Start data acquisition and record data to disk");
        println!("   stop             - Stop data acquisition and stop recording data to disk");
        println!("   startacq         - Start data acquisition");
        println!("   stopacq          - Stop data acquisition");
        println!("   acq (shm)        - Toggle \"shared-memory\" mode");
        println!("   spill (hup)      - Force dump of current spill");
        println!("   prefix [name]    - Set the output filename prefix");
        println!("   fdir [path]      - Set the output file directory");
        println!("   title [runTitle] - Set the title of the current run");
        println!("   facility [name]  - Set the facility name (pld format only)");
        println!("   runnum [number]  - Set the next run number");
        println!("   oform [0|1|2]    - Set the format of the output file");
        println!("   close (clo)      - Safely close the current data output file");
        println!("   reboot           - Reboot the crate");
        println!("   mca [root|damm] [time] [filename] - Run the multichannel analyzer");
        println!("   dump [filename]                   - Dump crate settings to file");
        println!("   pread [mod] [chan] [param]        - Read a channel parameter");
        println!("   pmread [mod] [param]              - Read a module parameter");
        println!("   pwrite [mod] [chan] [param] [val] - Write a channel parameter");
        println!("   pmwrite [mod] [param] [val]       - Write a module parameter");
        println!("   adjust_offsets [module]           - Adjust the baselines of a module");
        println!("   find_tau [module] [channel]       - Measure a channel's decay constant");
        println!("   toggle [mod] [chan] [bit]         - Toggle a CHANNEL_CSRA bit");
        println!("   toggle_bit [mod] [chan] [param] [bit] - Toggle any parameter bit");
        println!("   csr_test [number]                 - Decode CSRA bits of a value");
        println!("   bit_test [num_bits] [number]      - Display active bits of a value");
        println!("   status           - Display system status information");
        println!("   debug            - Toggle debug mode");
        println!("   quiet            - Toggle quiet mode");
        println!("   quit             - Close the program");
        println!("   help (h)         - Display this dialogue");
        println!("   version (v)      - Display version information");
    }

    fn pchan_help(&self) {
        println!("  Valid channel parameters:");
        for param in CHANNEL_PARAMS {
            println!("   {param}");
        }
    }

    fn pmod_help(&self) {
        println!("  Valid module parameters:");
        for param in MODULE_PARAMS {
            println!("   {param}");
        }
    }

    fn csra_help(&self) {
        println!("  CHANNEL_CSRA bits:");
        for (bit, name) in CSRA_BIT_NAMES.iter().enumerate() {
            println!("   {bit:2} - {name}");
        }
    }
}

/// Decimal unless prefixed `0x`.
fn parse_u32(arg: &str) -> Option<u32> {
    match arg.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => arg.parse().ok(),
    }
}

fn parse_usize(arg: &str) -> Option<usize> {
    parse_u32(arg).map(|value| value as usize)
}

fn yesno(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::BootMode;
    use crate::mock::MockCrate;
    use std::sync::mpsc::{channel, Receiver};

    struct Harness {
        dispatcher: CommandDispatcher<MockCrate>,
        requests: Receiver<Request>,
        status: Arc<Mutex<PollStatus>>,
        interrupts: Interrupts,
        gateway: Arc<Mutex<MockCrate>>,
    }

    fn harness() -> Harness {
        let mut pif = MockCrate::new(vec![2, 3]);
        pif.discover_slots().unwrap();
        pif.init().unwrap();
        pif.boot(BootMode::Full).unwrap();
        let gateway = Arc::new(Mutex::new(pif));

        let (tx, rx) = channel();
        let status = Arc::new(Mutex::new(PollStatus::default()));
        let interrupts = Interrupts::new();
        let mut dispatcher =
            CommandDispatcher::new(tx, status.clone(), interrupts.clone(), gateway.clone());
        dispatcher.set_poll_wait(Duration::from_millis(1));
        Harness {
            dispatcher,
            requests: rx,
            status,
            interrupts,
            gateway,
        }
    }

    impl Harness {
        fn set_status(&self, update: impl FnOnce(&mut PollStatus)) {
            update(&mut self.status.lock().unwrap());
        }
    }

    #[test]
    fn test_run_requests_a_run_when_idle() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle_line("run"), Disposition::Continue);
        assert!(matches!(h.requests.try_recv(), Ok(Request::StartRun)));
    }

    #[test]
    fn test_run_rejected_while_running() {
        let mut h = harness();
        h.set_status(|s| s.acq_running = true);
        h.dispatcher.handle_line("run");
        assert!(h.requests.try_recv().is_err());
    }

    #[test]
    fn test_stop_sets_token_and_request() {
        let mut h = harness();
        h.set_status(|s| s.acq_running = true);
        h.dispatcher.handle_line("stop");
        assert!(matches!(h.requests.try_recv(), Ok(Request::StopRun)));
        assert!(h.interrupts.stop_requested());
    }

    #[test]
    fn test_stop_rejected_when_idle() {
        let mut h = harness();
        h.dispatcher.handle_line("stop");
        assert!(h.requests.try_recv().is_err());
        assert!(!h.interrupts.stop_requested());
    }

    #[test]
    fn test_shm_toggle_round_trip() {
        let mut h = harness();
        h.dispatcher.handle_line("acq");
        assert!(matches!(h.requests.try_recv(), Ok(Request::SetShm(true))));
        h.set_status(|s| s.shm_mode = true);
        h.dispatcher.handle_line("shm");
        assert!(matches!(h.requests.try_recv(), Ok(Request::SetShm(false))));
    }

    #[test]
    fn test_quit_rejected_while_running() {
        let mut h = harness();
        h.set_status(|s| s.acq_running = true);
        assert_eq!(h.dispatcher.handle_line("quit"), Disposition::Continue);
        assert!(!h.interrupts.kill_requested());
    }

    #[test]
    fn test_quit_kills_when_idle() {
        let mut h = harness();
        h.set_status(|s| s.run_ctrl_exited = true);
        assert_eq!(h.dispatcher.handle_line("quit"), Disposition::Quit);
        assert!(h.interrupts.kill_requested());
    }

    #[test]
    fn test_kill_stops_a_running_acquisition() {
        let mut h = harness();
        h.set_status(|s| {
            s.acq_running = true;
            s.run_ctrl_exited = true;
        });
        assert_eq!(h.dispatcher.handle_line("kill"), Disposition::Quit);
        assert!(h.interrupts.stop_requested());
        assert!(h.interrupts.kill_requested());
    }

    #[test]
    fn test_mca_argument_parsing() {
        let mut h = harness();
        h.dispatcher.handle_line("mca root 5 test_");
        match h.requests.try_recv() {
            Ok(Request::StartMca(args)) => {
                assert_eq!(args.backend, McaBackend::Root);
                assert_eq!(args.duration, Some(Duration::from_secs(5)));
                assert_eq!(args.basename, "test_");
            }
            other => panic!("expected StartMca, got {other:?}"),
        }

        // a bare time, no backend
        h.dispatcher.handle_line("mca 30");
        match h.requests.try_recv() {
            Ok(Request::StartMca(args)) => {
                assert_eq!(args.backend, McaBackend::Damm);
                assert_eq!(args.duration, Some(Duration::from_secs(30)));
                assert_eq!(args.basename, "MCA");
            }
            other => panic!("expected StartMca, got {other:?}"),
        }

        // negative time runs until stopped
        h.dispatcher.handle_line("mca damm -1 hist");
        match h.requests.try_recv() {
            Ok(Request::StartMca(args)) => {
                assert_eq!(args.backend, McaBackend::Damm);
                assert_eq!(args.duration, None);
                assert_eq!(args.basename, "hist");
            }
            other => panic!("expected StartMca, got {other:?}"),
        }

        // no time at all defaults to 10 seconds
        h.dispatcher.handle_line("mca");
        match h.requests.try_recv() {
            Ok(Request::StartMca(args)) => {
                assert_eq!(args.duration, Some(Duration::from_secs(10)));
            }
            other => panic!("expected StartMca, got {other:?}"),
        }
    }

    #[test]
    fn test_mca_rejected_while_acquiring() {
        let mut h = harness();
        h.set_status(|s| s.acq_running = true);
        h.dispatcher.handle_line("mca root 5");
        assert!(h.requests.try_recv().is_err());
    }

    #[test]
    fn test_pwrite_writes_and_saves() {
        let mut h = harness();
        h.dispatcher.handle_line("pwrite 0 3 TAU 42.5");
        let pif = h.gateway.lock().unwrap();
        assert_eq!(pif.read_channel_param("TAU", 0, 3).unwrap(), 42.5);
        assert_eq!(pif.dsp_saves(), 1);
    }

    #[test]
    fn test_pmwrite_accepts_hex() {
        let mut h = harness();
        h.dispatcher.handle_line("pmwrite 1 MODULE_CSRA 0x41");
        let pif = h.gateway.lock().unwrap();
        assert_eq!(pif.read_module_param("MODULE_CSRA", 1).unwrap(), 0x41);
    }

    #[test]
    fn test_parameter_write_rejected_while_running() {
        let mut h = harness();
        h.set_status(|s| s.acq_running = true);
        h.dispatcher.handle_line("pwrite 0 3 TAU 42.5");
        let pif = h.gateway.lock().unwrap();
        assert_eq!(pif.read_channel_param("TAU", 0, 3).unwrap(), 0.0);
        assert_eq!(pif.dsp_saves(), 0);
    }

    #[test]
    fn test_toggle_flips_a_csra_bit() {
        let mut h = harness();
        h.dispatcher.handle_line("toggle 0 2 8");
        {
            let pif = h.gateway.lock().unwrap();
            assert_eq!(
                pif.read_channel_param("CHANNEL_CSRA", 0, 2).unwrap() as u32,
                1 << 8
            );
        }
        h.dispatcher.handle_line("toggle 0 2 8");
        let pif = h.gateway.lock().unwrap();
        assert_eq!(pif.read_channel_param("CHANNEL_CSRA", 0, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_runnum_rejects_non_numeric() {
        let mut h = harness();
        h.dispatcher.handle_line("runnum fifty");
        assert!(h.requests.try_recv().is_err());
        h.dispatcher.handle_line("runnum 50");
        assert!(matches!(
            h.requests.try_recv(),
            Ok(Request::SetRunNumber(50))
        ));
    }

    #[test]
    fn test_config_edits_rejected_with_open_file() {
        let mut h = harness();
        h.set_status(|s| s.file_open = true);
        h.dispatcher.handle_line("prefix beam");
        h.dispatcher.handle_line("fdir /tmp");
        h.dispatcher.handle_line("title some title");
        h.dispatcher.handle_line("runnum 9");
        assert!(h.requests.try_recv().is_err());
    }

    #[test]
    fn test_facility_requires_pld_format() {
        let mut h = harness();
        h.dispatcher.handle_line("facility FRIB");
        assert!(h.requests.try_recv().is_err());
        h.set_status(|s| s.output_format = OutputFormat::Pld);
        h.dispatcher.handle_line("facility FRIB");
        assert!(matches!(
            h.requests.try_recv(),
            Ok(Request::SetFacility(f)) if f == "FRIB"
        ));
    }

    #[test]
    fn test_dump_writes_every_parameter() {
        let mut h = harness();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Fallback.set");
        h.dispatcher
            .handle_line(&format!("dump {}", path.display()));
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines = contents.lines().count();
        // 21 channel params x 2 modules x 16 channels + 13 module params x 2
        assert_eq!(lines, 21 * 2 * 16 + 13 * 2);
        assert!(contents.contains("TAU 0 0 0"));
    }

    #[test]
    fn test_tab_complete_verbs_and_params() {
        let h = harness();
        let verbs = h.dispatcher.tab_complete("sta");
        assert!(verbs.contains(&String::from("rtacq")));
        assert!(verbs.contains(&String::from("tus")));

        let params = h.dispatcher.tab_complete("pread 0 0 TRIGGER_R");
        assert_eq!(params, vec![String::from("ISETIME")]);

        let mod_params = h.dispatcher.tab_complete("pmwrite 0 MODULE_C");
        assert_eq!(
            mod_params,
            vec![String::from("SRA"), String::from("SRB")]
        );
    }

    #[test]
    fn test_unknown_command_is_harmless() {
        let mut h = harness();
        assert_eq!(h.dispatcher.handle_line("frobnicate"), Disposition::Continue);
        assert!(h.requests.try_recv().is_err());
    }

    #[test]
    fn test_spill_requires_a_running_acquisition() {
        let mut h = harness();
        h.dispatcher.handle_line("hup");
        assert!(h.requests.try_recv().is_err());
        h.set_status(|s| s.acq_running = true);
        h.dispatcher.handle_line("spill");
        assert!(matches!(h.requests.try_recv(), Ok(Request::ForceSpill)));
    }
}
