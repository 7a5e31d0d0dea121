//! # pixie_poll
//!
//! Part of the pixie_poll crate family.
//!
//! This is the interactive console that controls a PIXIE-16 class
//! digitizer crate: list-mode runs, MCA sub-runs, parameter I/O, output
//! file management and the live-data broadcast.
//!
//! ## Use
//!
//! ```bash
//! pixie_poll -c pixie.cfg
//! ```
//!
//! To generate a configuration template file use
//!
//! ```bash
//! pixie_poll -c pixie.cfg new
//! ```
//!
//! Type `help` at the prompt for the command set. Progress and diagnostics
//! are logged to `pixie_poll.log`; the terminal carries only the operator
//! dialogue.
//!
//! ## Configuration
//!
//! The YAML configuration holds the crate slot map (`slots`) and the
//! console options (output directory, filename prefix, run title, next run
//! number, output format, FIFO drain threshold, broadcast address, boot
//! and verbosity flags). See the library documentation for the full field
//! list.

use clap::{Arg, ArgAction, Command};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use libpixie_poll::command::{CommandDispatcher, Disposition, SYS_MESSAGE_HEAD};
use libpixie_poll::config::Config;
use libpixie_poll::controller::RunController;
use libpixie_poll::broadcast::UdpBroadcaster;
use libpixie_poll::hardware::BootMode;
use libpixie_poll::messages::{Interrupts, PollStatus};
use libpixie_poll::mock::MockCrate;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = std::fs::File::create(path).expect("Could not create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// The program entry point
fn main() -> ExitCode {
    // Create a cli
    let matches = Command::new("pixie_poll")
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .default_value("pixie.cfg")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("fast")
                .long("fast")
                .action(ArgAction::SetTrue)
                .help("Fast boot: download parameters, set DACs and program the FPGAs only"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Start in quiet mode"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("Start in debug mode"),
        )
        .get_matches();

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("config has a default"),
    );

    if let Some(("new", _)) = matches.subcommand() {
        println!(
            "{SYS_MESSAGE_HEAD}Making a template config at {}...",
            config_path.display()
        );
        make_template_config(&config_path);
        println!("{SYS_MESSAGE_HEAD}Done.");
        return ExitCode::SUCCESS;
    }

    // Setup logging to a file; the terminal belongs to the operator
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./pixie_poll.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .unwrap(),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sink(file_sink)
            .build()
            .unwrap(),
    );
    spdlog::set_default_logger(logger);
    spdlog::info!("Starting pixie_poll console");

    let mut config = match Config::read_config_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{SYS_MESSAGE_HEAD}{e}");
            return ExitCode::FAILURE;
        }
    };
    if matches.get_flag("fast") {
        config.boot_fast = true;
    }
    if matches.get_flag("quiet") {
        config.is_quiet = true;
    }
    if matches.get_flag("debug") {
        config.debug_mode = true;
    }

    // The crate gateway. The bundled simulator stands in until a vendor
    // driver implementing HardwareGateway is wired up here.
    let gateway = Arc::new(Mutex::new(MockCrate::new(config.slots.clone())));

    let broadcaster = match UdpBroadcaster::connect(&config.broadcast_address) {
        Ok(broadcaster) => broadcaster,
        Err(e) => {
            eprintln!(
                "{SYS_MESSAGE_HEAD}Could not reach the broadcast address {}: {e}",
                config.broadcast_address
            );
            return ExitCode::FAILURE;
        }
    };

    let (requests_tx, requests_rx) = mpsc::channel();
    let interrupts = Interrupts::new();
    let status = Arc::new(Mutex::new(PollStatus::default()));

    let mut controller = RunController::new(
        &config,
        gateway.clone(),
        Box::new(broadcaster),
        requests_rx,
        interrupts.clone(),
        status.clone(),
    );
    let boot_mode = if config.boot_fast {
        BootMode::Fast
    } else {
        BootMode::Full
    };
    if let Err(e) = controller.initialize(boot_mode) {
        spdlog::error!("Crate initialization failed: {e}");
        eprintln!("{SYS_MESSAGE_HEAD}Crate initialization failed: {e}");
        return ExitCode::FAILURE;
    }

    let run_handle = std::thread::spawn(move || controller.run());

    let mut dispatcher = CommandDispatcher::new(requests_tx, status.clone(), interrupts, gateway);
    let stdin = std::io::stdin();
    let mut quit = false;
    loop {
        print!("poll> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // end of input
            Ok(_) => {}
        }
        if dispatcher.handle_line(&line) == Disposition::Quit {
            quit = true;
            break;
        }
    }
    if !quit {
        // stdin closed; fall back to quit, then to an unconditional kill
        if dispatcher.handle_line("quit") != Disposition::Quit {
            dispatcher.handle_line("kill");
        }
    }

    if run_handle.join().is_err() {
        spdlog::error!("An error occured joining the run control thread!");
        return ExitCode::FAILURE;
    }

    if status.lock().unwrap().had_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
