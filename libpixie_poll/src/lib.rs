//! # pixie_poll
//!
//! pixie_poll is a control console and spill-assembly engine for PIXIE-16
//! class digitizer crates, written in Rust. It drives a multi-module crate
//! at line rate: booting and synchronizing the modules, running the
//! list-mode acquisition lifecycle, draining every module's external FIFO
//! under a threshold policy, reassembling events that straddle a drain, and
//! framing the resulting spills into size-bounded output files and a UDP
//! broadcast for live consumers.
//!
//! ## Architecture
//!
//! Two long-lived threads cooperate:
//!
//! - the **command dispatcher** ([command::CommandDispatcher]) owns the
//!   operator terminal. It parses command lines, performs advisory state
//!   checks against a status snapshot, and signals the controller through a
//!   typed request mailbox plus two interrupt tokens (stop, kill).
//! - the **run controller** ([controller::RunController]) owns the
//!   acquisition. Each tick it honors kill/reboot/MCA/start edges in
//!   priority order, drives the [assembler::SpillAssembler] while a run is
//!   live, and publishes the status snapshot back.
//!
//! Everything that touches the digitizer goes through the
//! [hardware::HardwareGateway] capability trait. The bundled
//! [mock::MockCrate] simulator implements it deterministically, which is
//! how the test suites script full-FIFO faults, corrupted event streams and
//! straddling events, and how the console runs without a crate attached.
//!
//! ## Data path
//!
//! A spill is one drain of every module: per module, ascending,
//! `[length, module, event words...]`, where `length` counts itself and the
//! module word. Recording appends spills to the active run file
//! ([sink::RunFile]), rotating to a continuation file (same run number,
//! incremented suffix) before any write that would cross the 4 GB ceiling.
//! Live consumers receive either a per-spill status packet or, in
//! shared-memory mode, the spill itself chunked into 40 008-byte datagrams
//! ([broadcast]).
//!
//! ## Configuration
//!
//! A YAML file (default `pixie.cfg`) holds the crate slot map and the
//! console options:
//!
//! ```yml
//! slots: [2]
//! output_directory: ./
//! filename_prefix: run
//! output_title: PIXIE data file
//! next_run_number: 1
//! output_format: 0
//! fifo_threshold_percent: 50
//! broadcast_address: 127.0.0.1:5555
//! boot_fast: false
//! is_quiet: false
//! debug_mode: false
//! shm_mode: false
//! ```
//!
//! Generate a template with `pixie_poll new -c pixie.cfg`.
pub mod assembler;
pub mod broadcast;
pub mod command;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod event;
pub mod hardware;
pub mod mca;
pub mod messages;
pub mod mock;
pub mod sink;
pub mod stats;
