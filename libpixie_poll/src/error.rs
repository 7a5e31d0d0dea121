use std::path::PathBuf;
use thiserror::Error;

use super::constants::EXTERNAL_FIFO_LENGTH;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Crate gateway was used before initialization")]
    NotInitialized,
    #[error("Module {0} does not exist in this crate")]
    BadModule(usize),
    #[error("Crate failed to boot")]
    BootFailed,
    #[error("Module {0} did not recognize parameter '{1}'")]
    UnknownParameter(usize, String),
    #[error("List mode run failed to start")]
    StartFailed,
    #[error("Bulk FIFO read of {words} words from module {module} failed")]
    ReadFailed { module: usize, words: usize },
    #[error("Gateway failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error)]
pub enum EventParseError {
    #[error("Slot read ({read}) in module {module} not the same as slot expected ({expected})")]
    SlotMismatch { module: usize, read: u8, expected: u8 },
    #[error("Zero event size in module {0}")]
    ZeroEventSize(usize),
}

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("Full FIFO in module {module}, size: {depth}/{max}", max = EXTERNAL_FIFO_LENGTH)]
    FullFifo { module: usize, depth: u32 },
    #[error("Assembler failed to read the FIFO: {0}")]
    ReadError(#[from] GatewayError),
    #[error("Corrupted data {words_in} words into the FIFO of module {module}: {source}")]
    CorruptData {
        module: usize,
        words_in: usize,
        source: EventParseError,
    },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("A file is already open; close the current file before opening a new one")]
    AlreadyOpen,
    #[error("No file is open")]
    NotOpen,
    #[error("Could not open output file {0:?}; check that the path is correct")]
    BadFilePath(PathBuf),
    #[error("Sink failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcaster failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum McaError {
    #[error("MCA run failed due to gateway error: {0}")]
    GatewayError(#[from] GatewayError),
    #[error("MCA run could not open histogram file {0:?}")]
    BadFilePath(PathBuf),
    #[error("MCA run failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller failed due to gateway error: {0}")]
    GatewayError(#[from] GatewayError),
    #[error("Controller failed due to sink error: {0}")]
    SinkError(#[from] SinkError),
    #[error("Controller failed due to assembler error: {0}")]
    AssemblerError(#[from] AssemblerError),
    #[error("Controller failed due to broadcast error: {0}")]
    BroadcastError(#[from] BroadcastError),
    #[error("Controller failed due to MCA error: {0}")]
    McaError(#[from] McaError),
    #[error("Controller failed due to config error: {0}")]
    ConfigError(#[from] ConfigError),
}
