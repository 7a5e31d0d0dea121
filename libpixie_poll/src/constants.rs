//! Constants shared across the acquisition engine.

/// The 32-bit quantum of digitizer data. Everything the crate produces,
/// the FIFOs, the spill frames and the output files, is a stream of these.
pub type Word = u32;

/// Size of a [Word] in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Depth of the external FIFO on each module, in words. A module reporting
/// this many words has overflowed and the current run cannot be trusted.
pub const EXTERNAL_FIFO_LENGTH: usize = 131072;

/// Modules holding fewer words than this are skipped during a drain and
/// contribute only an empty segment to the spill.
pub const MIN_FIFO_READ: usize = 9;

/// Number of polling cycles the threshold wait performs before a drain
/// decision is forced.
pub const POLL_TRIES: usize = 100;

/// 4 GB. Maximum allowable output file size in bytes.
pub const MAX_FILE_SIZE: u64 = 4294967296;

/// Bytes the sink needs to finish a file (close trailer and end-of-file
/// buffers). Reserved when checking a write against [MAX_FILE_SIZE].
pub const FILE_CLOSE_OVERHEAD: u64 = 65552;

/// Words of spill data carried by one full shared-memory datagram.
pub const SHM_CHUNK_WORDS: usize = 10000;

/// Bytes of chunk header (index and total count) on each shared-memory
/// datagram.
pub const SHM_HEADER_BYTES: usize = 8;

/// Total size of a full shared-memory datagram.
pub const SHM_PACKET_BYTES: usize = SHM_HEADER_BYTES + SHM_CHUNK_WORDS * WORD_SIZE;

/// Channels on one digitizer module.
pub const CHANNELS_PER_MODULE: usize = 16;

/// Bins in one channel histogram read back during an MCA run.
pub const HISTOGRAM_LENGTH: usize = 32768;

/// DSP parameters addressed per channel.
pub const CHANNEL_PARAMS: [&str; 21] = [
    "TRIGGER_RISETIME",
    "TRIGGER_FLATTOP",
    "TRIGGER_THRESHOLD",
    "ENERGY_RISETIME",
    "ENERGY_FLATTOP",
    "TAU",
    "TRACE_LENGTH",
    "TRACE_DELAY",
    "VOFFSET",
    "XDT",
    "BASELINE_PERCENT",
    "EMIN",
    "BINFACTOR",
    "CHANNEL_CSRA",
    "CHANNEL_CSRB",
    "BLCUT",
    "ExternDelayLen",
    "ExtTrigStretch",
    "ChanTrigStretch",
    "FtrigoutDelay",
    "FASTTRIGBACKLEN",
];

/// DSP parameters addressed per module.
pub const MODULE_PARAMS: [&str; 13] = [
    "MODULE_CSRA",
    "MODULE_CSRB",
    "MODULE_FORMAT",
    "MAX_EVENTS",
    "SYNCH_WAIT",
    "IN_SYNCH",
    "SLOW_FILTER_RANGE",
    "FAST_FILTER_RANGE",
    "MODULE_NUMBER",
    "TrigConfig0",
    "TrigConfig1",
    "TrigConfig2",
    "TrigConfig3",
];

/// Meaning of each CHANNEL_CSRA bit, indexed by bit position.
pub const CSRA_BIT_NAMES: [&str; 19] = [
    "Fast trigger selection",
    "Module validation signal",
    "Good channel",
    "Channel validation signal",
    "Block data acquisition",
    "Trigger polarity",
    "Veto enable",
    "Histogram energy",
    "Trace capture",
    "QDC sums",
    "CFD trigger mode",
    "Global trigger validation",
    "Raw energy sums",
    "Channel trigger validation",
    "Gain",
    "Pileup rejection",
    "Inverse pileup rejection",
    "Energy cut",
    "Group trigger selection",
];
