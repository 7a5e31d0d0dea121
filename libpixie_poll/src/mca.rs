//! MCA sub-runs.
//!
//! An MCA run puts the crate into histogram mode for a bounded (or
//! operator-terminated) period and snapshots every channel histogram into a
//! single file at the end. It cannot coexist with a list-mode run; the
//! run controller schedules it only from idle.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::constants::CHANNELS_PER_MODULE;
use super::error::McaError;
use super::hardware::HardwareGateway;

/// Which histogram backend formats the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McaBackend {
    Root,
    Damm,
}

impl McaBackend {
    pub fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "root" => Some(McaBackend::Root),
            "damm" => Some(McaBackend::Damm),
            _ => None,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            McaBackend::Root => "root",
            McaBackend::Damm => "his",
        }
    }

    fn magic(&self) -> u32 {
        u32::from_le_bytes(match self {
            McaBackend::Root => *b"MCAR",
            McaBackend::Damm => *b"MCAD",
        })
    }
}

/// Arguments of one MCA request. `duration` of `None` runs until the
/// operator stops it.
#[derive(Debug, Clone)]
pub struct McaArgs {
    pub backend: McaBackend,
    pub duration: Option<Duration>,
    pub basename: String,
}

impl McaArgs {
    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.basename, self.backend.extension()))
    }
}

/// Backend-tagged histogram file. Records are
/// `[module u16][channel u16][bins u32][bin values...]`, all little endian.
struct HistogramFile {
    writer: BufWriter<File>,
}

impl HistogramFile {
    fn create(path: &Path, backend: McaBackend) -> Result<Self, McaError> {
        let file = File::create(path).map_err(|_| McaError::BadFilePath(path.to_path_buf()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&backend.magic().to_le_bytes())?;
        Ok(HistogramFile { writer })
    }

    fn write_histogram(
        &mut self,
        module: usize,
        channel: usize,
        bins: &[u32],
    ) -> Result<(), McaError> {
        self.writer.write_all(&(module as u16).to_le_bytes())?;
        self.writer.write_all(&(channel as u16).to_le_bytes())?;
        self.writer.write_all(&(bins.len() as u32).to_le_bytes())?;
        for bin in bins {
            self.writer.write_all(&bin.to_le_bytes())?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), McaError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Run the MCA to completion.
///
/// Starts a histogram run, polls once a second until the stop token is
/// raised or the requested time has passed, then ends the run and writes
/// every (module, channel) histogram through the selected backend.
/// Returns the elapsed wall time in seconds.
pub fn run_mca<G: HardwareGateway>(
    gateway: &Mutex<G>,
    args: &McaArgs,
    stop: &AtomicBool,
) -> Result<f64, McaError> {
    gateway.lock().unwrap().start_histogram_run()?;
    match args.duration {
        Some(duration) => {
            spdlog::info!("Performing MCA data run for {} s", duration.as_secs())
        }
        None => spdlog::info!("Performing infinite MCA data run. Type \"stop\" to quit"),
    }

    let started = Instant::now();
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if let Some(duration) = args.duration {
            if started.elapsed() >= duration {
                break;
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    let elapsed = started.elapsed().as_secs_f64();

    let mut pif = gateway.lock().unwrap();
    pif.end_run()?;

    let path = args.output_path();
    let mut file = HistogramFile::create(&path, args.backend)?;
    for module in 0..pif.num_modules() {
        for channel in 0..CHANNELS_PER_MODULE {
            let bins = pif.read_histogram(module, channel)?;
            file.write_histogram(module, channel, &bins)?;
        }
    }
    file.finish()?;
    spdlog::info!("Wrote MCA histograms to {:?} after {:.1} s", path, elapsed);

    Ok(elapsed)
}
