use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::constants::{Word, FILE_CLOSE_OVERHEAD, MAX_FILE_SIZE, WORD_SIZE};
use super::error::SinkError;

/// On-disk representation selected with the `oform` command.
///
/// The PLD and ROOT formats share the sink's raw word framing; the variant
/// selects the extension and the header tag, and only PLD carries a
/// facility string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Ldf,
    Pld,
    Root,
}

impl OutputFormat {
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(OutputFormat::Ldf),
            1 => Some(OutputFormat::Pld),
            2 => Some(OutputFormat::Root),
            _ => None,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            OutputFormat::Ldf => 0,
            OutputFormat::Pld => 1,
            OutputFormat::Root => 2,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Ldf => "ldf",
            OutputFormat::Pld => "pld",
            OutputFormat::Root => "root",
        }
    }

    fn magic(&self) -> u32 {
        u32::from_le_bytes(match self {
            OutputFormat::Ldf => *b"LDF ",
            OutputFormat::Pld => *b"PLD ",
            OutputFormat::Root => *b"ROOT",
        })
    }
}

/// Trailer marker written when a file is closed.
const CLOSE_MARKER: u32 = 0xFFFF_FFFF;

/// The output sink. At most one file is open at a time; words are appended
/// to it until the controller closes the file or rotates to a continuation.
#[derive(Debug, Default)]
pub struct RunFile {
    title: String,
    facility: String,
    format: OutputFormat,
    run_number: u32,
    suffix: u32,
    prefix: String,
    directory: PathBuf,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
    debug: bool,
}

impl RunFile {
    pub fn new() -> Self {
        RunFile {
            facility: String::from("HRIBF"),
            ..Default::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_format(&mut self, format: OutputFormat) {
        self.format = format;
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn set_facility(&mut self, facility: &str) {
        self.facility = String::from(facility);
    }

    pub fn facility(&self) -> &str {
        &self.facility
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn suffix(&self) -> u32 {
        self.suffix
    }

    /// Path of the open file, or of the last file that was open.
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Bytes written to the current file so far.
    pub fn size(&self) -> u64 {
        self.bytes_written
    }

    /// Deterministic file name for a run identity. Suffix 0 (a fresh run)
    /// is unadorned; continuations append `-<suffix>`.
    pub fn filename(
        directory: &Path,
        prefix: &str,
        run_number: u32,
        suffix: u32,
        format: OutputFormat,
    ) -> PathBuf {
        let name = if suffix == 0 {
            format!("{}_{}.{}", prefix, run_number, format.extension())
        } else {
            format!("{}_{}-{}.{}", prefix, run_number, suffix, format.extension())
        };
        directory.join(name)
    }

    /// The next usable file path for a fresh run, advancing `run_number`
    /// past any run that already has a file on disk.
    pub fn next_filename(
        run_number: &mut u32,
        prefix: &str,
        directory: &Path,
        format: OutputFormat,
    ) -> PathBuf {
        let mut path = Self::filename(directory, prefix, *run_number, 0, format);
        while path.exists() {
            *run_number += 1;
            path = Self::filename(directory, prefix, *run_number, 0, format);
        }
        path
    }

    /// Whether appending `n_words` would push the file past the 4 GB
    /// ceiling once the close trailer is accounted for.
    pub fn would_exceed_ceiling(&self, n_words: usize) -> bool {
        Self::write_would_overflow(self.bytes_written, n_words)
    }

    pub fn write_would_overflow(current_size: u64, n_words: usize) -> bool {
        current_size + (WORD_SIZE * n_words) as u64 + FILE_CLOSE_OVERHEAD > MAX_FILE_SIZE
    }

    /// Open a new output file.
    ///
    /// A fresh run records the identity handed in and starts at suffix 0. A
    /// continuation keeps the run identity of the file that just closed and
    /// increments the suffix, so a rotation never changes the run number.
    pub fn open(
        &mut self,
        title: &str,
        run_number: u32,
        prefix: &str,
        directory: &Path,
        continuation: bool,
    ) -> Result<(), SinkError> {
        if self.is_open() {
            return Err(SinkError::AlreadyOpen);
        }

        if continuation {
            self.suffix += 1;
        } else {
            self.title = String::from(title);
            self.run_number = run_number;
            self.suffix = 0;
            self.prefix = String::from(prefix);
            self.directory = PathBuf::from(directory);
        }

        let path = Self::filename(
            &self.directory,
            &self.prefix,
            self.run_number,
            self.suffix,
            self.format,
        );
        let file = File::create(&path).map_err(|_| SinkError::BadFilePath(path.clone()))?;
        self.path = path;
        self.writer = Some(BufWriter::new(file));
        self.bytes_written = 0;
        self.write_header()?;

        if self.debug {
            spdlog::debug!(
                "Opened output file {:?} (run {}, suffix {})",
                self.path,
                self.run_number,
                self.suffix
            );
        }
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), SinkError> {
        let mut header = Vec::new();
        header.extend_from_slice(&self.format.magic().to_le_bytes());
        header.extend_from_slice(&self.run_number.to_le_bytes());
        header.extend_from_slice(&self.suffix.to_le_bytes());
        push_string(&mut header, &self.title);
        if self.format == OutputFormat::Pld {
            push_string(&mut header, &self.facility);
        }
        self.append(&header)
    }

    /// Append a block of words to the open file. Returns the bytes written.
    pub fn write(&mut self, words: &[Word]) -> Result<usize, SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::NotOpen);
        }
        let mut bytes = Vec::with_capacity(words.len() * WORD_SIZE);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        self.append(&bytes)?;
        Ok(bytes.len())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotOpen)?;
        writer.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Write the close trailer and release the file.
    pub fn close(&mut self, total_time: f32) -> Result<(), SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::NotOpen);
        }
        let mut trailer = Vec::new();
        trailer.extend_from_slice(&CLOSE_MARKER.to_le_bytes());
        trailer.extend_from_slice(&total_time.to_le_bytes());
        self.append(&trailer)?;
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if self.debug {
            spdlog::debug!(
                "Closed output file {:?} after {}s, {} bytes",
                self.path,
                total_time,
                self.bytes_written
            );
        }
        Ok(())
    }

    /// Status packet describing the sink, broadcast once per spill when the
    /// live consumer is in notify mode. The run number is `u32::MAX` when
    /// no file is open.
    pub fn build_status_packet(&self) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&0u32.to_le_bytes());
        if self.is_open() {
            packet.extend_from_slice(&self.run_number.to_le_bytes());
            packet.extend_from_slice(&self.suffix.to_le_bytes());
            packet.extend_from_slice(&self.bytes_written.to_le_bytes());
            packet.extend_from_slice(self.path.to_string_lossy().as_bytes());
        } else {
            packet.extend_from_slice(&u32::MAX.to_le_bytes());
            packet.extend_from_slice(&0u32.to_le_bytes());
            packet.extend_from_slice(&0u64.to_le_bytes());
        }
        let len = packet.len() as u32;
        packet[0..4].copy_from_slice(&len.to_le_bytes());
        packet
    }
}

/// Length-prefixed string, padded to a word boundary.
fn push_string(buffer: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    buffer.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buffer.extend_from_slice(bytes);
    while buffer.len() % WORD_SIZE != 0 {
        buffer.push(0);
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_write_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RunFile::new();
        sink.open("test run", 3, "run", dir.path(), false).unwrap();
        assert!(sink.is_open());
        assert_eq!(sink.run_number(), 3);
        assert_eq!(sink.suffix(), 0);

        let written = sink.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(written, 16);
        let size_before_close = sink.size();
        sink.close(1.5).unwrap();
        assert!(!sink.is_open());

        let on_disk = std::fs::metadata(sink.current_path()).unwrap().len();
        assert_eq!(on_disk, size_before_close + 8);
    }

    #[test]
    fn test_double_close_reports_not_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RunFile::new();
        sink.open("t", 1, "run", dir.path(), false).unwrap();
        sink.close(0.0).unwrap();
        assert!(matches!(sink.close(0.0), Err(SinkError::NotOpen)));
    }

    #[test]
    fn test_continuation_keeps_run_number() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RunFile::new();
        sink.open("t", 7, "run", dir.path(), false).unwrap();
        sink.close(0.0).unwrap();
        sink.open("t", 7, "run", dir.path(), true).unwrap();
        assert_eq!(sink.run_number(), 7);
        assert_eq!(sink.suffix(), 1);
        assert!(sink
            .current_path()
            .to_string_lossy()
            .ends_with("run_7-1.ldf"));
    }

    #[test]
    fn test_next_filename_skips_existing_runs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run_1.ldf"), b"x").unwrap();
        std::fs::write(dir.path().join("run_2.ldf"), b"x").unwrap();
        let mut run_number = 1;
        let path = RunFile::next_filename(&mut run_number, "run", dir.path(), OutputFormat::Ldf);
        assert_eq!(run_number, 3);
        assert!(path.to_string_lossy().ends_with("run_3.ldf"));
    }

    #[test]
    fn test_ceiling_math() {
        // 2048 words plus the close overhead overflows from 4 GB - 4096
        assert!(RunFile::write_would_overflow(MAX_FILE_SIZE - 4096, 2048));
        // but a file far from the ceiling accepts the same spill
        assert!(!RunFile::write_would_overflow(1024, 2048));
        // boundary: exactly at the ceiling is accepted
        let headroom = FILE_CLOSE_OVERHEAD + 2048 * WORD_SIZE as u64;
        assert!(!RunFile::write_would_overflow(MAX_FILE_SIZE - headroom, 2048));
        assert!(RunFile::write_would_overflow(
            MAX_FILE_SIZE - headroom + 1,
            2048
        ));
    }

    #[test]
    fn test_status_packet_reports_run_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RunFile::new();
        let closed = sink.build_status_packet();
        assert_eq!(closed[4..8], u32::MAX.to_le_bytes());

        sink.open("t", 12, "run", dir.path(), false).unwrap();
        let packet = sink.build_status_packet();
        let len = u32::from_le_bytes(packet[0..4].try_into().unwrap());
        assert_eq!(len as usize, packet.len());
        assert_eq!(packet[4..8], 12u32.to_le_bytes());
        sink.close(0.0).unwrap();
    }

    #[test]
    fn test_open_bad_directory_fails() {
        let mut sink = RunFile::new();
        let result = sink.open("t", 1, "run", Path::new("/no/such/directory"), false);
        assert!(matches!(result, Err(SinkError::BadFilePath(_))));
        assert!(!sink.is_open());
    }
}
