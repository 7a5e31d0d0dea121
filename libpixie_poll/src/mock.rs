//! A deterministic, scriptable stand-in for the vendor crate driver.
//!
//! The simulator backs the test suites and the console's offline mode. FIFO
//! content is loaded per module ahead of a drain, and faults (full FIFO,
//! failed bulk read, failed boot) are injected explicitly, so every drain
//! scenario the assembler has to survive can be scripted exactly.

use std::collections::VecDeque;

use fxhash::FxHashMap;

use super::constants::{Word, HISTOGRAM_LENGTH, MODULE_PARAMS};
use super::error::GatewayError;
use super::hardware::{BootMode, HardwareGateway};

/// Crate simulator implementing [HardwareGateway].
pub struct MockCrate {
    slots: Vec<u8>,
    slots_known: bool,
    initialized: bool,
    booted: bool,
    list_running: bool,
    histogram_running: bool,
    fifos: Vec<VecDeque<Word>>,
    module_params: FxHashMap<(usize, String), u32>,
    channel_params: FxHashMap<(usize, usize, String), f64>,
    histograms: FxHashMap<(usize, usize), Vec<u32>>,
    fail_read: Option<usize>,
    fail_boot: bool,
    fail_start: bool,
    saves: u32,
}

impl MockCrate {
    /// Build a simulator with one module per declared slot.
    pub fn new(slots: Vec<u8>) -> Self {
        let n = slots.len();
        MockCrate {
            slots,
            slots_known: false,
            initialized: false,
            booted: false,
            list_running: false,
            histogram_running: false,
            fifos: vec![VecDeque::new(); n],
            module_params: FxHashMap::default(),
            channel_params: FxHashMap::default(),
            histograms: FxHashMap::default(),
            fail_read: None,
            fail_boot: false,
            fail_start: false,
            saves: 0,
        }
    }

    /// Append words to a module's FIFO, as if triggers had arrived.
    pub fn load_fifo(&mut self, module: usize, words: &[Word]) {
        self.fifos[module].extend(words.iter().copied());
    }

    /// Arrange for the next bulk read of `module` to fail.
    pub fn fail_next_read(&mut self, module: usize) {
        self.fail_read = Some(module);
    }

    /// Arrange for the next boot to fail.
    pub fn fail_next_boot(&mut self) {
        self.fail_boot = true;
    }

    /// Arrange for the next list-mode start to fail.
    pub fn fail_next_start(&mut self) {
        self.fail_start = true;
    }

    /// Install a histogram to be read back during an MCA run.
    pub fn set_histogram(&mut self, module: usize, channel: usize, bins: Vec<u32>) {
        self.histograms.insert((module, channel), bins);
    }

    /// How many times the working parameters were committed to disk.
    pub fn dsp_saves(&self) -> u32 {
        self.saves
    }

    fn check_module(&self, module: usize) -> Result<(), GatewayError> {
        if module < self.slots.len() {
            Ok(())
        } else {
            Err(GatewayError::BadModule(module))
        }
    }
}

impl HardwareGateway for MockCrate {
    fn discover_slots(&mut self) -> Result<(), GatewayError> {
        self.slots_known = true;
        Ok(())
    }

    fn init(&mut self) -> Result<(), GatewayError> {
        if !self.slots_known {
            return Err(GatewayError::NotInitialized);
        }
        self.initialized = true;
        Ok(())
    }

    fn boot(&mut self, _mode: BootMode) -> Result<(), GatewayError> {
        if !self.initialized {
            return Err(GatewayError::NotInitialized);
        }
        if self.fail_boot {
            self.fail_boot = false;
            return Err(GatewayError::BootFailed);
        }
        self.booted = true;
        Ok(())
    }

    fn num_modules(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, module: usize) -> u8 {
        self.slots[module]
    }

    fn fifo_depth(&self, module: usize) -> u32 {
        self.fifos[module].len() as u32
    }

    fn read_fifo(&mut self, module: usize, dest: &mut [Word]) -> Result<(), GatewayError> {
        self.check_module(module)?;
        if self.fail_read == Some(module) {
            self.fail_read = None;
            return Err(GatewayError::ReadFailed {
                module,
                words: dest.len(),
            });
        }
        if dest.len() > self.fifos[module].len() {
            return Err(GatewayError::ReadFailed {
                module,
                words: dest.len(),
            });
        }
        for slot in dest.iter_mut() {
            *slot = self.fifos[module].pop_front().unwrap();
        }
        Ok(())
    }

    fn start_list_mode(&mut self) -> Result<(), GatewayError> {
        if !self.booted {
            return Err(GatewayError::NotInitialized);
        }
        if self.fail_start {
            self.fail_start = false;
            return Err(GatewayError::StartFailed);
        }
        self.list_running = true;
        Ok(())
    }

    fn start_histogram_run(&mut self) -> Result<(), GatewayError> {
        if !self.booted {
            return Err(GatewayError::NotInitialized);
        }
        self.histogram_running = true;
        Ok(())
    }

    fn end_run(&mut self) -> Result<(), GatewayError> {
        self.list_running = false;
        self.histogram_running = false;
        Ok(())
    }

    fn run_active(&self, module: usize) -> bool {
        // After end_run a module stays busy until its FIFO is drained.
        self.list_running || !self.fifos[module].is_empty()
    }

    fn remove_preset_run_length(&mut self, module: usize) -> Result<(), GatewayError> {
        self.check_module(module)
    }

    fn read_histogram(&self, module: usize, channel: usize) -> Result<Vec<u32>, GatewayError> {
        self.check_module(module)?;
        Ok(self
            .histograms
            .get(&(module, channel))
            .cloned()
            .unwrap_or_else(|| vec![0; HISTOGRAM_LENGTH]))
    }

    fn read_module_param(&self, name: &str, module: usize) -> Result<u32, GatewayError> {
        self.check_module(module)?;
        if !MODULE_PARAMS.contains(&name) {
            return Err(GatewayError::UnknownParameter(module, name.to_string()));
        }
        Ok(self
            .module_params
            .get(&(module, name.to_string()))
            .copied()
            .unwrap_or(0))
    }

    fn write_module_param(
        &mut self,
        name: &str,
        value: u32,
        module: usize,
    ) -> Result<(), GatewayError> {
        self.check_module(module)?;
        if !MODULE_PARAMS.contains(&name) {
            return Err(GatewayError::UnknownParameter(module, name.to_string()));
        }
        self.module_params.insert((module, name.to_string()), value);
        Ok(())
    }

    fn read_channel_param(
        &self,
        name: &str,
        module: usize,
        channel: usize,
    ) -> Result<f64, GatewayError> {
        self.check_module(module)?;
        Ok(self
            .channel_params
            .get(&(module, channel, name.to_string()))
            .copied()
            .unwrap_or(0.0))
    }

    fn write_channel_param(
        &mut self,
        name: &str,
        value: f64,
        module: usize,
        channel: usize,
    ) -> Result<(), GatewayError> {
        self.check_module(module)?;
        self.channel_params
            .insert((module, channel, name.to_string()), value);
        Ok(())
    }

    fn save_dsp_parameters(&mut self) -> Result<(), GatewayError> {
        self.saves += 1;
        Ok(())
    }

    fn adjust_offsets(&mut self, module: usize) -> Result<(), GatewayError> {
        self.check_module(module)
    }

    fn find_tau(&self, module: usize, channel: usize) -> Result<f64, GatewayError> {
        self.check_module(module)?;
        Ok(self
            .channel_params
            .get(&(module, channel, String::from("TAU")))
            .copied()
            .unwrap_or(50.0))
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn booted_crate() -> MockCrate {
        let mut pif = MockCrate::new(vec![2, 3]);
        pif.discover_slots().unwrap();
        pif.init().unwrap();
        pif.boot(BootMode::Full).unwrap();
        pif
    }

    #[test]
    fn test_fifo_read_drains_front() {
        let mut pif = booted_crate();
        pif.load_fifo(0, &[1, 2, 3, 4]);
        let mut dest = [0 as Word; 3];
        pif.read_fifo(0, &mut dest).unwrap();
        assert_eq!(dest, [1, 2, 3]);
        assert_eq!(pif.fifo_depth(0), 1);
    }

    #[test]
    fn test_injected_read_failure_fires_once() {
        let mut pif = booted_crate();
        pif.load_fifo(1, &[1, 2]);
        pif.fail_next_read(1);
        let mut dest = [0 as Word; 2];
        assert!(pif.read_fifo(1, &mut dest).is_err());
        assert!(pif.read_fifo(1, &mut dest).is_ok());
    }

    #[test]
    fn test_run_active_tracks_residual_words() {
        let mut pif = booted_crate();
        pif.start_list_mode().unwrap();
        assert!(pif.run_active(0));
        pif.load_fifo(0, &[5, 6]);
        pif.end_run().unwrap();
        assert!(pif.run_active(0));
        assert!(!pif.run_active(1));
        let mut dest = [0 as Word; 2];
        pif.read_fifo(0, &mut dest).unwrap();
        assert!(!pif.run_active(0));
    }

    #[test]
    fn test_unknown_module_param_rejected() {
        let mut pif = booted_crate();
        assert!(pif.write_module_param("NOT_A_PARAM", 1, 0).is_err());
        assert!(pif.write_module_param("IN_SYNCH", 0, 0).is_ok());
        assert_eq!(pif.read_module_param("IN_SYNCH", 0).unwrap(), 0);
    }
}
