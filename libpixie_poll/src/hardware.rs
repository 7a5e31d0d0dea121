use super::constants::Word;
use super::error::GatewayError;

/// How much of the crate firmware to reload on boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Download parameters, set the DACs and program the FPGAs.
    Fast,
    /// Full boot of every firmware component.
    Full,
}

/// Capability interface over the digitizer crate.
///
/// Everything that touches the device goes through this trait, so the run
/// controller and the command dispatcher can be driven against the crate
/// simulator in tests. Implementations do not retry; a failure propagates
/// as an error and the caller decides what to do with the run.
pub trait HardwareGateway: Send {
    /// Read the physical slot assignment from the crate configuration.
    fn discover_slots(&mut self) -> Result<(), GatewayError>;

    /// Bring up the vendor library. Must precede [HardwareGateway::boot].
    fn init(&mut self) -> Result<(), GatewayError>;

    /// Boot every module.
    fn boot(&mut self, mode: BootMode) -> Result<(), GatewayError>;

    /// Number of modules discovered at init.
    fn num_modules(&self) -> usize;

    /// The declared physical slot of a module. Event headers carry the slot
    /// and a mismatch against this value means the stream is corrupt.
    fn slot_of(&self, module: usize) -> u8;

    /// Number of words currently held in a module's external FIFO.
    fn fifo_depth(&self, module: usize) -> u32;

    /// Bulk-read `dest.len()` words from a module's FIFO.
    fn read_fifo(&mut self, module: usize, dest: &mut [Word]) -> Result<(), GatewayError>;

    /// Start a list-mode run across the crate.
    fn start_list_mode(&mut self) -> Result<(), GatewayError>;

    /// Start a histogram run across the crate (MCA).
    fn start_histogram_run(&mut self) -> Result<(), GatewayError>;

    /// End the active run, list-mode or histogram.
    fn end_run(&mut self) -> Result<(), GatewayError>;

    /// Whether a module considers its run still in progress. After
    /// [HardwareGateway::end_run] a module stays active until its FIFO
    /// has been read out.
    fn run_active(&self, module: usize) -> bool;

    /// Clear any preset run length so a run is bounded only by the operator.
    fn remove_preset_run_length(&mut self, module: usize) -> Result<(), GatewayError>;

    /// Read back the MCA histogram of one channel.
    fn read_histogram(&self, module: usize, channel: usize) -> Result<Vec<u32>, GatewayError>;

    fn read_module_param(&self, name: &str, module: usize) -> Result<u32, GatewayError>;

    fn write_module_param(
        &mut self,
        name: &str,
        value: u32,
        module: usize,
    ) -> Result<(), GatewayError>;

    fn read_channel_param(
        &self,
        name: &str,
        module: usize,
        channel: usize,
    ) -> Result<f64, GatewayError>;

    fn write_channel_param(
        &mut self,
        name: &str,
        value: f64,
        module: usize,
        channel: usize,
    ) -> Result<(), GatewayError>;

    /// Commit the working parameter set to the DSP settings file.
    fn save_dsp_parameters(&mut self) -> Result<(), GatewayError>;

    /// Adjust the DC offsets of one module's inputs.
    fn adjust_offsets(&mut self, module: usize) -> Result<(), GatewayError>;

    /// Measure the decay constant of one channel, in microseconds.
    fn find_tau(&self, module: usize, channel: usize) -> Result<f64, GatewayError>;
}
