/// Static configuration for the Micro-Modem driver, reapplied to the modem's
/// NVRAM at every [`super::MicroModemDriver::startup`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Our acoustic address (`SRC` NVRAM parameter).
    pub modem_id: u16,
    /// Line terminator appended to every outbound sentence.
    pub line_delimiter: String,
    /// Serial speed; informational here, the byte transport is external.
    pub serial_baud: u32,
    /// Extra `KEY,VALUE` NVRAM settings written at startup.
    pub nvram_cfg: Vec<String>,
    /// Write `ALL,0` first to factory-reset the NVRAM (skipped on a Hydroid
    /// gateway, which cannot survive the baud reset).
    pub reset_nvram: bool,
    /// Talk through a Hydroid gateway buoy: prefix writes with `#M<id>`,
    /// strip the same prefix on read, and poll the buoy's GPS periodically.
    pub hydroid_gateway_id: Option<u8>,

    /// REMUS LBL transponder turn-around time (ms), written to `TAT`.
    pub remus_turnaround_ms: u32,
    /// Bit mask enabling REMUS beacons A-D.
    pub remus_enable_beacons: u8,

    pub narrowband_turnaround_ms: u32,
    pub narrowband_transmit_freq: u32,
    pub narrowband_transmit_ping_ms: u32,
    pub narrowband_receive_ping_ms: u32,
    /// Up to four receive frequencies; extras are ignored.
    pub narrowband_receive_freq: Vec<u32>,
    pub narrowband_transmit_flag: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            modem_id: 1,
            line_delimiter: "\r\n".to_string(),
            serial_baud: 19200,
            nvram_cfg: Vec::new(),
            reset_nvram: false,
            hydroid_gateway_id: None,
            remus_turnaround_ms: 50,
            remus_enable_beacons: 0b1111,
            narrowband_turnaround_ms: 50,
            narrowband_transmit_freq: 26000,
            narrowband_transmit_ping_ms: 5,
            narrowband_receive_ping_ms: 5,
            narrowband_receive_freq: Vec::new(),
            narrowband_transmit_flag: false,
        }
    }
}
