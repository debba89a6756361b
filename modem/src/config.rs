use std::time::Duration;

use derive_builder::Builder;
use serde::Serialize;

/// How long the module may take to print `RDY` after a reset.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(15000);
pub const DEFAULT_BAUDRATE: u32 = 115200;
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB2";

/// RTS/CTS lines of the serial link. Their presence turns on hardware
/// flow control, both on the host tty and inside the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowControlPins {
    pub rts: u32,
    pub cts: u32,
}

/// Wiring and timing of one EC2x module.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "mutable", build_fn(validate = "Self::validate"))]
pub struct Ec2xConfig {
    /// Serial device carrying the AT channel
    #[builder(default = "DEFAULT_DEVICE.to_string()", setter(into))]
    pub device: String,
    #[builder(default = "DEFAULT_BAUDRATE")]
    pub baudrate: u32,
    /// Power key GPIO, `None` when not wired
    #[builder(default)]
    pub pwr_pin: Option<u32>,
    /// Reset GPIO, `None` when not wired
    #[builder(default)]
    pub rst_pin: Option<u32>,
    #[builder(default = "true")]
    pub active_high: bool,
    #[builder(default = "DEFAULT_START_TIMEOUT")]
    pub start_timeout: Duration,
    #[builder(default)]
    pub flow_control: Option<FlowControlPins>,
}

impl Ec2xConfig {
    pub fn builder() -> Ec2xConfigBuilder {
        Ec2xConfigBuilder::default()
    }

    pub fn flow_control_enabled(&self) -> bool {
        self.flow_control.is_some()
    }
}

impl Default for Ec2xConfig {
    fn default() -> Self {
        Ec2xConfig {
            device: DEFAULT_DEVICE.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            pwr_pin: None,
            rst_pin: None,
            active_high: true,
            start_timeout: DEFAULT_START_TIMEOUT,
            flow_control: None,
        }
    }
}

impl Ec2xConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let (Some(Some(pwr)), Some(Some(rst))) = (self.pwr_pin, self.rst_pin) {
            if pwr == rst {
                return Err(format!("power and reset share gpio {}", pwr));
            }
        }
        if let Some(Some(fc)) = self.flow_control {
            if fc.rts == fc.cts {
                return Err(format!("rts and cts share pin {}", fc.rts));
            }
        }
        if let Some(timeout) = self.start_timeout {
            if timeout.is_zero() {
                return Err("start timeout must be non-zero".to_string());
            }
        }
        if self.baudrate == Some(0) {
            return Err("baudrate must be non-zero".to_string());
        }
        Ok(())
    }
}
