use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use embedded_hal::{delay::DelayNs, digital::OutputPin};
use slog::{debug, info, warn, Logger};

use crate::{
    at::{CommandChannel, OK},
    config::Ec2xConfig,
    error::{DeviceFault, ModemError, Result},
    gpio::DigitalOut,
    modem::{BootStage, PowerControl},
    properties::{CellularProperties, EC2X_PROPERTIES},
};

/// Short press: the module powers up.
pub const POWER_ON_PRESS: Duration = Duration::from_millis(600);
/// Long press: the module shuts down.
pub const POWER_OFF_PRESS: Duration = Duration::from_millis(750);
pub const RESET_HOLD: Duration = Duration::from_millis(460);
/// Inactive time after every pulse before the line may be touched again.
pub const SETTLE: Duration = Duration::from_millis(100);

/// Printed by the firmware once boot has finished.
pub const READY_TAG: &str = "RDY";

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Holds the command channel locked; unlocks on drop so every return path
/// gives the channel back.
struct ChannelLock<'a, C: CommandChannel> {
    at: &'a mut C,
}

impl<'a, C: CommandChannel> ChannelLock<'a, C> {
    fn new(at: &'a mut C) -> Self {
        at.lock();
        ChannelLock { at }
    }
}

impl<C: CommandChannel> Deref for ChannelLock<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.at
    }
}

impl<C: CommandChannel> DerefMut for ChannelLock<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.at
    }
}

impl<C: CommandChannel> Drop for ChannelLock<'_, C> {
    fn drop(&mut self) {
        self.at.unlock();
    }
}

fn advance(stage: &mut BootStage, logger: &Logger, next: BootStage) {
    debug!(logger, "boot stage"; "from" => %stage, "to" => %next);
    *stage = next;
}

/// Power sequencing for a Quectel EC2x (EC21/EC25) module.
pub struct QuectelEc2x<C, P, D> {
    at: C,
    pwr_key: DigitalOut<P>,
    rst: DigitalOut<P>,
    delay: D,
    active_high: bool,
    start_timeout: Duration,
    flow_control: bool,
    stage: BootStage,
    logger: Logger,
}

impl<C, P, D> QuectelEc2x<C, P, D>
where
    C: CommandChannel,
    P: OutputPin,
    P::Error: Into<ModemError>,
    D: DelayNs,
{
    /// Both lines are driven inactive straight away.
    pub fn new(
        at: C,
        pwr_key: Option<P>,
        rst: Option<P>,
        delay: D,
        config: &Ec2xConfig,
        logger: Logger,
    ) -> Result<Self> {
        let inactive = !config.active_high;
        let pwr_key = DigitalOut::from_option(pwr_key, inactive).map_err(Into::into)?;
        let rst = DigitalOut::from_option(rst, inactive).map_err(Into::into)?;

        info!(logger, "EC2x controller ready";
            "power_key" => pwr_key.is_connected(),
            "reset" => rst.is_connected(),
            "active_high" => config.active_high,
            "flow_control" => config.flow_control_enabled()
        );

        Ok(QuectelEc2x {
            at,
            pwr_key,
            rst,
            delay,
            active_high: config.active_high,
            start_timeout: config.start_timeout,
            flow_control: config.flow_control_enabled(),
            stage: BootStage::Idle,
            logger,
        })
    }

    pub fn channel(&self) -> &C {
        &self.at
    }

    fn sleep(&mut self, d: Duration) {
        self.delay
            .delay_ms(u32::try_from(d.as_millis()).unwrap_or(u32::MAX));
    }

    /// Hold the power key for `hold`, then let it settle.
    pub fn press_power_button(&mut self, hold: Duration) -> Result<()> {
        if !self.pwr_key.is_connected() {
            return Ok(());
        }

        debug!(self.logger, "pressing power key"; "hold_ms" => hold.as_millis() as u64);
        // whatever the last boot reached no longer describes the module
        advance(&mut self.stage, &self.logger, BootStage::Idle);
        self.pwr_key.set(self.active_high).map_err(Into::into)?;
        self.sleep(hold);
        self.pwr_key.set(!self.active_high).map_err(Into::into)?;
        self.sleep(SETTLE);

        Ok(())
    }

    fn pulse_reset(&mut self) -> Result<()> {
        self.rst.set(self.active_high).map_err(Into::into)?;
        advance(&mut self.stage, &self.logger, BootStage::ResetAsserted);
        self.sleep(RESET_HOLD);
        self.rst.set(!self.active_high).map_err(Into::into)?;
        advance(&mut self.stage, &self.logger, BootStage::ResetReleased);
        self.sleep(SETTLE);
        Ok(())
    }

    /// Waits for `RDY` and, when RTS/CTS is wired, turns on and persists
    /// hardware flow control. The channel lock is held from the ready wait
    /// through the flow-control commands.
    fn await_ready(&mut self) -> Result<bool> {
        let mut at = ChannelLock::new(&mut self.at);

        at.set_at_timeout(self.start_timeout);
        at.resp_start();
        at.set_stop_tag(READY_TAG);
        advance(&mut self.stage, &self.logger, BootStage::AwaitingReady);
        let rdy = at.consume_to_stop_tag();
        at.set_stop_tag(OK);
        at.restore_at_timeout();

        if let Some(e) = at.take_io_error() {
            return Err(ModemError::Channel(e));
        }

        if rdy {
            advance(&mut self.stage, &self.logger, BootStage::ReadySeen);
        } else {
            advance(&mut self.stage, &self.logger, BootStage::ReadyTimeout);
        }

        if self.flow_control {
            // RDY and the IFC reply may both arrive garbled while the module
            // still runs without flow control. Persisting with &W makes the
            // next boot start with RTS/CTS on even if this one fails.
            at.at_cmd_discard("+IFC", "=", &[2, 2]).map_err(|e| {
                warn!(self.logger, "set flow control failed"; "error" => %e);
                ModemError::Device(DeviceFault::FlowControl)
            })?;
            at.at_cmd_discard("&W", "", &[]).map_err(|e| {
                warn!(self.logger, "save settings failed"; "error" => %e);
                ModemError::Device(DeviceFault::SaveSettings)
            })?;
            advance(&mut self.stage, &self.logger, BootStage::FlowControlConfigured);
        }

        Ok(rdy)
    }

    fn boot(&mut self) -> Result<()> {
        self.pulse_reset()?;

        if !self.await_ready()? {
            warn!(self.logger, "modem did not report ready";
                "timeout_ms" => self.start_timeout.as_millis() as u64);
            return Err(ModemError::Device(DeviceFault::NotReady));
        }
        Ok(())
    }
}

impl<C, P, D> PowerControl for QuectelEc2x<C, P, D>
where
    C: CommandChannel,
    P: OutputPin,
    P::Error: Into<ModemError>,
    D: DelayNs,
{
    fn hard_power_on(&mut self) -> Result<()> {
        info!(self.logger, "hard power on");
        self.press_power_button(POWER_ON_PRESS)
    }

    fn hard_power_off(&mut self) -> Result<()> {
        info!(self.logger, "hard power off");
        self.press_power_button(POWER_OFF_PRESS)
    }

    fn soft_power_on(&mut self) -> Result<()> {
        if !self.rst.is_connected() {
            debug!(self.logger, "no reset line, skipping soft power on");
            advance(&mut self.stage, &self.logger, BootStage::Idle);
            return Ok(());
        }

        info!(self.logger, "soft power on"; "timeout_ms" => self.start_timeout.as_millis() as u64);
        let result = self.boot();

        let end = match &result {
            Ok(()) => BootStage::Done,
            Err(ModemError::Device(DeviceFault::NotReady)) => BootStage::ReadyTimeout,
            Err(_) => BootStage::Failed,
        };
        advance(&mut self.stage, &self.logger, end);
        result
    }

    fn soft_power_off(&mut self) -> Result<()> {
        self.hard_power_off()
    }

    fn boot_stage(&self) -> BootStage {
        self.stage
    }

    fn model(&self) -> &'static str {
        "Quectel EC2x"
    }

    fn properties(&self) -> &'static CellularProperties {
        &EC2X_PROPERTIES
    }
}
