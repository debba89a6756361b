use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, TryLockError},
};

use async_trait::async_trait;
use serde::Serialize;
use slog::{error, info, Logger};
use thiserror::Error;

use crate::{
    config::{Ec2xConfig, FlowControlPins},
    error::{ModemError, Result},
    metrics::{POWER_OPERATIONS, POWER_OPERATION_SECONDS},
    properties::CellularProperties,
};

/// Blocking power sequencing of one module. Calls sleep the current thread.
pub trait PowerControl {
    fn hard_power_on(&mut self) -> Result<()>;
    fn hard_power_off(&mut self) -> Result<()>;
    fn soft_power_on(&mut self) -> Result<()>;
    fn soft_power_off(&mut self) -> Result<()>;

    /// Where the last reset-based boot got to.
    fn boot_stage(&self) -> BootStage;

    fn model(&self) -> &'static str;

    fn properties(&self) -> &'static CellularProperties;

    fn run(&mut self, action: PowerAction) -> Result<()> {
        match action {
            PowerAction::HardOn => self.hard_power_on(),
            PowerAction::HardOff => self.hard_power_off(),
            PowerAction::SoftOn => self.soft_power_on(),
            PowerAction::SoftOff => self.soft_power_off(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootStage {
    Idle,
    ResetAsserted,
    ResetReleased,
    AwaitingReady,
    ReadyTimeout,
    ReadySeen,
    FlowControlConfigured,
    Done,
    /// Reset pulse, channel I/O or a flow-control command failed
    Failed,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootStage::Idle => "idle",
            BootStage::ResetAsserted => "reset_asserted",
            BootStage::ResetReleased => "reset_released",
            BootStage::AwaitingReady => "awaiting_ready",
            BootStage::ReadyTimeout => "ready_timeout",
            BootStage::ReadySeen => "ready_seen",
            BootStage::FlowControlConfigured => "flow_control_configured",
            BootStage::Done => "done",
            BootStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerAction {
    HardOn,
    HardOff,
    SoftOn,
    SoftOff,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::HardOn => "hard-on",
            PowerAction::HardOff => "hard-off",
            PowerAction::SoftOn => "soft-on",
            PowerAction::SoftOff => "soft-off",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown power action `{0}`")]
pub struct UnknownAction(pub String);

impl FromStr for PowerAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hard-on" => Ok(PowerAction::HardOn),
            "hard-off" => Ok(PowerAction::HardOff),
            "soft-on" => Ok(PowerAction::SoftOn),
            "soft-off" => Ok(PowerAction::SoftOff),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModemStatus {
    pub model: &'static str,
    pub active_high: bool,
    pub pwr_pin: Option<u32>,
    pub rst_pin: Option<u32>,
    pub flow_control: Option<FlowControlPins>,
    pub start_timeout_ms: u64,
    /// A power operation is running right now
    pub busy: bool,
    pub boot_stage: Option<BootStage>,
    pub properties: CellularProperties,
}

#[async_trait]
pub trait Modem: Send + Sync {
    async fn power(&self, action: PowerAction) -> Result<()>;

    fn status(&self) -> ModemStatus;
}

/// Runs a blocking [`PowerControl`] on tokio's blocking pool so a 15 s boot
/// wait never parks an async worker. Operations are serialized.
pub struct ModemWorker<T> {
    inner: Arc<Mutex<T>>,
    model: &'static str,
    properties: CellularProperties,
    config: Ec2xConfig,
    logger: Logger,
}

impl<T: PowerControl + Send + 'static> ModemWorker<T> {
    pub fn new(modem: T, config: Ec2xConfig, logger: Logger) -> Self {
        ModemWorker {
            model: modem.model(),
            properties: *modem.properties(),
            inner: Arc::new(Mutex::new(modem)),
            config,
            logger,
        }
    }
}

#[async_trait]
impl<T: PowerControl + Send + 'static> Modem for ModemWorker<T> {
    async fn power(&self, action: PowerAction) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let timer = POWER_OPERATION_SECONDS
            .with_label_values(&[action.as_str()])
            .start_timer();

        let joined = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut modem = inner.lock().map_err(|_| ModemError::Poisoned)?;
            modem.run(action)
        })
        .await;
        timer.observe_duration();

        let result = joined
            .map_err(|e| ModemError::Worker(e.to_string()))
            .and_then(|r| r);

        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) if e.is_device_error() => "device_error",
            Err(_) => "error",
        };
        POWER_OPERATIONS
            .with_label_values(&[action.as_str(), outcome])
            .inc();

        match &result {
            Ok(()) => info!(self.logger, "power operation done"; "action" => action.as_str()),
            Err(e) => error!(self.logger, "power operation failed";
                "action" => action.as_str(), "error" => %e),
        }

        result
    }

    fn status(&self) -> ModemStatus {
        let (busy, boot_stage) = match self.inner.try_lock() {
            Ok(m) => (false, Some(m.boot_stage())),
            Err(TryLockError::WouldBlock) => (true, None),
            Err(TryLockError::Poisoned(_)) => (false, None),
        };

        ModemStatus {
            model: self.model,
            active_high: self.config.active_high,
            pwr_pin: self.config.pwr_pin,
            rst_pin: self.config.rst_pin,
            flow_control: self.config.flow_control,
            start_timeout_ms: self.config.start_timeout.as_millis() as u64,
            busy,
            boot_stage,
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::DeviceFault, properties::EC2X_PROPERTIES};

    #[derive(Default)]
    struct ScriptedModem {
        calls: Vec<PowerAction>,
        fail_soft_on: bool,
    }

    impl PowerControl for ScriptedModem {
        fn hard_power_on(&mut self) -> Result<()> {
            self.calls.push(PowerAction::HardOn);
            Ok(())
        }

        fn hard_power_off(&mut self) -> Result<()> {
            self.calls.push(PowerAction::HardOff);
            Ok(())
        }

        fn soft_power_on(&mut self) -> Result<()> {
            self.calls.push(PowerAction::SoftOn);
            if self.fail_soft_on {
                return Err(ModemError::Device(DeviceFault::NotReady));
            }
            Ok(())
        }

        fn soft_power_off(&mut self) -> Result<()> {
            self.calls.push(PowerAction::SoftOff);
            Ok(())
        }

        fn boot_stage(&self) -> BootStage {
            if self.fail_soft_on {
                BootStage::ReadyTimeout
            } else {
                BootStage::Idle
            }
        }

        fn model(&self) -> &'static str {
            "scripted"
        }

        fn properties(&self) -> &'static CellularProperties {
            &EC2X_PROPERTIES
        }
    }

    fn worker(modem: ScriptedModem) -> ModemWorker<ScriptedModem> {
        let config = Ec2xConfig {
            rst_pin: Some(27),
            ..Ec2xConfig::default()
        };
        ModemWorker::new(modem, config, Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn parses_actions() {
        for action in [
            PowerAction::HardOn,
            PowerAction::HardOff,
            PowerAction::SoftOn,
            PowerAction::SoftOff,
        ] {
            assert_eq!(action.as_str().parse::<PowerAction>().unwrap(), action);
        }
        let err = "reboot".parse::<PowerAction>().unwrap_err();
        assert_eq!(err.to_string(), "unknown power action `reboot`");
    }

    #[tokio::test]
    async fn worker_dispatches_in_order() {
        let w = worker(ScriptedModem::default());
        w.power(PowerAction::HardOn).await.unwrap();
        w.power(PowerAction::SoftOn).await.unwrap();
        w.power(PowerAction::SoftOff).await.unwrap();
        let calls = w.inner.lock().unwrap().calls.clone();
        assert_eq!(
            calls,
            vec![PowerAction::HardOn, PowerAction::SoftOn, PowerAction::SoftOff]
        );
    }

    #[tokio::test]
    async fn worker_surfaces_device_errors() {
        let w = worker(ScriptedModem {
            fail_soft_on: true,
            ..ScriptedModem::default()
        });
        let err = w.power(PowerAction::SoftOn).await.unwrap_err();
        assert!(err.is_device_error());
        assert_eq!(w.status().boot_stage, Some(BootStage::ReadyTimeout));
    }

    #[test]
    fn status_reports_wiring() {
        let status = worker(ScriptedModem::default()).status();
        assert_eq!(status.model, "scripted");
        assert_eq!(status.rst_pin, Some(27));
        assert_eq!(status.start_timeout_ms, 15000);
        assert!(!status.busy);
        assert_eq!(status.boot_stage, Some(BootStage::Idle));
    }
}
