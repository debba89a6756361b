use anyhow::{Result, bail};
use clap::Parser;
use slog::{Drain, FnValue, Logger, PushFnValue, Record, error, info, o};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tikv_jemallocator::Jemalloc;
use modem::api::API;
use modem::at::AtChannel;
use modem::ec2x::{QuectelEc2x, StdDelay};
use modem::gpio::SysfsPin;
use modem::metrics::start_metrics_server;
use modem::modem::{Modem, ModemWorker, PowerAction};
use modem::tty::open_serial;
use modem::{Ec2xConfig, FlowControlPins};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Config {
    #[clap(long, env = "CLUSTER", default_value = "ua-1")]
    cluster: String,

    #[clap(long, env = "IP", default_value = "127.0.0.1")]
    ip: String,

    /// Serial device of the module's AT port
    #[clap(long, env = "MODEM_DEVICE", default_value = "/dev/ttyUSB2")]
    device: String,

    #[clap(long, env = "MODEM_BAUDRATE", default_value = "115200")]
    baudrate: u32,

    /// sysfs GPIO number of the power key line
    #[clap(long, env = "MODEM_PWR_PIN")]
    pwr_pin: Option<u32>,

    /// sysfs GPIO number of the reset line
    #[clap(long, env = "MODEM_RST_PIN")]
    rst_pin: Option<u32>,

    /// Drive power key and reset low to assert them
    #[clap(long, env = "MODEM_ACTIVE_LOW")]
    active_low: bool,

    #[clap(long, env = "MODEM_START_TIMEOUT_MS", default_value = "15000")]
    start_timeout_ms: u64,

    #[clap(long, env = "MODEM_AT_TIMEOUT_MS", default_value = "8000")]
    at_timeout_ms: u64,

    /// RTS pin of the serial link; together with --cts-pin enables flow control
    #[clap(long, env = "MODEM_RTS_PIN")]
    rts_pin: Option<u32>,

    #[clap(long, env = "MODEM_CTS_PIN")]
    cts_pin: Option<u32>,

    /// Power the module on and wait for RDY before serving
    #[clap(long, env = "BOOT_ON_START")]
    boot_on_start: bool,

    #[clap(long, env = "PORT_API", default_value = "4444")]
    port_api: u16,

    #[clap(long, env = "PORT_PROMETHEUS", default_value = "8888")]
    port_prometheus: u16,

    #[clap(long, env = "PROMETHEUS_USERNAME", default_value = "")]
    prometheus_username: String,

    #[clap(long, env = "PROMETHEUS_PASSWORD", default_value = "")]
    prometheus_password: String,
}

impl Config {
    fn ec2x(&self) -> Result<Ec2xConfig> {
        let flow_control = match (self.rts_pin, self.cts_pin) {
            (Some(rts), Some(cts)) => Some(FlowControlPins { rts, cts }),
            (None, None) => None,
            _ => bail!("--rts-pin and --cts-pin must be given together"),
        };

        let cfg = Ec2xConfig::builder()
            .device(self.device.clone())
            .baudrate(self.baudrate)
            .pwr_pin(self.pwr_pin)
            .rst_pin(self.rst_pin)
            .active_high(!self.active_low)
            .start_timeout(Duration::from_millis(self.start_timeout_ms))
            .flow_control(flow_control)
            .build()?;
        Ok(cfg)
    }
}

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();

    let drain = slog_json::Json::new(std::io::stdout())
        .add_key_value(o!(
            "timestamp" => FnValue(move |_ : &Record| {
                    time::OffsetDateTime::now_utc()
                    .format(&time::format_description::well_known::Rfc3339)
                    .ok()
            }),
            "cluster" => cfg.cluster.clone(),
            "ip" => cfg.ip.clone(),
            "level" => FnValue(move |rinfo : &Record| {
                match rinfo.level() {
                    slog::Level::Critical => "critical",
                    slog::Level::Error => "error",
                    slog::Level::Warning => "warn",
                    slog::Level::Info => "info",
                    slog::Level::Debug => "debug",
                    slog::Level::Trace => "trace",
                }
            }),
            "msg" => PushFnValue(move |record : &Record, ser| {
                ser.emit(record.msg())
            }),
            "caller" => FnValue(move |rinfo : &Record| {
                format!("{}:{}", rinfo.file(), rinfo.line())
            }),
            "app" => "ec2x-powerd".to_string(),
        ))
        .build();

    let logger = Logger::root(slog_async::Async::new(drain.fuse()).build().fuse(), o!());

    let ec2x_cfg = cfg.ec2x()?;
    let inactive = !ec2x_cfg.active_high;

    let serial = open_serial(
        &ec2x_cfg.device,
        ec2x_cfg.baudrate,
        ec2x_cfg.flow_control_enabled(),
    )?;
    let channel = AtChannel::new(
        serial,
        Duration::from_millis(cfg.at_timeout_ms),
        logger.new(o!("component" => "at")),
    );

    let pwr_key = ec2x_cfg
        .pwr_pin
        .map(|pin| SysfsPin::export(pin, inactive))
        .transpose()?;
    let rst = ec2x_cfg
        .rst_pin
        .map(|pin| SysfsPin::export(pin, inactive))
        .transpose()?;

    let controller = QuectelEc2x::new(
        channel,
        pwr_key,
        rst,
        StdDelay,
        &ec2x_cfg,
        logger.new(o!("component" => "ec2x")),
    )?;
    info!(logger, "Modem controller assembled";
        "device" => &ec2x_cfg.device,
        "baudrate" => ec2x_cfg.baudrate,
        "flow_control" => ec2x_cfg.flow_control_enabled());

    let worker = Arc::new(ModemWorker::new(controller, ec2x_cfg, logger.clone()));

    if cfg.boot_on_start {
        // a failed boot is left to the operator to retry through the API
        for action in [PowerAction::HardOn, PowerAction::SoftOn] {
            if let Err(e) = worker.power(action).await {
                error!(logger, "boot on start failed"; "action" => action.as_str(), "error" => %e);
                break;
            }
        }
    }

    let prometheus_addr = SocketAddr::from(([0, 0, 0, 0], cfg.port_prometheus));

    let shutdown_metrics = start_metrics_server(
        prometheus_addr,
        cfg.prometheus_username,
        cfg.prometheus_password,
        logger.clone(),
    ).await?;

    info!(logger, "Prometheus Started"; "addr" => %prometheus_addr);

    let api_addr = SocketAddr::from(([0, 0, 0, 0], cfg.port_api));

    let api = API::builder()
        .modem(worker)
        .addr(api_addr)
        .logger(Option::from(logger.clone()))
        .build()?;

    info!(logger, "API Started"; "addr" => %api_addr);

    if let Err(e) = api.run().await {
        error!(logger, "api error"; "error" => %e);
    }

    let _ = shutdown_metrics.send(());

    Ok(())
}
