use clap::{App, Arg};
use pvgate::adapters::{HttpRelayEndpoint, MqttTransport, TtySerialPort};
use pvgate::api;
use pvgate::config::GatewayConfig;
use pvgate::gateway::{Gateway, GatewayHandle, TICK_INTERVAL};
use pvgate::protocol::{SerialError, SerialPort};
use pvgate::telemetry::ResetReason;
use pvgate::SystemClock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "pvgate.json";

/// Stands in for the controller port until the device can be opened.
struct UnavailablePort;

impl SerialPort for UnavailablePort {
    fn write_all(&mut self, _bytes: &[u8]) -> Result<(), SerialError> {
        Err(SerialError("device not open".into()))
    }

    fn read(&mut self) -> nb::Result<u8, SerialError> {
        Err(nb::Error::WouldBlock)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("pvgated")
        .version(env!("CARGO_PKG_VERSION"))
        .about("PV router gateway daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("print-config")
                .long("print-config")
                .help("Print the effective configuration and exit"),
        )
        .get_matches();

    let config = GatewayConfig::load(matches.value_of("config").unwrap_or(DEFAULT_CONFIG))?;
    if matches.is_present("print-config") {
        println!("{}", config.to_json_pretty()?);
        return Ok(());
    }

    println!("☀️  PV Router Gateway");
    println!("====================");

    let shutdown = Arc::new(AtomicBool::new(false));
    let (handle_tx, handle_rx) = mpsc::channel();
    let loop_config = config.clone();
    let loop_shutdown = shutdown.clone();
    let control = thread::Builder::new()
        .name("control".into())
        .spawn(move || run_control_loop(loop_config, loop_shutdown, handle_tx))?;

    let handle = tokio::task::spawn_blocking(move || handle_rx.recv()).await??;

    let listener = TcpListener::bind(&config.api.bind).await?;
    info!("🌐 API listening on {}", config.api.bind);

    tokio::select! {
        result = serve_api(listener, handle) => {
            if let Err(e) = result {
                error!("API server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    if tokio::task::spawn_blocking(move || control.join()).await?.is_err() {
        error!("control loop panicked");
    }
    println!("☀️  PV Router Gateway stopped");
    Ok(())
}

fn open_serial(config: &GatewayConfig) -> Box<dyn SerialPort> {
    match TtySerialPort::open(&config.serial.device, config.serial.baud) {
        Ok(port) => Box::new(port),
        Err(e) => {
            warn!(error = %e, "serial device unavailable, will retry on watchdog restart");
            Box::new(UnavailablePort)
        }
    }
}

fn connect_mqtt(config: &GatewayConfig, handle: &GatewayHandle) -> MqttTransport {
    let handle = handle.clone();
    MqttTransport::connect(
        &config.mqtt,
        Box::new(move |intent| {
            if let Err(e) = handle.submit(intent) {
                warn!(?intent, error = %e, "dropping MQTT command");
            }
        }),
    )
}

/// Owns the gateway for its whole life. Everything else talks to it through
/// the handle sent back on `handle_tx`.
fn run_control_loop(
    config: GatewayConfig,
    shutdown: Arc<AtomicBool>,
    handle_tx: mpsc::Sender<GatewayHandle>,
) {
    let clock = Arc::new(SystemClock::new(config.network.utc_offset_min));
    let mut gateway = Gateway::new(&config, clock, open_serial(&config));
    gateway.set_reset_reason(ResetReason::PowerOn);

    if config.relay.enabled {
        match HttpRelayEndpoint::new(&config.relay) {
            Ok(endpoint) => gateway = gateway.with_mirror(Box::new(endpoint), config.mirror_period()),
            Err(e) => warn!(error = %e, "remote relay mirror disabled"),
        }
    }

    let handle = gateway.handle();
    if config.mqtt.enabled {
        gateway.replace_transport(Box::new(connect_mqtt(&config, &handle)));
    }
    if handle_tx.send(handle.clone()).is_err() {
        return;
    }

    info!("control loop running");
    while !shutdown.load(Ordering::Relaxed) {
        let report = gateway.tick();
        if report.watchdog.restart_serial {
            gateway.replace_serial(open_serial(&config));
        }
        if report.watchdog.restart_network && config.mqtt.enabled {
            gateway.replace_transport(Box::new(connect_mqtt(&config, &handle)));
        }
        thread::sleep(TICK_INTERVAL);
    }
    info!("control loop stopped");
}

async fn serve_api(listener: TcpListener, handle: GatewayHandle) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("🔗 API client connected: {}", addr);
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, handle).await {
                warn!("API client {} error: {}", addr, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, handle: GatewayHandle) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = api::handle_line(&line, &handle);
        let mut body = serde_json::to_string(&response)?;
        body.push('\n');
        writer.write_all(body.as_bytes()).await?;
    }
    Ok(())
}
