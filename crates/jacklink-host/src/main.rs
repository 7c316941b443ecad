//! JackLink Host - reference engine driving the bridge
//!
//! Stands in for a host engine's audio subsystem. It:
//! 1. Loads the bridge settings (YAML) and optionally launches jackd
//! 2. Configures and starts the bridge, with a monitor thread handling
//!    server events and reconnects
//! 3. Runs an engine audio thread that renders a sine tone into the bridge
//!    and pulls captured audio back
//! 4. Prints status once per second, then stops cleanly
//!
//! ## Command line flags
//!
//! - `--config <path>`: settings file (default: `<config dir>/jacklink/settings.yaml`)
//! - `--simulate`: use the in-process simulated server instead of JACK
//! - `--seconds <n>`: run time (default 10, 0 runs until killed)
//! - `--rate <hz>` / `--block <frames>`: engine format (default 48000 / 256)
//! - `--list-ports`: print the server's ports and clients after startup
//! - `--write-default-config`: write default settings and exit

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use jacklink_core::config::{default_config_path, ServerSettings};
use jacklink_core::server::{self, AudioServer, JackdController, SimulatedServer};
use jacklink_core::{
    load_config, save_config, AudioBuffer, BridgeConfig, BridgeError, BridgeLifecycleManager, BridgeMonitor,
    BridgeResult, BridgeState, EngineAudioAdapter, LinkSettings, Sample, StateChange,
};

const TONE_HZ: f32 = 440.0;
const TONE_GAIN: f32 = 0.2;
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);
const JACKD_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

struct Options {
    config: Option<PathBuf>,
    simulate: bool,
    seconds: u64,
    rate: u32,
    block: usize,
    list_ports: bool,
    write_default_config: bool,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
            args.iter()
                .position(|arg| arg == flag)
                .and_then(|i| args.get(i + 1))
                .map(String::as_str)
        }
        fn number<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> Result<T> {
            match value_of(args, flag) {
                Some(value) => value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", flag, value)),
                None => Ok(default),
            }
        }

        for flag in ["--config", "--seconds", "--rate", "--block"] {
            if args.iter().any(|arg| arg == flag) && value_of(args, flag).is_none() {
                bail!("{} needs a value", flag);
            }
        }

        Ok(Self {
            config: value_of(args, "--config").map(PathBuf::from),
            simulate: args.iter().any(|arg| arg == "--simulate"),
            seconds: number(args, "--seconds", 10)?,
            rate: number(args, "--rate", 48000)?,
            block: number(args, "--block", 256)?,
            list_ports: args.iter().any(|arg| arg == "--list-ports"),
            write_default_config: args.iter().any(|arg| arg == "--write-default-config"),
        })
    }
}

/// What the engine thread reports back once per second
struct EngineReport {
    blocks: u64,
    frames_accepted: u64,
    captured_peak: Sample,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let options = Options::parse(&args)?;
    let config_path = options.config.clone().unwrap_or_else(default_config_path);

    if options.write_default_config {
        save_config(&LinkSettings::default(), &config_path)
            .with_context(|| format!("Failed to write default settings to {:?}", config_path))?;
        println!("Wrote default settings to {}", config_path.display());
        return Ok(());
    }

    log::info!("jacklink-host starting up");
    let mut settings: LinkSettings = load_config(&config_path);
    settings.validate();

    let server: Box<dyn AudioServer> = if options.simulate {
        log::info!("Using simulated server (--simulate)");
        Box::new(SimulatedServer::free_running(
            settings.server.sample_rate,
            settings.server.buffer_size,
        ))
    } else {
        server::default_server(&settings)
    };
    let auto_start = !options.simulate && settings.server.auto_start;
    let server_settings = settings.server.clone();

    let engine_config = BridgeConfig::new(options.rate, options.block, settings.output_ports);

    let mut manager = BridgeLifecycleManager::new(server, settings);
    manager.set_observer(|change: &StateChange| match &change.error {
        Some(e) => println!("Bridge {} -> {} ({})", change.from, change.to, e),
        None => println!("Bridge {} -> {}", change.from, change.to),
    });
    manager
        .configure(engine_config)
        .context("Engine format rejected by the bridge")?;

    // Keep the controller alive for the whole run
    let mut jackd: Option<JackdController> = None;
    let mut started = manager.start();
    if auto_start && matches!(started, Err(BridgeError::CapabilityUnavailable(_))) {
        jackd = launch_jackd(server_settings);
        if let Some(controller) = jackd.as_mut() {
            started = wait_for_jackd(&mut manager, controller);
        }
    }

    // A degraded bridge is not fatal: the engine keeps running on silence
    if let Err(e) = started {
        eprintln!("Warning: bridge not active: {}", e);
        if !e.degrades() {
            return Err(e).context("Failed to start bridge");
        }
    }

    if options.list_ports {
        print_graph(&manager);
    }

    let adapter = manager.adapter();
    let bridge = Arc::new(Mutex::new(manager));
    let monitor = BridgeMonitor::spawn(bridge.clone(), MONITOR_INTERVAL)
        .context("Failed to start bridge monitor")?;

    let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
    let (report_tx, report_rx) = crossbeam::channel::unbounded();
    let engine = thread::Builder::new()
        .name("jacklink-engine".into())
        .spawn(move || run_engine(adapter, engine_config, stop_rx, report_tx))
        .context("Failed to spawn engine thread")?;

    report_status(&bridge, &report_rx, options.seconds);

    let _ = stop_tx.send(());
    if engine.join().is_err() {
        log::error!("Engine thread panicked");
    }
    monitor.shutdown();

    let mut manager = bridge.lock().unwrap_or_else(PoisonError::into_inner);
    manager.stop();
    let stats = manager.stats();
    println!(
        "Done: {} sessions, {} cycles, {} server xruns, capture {} / playback {} ring xruns",
        stats.generation,
        stats.cycles,
        stats.server_xruns,
        stats.capture.xruns(),
        stats.playback.xruns()
    );
    drop(manager);

    // Stops jackd when the settings ask for it
    drop(jackd);
    Ok(())
}

/// Launch jackd with the configured arguments
fn launch_jackd(settings: ServerSettings) -> Option<JackdController> {
    let mut controller = JackdController::new(settings);
    match controller.version() {
        Ok(version) => log::info!("Found jackd {}", version),
        Err(e) => log::warn!("Could not query jackd version: {}", e),
    }
    if let Err(e) = controller.start() {
        eprintln!("Warning: could not launch jackd: {}", e);
        return None;
    }
    Some(controller)
}

/// Retry the bridge until the freshly launched jackd accepts it
fn wait_for_jackd(manager: &mut BridgeLifecycleManager, controller: &mut JackdController) -> BridgeResult<()> {
    let deadline = Instant::now() + JACKD_STARTUP_TIMEOUT;
    loop {
        thread::sleep(Duration::from_millis(100));
        match manager.reconnect() {
            Ok(()) => {
                println!("jackd running (pid {:?})", controller.pid());
                return Ok(());
            }
            Err(e) if !controller.is_running() => {
                eprintln!("Warning: jackd exited during startup");
                return Err(e);
            }
            Err(e) if Instant::now() >= deadline => {
                eprintln!("Warning: jackd did not come up within {:?}", JACKD_STARTUP_TIMEOUT);
                return Err(e);
            }
            Err(e) => log::debug!("Waiting for jackd: {}", e),
        }
    }
}

fn print_graph(manager: &BridgeLifecycleManager) {
    match manager.list_clients() {
        Ok(clients) => println!("Clients: {}", clients.join(", ")),
        Err(e) => eprintln!("Warning: could not list clients: {}", e),
    }
    match manager.list_ports(None) {
        Ok(ports) => {
            for port in ports {
                println!("  {}", port);
            }
        }
        Err(e) => eprintln!("Warning: could not list ports: {}", e),
    }
}

/// Engine audio thread: one block per engine period
fn run_engine(
    mut adapter: EngineAudioAdapter,
    config: BridgeConfig,
    stop_rx: Receiver<()>,
    report_tx: Sender<EngineReport>,
) {
    let period = Duration::from_secs_f64(config.buffer_size as f64 / config.sample_rate as f64);
    let phase_step = TONE_HZ / config.sample_rate as f32;
    let mut phase = 0.0f32;
    let mut report = EngineReport {
        blocks: 0,
        frames_accepted: 0,
        captured_peak: 0.0,
    };
    let mut last_report = Instant::now();

    log::info!(
        "Engine thread running: {} ch @ {}Hz, {} frame blocks",
        config.channels,
        config.sample_rate,
        config.buffer_size
    );

    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            default(period) => {}
        }

        let mut block = AudioBuffer::silence(config.channels, config.buffer_size, config.sample_rate);
        for frame in 0..config.buffer_size {
            let value = (phase * std::f32::consts::TAU).sin() * TONE_GAIN;
            for channel in 0..config.channels {
                block.set_sample(frame, channel, value);
            }
            phase = (phase + phase_step).fract();
        }

        match adapter.push_render(&block) {
            Ok(frames) => report.frames_accepted += frames as u64,
            Err(e) => {
                log::error!("Engine block rejected: {}", e);
                break;
            }
        }
        let captured = adapter.pull_captured(config.buffer_size);
        report.captured_peak = report.captured_peak.max(captured.peak());
        report.blocks += 1;

        if last_report.elapsed() >= Duration::from_secs(1) {
            let _ = report_tx.send(report);
            report = EngineReport {
                blocks: 0,
                frames_accepted: 0,
                captured_peak: 0.0,
            };
            last_report = Instant::now();
        }
    }
    log::info!("Engine thread stopped");
}

/// Print one status line per engine report until `seconds` elapse
fn report_status(bridge: &Arc<Mutex<BridgeLifecycleManager>>, reports: &Receiver<EngineReport>, seconds: u64) {
    let started = Instant::now();
    let run_for = (seconds > 0).then(|| Duration::from_secs(seconds));

    while run_for.map_or(true, |limit| started.elapsed() < limit) {
        let report = match reports.recv_timeout(Duration::from_secs(2)) {
            Ok(report) => report,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                eprintln!("Engine thread exited early");
                break;
            }
        };
        let manager = bridge.lock().unwrap_or_else(PoisonError::into_inner);
        let state = manager.current_state();
        let stats = manager.stats();
        let server = manager
            .server_info()
            .map(|info| format!("{}Hz/{}", info.sample_rate, info.buffer_size))
            .unwrap_or_else(|| "-".to_string());
        drop(manager);

        println!(
            "[{:>5.1}s] {:<8} server {:<12} blocks {:>4} accepted {:>6} peak in {:.3} | cycles {} xruns {}/{}/{}",
            started.elapsed().as_secs_f32(),
            state.name(),
            server,
            report.blocks,
            report.frames_accepted,
            report.captured_peak,
            stats.cycles,
            stats.server_xruns,
            stats.capture.xruns(),
            stats.playback.xruns()
        );
        if state == BridgeState::Stopped {
            break;
        }
    }
}
