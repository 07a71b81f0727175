use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, LevelFilter};

use bauklank_hub::config::config_path_arg;
use bauklank_hub::{Hub, HubConfig, HubError, SystemFacts, SystemSerial};
use bauklank_net::FanoutServer;

/// Control loop period.
const TICK: Duration = Duration::from_millis(2);

fn init_logging() {
    use simplelog::*;

    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .build();

    // The max level is lowered right after startup; the logger itself passes everything.
    if TermLogger::init(LevelFilter::Trace, config, TerminalMode::Stderr, ColorChoice::Auto).is_err() {
        eprintln!("bauklank-hub: logger already initialized");
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    init_logging();

    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<(), HubError> {
    let mut config = HubConfig::load(config_path_arg(args).as_deref())?;
    config.apply_args(args)?;

    log::set_max_level(config.startup_log_level);
    info!("Bauklank hub starting up");
    info!("Engines: {:?}", config.engine_slots);
    info!(
        "Serial: baud={} scanEvery={:?} probeTimeout={:?}",
        config.serial.baud,
        config.serial.scan_interval,
        config.serial.probe_timeout
    );
    match &config.serial.allowlist {
        Some(list) => info!("deviceId allowlist: {:?} (strict)", list),
        None => info!("deviceId allowlist: any"),
    }
    if !config.identity.is_empty() {
        info!("Identity slots: {:?}", config.identity);
    }
    if !config.serial.exclude.is_empty() {
        info!("Serial exclude list: {:?}", config.serial.exclude);
    }

    let addr = config.bind_addr();
    let mut server = FanoutServer::bind(&addr).map_err(|source| HubError::Bind {
        addr: addr.clone(),
        source,
    })?;
    info!("WebSocket server started on ws://{}", addr);
    log::set_max_level(config.run_log_level);

    let facts = SystemFacts::new(config.append_git_hash, config.append_dirty_suffix);
    let mut hub = Hub::new(config, Arc::new(SystemSerial), Box::new(facts));

    loop {
        let now = Instant::now();

        for client_id in server.accept_connections() {
            for msg in hub.greeting(now) {
                server.send_to(client_id, &msg);
            }
        }
        server.poll_events();

        for msg in hub.step(now) {
            server.broadcast(&msg);
        }

        thread::sleep(TICK);
    }
}
