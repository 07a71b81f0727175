//! Headless display client: subscribes to engine slots on the hub and drives
//! a null engine per slot.

use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn, LevelFilter};

use bauklank_engine::{EngineError, EngineScheduler, NullEngine, SlotBank};
use bauklank_net::{ConnectionState, HubConnection, HubEvent};
use bauklank_net::protocol::HubMessage;
use bauklank_types::SlotId;

const TICK: Duration = Duration::from_millis(5);
const DEFAULT_URL: &str = "ws://localhost:8765";
const DEFAULT_DURATION_SECS: f64 = 60.0;

struct PlayerArgs {
    url: String,
    slots: Vec<SlotId>,
    duration: f64,
    verbose: bool,
}

fn parse_args(args: &[String]) -> Result<PlayerArgs, String> {
    let mut parsed = PlayerArgs {
        url: DEFAULT_URL.to_string(),
        slots: Vec::new(),
        duration: DEFAULT_DURATION_SECS,
        verbose: false,
    };
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--url" => {
                parsed.url = iter.next().ok_or("--url needs a value")?.clone();
            }
            "--slot" => {
                let value = iter.next().ok_or("--slot needs a value")?;
                for name in value.split(',') {
                    let slot = SlotId::parse(name).ok_or_else(|| format!("invalid slot '{}'", name))?;
                    if !parsed.slots.contains(&slot) {
                        parsed.slots.push(slot);
                    }
                }
            }
            "--duration" => {
                let value = iter.next().ok_or("--duration needs a value")?;
                parsed.duration = value
                    .parse::<f64>()
                    .ok()
                    .filter(|d| d.is_finite() && *d >= 0.0)
                    .ok_or_else(|| format!("invalid duration '{}'", value))?;
            }
            "--verbose" | "-v" => parsed.verbose = true,
            other => return Err(format!("unknown argument '{}'", other)),
        }
    }
    if parsed.slots.is_empty() {
        parsed.slots = bauklank_types::slot_range(1);
    }
    Ok(parsed)
}

fn init_logging(verbose: bool) {
    use simplelog::*;

    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Error)
        .build();
    if TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto).is_err() {
        eprintln!("bauklank-player: logger already initialized");
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let args = match parse_args(&args) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("bauklank-player: {}", e);
            eprintln!("usage: bauklank-player [--url URL] [--slot A,B] [--duration SECS] [--verbose]");
            std::process::exit(2);
        }
    };
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: PlayerArgs) -> Result<(), EngineError> {
    let mut bank = SlotBank::new();
    for slot in &args.slots {
        let mut scheduler = EngineScheduler::new(*slot)?;
        scheduler.load_source(Box::new(NullEngine::new()), args.duration);
        bank.insert(scheduler);
    }
    info!("Player for slots {:?} connecting to {}", bank.slots(), args.url);

    let mut connection = HubConnection::new(args.url.clone(), bank.slots());
    connection.connect();

    loop {
        let now = Instant::now();
        for event in connection.poll(now) {
            match event {
                HubEvent::State(state) => {
                    match (&state, connection.last_error()) {
                        (ConnectionState::Reconnecting { .. }, Some(e)) => {
                            warn!("Hub connection: {} ({})", state, e)
                        }
                        _ => info!("Hub connection: {}", state),
                    }
                }
                HubEvent::Message(HubMessage::ServerVersion { version }) => {
                    info!("Hub version {}", version);
                }
                HubEvent::Message(msg) => {
                    bank.handle(&msg, now);
                }
            }
        }
        bank.poll(now);
        thread::sleep(TICK);
    }
}
