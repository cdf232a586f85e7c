//! Runnable gateway process. Loads a fleet config file, wires up the
//! default (HTTP-less, in-memory) collaborators and runs until interrupted.
//! The HTTP front door itself is an external collaborator (spec's Non-goal
//! list) — this binary is the standalone engine a front door would sit in
//! front of. Grounded on `services/authenticator/src/main.rs`'s clap/logging
//! wiring.

use clap::{App, Arg};
use inspectgw_common::logging;
use inspectgw_core::collaborators::{InMemoryTokenStore, NullMetricsSink, StaticDirectory};
use inspectgw_core::config::FleetConfig;
use inspectgw_core::net::codec::DefaultSessionCodec;
use inspectgw_core::{Gateway, GatewayDeps};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CLIENT_VERSION: u32 = 2000244;

fn main() {
    let matches = App::new("Inspection Gateway")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the bot fleet and inspection dispatcher standalone.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the fleet config TOML file")
                .required(true),
        )
        .arg(
            Arg::with_name("cm")
                .long("cm")
                .value_name("HOST:PORT,...")
                .help("Comma-separated session-manager endpoints to round-robin (default: a single localhost placeholder)")
                .takes_value(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = FleetConfig::load(config_file_path);

    let logger = logging::init(&config.log);
    logging::info!(logger, "starting inspection gateway"; "config" => config_file_path, "bots" => config.bots.len() as u64);

    let endpoints: Vec<String> = match matches.value_of("cm") {
        Some(raw) => raw.split(',').map(str::to_string).collect(),
        None => vec!["127.0.0.1:27017".to_string()],
    };

    let deps = GatewayDeps {
        codec_factory: Box::new(|| Box::new(DefaultSessionCodec::new())),
        token_store: Arc::new(InMemoryTokenStore::default()),
        metrics: Arc::new(NullMetricsSink),
        directory: Arc::new(StaticDirectory::new(endpoints)),
        auth_handler: None,
        client_version: CLIENT_VERSION,
    };

    let mut gateway = Gateway::start(logger.clone(), config, deps);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .expect("failed to install Ctrl-C handler");
    }

    while !stop.load(Ordering::Relaxed) {
        let status = gateway.bot_status();
        logging::debug!(logger, "fleet status";
            "disconnected" => status[0] as u64, "connected" => status[1] as u64,
            "logged_in" => status[2] as u64, "ingame" => status[3] as u64, "total" => status[4] as u64);
        thread_sleep(Duration::from_secs(30), &stop);
    }

    logging::info!(logger, "shutting down");
    gateway.shutdown();
}

/// Sleeps in short increments so a Ctrl-C during the sleep is noticed
/// promptly rather than after the full interval.
fn thread_sleep(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(200);
    let mut waited = Duration::ZERO;
    while waited < total && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        waited += step;
    }
}
