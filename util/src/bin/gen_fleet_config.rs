//! Scaffolds a starter fleet config TOML file: a handful of placeholder
//! bot credential entries plus the default dispatcher/worker-pool
//! parameters, ready for an operator to fill in real account secrets.
//! Grounded on `gen_keys.rs`'s shape (CLI arg parsing, file writing); the
//! domain changed from serial-key generation to bot credential scaffolding.

use clap::{App, Arg};
use inspectgw_core::config::{BotCredentials, FleetConfig};
use std::fs;

fn main() {
    let matches = App::new("Fleet Config Generator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Writes a starter fleet config TOML file with placeholder bot entries.")
        .arg(
            Arg::with_name("OUTPUT_FILE")
                .help("Path the generated config will be written to")
                .required(true),
        )
        .arg(
            Arg::with_name("NBOTS")
                .help("Number of placeholder bot entries to generate")
                .required(true),
        )
        .get_matches();

    let output_path = matches.value_of("OUTPUT_FILE").unwrap();
    let bot_count: usize = matches
        .value_of("NBOTS")
        .unwrap()
        .parse()
        .expect("bot count must be a valid integer");

    let mut config = FleetConfig::default();
    config.bots = (0..bot_count)
        .map(|i| BotCredentials {
            name: format!("bot{}", i),
            password: "CHANGE_ME".to_string(),
            shared_secret: None,
        })
        .collect();

    let rendered = serdeconv::to_toml_string(&config).expect("fleet config failed to serialize");
    fs::write(output_path, rendered).expect("failed writing generated fleet config");

    println!(
        "Wrote a {}-bot starter config to `{}`. Fill in real passwords and shared secrets before running the gateway.",
        bot_count, output_path
    );
}
