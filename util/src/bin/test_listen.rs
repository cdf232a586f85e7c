//! Connectivity smoke test: dials a destination (directly, or through a
//! SOCKS5 proxy) using the same `Connector` state machine the gateway
//! drives from its readiness loop, and reports success or the failure
//! reason. Grounded on the original `test_listen.rs`'s shape (a tiny
//! mio-driven poll loop); updated from mio 0.6's `Ready`/`PollOpt`/4-arg
//! `register` to mio 0.8's `Interest`/`Token`/`Poll::registry()`, and
//! repointed at `inspectgw_core::net::connector` instead of a raw listener.

use clap::{App, Arg};
use inspectgw_core::net::connector::{Connector, Progress, ProxyCredentials};
use mio::{Events, Interest, Poll, Token};
use std::net::SocketAddr;
use std::time::Duration;

const CONNECTOR_TOKEN: Token = Token(0);

fn main() {
    let matches = App::new("Connectivity Smoke Test")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Dials a destination directly or through a SOCKS5 proxy and reports the outcome.")
        .arg(
            Arg::with_name("DESTINATION")
                .help("HOST:PORT to connect to")
                .required(true),
        )
        .arg(
            Arg::with_name("proxy")
                .long("proxy")
                .value_name("HOST:PORT")
                .help("SOCKS5 proxy to tunnel through")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("user")
                .long("user")
                .value_name("USERNAME")
                .requires("proxy")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("pass")
                .long("pass")
                .value_name("PASSWORD")
                .requires("proxy")
                .takes_value(true),
        )
        .get_matches();

    let destination: SocketAddr = matches
        .value_of("DESTINATION")
        .unwrap()
        .parse()
        .expect("destination must be HOST:PORT");

    let mut connector = match matches.value_of("proxy") {
        Some(proxy_addr) => {
            let proxy = ProxyCredentials {
                address: proxy_addr.parse().expect("proxy address must be HOST:PORT"),
                username: matches.value_of("user").unwrap_or_default().to_string(),
                password: matches.value_of("pass").unwrap_or_default().to_string(),
            };
            Connector::dial_via_proxy(proxy, destination).expect("failed starting proxy dial")
        }
        None => Connector::dial_direct(destination).expect("failed starting direct dial"),
    };

    let mut poll = Poll::new().expect("failed creating poll instance");
    let mut events = Events::with_capacity(16);

    poll.registry()
        .register(&mut connector.stream, CONNECTOR_TOKEN, Interest::READABLE | Interest::WRITABLE)
        .expect("failed registering connector socket");

    loop {
        poll.poll(&mut events, Some(Duration::from_secs(10)))
            .expect("poll failed");

        if events.is_empty() {
            eprintln!("timed out waiting for connection readiness");
            std::process::exit(1);
        }

        match connector.advance() {
            Ok(Progress::Pending) => continue,
            Ok(Progress::Established) => {
                println!("connection established to {}", destination);
                return;
            }
            Err(err) => {
                eprintln!("connection failed: {}", err);
                std::process::exit(1);
            }
        }
    }
}
