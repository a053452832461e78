//! A tiny authoritative name server.
//!
//! Run with:
//!
//!     cargo run --example named <records_file> [--port <port>] [--udp-only]
//!
//! Example:
//!
//!     cargo run --example named records.txt --port 10053
//!
//! Each line of the records file is `name qtype qclass ttl data`, for example:
//!
//!     www 1 1 300 127.0.0.1
//!     www 16 1 300 v=spf1 -all
//!
//! Then query it with `dig @127.0.0.1 -p 10053 www` (add `+tcp` for TCP).

use authdns::{Authority, DnsServer, MemoryStore, ServerConfig};
use std::{
    env,
    fs::File,
    io::BufReader,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

const DEFAULT_PORT: u16 = 10053;

fn main() {
    // setup env_logger
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    // Simple command line options.
    let args: Vec<String> = env::args().collect();
    let records_path = match args.get(1) {
        Some(arg) if !arg.starts_with("--") => arg.clone(),
        _ => {
            print_usage();
            return;
        }
    };

    let mut port = DEFAULT_PORT;
    let mut udp_only = false;
    let mut timeout_secs = 10;
    let mut iter = args.iter().skip(2);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--port" => match iter.next().and_then(|p| p.parse().ok()) {
                Some(p) => port = p,
                None => {
                    print_usage();
                    return;
                }
            },
            "--tcp-timeout" => match iter.next().and_then(|t| t.parse().ok()) {
                Some(t) => timeout_secs = t,
                None => {
                    print_usage();
                    return;
                }
            },
            "--udp-only" => udp_only = true,
            other => {
                println!("Unknown option: {}", other);
                print_usage();
                return;
            }
        }
    }

    let file = File::open(&records_path).expect("Failed to open the records file");
    let store = Arc::new(MemoryStore::load(BufReader::new(file)).expect("Failed to load records"));
    println!("Loaded {} records from {}", store.len(), records_path);

    let config = ServerConfig::new().tcp_timeout(Duration::from_secs(timeout_secs));
    let mut server = DnsServer::new(config).expect("Failed to create server");
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    server
        .open_udp(addr, Authority::new(store.clone()))
        .expect("Failed to open the UDP port");
    if !udp_only {
        server
            .open_tcp(addr, Authority::new(store))
            .expect("Failed to open the TCP port");
    }

    println!("Serving on {} (UDP{})", addr, if udp_only { "" } else { " and TCP" });
    if let Err(e) = server.run() {
        println!("Server stopped: {}", e);
    }
}

fn print_usage() {
    println!("Usage: cargo run --example named <records_file> [--port <port>] [--tcp-timeout <secs>] [--udp-only]");
    println!("Example: ");
    println!("cargo run --example named records.txt --port {}", DEFAULT_PORT);
}
