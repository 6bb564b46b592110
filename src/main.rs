//! LAN chat relay server
//!
//! Usage:
//!   cargo run -- server                    # Run on the default port
//!   cargo run -- server --port 9000        # Run on a specific port

use palaver::{RelayServer, ServerConfig};
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => {
            let port = parse_port(&args);
            run_server(port).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            return Ok(());
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Palaver - LAN Chat Relay");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    server              Start the chat relay");
    println!("    help                Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>       Port to listen on (default: 9000)");
    println!();
    println!("The relay binds a TCP chat listener and a UDP discovery listener");
    println!("to the same port. Clients on the local segment locate the server");
    println!("by broadcasting a discovery probe to that port.");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server");
    println!("    cargo run -- server --port 9000");
    println!("    RUST_LOG=debug cargo run -- server");
}

fn parse_port(args: &[String]) -> u16 {
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            if let Ok(port) = args[i + 1].parse() {
                return port;
            }
        }
    }
    9000 // default port
}

async fn run_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        port,
        ..Default::default()
    };

    // A bind failure is fatal at startup; never continue half-initialized
    let server = RelayServer::bind(config).await?;
    info!("chat relay ready on {}", server.local_addr());

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            return;
        }
        info!("ctrl-c received, shutting down");
        shutdown.shutdown().await;
    });

    server.run().await?;
    Ok(())
}
