//! Minimal SSH transport example
//!
//! This example demonstrates how to:
//! - Connect the transport over TCP
//! - Complete the identification and key exchange
//! - Inspect the session id and negotiated server identity
//!
//! Usage:
//!   cargo run --example connect <host:port>
//!
//! Example:
//!   cargo run --example connect 127.0.0.1:22

use skiff_proto::ssh::hostkey::{HostKey, HostKeyVerifier};
use skiff_proto::ssh::transport::{Config, Transport};
use std::env;
use tokio::net::TcpStream;

/// Prints the host key fingerprint and accepts it, like `ssh` with
/// `StrictHostKeyChecking=no`. Do not do this outside of examples.
struct PrintingVerifier;

impl HostKeyVerifier for PrintingVerifier {
    fn verify(&self, remote_addr: &str, key: &HostKey) -> bool {
        println!(
            "  Host key: {} {} (accepted blindly)",
            key.key_type(),
            key.fingerprint()
        );
        println!("  Remote:   {}", remote_addr);
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <host:port>", args[0]);
        eprintln!("Example: {} 127.0.0.1:22", args[0]);
        std::process::exit(1);
    }
    let addr = &args[1];

    println!("Connecting to {}...", addr);
    let stream = TcpStream::connect(addr).await?;

    let mut config = Config::default();
    config.add_host_key_verifier(Box::new(PrintingVerifier));

    // Performs the identification exchange and the initial key exchange.
    let transport = Transport::connect(stream, addr.as_str(), config).await?;

    println!("✓ Connected");
    println!("  Server:     {}", transport.server_id());
    if let Some(session_id) = transport.session_id() {
        println!("  Session id: {}", hex::encode(session_id));
    }

    transport.close().await;
    Ok(())
}
