//! Fanout Server
//!
//! Serves a home page, a health check and a WebSocket endpoint that streams
//! every upstream event to every connected client.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use fanout_server::source::spawn_generator;
use fanout_server::{Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    log::info!("Fanout Server starting...");
    log::info!("  Listen: {}", config.listen_addr);
    log::info!("  Event interval: {:?}", config.event_interval);
    log::info!("  Max workers: {}", config.max_workers);

    // SIGINT/SIGTERM only set the flag; shutdown runs on this thread
    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let (events, generator) = spawn_generator(config.event_interval, Arc::clone(&term))?;
    let server = Server::start(config, events)?;
    server.run_until(&term);

    if generator.join().is_err() {
        log::error!("Upstream generator panicked");
    }
    log::info!("Bye");
    Ok(())
}
