pub mod models;
pub mod server;
pub mod cli;
pub mod history;

use cli::Args;
use log::info;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("History Store Type: {}", args.history_type);
    info!("History Store Host: {}", args.history_host);
    info!("History Key Namespace: {}", args.history_session_key);
    info!("History Max Length: {}", args.history_max_length);
    info!("Guest Timeout: {}s ({:?} expiry)", args.history_timeout, args.history_expiry);
    info!("Cleanup Interval: {}s", args.cleanup_interval);
    info!("Cleanup Action: {}", args.cleanup_action);
    info!("Authenticated User Header: {}", args.auth_user_header);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let history = history::initialize_history_store(&args)?;
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, history, args);
    server.run().await?;

    Ok(())
}
