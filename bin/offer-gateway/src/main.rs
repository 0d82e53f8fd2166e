use clap::Parser;
use offer_gateway::{init_logger, server::run_server, GatewayArgs, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let args = GatewayArgs::parse();

    init_logger(&args.log_level).expect("Logger should initialize");

    run_server(args).await
}
