use clap::Parser;

use burrow_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    burrow_server::run(config).await
}
