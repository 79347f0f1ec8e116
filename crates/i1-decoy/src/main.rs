//! i1-decoy - decoy port listener feeding a DNS blocklist zone.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    i1_decoy::cli::run().await
}
