use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    indexserver_cli::main_entry().await
}
