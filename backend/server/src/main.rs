#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tally::start_server().await
}
