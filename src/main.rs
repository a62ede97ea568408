#[tokio::main]
async fn main() -> anyhow::Result<()> {
    devverse::run().await
}
