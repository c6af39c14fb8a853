use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    lifecycle_service::run().await
}
