mod announce;
mod app;
mod dispatch;
mod handler;
mod lifecycle;
mod logging;
mod mqtt;
mod ota;
mod platform;
mod telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::run().await
}
