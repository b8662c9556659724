pub mod app;
pub mod config;
pub mod gate;
pub mod http;
pub mod listener;
pub mod logging;
pub mod net;
pub mod tls;
pub mod tunnel;

pub async fn run(raw: config::RawConfig) -> anyhow::Result<()> {
    app::run(raw).await
}
