use anyhow::Context;

use stockhold_infra::ServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockhold_observability::init();

    let config = ServiceConfig::from_env();
    let services = stockhold_api::app::services::build_services(&config)
        .await
        .context("failed to wire services")?;
    let app = stockhold_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
