use std::{env, net::SocketAddr};

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,maintainer_assist_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = match maintainer_assist_gateway::build_state() {
        Ok(state) => state,
        Err(error) => {
            error!(%error, "refusing to start");
            return Err(error.into());
        }
    };
    let app = maintainer_assist_gateway::build_app(state);

    let addr = env::var("ASSIST_BIND_ADDR")
        .ok()
        .map(|value| value.parse::<SocketAddr>())
        .transpose()?
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "assist gateway listening");

    axum::serve(listener, app).await?;
    Ok(())
}
