use campaign_module::service::{run_server, ServiceConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let config = ServiceConfig::from_env();
    if let Err(err) = run_server(config).await {
        tracing::error!(error = %err, "campaign service exited with error");
        std::process::exit(1);
    }
}
