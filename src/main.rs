use std::net::SocketAddr;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn addr_from_env(host_var: &str, port_var: &str, default: &str) -> SocketAddr {
    let host = std::env::var(host_var).unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var(port_var).ok();
    let candidate = match port {
        Some(port) => format!("{host}:{port}"),
        None => default.to_string(),
    };
    candidate.parse().unwrap_or_else(|_| {
        default
            .parse()
            .expect("default listen address should be valid")
    })
}

#[tokio::main]
async fn main() {
    let _ = std::fs::create_dir_all("logs");
    let file_appender = tracing_appender::rolling::daily("logs", "judge_queuer.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .log_internal_errors(true)
                .with_target(false)
                .flatten_event(true)
                .with_span_list(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let judge_addr = addr_from_env("JUDGE_HOST", "JUDGE_PORT", "0.0.0.0:12345");
    let website_addr = addr_from_env("WEBSITE_HOST", "WEBSITE_PORT", "0.0.0.0:12346");

    queuer::main(judge_addr, website_addr).await;
}
