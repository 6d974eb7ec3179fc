mod access;
mod audit;
mod auth;
mod authz;
mod broker;
mod caster;
mod config;
mod directory;
mod hub;
mod limiter;
mod prejoin;
mod signaling;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use castgate_protocol::BrokerConfig;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::web::AppState;

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    issue_token: Option<String>,
}

fn parse_args(args: &[String]) -> Args {
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--config" | "-c", Some(v)) => {
                parsed.config_path = Some(PathBuf::from(v));
                i += 1;
            }
            ("--port" | "-p", Some(v)) => {
                parsed.port = v.parse().ok();
                i += 1;
            }
            ("--issue-token", Some(v)) => {
                parsed.issue_token = Some(v.clone());
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    parsed
}

/// Log every validation issue; fail on any `ERROR:`.
fn check_config(config: &BrokerConfig) -> Result<()> {
    let Err(issues) = config.validate() else {
        return Ok(());
    };
    let errors = issues.iter().filter(|i| i.starts_with("ERROR:")).count();
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{}", issue);
        } else {
            tracing::warn!("{}", issue);
        }
    }
    if errors > 0 {
        anyhow::bail!("Configuration has {errors} error(s). Fix them and restart.");
    }
    Ok(())
}

fn issue_token(config: &BrokerConfig, user_id: &str) -> Result<String> {
    let secret = config
        .server
        .jwt_secret
        .as_deref()
        .context("server.jwt_secret must be set to issue tokens")?;
    if !config.users.iter().any(|u| u.id == user_id) {
        anyhow::bail!("Unknown user '{user_id}'");
    }
    auth::generate_jwt(user_id, secret)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args);
    let config_path = args
        .config_path
        .unwrap_or_else(|| PathBuf::from("./config/castgate.toml"));

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = args.port {
        config.server.port = p;
    }
    check_config(&config)?;

    if let Some(user_id) = args.issue_token {
        println!("{}", issue_token(&config, &user_id)?);
        return Ok(());
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    let jwt_secret = config.server.jwt_secret.clone().unwrap_or_else(|| {
        tracing::info!("Generated a per-process JWT secret");
        auth::generate_secret()
    });

    let state = Arc::new(AppState::new(config, jwt_secret));

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(
        "Castgate broker v{} listening on {bind_addr}",
        env!("CARGO_PKG_VERSION")
    );

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!(
        sessions = state.directory.len(),
        "Castgate broker shut down"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("castgate-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_flags() {
        let parsed = parse_args(&args(&["-c", "/etc/castgate.toml", "--port", "6000"]));
        assert_eq!(
            parsed,
            Args {
                config_path: Some(PathBuf::from("/etc/castgate.toml")),
                port: Some(6000),
                issue_token: None,
            }
        );
    }

    #[test]
    fn ignores_dangling_and_unknown_flags() {
        let parsed = parse_args(&args(&["--verbose", "--port"]));
        assert_eq!(parsed, Args::default());
    }

    #[test]
    fn issue_token_requires_secret_and_known_user() {
        let mut config = crate::access::tests::test_config();
        assert!(issue_token(&config, "granted").is_err(), "no secret");

        config.server.jwt_secret = Some("operator-secret".to_string());
        assert!(issue_token(&config, "nobody").is_err());

        let token = issue_token(&config, "granted").unwrap();
        let claims = auth::validate_jwt(&token, "operator-secret").unwrap();
        assert_eq!(claims.sub, "granted");
    }

    #[test]
    fn config_errors_stop_startup() {
        let mut config = crate::access::tests::test_config();
        assert!(check_config(&config).is_ok(), "warnings only");
        config.remote_control.session_limit = 0;
        assert!(check_config(&config).is_err());
    }
}
