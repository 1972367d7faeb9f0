use anyhow::{Context, Result};
use bamgate_worker::hub::Rooms;
use bamgate_worker::registry::{AcceptNonEmpty, Registry, TokenVerifier};
use bamgate_worker::turn::TurnGateway;
use bamgate_worker::{app, AppState};
use clap::Parser;
use ip_network::Ipv4Network;
use rand::RngCore;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "bamgate cloud worker", long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "BAMGATE_LISTEN", default_value = "0.0.0.0:8787")]
    listen: SocketAddr,

    /// The network subnet tunnel addresses are assigned from.
    #[arg(long, env = "BAMGATE_SUBNET", default_value = "100.64.0.0/24")]
    subnet: Ipv4Network,

    /// Secret for signing access tokens. Generated at startup when absent,
    /// which invalidates all tokens across restarts.
    #[arg(long, env = "BAMGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Shared secret for TURN REST credentials. Generated at startup when
    /// absent.
    #[arg(long, env = "BAMGATE_TURN_SECRET", hide_env_values = true)]
    turn_secret: Option<String>,

    /// The URL agents should use to reach this worker; echoed back at
    /// registration.
    #[arg(long, env = "BAMGATE_SERVER_URL", default_value = "http://127.0.0.1:8787")]
    server_url: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let jwt_secret = secret_or_random(cli.jwt_secret, "BAMGATE_JWT_SECRET");
    let turn_secret = secret_or_random(cli.turn_secret, "BAMGATE_TURN_SECRET");

    let verifier: Box<dyn TokenVerifier> = Box::new(AcceptNonEmpty);

    let state = AppState {
        registry: Arc::new(Registry::new(
            cli.subnet,
            &jwt_secret,
            turn_secret.clone(),
            verifier,
        )),
        rooms: Arc::new(Rooms::new()),
        turn: Arc::new(TurnGateway::new(turn_secret)),
        server_url: cli.server_url,
    };

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    tracing::info!(listen = %cli.listen, subnet = %cli.subnet, "worker up");

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
    .context("server failed")?;

    Ok(())
}

fn secret_or_random(configured: Option<String>, name: &str) -> SecretString {
    match configured {
        Some(secret) => SecretString::from(secret),
        None => {
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);

            tracing::warn!("{name} not set; using an ephemeral secret");

            SecretString::from(hex::encode(bytes))
        }
    }
}
