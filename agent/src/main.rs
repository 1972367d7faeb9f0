use anyhow::{Context, Result};
use bamgate_agent::auth::TokenManager;
use bamgate_agent::config::{self, Config, Secrets};
use bamgate_agent::control::{self, ControlRequest};
use bamgate_agent::dns::DnsManager;
use bamgate_agent::error::AgentError;
use bamgate_agent::eventloop::Agent;
use bamgate_agent::routes::RouteManager;
use clap::Parser;
use rtc_mesh::TurnWsBridge;
use secrecy::SecretString;
use signaling::{Message, SignalingChannel};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tun_device::TunDevice;
use wg_tunnel::WgTunnel;

/// Forced-exit deadline once a shutdown signal arrives.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for the startup token refresh.
const STARTUP_REFRESH_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(author, version, about = "bamgate mesh VPN agent", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "BAMGATE_CONFIG", default_value_os_t = config::default_config_path())]
    config: PathBuf,

    /// Validate the configuration and exit without connecting.
    #[arg(long)]
    check: bool,

    /// Override the control socket path.
    #[arg(long, env = "BAMGATE_CONTROL_SOCKET")]
    control_socket: Option<PathBuf>,
}

fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // One human-readable line, no stack traces.
            eprintln!("{e:#}");
            std::process::exit(e.exit_code());
        }
    }
}

fn try_main() -> Result<(), AgentError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Step 1: load and validate configuration.
    let config = Config::load(&cli.config)
        .map_err(|e| AgentError::ConfigInvalid(format!("{e:#}")))?
        .validate()
        .map_err(AgentError::ConfigInvalid)?;

    if cli.check {
        tracing::info!("configuration is valid");
        return Ok(());
    }

    let secrets_path = config::secrets_path_for(&cli.config);
    let secrets = Secrets::load(&secrets_path).map_err(AgentError::Fatal)?;

    let turn_secret = SecretString::from(secrets.turn_secret.clone().ok_or_else(|| {
        AgentError::ConfigInvalid(
            "no TURN secret in secrets file; register this device first".to_owned(),
        )
    })?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bamgate")
        .build()
        .context("failed to create tokio runtime")?;

    let result = runtime.block_on(run(cli, config, secrets_path, secrets, turn_secret));

    runtime.shutdown_timeout(Duration::from_secs(1));

    result
}

async fn run(
    cli: Cli,
    config: config::ValidConfig,
    secrets_path: PathBuf,
    secrets: Secrets,
    turn_secret: SecretString,
) -> Result<(), AgentError> {
    let cancel = CancellationToken::new();

    // Step 2: ensure token freshness before touching the network stack.
    let token_manager = tokio::time::timeout(
        STARTUP_REFRESH_DEADLINE,
        TokenManager::bootstrap(&config, secrets_path, secrets),
    )
    .await
    .map_err(|_| {
        AgentError::AuthTransient(anyhow::anyhow!(
            "token refresh did not finish within {STARTUP_REFRESH_DEADLINE:?}"
        ))
    })??;

    let access_token = token_manager.access_token();

    // Step 3: create and configure the TUN device.
    let tun = TunDevice::create(&config.interface, config.mtu).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            AgentError::TunPermission
        } else {
            AgentError::Fatal(anyhow::Error::new(e).context("failed to create TUN device"))
        }
    })?;

    let tun_name = tun.name().to_owned();

    let routes = RouteManager::new(&tun_name)
        .await
        .context("failed to initialize route management")?;
    routes
        .configure_interface(
            config.tunnel_ip,
            config.tunnel_address.netmask(),
            config.mtu,
        )
        .await
        .context("failed to configure tunnel interface")?;

    tracing::info!(
        interface = %tun_name,
        address = %config.tunnel_ip,
        "tunnel interface up"
    );

    // Step 4: the WireGuard device with its data-channel bind shim.
    let wg = WgTunnel::start(tun, config.private_key.clone(), cancel.clone());

    // Step 5: control socket.
    let (control_tx, control_rx) = mpsc::channel::<ControlRequest>(16);
    let socket_path = cli.control_socket.unwrap_or_else(control::socket_path);
    let control_handle = control::serve(
        socket_path,
        control_tx,
        access_token.clone(),
        cancel.clone(),
    )
    .await
    .context("failed to start control socket")?;

    // Step 6: signaling client plus the TURN bridge it falls back to.
    let join = Message::Join {
        peer_id: config.device_id.clone(),
        public_key: wg_tunnel::public_key_base64(&x25519_dalek::PublicKey::from(
            &config.private_key,
        )),
        address: format!("{}/{}", config.tunnel_ip, config.tunnel_address.netmask()),
        routes: config.advertised_routes.clone(),
        dns: config.advertised_dns.clone(),
        dns_search: config.advertised_search.clone(),
    };

    let signaling = SignalingChannel::disconnected(
        &config.server_url,
        token_manager.current_access_token(),
        join,
        SignalingChannel::default_backoff,
    )
    .map_err(|e| AgentError::Fatal(anyhow::anyhow!(e)))?;

    let turn_bridge = TurnWsBridge::spawn(
        config.server_url.clone(),
        access_token.clone(),
        cancel.clone(),
    )
    .await
    .context("failed to start TURN bridge")?;

    // Step 7: main loop, token rotator and signal handling side by side.
    let agent = Agent::new(
        config,
        cli.config,
        signaling,
        wg,
        routes,
        DnsManager::new(),
        turn_bridge,
        turn_secret,
        control_rx,
        access_token,
        cancel.clone(),
    );

    let rotator = tokio::spawn(token_manager.run(cancel.clone()));
    let agent_task = tokio::spawn(agent.run());

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("received shutdown signal");
        signal_cancel.cancel();
    });

    let result: Result<(), AgentError> = tokio::select! {
        agent_result = agent_task => match agent_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AgentError::Fatal(e)),
            Err(join_error) => Err(AgentError::Fatal(anyhow::anyhow!(join_error))),
        },
        rotator_result = rotator => match rotator_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(join_error) => Err(AgentError::Fatal(anyhow::anyhow!(join_error))),
        },
    };

    // Whichever task ended first, everything else winds down now.
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_DEADLINE, control_handle)
        .await
        .is_err()
    {
        tracing::warn!("shutdown deadline exceeded, forcing exit");
        return result.and(Err(AgentError::Fatal(anyhow::anyhow!(
            "shutdown did not complete within {SHUTDOWN_DEADLINE:?}"
        ))));
    }

    result
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            let () = std::future::pending().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
