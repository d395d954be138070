//! Duet - pairing and signaling relay for two-partner journals
//!
//! Runs the relay server that lets a couple's devices pair, find each other
//! over WebRTC and exchange encrypted backups, and mints pairing codes for
//! testing device flows from the terminal.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use duet_auth::{codec, entropy_self_test, hash_token, mint_token, PairingPayload};
use duet_core::config::{
    default_backup_dir, DEFAULT_MAX_BACKUP_BYTES, DEFAULT_PAIRING_TTL_SECS, DEFAULT_SIGNAL_TTL_SECS,
};
use duet_core::RelayConfig;
use duet_relay::{
    create_router, spawn_sweeper, AppState, CertificateManager, ServerCertificate,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Duet - pairing and WebRTC signaling relay
#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (default)
    Serve(ServeArgs),
    /// Mint a pairing secret and print the pairing code for a couple
    PairCode(PairCodeArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Server port
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Comma-separated CORS origins (any origin when unset)
    #[arg(long, env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,

    /// Directory for encrypted backups (default: <data dir>/duet/backups)
    #[arg(long, env = "DUET_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Keep backups in memory only
    #[arg(long, conflicts_with = "backup_dir")]
    memory_backups: bool,

    /// Largest accepted backup in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BACKUP_BYTES)]
    max_backup_bytes: usize,

    /// Backups kept per couple
    #[arg(long, default_value_t = 5)]
    backup_retention: usize,

    /// Pairing request lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_PAIRING_TTL_SECS)]
    pairing_ttl: u64,

    /// Queued signal lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_SIGNAL_TTL_SECS)]
    signal_ttl: u64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,

    /// Serve HTTPS/WSS
    #[arg(long)]
    tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
struct PairCodeArgs {
    /// Couple identifier
    #[arg(long)]
    couple_id: String,

    /// Name of the initiating partner
    #[arg(long)]
    partner_a: String,

    /// Name of the joining partner
    #[arg(long)]
    partner_b: String,

    /// Anniversary date (YYYY-MM-DD)
    #[arg(long)]
    love_date: String,

    /// How the story started
    #[arg(long)]
    story_start: String,

    /// Journal cover title
    #[arg(long)]
    cover_title: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    // Pairing secrets are worthless without a working entropy source
    entropy_self_test().context("Secure random source unavailable")?;

    match args.command {
        Some(Command::PairCode(pair)) => pair_code(pair),
        Some(Command::Serve(serve_args)) => serve(serve_args).await,
        None => serve(args.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    info!("Duet relay v{}", env!("CARGO_PKG_VERSION"));

    let backup_dir = if args.memory_backups {
        None
    } else {
        let dir = args.backup_dir.or_else(default_backup_dir);
        if dir.is_none() {
            warn!("Could not determine a data directory, keeping backups in memory");
        }
        dir
    };

    let config = RelayConfig::new()
        .with_bind_addr(SocketAddr::new(args.bind, args.port))
        .with_allowed_origins(
            args.allowed_origins
                .as_deref()
                .map(RelayConfig::parse_origins)
                .unwrap_or_default(),
        )
        .with_pairing_ttl_secs(args.pairing_ttl)
        .with_signal_ttl_secs(args.signal_ttl)
        .with_max_backup_bytes(args.max_backup_bytes)
        .with_backup_retention(args.backup_retention)
        .with_backup_dir(backup_dir)
        .with_sweep_interval_secs(args.sweep_interval);

    let local_ip = get_local_ip().unwrap_or_else(|| "localhost".to_string());

    let certificate = match (&args.cert, &args.key) {
        (Some(cert_path), Some(key_path)) => {
            info!("Loading TLS certificate from files...");
            Some(ServerCertificate::from_files(cert_path, key_path)?)
        }
        _ if args.tls => {
            info!("Using persistent certificate storage...");
            let manager =
                CertificateManager::new().context("Failed to create certificate manager")?;
            let hostnames = vec![local_ip.clone(), "localhost".to_string()];
            Some(
                manager
                    .load_or_generate(&hostnames)
                    .context("Failed to load/generate certificate")?,
            )
        }
        _ => None,
    };
    if let Some(cert) = &certificate {
        info!("Certificate fingerprint: {}", cert.fingerprint);
    }

    let addr = config.bind_addr;
    let state = Arc::new(
        AppState::from_config(config)
            .await
            .context("Failed to initialize relay state")?
            .with_cert_fingerprint(certificate.as_ref().map(|c| c.fingerprint.clone())),
    );

    let sweeper = spawn_sweeper(state.clone());
    let router = create_router(state);

    let protocol = if certificate.is_some() { "https" } else { "http" };
    info!("Starting server on {}...", addr);
    info!("  Access URL: {}://{}:{}", protocol, local_ip, addr.port());
    info!("Press Ctrl+C to stop.");

    if let Some(cert) = certificate {
        let tls_config = cert.rustls_config().await.context("Failed to create TLS config")?;
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router.into_make_service())
            .await?;
    } else {
        let shutdown = async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        };

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
    }

    sweeper.abort();
    info!("Goodbye!");
    Ok(())
}

fn pair_code(args: PairCodeArgs) -> Result<()> {
    let secret = mint_token()?;
    let payload = PairingPayload::new(
        args.couple_id,
        args.partner_a,
        args.partner_b,
        args.cover_title,
        args.love_date,
        args.story_start,
        secret.expose(),
    );
    let code = codec::encode(&payload)?;
    let digest = hash_token(secret.expose());

    println!();
    display_qr_code(&code);
    println!();
    println!("  Pairing code:");
    println!("  {}", codec::format_for_display(&code));
    println!();
    println!("  Token digest (pairingTokenHash): {}", digest);
    println!();
    println!("  Register it with POST /api/pair/initiate:");
    println!(
        "  {{\"coupleId\": \"{}\", \"pairingTokenHash\": \"{}\"}}",
        payload.couple_id, digest
    );
    println!();
    Ok(())
}

/// Get the local IP address
fn get_local_ip() -> Option<String> {
    use std::net::UdpSocket;

    // Connecting a UDP socket sends nothing but selects the outbound interface
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    Some(addr.ip().to_string())
}

/// Display a QR code in the terminal
fn display_qr_code(data: &str) {
    use qrcode::QrCode;

    let code = match QrCode::new(data.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to generate QR code: {}", e);
            return;
        }
    };

    let string = code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build();

    for line in string.lines() {
        println!("  {}", line);
    }
}
