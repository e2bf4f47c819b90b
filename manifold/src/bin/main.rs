use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;

use manifold::config::Config;
use manifold::tls::{CertificateSource, DirCertificateSource};
use manifold::{Result, Server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "manifold", about = "A multiplexing reverse proxy", version)]
enum Cli {
    /// Start the reverse proxy
    Start {
        /// Path to the YAML configuration
        #[arg(long, short, visible_alias = "conf")]
        config: PathBuf,
        /// Listen address
        #[arg(long, short, default_value = ":443")]
        addr: String,
        /// ACME DNS provider API token, for the external certificate manager
        #[arg(long)]
        api: Option<String>,
        /// ACME account email, for the external certificate manager
        #[arg(long)]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _logger = tracing::subscriber::set_default(log_subscriber("info"));
    let cli = Cli::parse();

    let result = match cli {
        Cli::Start {
            config,
            addr,
            api,
            email,
        } => start(config, addr, api, email).await,
    };

    if let Err(err) = result {
        error!("A critical error occurred: {err}");
        exit(1);
    }
}

fn log_subscriber(level: &str) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .finish()
}

async fn start(
    config_path: PathBuf,
    addr: String,
    api: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let config = Config::load(&config_path)?;
    tracing::subscriber::set_global_default(log_subscriber(&config.log.level))?;

    let terminates = config
        .domains()
        .iter()
        .any(|d| config.entry(d).is_some_and(|e| e.terminate));
    if terminates {
        // Certificate acquisition and renewal run in an external manager;
        // it needs the account identity and writes PEM material into the
        // certificate directory this source watches.
        match (&api, &email) {
            (Some(_), Some(email)) => {
                info!(%email, "ACME account configured for the external certificate manager");
            }
            _ => {
                return Err(manifold::ManifoldError::config_error(
                    "TLS termination is configured: --api and --email are required",
                ));
            }
        }
    }

    let cert_dir = std::env::var("MANIFOLD_CERT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/manifold/certs"));
    let certs: Arc<dyn CertificateSource> = Arc::new(DirCertificateSource::new(cert_dir)?);

    let server = Arc::new(Server::new(config, certs)?);

    let cancel = server.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, shutting down");
        cancel.cancel();
    });

    server.run(&addr).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => stream.recv().await,
                Err(_) => std::future::pending::<Option<()>>().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
