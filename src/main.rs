//! Block Array CSI Driver
//!
//! One binary, two roles: `controller` talks to the array management API,
//! `node` attaches volumes on the machine it runs on.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockarray_csi::{
    ApiServer, ApiServerConfig, BackendConfig, BackendFactory, ControllerConfig,
    ControllerService, HostFilesystem, IscsiAdm, IscsiConfig, LunScope, NodeAgent,
    NodeConfig, RestArrayConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Container storage driver for iSCSI block arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// RPC listener address
    #[arg(long, env = "CSI_BIND_ADDR", default_value = "0.0.0.0:10000", global = true)]
    bind: String,

    /// Plugin name reported to the orchestrator
    #[arg(
        long,
        env = "CSI_PLUGIN_NAME",
        default_value = blockarray_csi::controlplane::DEFAULT_PLUGIN_NAME,
        global = true
    )]
    plugin_name: String,

    /// Request timeout in seconds
    #[arg(long, env = "CSI_REQUEST_TIMEOUT", default_value = "120", global = true)]
    request_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve the controller service
    Controller(ControllerArgs),
    /// Serve the node service
    Node(NodeArgs),
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Use an in-memory array instead of the REST management API
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Mappings the LUN allocator avoids: per-initiator or array
    #[arg(long, env = "CSI_LUN_SCOPE", default_value = "per-initiator")]
    lun_scope: String,

    /// Timeout of array API calls in seconds
    #[arg(long, env = "CSI_ARRAY_TIMEOUT", default_value = "30")]
    array_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Directory holding the connector state files
    #[arg(long, env = "CSI_PLUGIN_DIR")]
    plugin_dir: Option<PathBuf>,

    /// open-iscsi initiator name file
    #[arg(long, env = "CSI_INITIATOR_FILE", default_value = "/etc/iscsi/initiatorname.iscsi")]
    initiator_file: PathBuf,

    /// Check that host binaries are present before reporting ready
    #[arg(long, env = "CSI_CHECK_BINARIES")]
    check_binaries: bool,

    /// Seconds to wait for iSCSI devices to appear
    #[arg(long, env = "CSI_DEVICE_WAIT", default_value = "10")]
    device_wait_secs: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    info!(version = blockarray_csi::VERSION, "starting {}", blockarray_csi::NAME);

    let api_config = ApiServerConfig {
        bind_addr: cli
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address {}", cli.bind))?,
        request_timeout_secs: cli.request_timeout_secs,
    };

    let server = match &cli.role {
        Role::Controller(args) => {
            let controller =
                build_controller(&cli, args).context("failed to set up the controller service")?;
            ApiServer::new(api_config).with_controller(controller)
        }
        Role::Node(args) => {
            let node = build_node(&cli, args);
            ApiServer::new(api_config).with_node(node)
        }
    };

    spawn_signal_handler(server.shutdown_token());
    server.run().await?;

    info!("driver shutdown complete");
    Ok(())
}

fn build_controller(cli: &Cli, args: &ControllerArgs) -> Result<Arc<ControllerService>> {
    let lun_scope: LunScope = args.lun_scope.parse()?;
    let backend = if args.standalone { "memory" } else { "rest" };
    let client = BackendFactory::create(
        backend,
        BackendConfig {
            rest: RestArrayConfig {
                request_timeout: Duration::from_secs(args.array_timeout_secs),
                ..Default::default()
            },
        },
    )?;

    info!(backend, lun_scope = ?lun_scope, "controller role selected");
    let config = ControllerConfig {
        plugin_name: cli.plugin_name.clone(),
        lun_scope,
        ..Default::default()
    };
    Ok(ControllerService::new(config, client))
}

fn build_node(cli: &Cli, args: &NodeArgs) -> Arc<NodeAgent> {
    let defaults = NodeConfig::default();
    let config = NodeConfig {
        plugin_name: cli.plugin_name.clone(),
        plugin_dir: args
            .plugin_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/var/lib/kubelet/plugins/{}", cli.plugin_name))),
        initiator_name_path: args.initiator_file.clone(),
        check_binaries: args.check_binaries,
        device_wait_timeout: Duration::from_secs(args.device_wait_secs),
        ..defaults
    };

    let iscsi = IscsiAdm::new(IscsiConfig {
        device_wait_timeout: config.device_wait_timeout,
        ..Default::default()
    });
    info!(plugin_dir = %config.plugin_dir.display(), "node role selected");
    Arc::new(NodeAgent::new(
        config,
        Arc::new(iscsi),
        Arc::new(HostFilesystem::default()),
    ))
}

// =============================================================================
// Signals
// =============================================================================

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }
        token.cancel();
    });
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
