mod config;
mod error;
mod executor;
mod policy;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::executor::Executor;
use crate::policy::PolicyValidator;
use crate::server::AppState;

/// Config file used when no path is given on the command line.
const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

fn print_help() {
    println!(
        "\
kali-agent v{}

A local command-execution agent. Runs allow-listed tools on behalf of
the web interface, with per-job timeouts and cancellation.

USAGE:
    kali-agent [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                   Built-in defaults are used if the default file is absent.

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, kali_agent=debug,tower_http=warn)

ENDPOINTS:
    GET  /health     Agent status and allowed tools
    POST /execute    {{\"command\": \"nmap -sV host\", \"timeout\": 300}}
    POST /stop       {{\"process_id\": 1}}
    GET  /jobs       Running jobs

EXAMPLES:
    kali-agent                            # uses {DEFAULT_CONFIG_PATH} or defaults
    kali-agent /etc/kali-agent/agent.toml # custom config path
    RUST_LOG=debug kali-agent             # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("kali-agent v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ if config_path.is_none() => config_path = Some(arg),
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kali_agent=info,tower_http=info")),
        )
        .init();

    println!(
        r#"
╔═══════════════════════════════════════════════════════════════╗
║           KALI LINUX AUTO-EXECUTION AGENT v{:<18} ║
╠═══════════════════════════════════════════════════════════════╣
║  FOR AUTHORIZED PENETRATION TESTING ONLY                      ║
║                                                               ║
║  This agent allows remote command execution from the          ║
║  web interface. Only whitelisted security tools are allowed.  ║
╚═══════════════════════════════════════════════════════════════╝
"#,
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(&path).with_context(|| format!("Cannot load config {path}"))?
        }
        None => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH} (if present)");
            Config::load_or_default(DEFAULT_CONFIG_PATH)?
        }
    };

    let policy = Arc::new(PolicyValidator::new(config.policy.allowed_tools.iter().cloned()));
    if policy.is_empty() {
        warn!("Allow-list is empty: every command will be rejected");
    }

    info!("Agent: {}", config.agent.name);
    info!("Allowed tools: {} security utilities", policy.len());
    info!("Shell: {}", config.executor.shell);
    info!("Default timeout: {}s", config.executor.default_timeout_secs);
    warn!("No authentication: anyone who can reach this port can run allowed commands");

    let executor = Arc::new(Executor::new(policy, &config.executor));
    let state = AppState {
        executor,
        agent_name: Arc::from(config.agent.name.as_str()),
        default_timeout_secs: config.executor.default_timeout_secs,
    };

    let addr = config.server.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind {addr}"))?;

    info!("Starting agent on http://{addr}");
    info!("Press Ctrl+C to stop");

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, stopping running jobs");
    })
    .await?;

    info!("Agent stopped");
    Ok(())
}
