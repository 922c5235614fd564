use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use talkie_bridge::{
    default_projects_dir, default_state_dir, run, ApprovalPolicy, AuthMode, Settings,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Talkie session bridge daemon", long_about = None)]
struct Cli {
    #[arg(
        long,
        default_value = "0.0.0.0:8765",
        help = "Listen address for the bridge HTTP API"
    )]
    listen: SocketAddr,

    #[arg(
        long,
        value_name = "PATH",
        help = "Directory for the host key, device registry and terminal mappings"
    )]
    state_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Root of the agent session logs (defaults to ~/.claude/projects)"
    )]
    projects_dir: Option<PathBuf>,

    #[arg(
        long,
        default_value = "http://127.0.0.1:8766",
        help = "Base URL of the UI automation service"
    )]
    ui_automation_url: String,

    #[arg(long, default_value = "claude", help = "Agent CLI used for headless delivery")]
    agent_cli: String,

    #[arg(
        long,
        default_value = "claude",
        help = "Process name that marks sessions as live"
    )]
    agent_process: String,

    #[arg(long, help = "Hold new devices until an operator approves them")]
    require_approval: bool,

    #[arg(
        long,
        help = "Disable request signatures (trusted local development only)"
    )]
    insecure_local: bool,

    #[arg(
        long,
        default_value_t = 30,
        help = "Prune devices idle for this many days at startup (0 keeps them forever)"
    )]
    device_ttl_days: i64,

    #[arg(long, help = "Skip writing the bridge.json discovery file")]
    no_discovery: bool,

    #[arg(long, help = "OTLP endpoint for metrics (e.g., http://localhost:4318)")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Settings {
        Settings {
            listen: self.listen,
            state_dir: self.state_dir.unwrap_or_else(default_state_dir),
            projects_dir: self.projects_dir.unwrap_or_else(default_projects_dir),
            ui_automation_url: self.ui_automation_url,
            agent_cli: self.agent_cli,
            agent_process: self.agent_process,
            approval: if self.require_approval {
                ApprovalPolicy::Manual
            } else {
                ApprovalPolicy::AutoApprove
            },
            auth_mode: if self.insecure_local {
                AuthMode::Disabled
            } else {
                AuthMode::Signed
            },
            device_ttl_days: self.device_ttl_days,
            otlp_endpoint: self.otlp_endpoint,
            write_discovery: !self.no_discovery,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(cli.into_settings()).await
}
