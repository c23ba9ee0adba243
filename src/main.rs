//! Warden daemon - main entry point.
//!
//! Serves one line-oriented channel on stdin/stdout:
//! - `alice: echo hello` in, `alice: hello` out
//! - SIGHUP re-reads the config file
//! - Ctrl-C shuts down, giving in-flight skills the configured grace period

use clap::Parser;
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use warden_core::channel::{Channel, StdioChannel};
use warden_core::skills::{CommandSkill, FnSkill, SkillDescriptor};
use warden_core::{Config, Kernel};

#[derive(Debug, Parser)]
#[command(name = "warden-daemon", version, about = "Agent-routing daemon")]
struct Args {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Account the channel is linked to.
    #[arg(long, default_value = "local")]
    account: String,
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

async fn register_builtin_skills(kernel: &Kernel) -> warden_core::Result<()> {
    let skills = kernel.skills();
    skills
        .register(SkillDescriptor::new(
            "echo",
            "Reply with the input",
            Arc::new(FnSkill::new(|input, _| async move { Ok(input) }.boxed())),
        ))
        .await?;
    skills
        .register(SkillDescriptor::new(
            "time",
            "Current UTC time",
            Arc::new(FnSkill::new(|_, ctx| {
                async move { Ok(ctx.started_at.to_rfc3339()) }.boxed()
            })),
        ))
        .await?;
    skills
        .register(SkillDescriptor::new(
            "wc",
            "Count bytes of the input inside the sandbox",
            Arc::new(CommandSkill::new("printf %s {input} | wc -c")),
        ))
        .await?;
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_listener(kernel: Arc<Kernel>, path: Option<PathBuf>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "sighup_handler_unavailable");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match load_config(path.as_deref()) {
                // Rejection is logged by the kernel; the old config stays.
                Ok(config) => {
                    let _ = kernel.reload(config).await;
                }
                Err(e) => tracing::error!(error = %e, "config_read_failed"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_kernel: Arc<Kernel>, _path: Option<PathBuf>) {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = load_config(args.config.as_deref())?;

    // Initialize observability
    warden_core::observability::init_tracing(&config.observability);

    let kernel = Arc::new(Kernel::from_config(config)?);
    register_builtin_skills(&kernel).await?;

    let channel = Channel::new(Arc::new(StdioChannel::stdio()))
        .link(args.account)
        .await?
        .verify()
        .await?;

    spawn_reload_listener(Arc::clone(&kernel), args.config);

    let ctrl_c = {
        let kernel = Arc::clone(&kernel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                kernel.shutdown();
            }
        })
    };

    tracing::info!(skills = ?kernel.skills().list().await, "warden_daemon_started");
    kernel.run(channel).await?;
    ctrl_c.abort();

    Ok(())
}
