mod agent;

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::agent::budget::BudgetStore;
use crate::agent::clock::system_clock;
use crate::agent::config::AgentConfig;
use crate::agent::gateway::{serve, GatewayState};
use crate::agent::upstream::UpstreamClient;
use crate::agent::usage::UsageStore;

struct CliArgs {
    port: Option<u16>,
    config: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut out = CliArgs {
        port: None,
        config: None,
        data_dir: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--port requires a value"))?;
                out.port = Some(v.parse()?);
            }
            "--config" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                out.config = Some(PathBuf::from(v));
            }
            "--data-dir" => {
                let v = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--data-dir requires a path"))?;
                out.data_dir = Some(PathBuf::from(v));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let mut cfg = AgentConfig::load(&config_path)?;
    if let Some(port) = args.port {
        cfg.listen.port = port;
    }
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    std::fs::create_dir_all(&cfg.data_dir)?;

    let clock = system_clock();
    let state = GatewayState {
        usage: UsageStore::open(cfg.usage_file(), clock.clone()),
        budget: BudgetStore::open(cfg.budget_file(), clock),
        upstream: UpstreamClient::new(&cfg.upstreams, cfg.request_timeout_seconds),
    };

    let addr: SocketAddr = format!("{}:{}", cfg.listen.host, cfg.listen.port).parse()?;
    log::info!("agentcost local agent starting on http://{addr}");
    log::info!("only token counts are stored; request/response content is never logged or saved");
    log::info!("proxy routes: /anthropic/* and /openai/*");
    log::info!("stats: GET /stats, budget: GET|POST /api/budget, pre-flight: GET /api/budget/check");

    serve(addr, state).await
}
