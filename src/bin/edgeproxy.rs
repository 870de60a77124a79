//! Standalone edgeproxy binary.
//!
//! Usage:
//! ```
//! cargo run --bin edgeproxy -- --config-dir ./edgeproxy_data --log-dir ./logs
//! ```

use std::path::PathBuf;

use edgeproxy::api::proxy_api::{
    get_proxy_status, init_core, start_proxy, stop_proxy, StartStatus,
};

struct CliArgs {
    config_dir: PathBuf,
    log_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    init_core(args.log_dir).map_err(anyhow::Error::msg)?;

    match start_proxy(&args.config_dir).await {
        StartStatus::Started => {
            let status = get_proxy_status();
            tracing::info!(
                "edgeproxy serving on {}:{} (Ctrl-C to stop)",
                status.bind_address,
                status.port
            );
        }
        StartStatus::AlreadyRunning => {}
        StartStatus::Failed(reason) => anyhow::bail!("failed to start proxy: {reason}"),
        StartStatus::TimedOut => anyhow::bail!("proxy did not become ready in time"),
    }

    tokio::signal::ctrl_c().await?;
    stop_proxy().await;
    Ok(())
}

fn default_config_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("edgeproxy"))
        .unwrap_or_else(|| PathBuf::from("./edgeproxy_data"))
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_dir = default_config_dir();
    let mut log_dir = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config-dir" => {
                if let Some(path) = args.next() {
                    config_dir = PathBuf::from(path);
                }
            }
            "--log-dir" => {
                log_dir = args.next();
            }
            "--help" | "-h" => {
                eprintln!("edgeproxy {}", edgeproxy::VERSION);
                eprintln!();
                eprintln!("Usage: edgeproxy [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config-dir <PATH>   Directory holding proxy.json, remap.config and cache/");
                eprintln!("  --log-dir <PATH>      Write rotating log files here (release builds)");
                eprintln!("  --help, -h            Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    CliArgs {
        config_dir,
        log_dir,
    }
}
