use anyhow::{Context, Result};
use chatpal_backend::agent::ChatInput;
use chatpal_backend::config::BotConfig;
use chatpal_backend::runtime::BackendRuntimeBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const CONSOLE_USER: &str = "console";
const STATS_COMMAND: &str = ":stats";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatpal_backend=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let ephemeral = std::env::args().skip(1).any(|arg| arg == "--ephemeral");
    let config = BotConfig::load();
    let runtime = BackendRuntimeBuilder::new(config)
        .ephemeral(ephemeral)
        .build()
        .context("failed to bootstrap backend runtime")?;

    tracing::info!(
        "Console chat as '{}' (persona: {}). {} shows usage, Ctrl-D quits.",
        CONSOLE_USER,
        runtime.agent.stores().personas.get(CONSOLE_USER),
        STATS_COMMAND
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == STATS_COMMAND {
            match runtime.agent.stores().stats.summary(CONSOLE_USER) {
                Some(summary) => println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("failed to render stats")?
                ),
                None => println!("No usage recorded yet"),
            }
            continue;
        }
        let reply = runtime
            .agent
            .converse(CONSOLE_USER, ChatInput::Text(text.to_string()))
            .await;
        for part in reply.split("|||").map(str::trim).filter(|p| !p.is_empty()) {
            println!("{}", part);
        }
    }

    runtime.shutdown();
    Ok(())
}
