use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use wxrelay::config::Config;
use wxrelay::{gateway, observability};

/// WeChat official-account chat relay.
#[derive(Debug, Parser)]
#[command(name = "wxrelay", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook gateway (default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Print the JSON schema of the config file.
    Schema,
    /// Print the effective configuration with secrets redacted.
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            let mut config = Config::load(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await
        }
        Commands::Config { action } => match action {
            ConfigCommands::Schema => {
                println!("{}", Config::json_schema()?);
                Ok(())
            }
            ConfigCommands::Show => {
                let mut config = Config::load(cli.config.as_deref())?;
                if config.provider.api_key.is_some() {
                    config.provider.api_key = Some("***".to_string());
                }
                config.wechat.token = "***".to_string();
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        },
    }
}
