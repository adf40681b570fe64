use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use workers_relay::config::Config;
use workers_relay::gateway::Gateway;
use workers_relay::prompt::{self, Message};
use workers_relay::registry::ModelRegistry;
use workers_relay::relay::{RelayEvent, StreamRelay};
use workers_relay::server::{self, AppState};

#[derive(Parser)]
#[command(
    name = "workers-relay",
    about = "Edge inference relay — image generation, summarization and streaming chat"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Path to config file
        #[arg(short, long, default_value = "relay.toml")]
        config: PathBuf,

        /// Listen address override, e.g. 127.0.0.1:8787
        #[arg(long)]
        bind: Option<String>,
    },

    /// List the models each endpoint accepts
    Models {
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Stream one chat turn from the provider to stdout
    Chat {
        /// Text model key (m1..m7)
        #[arg(short, long, default_value = "m1")]
        model: String,

        /// System prompt override
        #[arg(long)]
        system: Option<String>,

        /// Path to config file
        #[arg(short, long, default_value = "relay.toml")]
        config: PathBuf,

        /// The user message to send
        #[arg(value_name = "PROMPT")]
        message: String,
    },
}

fn load_config(path: &Path) -> Result<Config> {
    let cfg = Config::load(path).unwrap_or_default();
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("workers_relay=info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, bind } => {
            let cfg = load_config(&config)?;
            let gateway = Gateway::from_config(&cfg.provider)?;
            let state = AppState {
                registry: Arc::new(ModelRegistry::builtin()),
                gateway: Arc::new(gateway),
                default_system_prompt: cfg.text.system_prompt.clone(),
                max_tokens: cfg.text.max_tokens,
            };
            let addr = bind.unwrap_or(cfg.server.bind);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            server::serve(listener, state).await?;
            Ok(())
        }
        Command::Models { json } => {
            let registry = ModelRegistry::builtin();
            if json {
                println!("{}", serde_json::to_string_pretty(&registry)?);
                return Ok(());
            }
            for (task, table) in [
                ("image", &registry.image),
                ("summary", &registry.summary),
                ("text", &registry.text),
            ] {
                for spec in table.iter() {
                    println!("{task:<8} {:<3} {:<12} {}", spec.key, spec.family.to_string(), spec.provider_id);
                }
            }
            Ok(())
        }
        Command::Chat {
            model,
            system,
            config,
            message,
        } => {
            let cfg = load_config(&config)?;
            let registry = ModelRegistry::builtin();
            let spec = registry.text.lookup(&model)?;
            let gateway = Gateway::from_config(&cfg.provider)?;

            let conversation = vec![Message::user(message)];
            let system = system.or(cfg.text.system_prompt);
            let payload = prompt::format(&conversation, spec.family, system.as_deref());

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let upstream = gateway
                .stream_text(spec, &payload, cfg.text.max_tokens, &cancel)
                .await?;
            let mut relay = StreamRelay::new(upstream, cancel);
            let mut stdout = std::io::stdout();
            while let Some(event) = relay.next_event().await {
                match event {
                    RelayEvent::Fragment(text) => {
                        write!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                    RelayEvent::Done => break,
                }
            }
            writeln!(stdout)?;
            Ok(())
        }
    }
}
