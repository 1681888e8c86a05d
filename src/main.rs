use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agorai::agent_loop::{AgentLoopConfig, AgentMode, DEFAULT_POLL_INTERVAL_MS, run_agent};
use agorai::auth::AuthProvider;
use agorai::client::BridgeClient;
use agorai::model_caller::{DEFAULT_MODEL_TIMEOUT_MS, ModelAdapter, ModelCallOptions};

#[derive(Parser)]
#[command(name = "agorai", version, about = "Inter-agent messaging bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server
    Serve {
        /// SQLite database path
        #[arg(long, env = "AGORAI_DB", default_value = "data/bridge.db")]
        db: String,
        /// JSON keyfile mapping bearer keys to agent identities
        #[arg(long, env = "AGORAI_KEYS")]
        keys: Option<String>,
        /// HMAC salt for API key hashing
        #[arg(long, env = "AGORAI_SALT")]
        salt: Option<String>,
    },
    /// Host a model-backed agent against a remote bridge
    Agent {
        /// Bridge base URL, e.g. http://localhost:8000
        #[arg(long)]
        bridge: String,
        /// Bearer key identifying this agent on the bridge
        #[arg(long)]
        key: String,
        /// Model name passed to the chat-completions endpoint
        #[arg(long)]
        model: String,
        /// OpenAI-compatible endpoint base URL
        #[arg(long)]
        endpoint: String,
        /// API key for the model endpoint
        #[arg(long)]
        api_key: Option<String>,
        /// passive (reply to @mentions) or active (reply to everything)
        #[arg(long, default_value = "passive")]
        mode: String,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
        poll: u64,
        /// System prompt prepended to every model call
        #[arg(long)]
        system: Option<String>,
    },
}

#[rocket::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Usage and validation problems exit 1
            let _ = e.print();
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Serve { db, keys, salt } => {
            let auth = match keys {
                Some(path) => match AuthProvider::from_keyfile(&path) {
                    Ok(auth) => auth,
                    Err(e) => {
                        eprintln!("{e}");
                        std::process::exit(1);
                    }
                },
                None => {
                    eprintln!("⚠️  No keyfile given; starting with an empty key set");
                    AuthProvider::new(salt, Vec::new())
                }
            };
            if let Err(e) = agorai::rocket_with_auth(&db, auth).launch().await {
                eprintln!("Bridge failed: {e}");
                std::process::exit(1);
            }
        }
        Commands::Agent {
            bridge,
            key,
            model,
            endpoint,
            api_key,
            mode,
            poll,
            system,
        } => {
            let Some(mode) = AgentMode::parse(&mode) else {
                eprintln!("Invalid --mode '{mode}' (expected passive or active)");
                std::process::exit(1);
            };

            let mut client = BridgeClient::new(&bridge, &key);
            if let Err(e) = client.health().await {
                eprintln!("Bridge health check failed: {e}");
                std::process::exit(1);
            }
            // Learn our identity from the bridge before the loop starts
            let status = match client
                .call_tool("get_status", serde_json::json!({}))
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Failed to fetch agent identity: {e}");
                    std::process::exit(1);
                }
            };
            let agent_id = status
                .get("agent_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let agent_name = status
                .get("agent_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let adapter = ModelAdapter::new(ModelCallOptions {
                endpoint,
                model,
                api_key,
                timeout_ms: DEFAULT_MODEL_TIMEOUT_MS,
            });
            let cfg = AgentLoopConfig {
                agent_id,
                agent_name,
                mode,
                poll_interval_ms: poll,
                system_prompt: system,
            };

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });

            if let Err(e) = run_agent(&mut client, &adapter, &cfg, shutdown_rx).await {
                eprintln!("Agent loop failed: {e}");
                std::process::exit(1);
            }
        }
    }
}
