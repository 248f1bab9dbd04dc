use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::oneshot;

use agent_broker::{
    config::Config,
    events::{init_logging, EventEmitter},
    gateway::{Gateway, UnixSocketTransport},
    keys::{AgentKey, KeySelection, KeyService},
    runner::{ForegroundRunner, InteractionSurface},
    types::AgentId,
    Broker,
};

mod console;

use console::ConsoleSurface;

#[derive(Debug, Parser)]
#[command(name = "agent-broker")]
#[command(about = "Delegates SSH key operations to out-of-process agents")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Let the user pick a key in an agent and print its descriptor.
    SelectKey {
        agent: String,
    },
    /// Print the public half of a key held by an agent.
    PublicKey {
        agent: String,
        key_id: String,
    },
    /// Sign a base64 challenge with a key held by an agent.
    Sign {
        agent: String,
        key_id: String,
        /// Challenge bytes, base64 encoded
        challenge: String,
        /// SHA-1, SHA-256, SHA-384, SHA-512 or an SSH signature name
        #[arg(long, default_value = "SHA-256")]
        hash: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let broker_config = cli.config.broker_config();
    let agent_dir = cli.config.agent_dir();
    tracing::debug!(
        target = "agent_broker::cli",
        agent_dir = %agent_dir.display(),
        "using agent socket directory"
    );
    let gateway = Gateway::new(
        Arc::new(UnixSocketTransport::new(agent_dir)),
        broker_config.invoke_timeout,
    );
    let (broker, queue) = Broker::builder(gateway)
        .config(broker_config)
        .events(EventEmitter::new(cli.config.json_output))
        .runtime(runtime.handle().clone())
        .build();

    let surface: Arc<dyn InteractionSurface> = Arc::new(ConsoleSurface::new());
    let runner = ForegroundRunner::new(&broker, queue, &surface);
    let keys = KeyService::new(broker.clone());

    // Key operations block, so they run on a worker; this thread presents
    // interactions.
    let (done_tx, done_rx) = oneshot::channel();
    let command = cli.command;
    std::thread::Builder::new()
        .name("agent-broker-worker".to_string())
        .spawn(move || {
            let _ = done_tx.send(run_command(&keys, command));
        })
        .context("failed to spawn worker thread")?;

    let output: Result<String> = runtime.block_on(async move {
        tokio::select! {
            _ = runner.run() => Err(anyhow!("interaction runner stopped unexpectedly")),
            result = done_rx => result.context("worker thread exited without a result")?,
        }
    });

    let metrics = broker.metrics();
    tracing::debug!(
        target = "agent_broker::cli",
        submitted = metrics.submitted,
        succeeded = metrics.succeeded,
        failed = metrics.failed,
        canceled = metrics.canceled,
        interactions = metrics.interactions,
        "done"
    );
    broker.shutdown();

    println!("{}", output?);
    Ok(())
}

fn run_command(keys: &KeyService, command: Commands) -> Result<String> {
    match command {
        Commands::SelectKey { agent } => {
            let (tx, rx) = oneshot::channel();
            keys.select_key(AgentId::new(agent), move |result| {
                let _ = tx.send(result);
            });
            let selection = rx
                .blocking_recv()
                .context("key selection was dropped")??;
            match selection {
                KeySelection::Selected(key) => {
                    let fingerprint = key.fingerprint()?;
                    Ok(serde_json::to_string_pretty(&json!({
                        "agent": key.agent,
                        "key_id": key.key_id,
                        "description": key.description,
                        "key_type": key.key_type,
                        "fingerprint": fingerprint,
                        "public_key": B64.encode(&key.public_key),
                    }))?)
                }
                KeySelection::Canceled => bail!("key selection canceled"),
            }
        }
        Commands::PublicKey { agent, key_id } => {
            let info = keys.fetch_public_key(&AgentId::new(agent), &key_id)?;
            Ok(format!(
                "{} {} {}",
                info.key_type(),
                info.fingerprint,
                B64.encode(&info.encoded)
            ))
        }
        Commands::Sign {
            agent,
            key_id,
            challenge,
            hash,
        } => {
            let challenge = B64
                .decode(challenge.trim())
                .context("challenge is not valid base64")?;
            let agent = AgentId::new(agent);
            let info = keys.fetch_public_key(&agent, &key_id)?;
            let key = AgentKey {
                agent,
                key_id,
                description: None,
                key_type: info.key_type().to_string(),
                public_key: info.encoded,
            };
            match keys.sign_challenge(&key, &challenge, &hash)? {
                Some(signature) => Ok(B64.encode(signature)),
                None => bail!("signing canceled"),
            }
        }
    }
}
