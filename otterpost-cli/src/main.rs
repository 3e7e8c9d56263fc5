use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use otterpost_core::config::Config;
use otterpost_core::core_client::{InitOutcome, LoadPhase, WalletStatus};
use otterpost_core::core_protocol::memory::{InMemoryFactory, InMemoryNetwork, StaticSigner};
use otterpost_core::core_reputation::{HttpReputationClient, ReputationSource, StaticReputationSource};
use otterpost_core::core_unread::{FileKvStore, KeyValueStore, MemoryKvStore};
use otterpost_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use otterpost_core::model::{ConsentState, Conversation, ConversationId, InboxId};
use otterpost_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use otterpost_core::test_utils::{eventually, test_address, test_profile, DEFAULT_TEST_TIMEOUT};
use otterpost_core::{Engine, SessionHandle};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "otterpost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Configuration file (TOML); OTTERPOST_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a sync session against an in-memory network
    Demo {
        /// Keep running and print session events until Ctrl+C
        #[arg(long)]
        follow: bool,

        /// Persist read state under the configured data directory
        #[arg(long)]
        persist: bool,

        /// Use the reputation API at the configured base URL
        #[arg(long)]
        live_reputation: bool,

        /// Print conversation lists as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::from(&config.logging);
    if let Some(level) = &args.log_level {
        let level = LogLevel::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
        log_config.level = level;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    otterpost_core::metrics::init_metrics();

    match args.command {
        Some(Command::Config { output }) => match output {
            Some(path) => {
                config.save_to_file(&path)?;
                info!(path = %path.display(), "Configuration written");
            }
            None => print!("{}", config.to_toml()?),
        },
        Some(Command::Demo { follow, persist, live_reputation, json }) => {
            run_demo(config, follow, persist, live_reputation, json).await?;
        }
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }
    Ok(())
}

fn print_view(label: &str, conversations: &[Conversation], json: bool) -> Result<()> {
    if json {
        let mut view = serde_json::Map::new();
        view.insert(label.to_string(), serde_json::to_value(conversations)?);
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    println!("{} ({})", label, conversations.len());
    for conversation in conversations {
        let preview = conversation
            .last_message
            .as_ref()
            .map(|m| m.text.as_str())
            .unwrap_or("(no messages)");
        println!(
            "  {:<12} {:<44} unread={} {}",
            conversation.id.as_str(),
            conversation.title(),
            conversation.unread_count,
            preview
        );
    }
    Ok(())
}

async fn wait_until_loaded(session: &SessionHandle) -> Result<()> {
    let loaded = eventually(DEFAULT_TEST_TIMEOUT, || async {
        matches!(session.load_phase().await, Ok(LoadPhase::Loaded) | Ok(LoadPhase::Error(_)))
    })
    .await;
    if !loaded {
        bail!("conversation load did not settle");
    }
    if let LoadPhase::Error(reason) = session.load_phase().await? {
        bail!("conversation load failed: {}", reason);
    }
    Ok(())
}

async fn run_demo(config: Config, follow: bool, persist: bool, live_reputation: bool, json: bool) -> Result<()> {
    let network = InMemoryNetwork::new();
    let me = test_address(1);
    let my_inbox = network.register(&me);

    let store: Arc<dyn KeyValueStore> = if persist {
        Arc::new(FileKvStore::open(config.storage.kv_path())?)
    } else {
        Arc::new(MemoryKvStore::new())
    };
    let reputation: Arc<dyn ReputationSource> = if live_reputation {
        Arc::new(HttpReputationClient::from_config(&config.reputation)?)
    } else {
        let source = StaticReputationSource::new();
        source.insert(test_profile(2, 87.5));
        source.insert(test_profile(3, 12.0));
        Arc::new(source)
    };

    // a known contact with history, and a stranger
    let friend = test_address(2);
    let friend_inbox = network.register(&friend);
    let friend_dm = network.create_dm(&friend_inbox, &my_inbox);
    network.deliver_text(&friend_inbox, &friend_dm, "gm! are we still on for later?");
    network.set_remote_consent(&my_inbox, &friend_inbox, ConsentState::Allowed);
    let stranger_inbox = network.register(&test_address(3));
    network.register(&test_address(4));

    let factory = Arc::new(InMemoryFactory::new(network.clone()));
    let mut engine = Engine::new(factory, reputation, store, config);

    let state = engine.resume(&me).await?;
    info!(state = ?state, "Restore probe finished");
    match engine.sign_in(&me, &StaticSigner::approving(me.clone())).await? {
        InitOutcome::Ready => info!(address = %me, "Signed in"),
        other => bail!("sign-in did not complete: {:?}", other),
    }
    let session = engine.session().cloned().context("session did not start")?;
    wait_until_loaded(&session).await?;

    // arrives over the live stream
    let stranger_dm = network.create_dm(&stranger_inbox, &my_inbox);
    network.deliver_text(&stranger_inbox, &stranger_dm, "hey, saw your post");
    let streamed = eventually(DEFAULT_TEST_TIMEOUT, || async {
        session
            .conversations(ConsentState::Unknown)
            .await
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    })
    .await;
    if !streamed {
        warn!("Streamed conversation did not arrive in time");
    }

    print_view("Allowed", &session.conversations(ConsentState::Allowed).await?, json)?;
    print_view("Requests", &session.conversations(ConsentState::Unknown).await?, json)?;
    println!("Unread (allowed): {}", session.total_unread().await?);

    let new_dm = session.create_dm(test_address(4).as_str()).await?;
    println!("Created {}", new_dm);

    session.open_conversation(friend_dm.clone()).await?;
    session.send_message("yes! 7pm").await?;
    let reconciled = eventually(DEFAULT_TEST_TIMEOUT, || async {
        session
            .timeline()
            .await
            .map(|t| t.iter().all(|item| !item.id.is_local()))
            .unwrap_or(false)
    })
    .await;
    for item in session.timeline().await? {
        println!("  [{:?}] {}: {}", item.status, item.sender_inbox_id.short(), item.text);
    }
    if !reconciled {
        warn!("Sent message not yet confirmed by the network");
    }
    session.mark_as_read(friend_dm.clone()).await?;
    println!("Unread (allowed) after reading: {}", session.total_unread().await?);

    if let Some(profile) = session.reputation(friend.clone()).await? {
        println!("Reputation for {}: {} ({})", friend, profile.score, profile.level);
    }
    println!("Route: {:?}", engine.route(&WalletStatus::Connected(me.clone())).await);

    if follow {
        follow_events(&mut engine, &session, network, friend_inbox, friend_dm).await;
    } else {
        engine.shutdown().await;
    }
    Ok(())
}

async fn follow_events(
    engine: &mut Engine,
    session: &SessionHandle,
    network: InMemoryNetwork,
    friend_inbox: InboxId,
    conversation: ConversationId,
) {
    let coordinator = Arc::new(ShutdownCoordinator::new());
    install_signal_handlers(coordinator.clone());

    let chatter = tokio::spawn(async move {
        let mut n = 0u32;
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;
            n += 1;
            network.deliver_text(&friend_inbox, &conversation, &format!("ping #{}", n));
        }
    });

    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {:?}", event);
        }
    });

    println!("Following session events; press Ctrl+C to stop");
    engine.run_until_shutdown(&coordinator).await;
    chatter.abort();
    printer.abort();
}
