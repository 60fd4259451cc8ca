mod console;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use console::{Command, HELP};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use yueli_core::{ActionCatalog, SemanticSignal, SessionId, TriggerBinding, YueliConfig};
use yueli_expression::{AvatarControl, AvatarError};
use yueli_live::{LiveHub, LiveReceiver, LiveServer};
use yueli_pipeline::{Pipeline, TurnOutcome};
use yueli_voice::{SilentTts, SimulatedOutput};
use yueli_vts::VtsClient;

#[derive(Parser, Debug)]
#[command(name = "yueli", author, version, about, long_about = None)]
struct Args {
    /// Path to the config file
    #[arg(short, long, env = "YUELI_CONFIG", default_value = "config/yueli.toml")]
    config: String,

    /// Action catalog (overrides the config file)
    #[arg(long)]
    catalog: Option<String>,

    /// Address for the live event listener (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Do not accept live events
    #[arg(long)]
    no_live: bool,

    /// Session id used for terminal input
    #[arg(long, default_value = "terminal")]
    session: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Stand-in target when no VTube Studio connection is configured.
struct LoggingAvatar;

#[async_trait]
impl AvatarControl for LoggingAvatar {
    async fn trigger(&self, binding: &TriggerBinding) -> Result<(), AvatarError> {
        info!(hotkey = %binding.hotkey, "Avatar trigger");
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = YueliConfig::load_or_default(&args.config);
    if let Some(catalog) = args.catalog {
        config.catalog_path = catalog;
    }
    if let Some(listen) = args.listen {
        config.live.listen = Some(listen);
    }
    if args.no_live {
        config.live.listen = None;
    }

    let catalog = ActionCatalog::load(&config.catalog_path, &config.catalog_rules())
        .context("Cannot start without a valid action catalog")?;

    let avatar: Arc<dyn AvatarControl> = match &config.vts {
        Some(vts) => Arc::new(VtsClient::connect(vts)?),
        None => {
            info!("No [vts] section, avatar triggers are only logged");
            Arc::new(LoggingAvatar)
        }
    };
    let output = Arc::new(SimulatedOutput::new(config.audio.device.clone()));
    let pipeline = Arc::new(Pipeline::new(&config, catalog, avatar, output, Arc::new(SilentTts)));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    if let Some(listen) = &config.live.listen {
        let hub = Arc::new(LiveHub::new(&config.live, pipeline.counters()));
        let dialogue = hub.subscribe("dialogue", &config.live.dialogue).await;
        let decisions = hub.subscribe("decision", &config.live.decision).await;
        let server = LiveServer::bind(listen, hub, config.live.read_timeout(), config.live.max_line_bytes).await?;

        tasks.push(pipeline.spawn_live_decisions(decisions, shutdown.clone()));
        tasks.push(tokio::spawn(print_dialogue(dialogue, shutdown.clone())));
        tasks.push(tokio::spawn(server.run(shutdown.clone())));
    }

    let session = SessionId::from(args.session.as_str());
    let result = repl(&pipeline, &session, &config.catalog_path).await;

    shutdown.cancel();
    if let Err(e) = pipeline.end_session(&session).await {
        warn!("{}", e);
    }
    pipeline.shutdown();
    for task in tasks {
        let _ = task.await;
    }
    info!("YueLi stopped");
    result
}

/// Stand-in for the dialogue core: show what the live room says.
async fn print_dialogue(mut events: LiveReceiver, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let (Some(user), Some(content)) = (event.user(), event.content()) {
            println!("[{}|{}] {}: {}", event.kind, event.priority, user, content);
        }
    }
}

async fn repl(pipeline: &Pipeline, session: &SessionId, catalog_path: &str) -> Result<()> {
    pipeline.start_session(session).await;
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("YueLi online. {}", HELP);
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match Command::parse(&line) {
            Command::Quit => break,
            Command::Empty => {}
            Command::Stats => {
                println!("{}", serde_json::to_string_pretty(&pipeline.counters().snapshot())?);
            }
            Command::Reload => match pipeline.reload_catalog(catalog_path).await {
                Ok(count) => println!("Catalog reloaded: {} actions", count),
                Err(e) => {
                    error!("Catalog reload failed, keeping the current one: {:#}", e);
                    println!("[reload failed] {:#}", e);
                }
            },
            Command::Emotion => match pipeline.emotion(session).await {
                Some(state) => println!("{}", serde_json::to_string(&state)?),
                None => println!("(baseline)"),
            },
            Command::Reset => {
                if let Ok(teardown) = pipeline.end_session(session).await {
                    println!("Session reset: {:?}", teardown);
                }
                pipeline.start_session(session).await;
            }
            Command::Act(tag) => match pipeline.handle_turn(session, &SemanticSignal::new(tag, 1.0)).await {
                Ok(outcome) => print_turn(&outcome),
                Err(e) => println!("[error] {}", e),
            },
            Command::Say(text) => match pipeline.observe_reply(session, &text, None).await {
                Ok(reply) => {
                    print_turn(&reply.turn);
                    println!("speech: {} sentence(s) queued", reply.speech.len());
                }
                Err(e) => println!("[error] {}", e),
            },
        }
    }
    Ok(())
}

fn print_turn(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Idle(noop) => println!("action: none ({:?})", noop.reason),
        TurnOutcome::Rejected { action, reason } => println!("action: {} rejected ({})", action, reason),
        TurnOutcome::Dispatched { result, sound } => println!(
            "action: {} {:?} in {} ms{}",
            result.action,
            result.status,
            result.latency.as_millis(),
            if *sound { " + sound" } else { "" }
        ),
    }
}
