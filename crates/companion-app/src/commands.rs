// Handlers for each `companion` subcommand.

use std::io::Write;

use anyhow::{bail, Context};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use companion_core::config::Config;
use companion_core::personality::{PersonalityAnalyzer, PersonalityProfile};
use companion_core::protocol::{MotionPriority, TriggerCommand};
use companion_core::store::{connect_store, ChatTurn};
use companion_relay::listener::{listen, WsEvent};
use companion_relay::server::{self, RelayState};
use companion_relay::TriggerClient;

use crate::cli::{ChatArgs, Command, TriggerCommandArgs};
use crate::session::{ChatSession, SessionError};

const EXIT_WORDS: [&str; 2] = ["exit", "quit"];

pub async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    match command {
        Command::Serve => serve(config).await,
        Command::Chat(args) => chat(args, config).await,
        Command::Trigger(args) => trigger(args, &config).await,
        Command::Listen { url } => listen_and_print(url.unwrap_or(config.relay.ws_url)).await,
        Command::Profile { user, window } => profile(&user, window, &config).await,
        Command::History { user, limit, csv } => history(&user, limit, csv, &config).await,
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = config.server.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;
    eprintln!("Relay listening on http://{addr}");
    server::run(listener, RelayState::new(config.server), server::shutdown_signal()).await
}

// ---------------------------------------------------------------------------
// chat
// ---------------------------------------------------------------------------

async fn chat(args: ChatArgs, config: Config) -> anyhow::Result<()> {
    let session = open_session(&config, &args.user).await?;
    if !session.is_online() {
        eprintln!("No api_key in config/credentials.toml; replies will fail.");
    }

    let avatar = if args.expression.is_some() || args.speak_url.is_some() {
        Some(TriggerClient::new(&config.relay.trigger_url)?)
    } else {
        None
    };

    if let Some(message) = args.once.as_deref() {
        let reply = exchange(&session, message, args.stream).await?;
        react(avatar.as_ref(), &args).await;
        if !args.stream {
            println!("{reply}");
        }
        return Ok(());
    }

    println!("Chatting as {}. Type 'exit' to leave.", session.user_id());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if EXIT_WORDS.contains(&input) {
            break;
        }

        match exchange(&session, input, args.stream).await {
            Ok(reply) => {
                if !args.stream {
                    println!("{reply}");
                }
                react(avatar.as_ref(), &args).await;
            }
            Err(SessionError::EmptyInput) => {}
            Err(e) => eprintln!("Error: {e}"),
        }
    }
    Ok(())
}

async fn exchange(session: &ChatSession, input: &str, stream: bool) -> Result<String, SessionError> {
    if !stream {
        return session.respond(input).await;
    }
    let reply = session
        .respond_streaming(input, |token| {
            print!("{token}");
            let _ = std::io::stdout().flush();
        })
        .await;
    println!();
    reply
}

/// Forward the configured avatar reaction. A missing relay only warns.
async fn react(avatar: Option<&TriggerClient>, args: &ChatArgs) {
    let Some(client) = avatar else {
        return;
    };
    if let Some(name) = &args.expression {
        if let Err(e) = client.expression(name).await {
            warn!(error = %e, "expression trigger failed");
        }
    }
    if let Some(url) = &args.speak_url {
        if let Err(e) = client.speak(url).await {
            warn!(error = %e, "speak trigger failed");
        }
    }
}

// ---------------------------------------------------------------------------
// trigger
// ---------------------------------------------------------------------------

async fn trigger(args: TriggerCommandArgs, config: &Config) -> anyhow::Result<()> {
    let command = trigger_command(args)?;
    let client = TriggerClient::new(&config.relay.trigger_url)?;
    let ack = client.send(&command).await?;
    println!("{} ({} client(s))", ack.message, ack.delivered_to);
    Ok(())
}

pub fn trigger_command(args: TriggerCommandArgs) -> anyhow::Result<TriggerCommand> {
    Ok(match args {
        TriggerCommandArgs::Expression { name } => TriggerCommand::expression(name),
        TriggerCommandArgs::Motion { group, index, priority } => {
            let priority = MotionPriority::try_from(priority)
                .map_err(|p| anyhow::anyhow!("invalid motion priority {p}"))?;
            TriggerCommand::motion(group, index, priority)
        }
        TriggerCommandArgs::Speak { audio_url } => TriggerCommand::speak(audio_url),
        TriggerCommandArgs::Raw { command_type, payload } => {
            let payload: Map<String, Value> = match serde_json::from_str(&payload)
                .context("payload is not valid JSON")?
            {
                Value::Object(map) => map,
                _ => bail!("payload must be a JSON object"),
            };
            TriggerCommand::new(command_type, payload)
        }
    })
}

// ---------------------------------------------------------------------------
// listen
// ---------------------------------------------------------------------------

async fn listen_and_print(url: String) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let task = tokio::spawn(async move { listen(&url, tx).await });

    while let Some(event) = rx.recv().await {
        match event {
            WsEvent::Connected { url } => println!("Connected to {url}"),
            WsEvent::Message(msg) => println!("{} {}", msg.kind, Value::Object(msg.data)),
            WsEvent::Raw(text) => println!("(raw) {text}"),
            WsEvent::Disconnected => {
                println!("Disconnected");
                break;
            }
        }
    }

    task.await.context("listener task panicked")?
}

// ---------------------------------------------------------------------------
// profile / history
// ---------------------------------------------------------------------------

async fn profile(user: &str, window: Option<usize>, config: &Config) -> anyhow::Result<()> {
    let store = connect_store(&config.storage).await?;
    let analyzer = PersonalityAnalyzer::new(&config.personality);
    let window = window.unwrap_or(config.llm.profile_window);
    let profile = analyzer.generate_profile(store.as_ref(), user, window).await;
    info!(user, window, "profile computed");
    print!("{}", render_profile(&profile));
    Ok(())
}

pub fn render_profile(profile: &PersonalityProfile) -> String {
    let mut out = String::new();
    for entry in profile.entries() {
        out.push_str(&format!("{} ({}): {:.2}\n", entry.label, entry.id, entry.score));
    }
    out.push_str(&format!("temperature: {:.2}\n", profile.sampling_temperature()));
    out
}

async fn history(user: &str, limit: usize, csv: bool, config: &Config) -> anyhow::Result<()> {
    let store = connect_store(&config.storage).await?;
    let turns = store.latest(user, limit).await?;
    if csv {
        write_history_csv(&turns, std::io::stdout())?;
    } else if turns.is_empty() {
        println!("No history for {user}.");
    } else {
        for turn in &turns {
            println!("用户：{}\n{}\n", turn.user_message, turn.reply);
        }
    }
    Ok(())
}

pub fn write_history_csv<W: Write>(turns: &[ChatTurn], out: W) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for turn in turns {
        writer.serialize(turn)?;
    }
    writer.flush()?;
    Ok(())
}

pub async fn open_session(config: &Config, user: &str) -> anyhow::Result<ChatSession> {
    let store = connect_store(&config.storage)
        .await
        .context("failed to open chat log")?;
    Ok(ChatSession::from_config(config, store, user)?)
}
