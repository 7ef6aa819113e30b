// Command-line arguments for the `companion` binary.

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_USER: &str = "default";

#[derive(Debug, Parser)]
#[command(name = "companion", version, about = "Live2D companion backend and terminal front end")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP + WebSocket relay.
    Serve,

    /// Chat with the companion in the terminal.
    Chat(ChatArgs),

    /// Send a command to a running relay.
    #[command(subcommand)]
    Trigger(TriggerCommandArgs),

    /// Print every command the relay broadcasts.
    Listen {
        /// Relay WebSocket URL (defaults to `relay.ws_url`).
        #[arg(long)]
        url: Option<String>,
    },

    /// Show a user's personality profile.
    Profile {
        #[arg(long, default_value = DEFAULT_USER)]
        user: String,
        /// Number of recent turns to analyze (defaults to `llm.profile_window`).
        #[arg(long)]
        window: Option<usize>,
    },

    /// Show a user's most recent turns.
    History {
        #[arg(long, default_value = DEFAULT_USER)]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Write CSV to stdout instead of a readable listing.
        #[arg(long)]
        csv: bool,
    },
}

#[derive(Debug, Args)]
pub struct ChatArgs {
    #[arg(long, default_value = DEFAULT_USER)]
    pub user: String,

    /// Send one message, print the reply, and exit.
    #[arg(long)]
    pub once: Option<String>,

    /// Print the reply as it streams in.
    #[arg(long)]
    pub stream: bool,

    /// Expression to trigger on the avatar after each reply.
    #[arg(long)]
    pub expression: Option<String>,

    /// Audio URL the avatar lip-syncs to after each reply.
    #[arg(long)]
    pub speak_url: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum TriggerCommandArgs {
    /// Switch the avatar's expression.
    Expression { name: String },

    /// Play a motion.
    Motion {
        group: String,
        #[arg(long, default_value_t = 0)]
        index: u32,
        /// 1 = idle, 2 = normal, 3 = force.
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=3))]
        priority: u8,
    },

    /// Lip-sync to an audio file.
    Speak { audio_url: String },

    /// Send an arbitrary command with a JSON object payload.
    Raw { command_type: String, payload: String },
}
