//! Main Entrypoint for the Live-Chat Voice Client
//!
//! This binary is responsible for:
//! 1. Parsing command-line flags and loading configuration from the environment.
//! 2. Opening the local microphone and speakers through cpal.
//! 3. Running a session controller that the user toggles with Enter.
//! 4. Printing the agent's transcript and tool results to the terminal.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use livechat_core::SessionState;
use livechat_voice::{
    SessionController, SessionError, SessionHandler,
    audio::local::{LocalAudioInput, LocalAudioOutput, list_devices},
    config::{Config, Overrides},
};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, info, warn};

#[derive(Parser, Debug)]
#[command(name = "livechat")]
#[command(author, version, about = "Talk to a storefront's shopping assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the voice client (default)
    Run,
    /// List the audio devices cpal can see
    Devices,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Storefront slug (overrides LIVECHAT_STORE_SLUG)
    #[arg(long)]
    store: Option<String>,

    /// Shopper email sent with the connection (overrides LIVECHAT_SHOPPER_EMAIL)
    #[arg(long)]
    email: Option<String>,

    /// Relay base URL (overrides LIVECHAT_SERVER_URL)
    #[arg(long)]
    server: Option<String>,

    /// Microphone name, as printed by `livechat devices`
    #[arg(long)]
    input_device: Option<String>,

    /// Speaker name, as printed by `livechat devices`
    #[arg(long)]
    output_device: Option<String>,
}

impl From<SessionArgs> for Overrides {
    fn from(args: SessionArgs) -> Self {
        Overrides {
            server_url: args.server,
            store_slug: args.store,
            shopper_email: args.email,
            input_device: args.input_device,
            output_device: args.output_device,
        }
    }
}

/// Prints session output to the terminal.
struct ConsoleHandler;

impl SessionHandler for ConsoleHandler {
    fn on_tool_call(&self, name: &str, result: &serde_json::Value) {
        let pretty = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
        println!("\n[tool: {}]\n{}", name, pretty);
    }

    fn on_ai_text(&self, text: &str) {
        print!("{}", text);
        let _ = std::io::stdout().flush();
    }

    fn on_turn_complete(&self) {
        println!();
    }

    fn on_error(&self, error: &SessionError) {
        eprintln!("Could not start the session: {}", error);
    }
}

fn init_logging(level: Level) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
}

/// Listens for the `Ctrl+C` signal.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; use end-of-input to quit.");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn print_devices() -> anyhow::Result<()> {
    let devices = list_devices().context("Failed to enumerate audio devices")?;
    let mark = |name: &str, default: &Option<String>| {
        if default.as_deref() == Some(name) { "*" } else { " " }
    };
    println!("Input devices:");
    for name in &devices.inputs {
        println!(" {} {}", mark(name, &devices.default_input), name);
    }
    println!("Output devices:");
    for name in &devices.outputs {
        println!(" {} {}", mark(name, &devices.default_output), name);
    }
    Ok(())
}

fn describe(state: SessionState) -> String {
    let hint = if state.is_startable() {
        "Enter to start"
    } else {
        "Enter to stop"
    };
    format!("[{:?}] {}", state, hint)
}

async fn run(overrides: Overrides) -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::load(&overrides).context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    init_logging(config.log_level);
    info!(
        store = %config.store_slug,
        endpoint = %config.endpoint(),
        backpressure = ?config.backpressure,
        interrupt = ?config.interrupt,
        "Configuration loaded."
    );

    // --- 3. Wire Devices and Controller ---
    let input = Arc::new(LocalAudioInput::new(config.input_device.clone()));
    let output = Arc::new(LocalAudioOutput::new(config.output_device.clone()));
    let controller =
        SessionController::new(config.session(), input, output, Arc::new(ConsoleHandler));
    let mut state = controller.subscribe_state();

    // --- 4. Drive from the Terminal ---
    println!("Press Enter to start or stop talking. Ctrl+C quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line.context("Failed to read from stdin")? {
                Some(_) => controller.toggle()?,
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("{}", describe(current));
            }
        }
    }

    controller.shutdown().await;
    info!("Voice client has shut down.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Devices => {
            init_logging(Level::WARN);
            print_devices()
        }
        Commands::Run => run(cli.session.into()).await,
    }
}
