#![forbid(unsafe_code)]

//! `agent-relay-ctl`: shell companion for `agent-relay`.
//!
//! Posts JSON requests to the relay's local HTTP API so the agent can message
//! the operator, ask a question or share a file from a shell command.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "agent-relay-ctl",
    about = "Talk to the operator through a running agent-relay",
    version,
    long_about = None
)]
struct Cli {
    /// Local port of the relay HTTP API (must match `http_port`).
    #[arg(long, default_value_t = 8081)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send a message to the operator.
    Send {
        /// Message text (markdown).
        text: String,
    },

    /// Ask the operator a question and stop the current run.
    Ask {
        /// Question prompt.
        question: String,
        /// Answer options (up to 8).
        #[arg(long = "option", short = 'o')]
        options: Vec<String>,
    },

    /// Upload a local file to the operator.
    SendFile {
        /// File to upload.
        path: PathBuf,
        /// Optional caption.
        #[arg(long)]
        caption: Option<String>,
    },

    /// Show relay health.
    Health,
}

fn main() {
    let args = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let base = format!("http://127.0.0.1:{}", args.port);
    match runtime.block_on(execute(&base, &args.command)) {
        Ok(response) => {
            let ok = response.get("error").is_none();
            if ok {
                if response.get("ok").is_some() {
                    println!("OK");
                } else {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&response).unwrap_or_default()
                    );
                }
            } else {
                let err_msg = response
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                eprintln!("Error: {err_msg}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to reach agent-relay: {err}");
            eprintln!("Is agent-relay running with http_port {}?", args.port);
            std::process::exit(1);
        }
    }
}

async fn execute(
    base: &str,
    command: &Command,
) -> std::result::Result<serde_json::Value, reqwest::Error> {
    let client = reqwest::Client::new();
    let request = match command {
        Command::Send { text } => client
            .post(format!("{base}/send"))
            .json(&serde_json::json!({ "text": text })),
        Command::Ask { question, options } => client
            .post(format!("{base}/ask"))
            .json(&serde_json::json!({ "question": question, "options": options })),
        Command::SendFile { path, caption } => {
            let path = path.canonicalize().unwrap_or_else(|_| path.clone());
            client
                .post(format!("{base}/send_file"))
                .json(&serde_json::json!({ "path": path, "caption": caption }))
        }
        Command::Health => client.get(format!("{base}/health")),
    };
    request.send().await?.json().await
}
