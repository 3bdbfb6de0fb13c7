//! Console channel — line-based chat REPL over stdin/stdout.
//!
//! Plain lines go to the orchestrator as user messages; `/`-prefixed lines
//! are commands for model and document management.  Runs until the
//! `shutdown` token is cancelled (Ctrl-C) or stdin is closed.  A Ctrl-C
//! while a reply is streaming interrupts the generation before the console
//! exits.

use std::io::Write as _;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::GenerationParams;
use crate::error::AppError;
use crate::models::{LoadEvent, LoadState, ModelDescriptor, ModelRegistry};
use crate::retrieval::RetrievalIndex;
use crate::session::{GenerationOutcome, Orchestrator};

// ── Commands ─────────────────────────────────────────────────────────────────

/// A parsed `/` command line.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Help,
    Quit,
    Models,
    AddModel { id: String, source: String, library: String },
    RemoveModel { id: String },
    Load { id: String },
    Select { id: String },
    Docs,
    DocAdd { text: String },
    DocRemove { id: String },
    Rag { on: bool },
    Reset,
    Stats,
    Unknown(String),
}

/// Parse a `/`-prefixed line.  Returns `None` for plain chat input.
fn parse_command(line: &str) -> Option<Command> {
    let line = line.strip_prefix('/')?;
    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();

    let cmd = match head {
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "models" => Command::Models,
        "add" => match (words.next(), words.next(), words.next()) {
            (Some(id), Some(source), Some(library)) => Command::AddModel {
                id: id.to_string(),
                source: source.to_string(),
                library: library.to_string(),
            },
            _ => Command::Unknown("usage: /add <id> <source-url> <library>".into()),
        },
        "remove" => match words.next() {
            Some(id) => Command::RemoveModel { id: id.to_string() },
            None => Command::Unknown("usage: /remove <id>".into()),
        },
        "load" => match words.next() {
            Some(id) => Command::Load { id: id.to_string() },
            None => Command::Unknown("usage: /load <id>".into()),
        },
        "select" => match words.next() {
            Some(id) => Command::Select { id: id.to_string() },
            None => Command::Unknown("usage: /select <id>".into()),
        },
        "docs" => Command::Docs,
        "doc" => match words.next() {
            Some("add") => {
                let text = words.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    Command::Unknown("usage: /doc add <text>".into())
                } else {
                    Command::DocAdd { text }
                }
            }
            Some("rm") => match words.next() {
                Some(id) => Command::DocRemove { id: id.to_string() },
                None => Command::Unknown("usage: /doc rm <id>".into()),
            },
            _ => Command::Unknown("usage: /doc add <text> | /doc rm <id>".into()),
        },
        "rag" => match words.next() {
            Some("on") => Command::Rag { on: true },
            Some("off") => Command::Rag { on: false },
            _ => Command::Unknown("usage: /rag on|off".into()),
        },
        "reset" => Command::Reset,
        "stats" => Command::Stats,
        other => Command::Unknown(format!("unknown command: /{other} — try /help")),
    };
    Some(cmd)
}

// ── Console ──────────────────────────────────────────────────────────────────

pub struct Console {
    orchestrator: Orchestrator,
    registry: ModelRegistry,
    index: RetrievalIndex,
    params: GenerationParams,
    use_rag: bool,
}

impl Console {
    pub fn new(
        orchestrator: Orchestrator,
        registry: ModelRegistry,
        index: RetrievalIndex,
        params: GenerationParams,
    ) -> Self {
        Self { orchestrator, registry, index, params, use_rag: false }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), AppError> {
        info!("console started — type a message and press Enter, /help for commands");
        println!("──────────────────────────────────");
        println!(" Hearth console  (Ctrl-C to quit)");
        println!("──────────────────────────────────");

        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();

        loop {
            print!("> ");
            let _ = std::io::stdout().flush();

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    println!("\n[console] shutdown signal received");
                    info!("console shutting down");
                    break;
                }

                line = lines.next_line() => {
                    match line {
                        Err(e) => {
                            warn!("console read error: {e}");
                            break;
                        }
                        Ok(None) => {
                            info!("stdin closed");
                            break;
                        }
                        Ok(Some(input)) => {
                            let input = input.trim().to_string();
                            if input.is_empty() { continue; }
                            debug!(input = %input, "console line");

                            match parse_command(&input) {
                                Some(Command::Quit) => break,
                                Some(cmd) => self.handle_command(cmd, &shutdown).await,
                                None => self.chat(&input, &shutdown).await,
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Send one user message and stream the reply to stdout.
    async fn chat(&self, text: &str, shutdown: &CancellationToken) {
        let (done_tx, done_rx) = oneshot::channel();

        let on_delta = Box::new(|delta: &str| {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        });
        let on_complete = Box::new(move |outcome: GenerationOutcome| {
            let _ = done_tx.send(outcome);
        });

        if let Err(e) = self.orchestrator.generate(text, self.params, self.use_rag, on_delta, on_complete) {
            println!("! {e}");
            return;
        }

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                self.orchestrator.interrupt();
                println!("\n[interrupted]");
            }

            outcome = done_rx => match outcome {
                Ok(GenerationOutcome::Completed(report)) => {
                    println!();
                    println!(
                        "  [{} tok · prefill {:.1} tok/s · decode {:.1} tok/s · {:.1}s]",
                        report.total_tokens,
                        report.prefill_tokens_per_second,
                        report.decode_tokens_per_second,
                        report.wall_clock_seconds,
                    );
                }
                Ok(GenerationOutcome::Failed { message }) => {
                    println!("\n! generation failed: {message}");
                }
                // Sink dropped without firing: the session was interrupted.
                Err(_) => println!("\n[stopped]"),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command, shutdown: &CancellationToken) {
        match cmd {
            Command::Help => print_help(),
            Command::Quit => unreachable!("handled by the run loop"),
            Command::Models => self.print_models(),
            Command::AddModel { id, source, library } => {
                match self.registry.add_model(ModelDescriptor::user_added(id, source, library)) {
                    Ok(()) => println!("model added"),
                    Err(e) => println!("! {e}"),
                }
            }
            Command::RemoveModel { id } => match self.registry.remove_model(&id) {
                Ok(()) => println!("model removed"),
                Err(e) => println!("! {e}"),
            },
            Command::Load { id } => self.load(&id, shutdown).await,
            Command::Select { id } => match self.orchestrator.select_model(&id) {
                Ok(()) => println!("selected {id}"),
                Err(e) => println!("! {e}"),
            },
            Command::Docs => {
                let docs = self.index.list_documents();
                if docs.is_empty() {
                    println!("no documents");
                }
                for d in docs {
                    let preview: String = d.content.chars().take(60).collect();
                    println!("  {}  [{} chunks]  {preview}…", d.id, d.chunks.len());
                }
            }
            Command::DocAdd { text } => match self.index.add_document(&text) {
                Ok(doc) => println!("document {} added ({} chunks)", doc.id, doc.chunks.len()),
                Err(e) => println!("! {e}"),
            },
            Command::DocRemove { id } => {
                self.index.remove_document(&id);
                println!("removed (if it existed)");
            }
            Command::Rag { on } => {
                self.use_rag = on;
                println!("retrieval augmentation {}", if on { "on" } else { "off" });
            }
            Command::Reset => match self.orchestrator.reset_chat() {
                Ok(()) => println!("chat reset"),
                Err(e) => println!("! {e}"),
            },
            Command::Stats => match self.orchestrator.performance_report() {
                Some(r) => println!(
                    "last generation: {} tok, prefill {:.1} tok/s, decode {:.1} tok/s, {:.1}s wall clock",
                    r.total_tokens,
                    r.prefill_tokens_per_second,
                    r.decode_tokens_per_second,
                    r.wall_clock_seconds,
                ),
                None => println!("no completed generation yet"),
            },
            Command::Unknown(msg) => println!("! {msg}"),
        }
    }

    fn print_models(&self) {
        let selected = self.registry.selected_model().map(|m| m.id);
        for m in self.registry.list_models() {
            let marker = if selected.as_deref() == Some(&m.id) { "*" } else { " " };
            let state = match m.load_state {
                LoadState::Unloaded => "unloaded",
                LoadState::Downloading => "downloading",
                LoadState::Ready => "ready",
                LoadState::Failed => "failed",
            };
            println!(" {marker} {:<28} {:<11} {:?}", m.id, state, m.origin);
        }
    }

    /// Kick off a model load and render progress until the terminal event.
    async fn load(&self, id: &str, shutdown: &CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self.orchestrator.load_model(id, tx) {
            println!("! {e}");
            return;
        }

        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{bar:30.cyan/blue} {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    // The download keeps running in the background.
                    bar.abandon_with_message("still downloading in background");
                    return;
                }

                event = rx.recv() => match event {
                    Some(LoadEvent::Progress(p)) => {
                        if let Some(total) = p.bytes_total {
                            bar.set_length(total);
                        }
                        bar.set_position(p.bytes_loaded);
                        match p.estimated_seconds_remaining {
                            Some(eta) if eta > 0.0 => bar.set_message(format!("~{eta:.0}s left")),
                            _ => bar.set_message(""),
                        }
                    }
                    Some(LoadEvent::Ready { model_id }) => {
                        bar.finish_with_message("ready");
                        println!("{model_id} is ready");
                        return;
                    }
                    Some(LoadEvent::Failed { message, .. }) => {
                        bar.abandon_with_message("failed");
                        println!("! load failed: {message}");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  /models                     list models and load states");
    println!("  /add <id> <source> <lib>    register a model");
    println!("  /remove <id>                remove a user-added model");
    println!("  /load <id>                  download + load a model");
    println!("  /select <id>                switch the active model");
    println!("  /docs                       list documents");
    println!("  /doc add <text>             ingest a document");
    println!("  /doc rm <id>                remove a document");
    println!("  /rag on|off                 toggle retrieval augmentation");
    println!("  /reset                      clear chat and stats");
    println!("  /stats                      last generation statistics");
    println!("  /quit                       exit");
    println!("anything else is sent to the model.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(parse_command("hello there").is_none());
        assert!(parse_command("").is_none());
    }

    #[test]
    fn commands_parse_with_arguments() {
        assert_eq!(parse_command("/models"), Some(Command::Models));
        assert_eq!(
            parse_command("/add m1 https://x.test/w.gguf llama-cpp/chatml"),
            Some(Command::AddModel {
                id: "m1".into(),
                source: "https://x.test/w.gguf".into(),
                library: "llama-cpp/chatml".into(),
            })
        );
        assert_eq!(parse_command("/load m1"), Some(Command::Load { id: "m1".into() }));
        assert_eq!(parse_command("/rag on"), Some(Command::Rag { on: true }));
        assert_eq!(parse_command("/rag off"), Some(Command::Rag { on: false }));
        assert_eq!(
            parse_command("/doc add some text here"),
            Some(Command::DocAdd { text: "some text here".into() })
        );
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
    }

    #[test]
    fn malformed_commands_report_usage() {
        for line in ["/add m1", "/load", "/rag sideways", "/doc add", "/nonsense"] {
            match parse_command(line) {
                Some(Command::Unknown(msg)) => assert!(!msg.is_empty()),
                other => panic!("{line:?} should be Unknown, got {other:?}"),
            }
        }
    }
}
