//! Command sources: an interactive line editor, or plain stdin.

use crate::dispatcher::CommandSource;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use colored::*;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::PathBuf;
use std::sync::mpsc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::oneshot;
use tracing::debug;

pub const PROMPT: &str = "pgshell> ";

type LineReply = oneshot::Sender<Result<Option<String>, String>>;

/// Interactive input with history, backed by rustyline.
///
/// The editor lives on its own thread and only reads when asked, so the
/// terminal is in raw mode at the prompt and back to normal while a
/// statement runs. Ctrl+C at the prompt clears the line; during a statement
/// it reaches the process as SIGINT.
pub struct ReadlineSource {
    requests: mpsc::Sender<LineReply>,
}

impl ReadlineSource {
    pub fn new(history: Option<PathBuf>) -> SessionResult<Self> {
        let (requests, incoming) = mpsc::channel::<LineReply>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        // The editor is created on its own thread and never leaves it.
        std::thread::Builder::new()
            .name("pgshell-readline".to_string())
            .spawn(move || {
                let mut editor = match DefaultEditor::new() {
                    Ok(editor) => editor,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Some(path) = &history {
                    // A missing history file is normal on first run.
                    let _ = editor.load_history(path);
                }
                let _ = ready_tx.send(Ok(()));

                let prompt = PROMPT.cyan().bold().to_string();
                for reply in incoming {
                    let line = read_line(&mut editor, &prompt);
                    if let Ok(Some(line)) = &line {
                        if !line.trim().is_empty() {
                            let _ = editor.add_history_entry(line.as_str());
                            if let Some(path) = &history {
                                let _ = editor.save_history(path);
                            }
                        }
                    }
                    if reply.send(line).is_err() {
                        break;
                    }
                }
                debug!("readline thread stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { requests }),
            Ok(Err(e)) => Err(SessionError::Io(std::io::Error::other(format!(
                "Failed to initialize line editor: {}",
                e
            )))),
            Err(_) => Err(SessionError::Io(std::io::Error::other(
                "line editor thread exited during startup",
            ))),
        }
    }
}

fn read_line(editor: &mut DefaultEditor, prompt: &str) -> Result<Option<String>, String> {
    loop {
        match editor.readline(prompt) {
            Ok(line) => return Ok(Some(line)),
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        }
    }
}

#[async_trait]
impl CommandSource for ReadlineSource {
    async fn next_command(&mut self) -> SessionResult<Option<String>> {
        let (tx, rx) = oneshot::channel();
        let stopped = || SessionError::Io(std::io::Error::other("line editor stopped"));
        self.requests.send(tx).map_err(|_| stopped())?;
        rx.await
            .map_err(|_| stopped())?
            .map_err(|e| SessionError::Io(std::io::Error::other(e)))
    }
}

/// One command per line from a non-interactive stdin.
pub struct StdinSource {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandSource for StdinSource {
    async fn next_command(&mut self) -> SessionResult<Option<String>> {
        Ok(self.lines.next_line().await?)
    }
}
