//! Interactive prompt loop and result presentation.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::agent::{Agent, QueryOutcome, QueryStatus};
use crate::error::QueryError;
use crate::session::{self, SessionData};
use crate::types::Message;

/// One line of user input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Quit,
    Empty,
    Clear,
    Tools,
    Save,
    Query(String),
}

pub fn parse_input(line: &str) -> Input {
    let input = line.trim();
    match input {
        "" => Input::Empty,
        "quit" | "exit" | "/quit" | "/exit" => Input::Quit,
        "/clear" => Input::Clear,
        "/tools" => Input::Tools,
        "/save" => Input::Save,
        _ => Input::Query(input.to_string()),
    }
}

/// Render an outcome for the terminal: the answer, then one note per
/// skipped tool call, then a notice if the round limit was hit.
pub fn render_outcome(outcome: &QueryOutcome) -> String {
    let mut out = String::new();
    if outcome.answer.trim().is_empty() {
        out.push_str("(no answer)");
    } else {
        out.push_str(outcome.answer.trim_end());
    }

    for skip in &outcome.skipped {
        out.push_str(&format!(
            "\n  [skipped {} ({}): {}]",
            skip.tool, skip.call_id, skip.reason
        ));
    }
    if outcome.status == QueryStatus::DepthExceeded {
        out.push_str(&format!(
            "\n  [stopped after {} rounds without a final answer]",
            outcome.rounds
        ));
    }
    out
}

/// Conversation carried between queries when memory is on.
#[derive(Debug, Default)]
pub struct Memory {
    pub enabled: bool,
    pub history: Vec<Message>,
}

impl Memory {
    pub fn new(enabled: bool, history: Vec<Message>) -> Self {
        Self { enabled, history }
    }

    fn remember(&mut self, outcome: &QueryOutcome) {
        if self.enabled {
            self.history = outcome.history.clone();
        }
    }
}

/// Answer one query, cancelling it if Ctrl-C arrives while it runs.
pub async fn ask(agent: &Agent, memory: &mut Memory, query: &str) -> Result<QueryOutcome, QueryError> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let result = if memory.enabled && !memory.history.is_empty() {
        agent
            .run_with_history(memory.history.clone(), query, &cancel)
            .await
    } else {
        agent.run(query, &cancel).await
    };
    watcher.abort();

    if let Ok(outcome) = &result {
        debug!(
            rounds = outcome.rounds,
            input_tokens = outcome.usage.input_tokens,
            output_tokens = outcome.usage.output_tokens,
            "query finished"
        );
        memory.remember(outcome);
    }
    result
}

pub struct ChatLoop<'a> {
    pub agent: &'a Agent,
    pub memory: Memory,
    pub server_url: String,
    pub sessions_dir: PathBuf,
}

impl ChatLoop<'_> {
    /// Prompt on stdin. Ctrl-C cancels a running query; at the idle
    /// prompt it ends the session.
    pub async fn run(self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        self.run_on(stdin, || async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Prompt loop over any line source; `interrupted` resolves when the
    /// user asks to leave while no query is running.
    pub async fn run_on<R, F, Fut>(mut self, reader: R, interrupted: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Fn() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut lines = reader.lines();
        println!("Type your query. Type quit or press Ctrl-C to leave, /tools to list tools, /clear to reset memory.");

        loop {
            print!("\nQuery: ");
            std::io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = interrupted() => {
                    println!();
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };

            match parse_input(&line) {
                Input::Empty => continue,
                Input::Quit => break,
                Input::Clear => {
                    self.memory.history.clear();
                    println!("[Cleared]");
                }
                Input::Tools => {
                    for tool in self.agent.tools().list() {
                        println!("- {}: {}", tool.name, tool.description);
                    }
                }
                Input::Save => self.save(),
                Input::Query(query) => match ask(self.agent, &mut self.memory, &query).await {
                    Ok(outcome) => println!("\n{}", render_outcome(&outcome)),
                    Err(QueryError::Cancelled) => println!("\n[Cancelled]"),
                    Err(e) => {
                        error!(error = %e, "query failed");
                        println!("\n[Error: {}]", e);
                    }
                },
            }
        }
        Ok(())
    }

    fn save(&self) {
        if self.memory.history.is_empty() {
            println!("[Nothing to save: memory is off or empty]");
            return;
        }
        let data = SessionData::new(&self.server_url, self.memory.history.clone());
        match session::save_session(&self.sessions_dir, &data) {
            Ok(path) => println!("[Saved session {} to {}]", data.id, path.display()),
            Err(e) => println!("[Error saving session: {:#}]", e),
        }
    }
}
