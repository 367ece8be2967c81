use crate::core::db::{BatchAbort, ConnectionManager, StatementResult};
use crate::core::{ClientError, Result};
use crate::results_grid::{render_error, render_result, Viewport};
use crate::runner::{CancellationToken, TaskHandle, TaskOutcome, TaskRunner, UiQueue};
use crate::statements::{extract_all, extract_at_cursor};
use crate::storage::{ConnectionProfile, KeyValueStore, ProfileStore, DEFAULT_SEPARATOR};
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::debug;

const POLL: Duration = Duration::from_millis(50);

/// Represents a parsed REPL command.
#[derive(Debug, PartialEq)]
pub enum Command {
    Profiles,
    Save {
        name: String,
        url: String,
        driver: Option<String>,
    },
    Delete(String),
    Connect(String),
    Disconnect,
    /// Execute the statement around the given buffer line (default: last line)
    Run(Option<usize>),
    /// Execute every statement in the buffer
    All,
    Cancel,
    Clear,
    Buffer,
    Help,
    Quit,
    Sql(String),
    Unknown(String),
}

/// Parses a user input string into a corresponding `Command`.
///
/// If the input starts with a colon (`:`), it is interpreted as a command.
/// Otherwise, it is a line for the query buffer.
pub fn parse_command(input: &str) -> Command {
    let trimmed = input.trim();
    if !trimmed.starts_with(':') {
        return Command::Sql(input.trim_end_matches(['\r', '\n']).to_string());
    }
    let parts: Vec<&str> = trimmed[1..].split_whitespace().collect();
    let Some(&head) = parts.first() else {
        return Command::Unknown(trimmed.to_string());
    };
    match (head, parts.len()) {
        ("profiles", _) => Command::Profiles,
        ("save", 3) | ("save", 4) => Command::Save {
            name: parts[1].to_string(),
            url: parts[2].to_string(),
            driver: parts.get(3).map(|d| d.to_string()),
        },
        ("delete", 2) => Command::Delete(parts[1].to_string()),
        ("connect", 2) => Command::Connect(parts[1].to_string()),
        ("disconnect", _) => Command::Disconnect,
        ("run", 1) => Command::Run(None),
        ("run", 2) => match parts[1].parse::<usize>() {
            Ok(line) if line > 0 => Command::Run(Some(line - 1)),
            _ => Command::Unknown(trimmed.to_string()),
        },
        ("all", _) => Command::All,
        ("cancel", _) => Command::Cancel,
        ("clear", _) => Command::Clear,
        ("buffer", _) => Command::Buffer,
        ("help", _) => Command::Help,
        ("quit", _) | ("q", _) => Command::Quit,
        _ => Command::Unknown(trimmed.to_string()),
    }
}

/// What the caller should do after a command.
#[derive(Debug, PartialEq)]
pub enum Flow {
    Continue(String),
    Quit,
}

/// Results of a batch, plus the failure that stopped it early, if any.
struct BatchReport {
    results: Vec<(String, StatementResult)>,
    failure: Option<ClientError>,
}

/// The interactive session: editable buffer, profiles and the live connection.
///
/// Profile storage and connection work always run on the background worker;
/// the calling thread only submits tasks and pumps their outcomes.
pub struct Session<S: KeyValueStore + 'static> {
    profiles: Arc<ProfileStore<S>>,
    connections: Arc<ConnectionManager>,
    runner: TaskRunner,
    ui: Arc<UiQueue>,
    buffer: Vec<String>,
    separator: String,
    viewport: Viewport,
}

impl<S: KeyValueStore + 'static> Session<S> {
    pub fn new(
        profiles: ProfileStore<S>,
        connections: Arc<ConnectionManager>,
        viewport: Viewport,
    ) -> Result<Self> {
        let ui = Arc::new(UiQueue::new());
        let runner = TaskRunner::new(ui.clone())?;
        Ok(Session {
            profiles: Arc::new(profiles),
            connections,
            runner,
            ui,
            buffer: Vec::new(),
            separator: DEFAULT_SEPARATOR.to_string(),
            viewport,
        })
    }

    pub fn buffer(&self) -> &[String] {
        &self.buffer
    }

    /// Statement separator of the live profile, `;` when disconnected.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Handles one command. `input` supplies further lines (password prompts,
    /// `:cancel` while a statement runs).
    pub fn handle(&mut self, command: Command, input: &Receiver<String>) -> Flow {
        match command {
            Command::Quit => Flow::Quit,
            Command::Sql(line) => {
                self.buffer.push(line);
                Flow::Continue(String::new())
            }
            other => Flow::Continue(self.dispatch(other, input)),
        }
    }

    fn dispatch(&mut self, command: Command, input: &Receiver<String>) -> String {
        match command {
            Command::Help => HELP.to_string(),
            Command::Buffer => self
                .buffer
                .iter()
                .enumerate()
                .map(|(i, line)| format!("{:>4}  {}\n", i + 1, line))
                .collect(),
            Command::Clear => {
                self.buffer.clear();
                "Buffer cleared\n".to_string()
            }
            Command::Profiles => {
                let store = self.profiles.clone();
                let outcome = self.await_task("list profiles", input, move |_| store.list());
                reply(outcome, |profiles| {
                    if profiles.is_empty() {
                        return "No saved profiles\n".to_string();
                    }
                    profiles
                        .iter()
                        .map(|p| {
                            let hotkey = p.hotkey.map(|h| format!(" [{}]", h)).unwrap_or_default();
                            format!("{}{}  {}\n", p.name, hotkey, p.url)
                        })
                        .collect()
                })
            }
            Command::Save { name, url, driver } => {
                let mut profile = ConnectionProfile::new(name, url);
                profile.driver = driver;
                profile.auto_login = true;
                let label = profile.name.clone();
                let store = self.profiles.clone();
                let outcome = self.await_task("save profile", input, move |_| store.save(&profile));
                reply(outcome, |()| format!("Saved profile {}\n", label))
            }
            Command::Delete(name) => {
                let store = self.profiles.clone();
                let label = name.clone();
                let outcome =
                    self.await_task("delete profile", input, move |_| store.delete_by_name(&name));
                reply(outcome, |()| format!("Deleted profile {}\n", label))
            }
            Command::Connect(name) => self.connect(name, input),
            Command::Disconnect => {
                let outcome = self.disconnect(input);
                reply(outcome, |()| "Disconnected\n".to_string())
            }
            Command::Run(line) => {
                let cursor = line.unwrap_or_else(|| self.buffer.len().saturating_sub(1));
                let statement = extract_at_cursor(&self.buffer, &self.separator, cursor);
                if statement.is_empty() {
                    return "No statement at cursor\n".to_string();
                }
                self.execute(vec![statement], input)
            }
            Command::All => {
                let statements = extract_all(&self.buffer, &self.separator);
                if statements.is_empty() {
                    return "Buffer holds no statements\n".to_string();
                }
                self.execute(statements, input)
            }
            Command::Cancel => "Nothing is running\n".to_string(),
            Command::Unknown(text) => format!("Unknown command: {} (try :help)\n", text),
            Command::Quit | Command::Sql(_) => String::new(),
        }
    }

    fn connect(&mut self, name: String, input: &Receiver<String>) -> String {
        let store = self.profiles.clone();
        let lookup = name.clone();
        let mut profile = match self.await_task("find profile", input, move |_| {
            store.find_by_name(&lookup)
        }) {
            TaskOutcome::Completed(Some(profile)) => profile,
            TaskOutcome::Completed(None) => return format!("Error: no profile named {:?}\n", name),
            other => return reply(other, |_| String::new()),
        };

        if !profile.auto_login && profile.password.is_none() {
            print!("Password for {}: ", profile.name);
            let _ = io::stdout().flush();
            match input.recv() {
                Ok(password) => profile.password = Some(password.trim_end().to_string()),
                Err(_) => return "Error: no password supplied\n".to_string(),
            }
        }

        let separator = profile.separator.clone();
        let label = profile.name.clone();
        let connections = self.connections.clone();
        let outcome = self.await_task("connect", input, move |_| connections.establish(&profile));
        if matches!(outcome, TaskOutcome::Completed(())) {
            self.separator = separator;
        }
        reply(outcome, |()| format!("Connected to {}\n", label))
    }

    fn disconnect(&mut self, input: &Receiver<String>) -> TaskOutcome<()> {
        let connections = self.connections.clone();
        let outcome = self.await_task("disconnect", input, move |_| connections.disconnect());
        if matches!(outcome, TaskOutcome::Completed(())) {
            self.separator = DEFAULT_SEPARATOR.to_string();
        }
        outcome
    }

    /// Closes the live connection, if any, before the session ends.
    pub fn close(&mut self, input: &Receiver<String>) -> Option<String> {
        if !self.connections.is_connected() {
            return None;
        }
        match self.disconnect(input) {
            TaskOutcome::Completed(()) => None,
            TaskOutcome::Failed(e) => Some(render_error(&e)),
            TaskOutcome::Interrupted => Some("Interrupted".to_string()),
        }
    }

    fn execute(&mut self, statements: Vec<String>, input: &Receiver<String>) -> String {
        let connections = self.connections.clone();
        let row_limit = self.viewport.row_limit();
        let outcome = self.await_task("execute", input, move |token| {
            match connections.execute_batch(&statements, row_limit, || token.is_cancelled()) {
                Ok(results) => Ok(BatchReport {
                    results: statements.iter().cloned().zip(results).collect(),
                    failure: None,
                }),
                // Partial results of a cancelled batch are discarded.
                Err(abort) if abort.is_cancelled() => Err(ClientError::Interrupted),
                Err(BatchAbort { completed, cause }) => Ok(BatchReport {
                    results: statements.iter().cloned().zip(completed).collect(),
                    failure: Some(cause),
                }),
            }
        });
        reply(outcome, |report| {
            let mut text: String = report
                .results
                .iter()
                .map(|(sql, result)| render_result(sql, result))
                .collect();
            if let Some(failure) = &report.failure {
                text.push_str(&render_error(failure));
                text.push('\n');
            }
            text
        })
    }

    /// Runs `work` on the worker and pumps UI callbacks until its outcome
    /// arrives. `:cancel` typed meanwhile requests cancellation.
    fn await_task<T, W>(&self, name: &str, input: &Receiver<String>, work: W) -> TaskOutcome<T>
    where
        T: Send + 'static,
        W: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    {
        let slot: Arc<Mutex<Option<TaskOutcome<T>>>> = Arc::new(Mutex::new(None));
        let handle = {
            let slot = slot.clone();
            self.runner.start(name, work, move |outcome| {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(outcome);
                }
            })
        };

        loop {
            if let Some(outcome) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                return outcome;
            }
            if self.ui.pump(POLL) {
                continue;
            }
            self.poll_cancel(&handle, input);
        }
    }

    fn poll_cancel(&self, handle: &TaskHandle, input: &Receiver<String>) {
        match input.try_recv() {
            Ok(line) if parse_command(&line) == Command::Cancel => {
                if self.runner.cancel(handle) {
                    println!("Cancelling after the current statement...");
                }
            }
            Ok(line) => debug!("Ignoring input while busy: {}", line),
            Err(_) => {}
        }
    }
}

/// Text for a task outcome; `render` formats a completed value.
fn reply<T>(outcome: TaskOutcome<T>, render: impl FnOnce(T) -> String) -> String {
    match outcome {
        TaskOutcome::Completed(value) => render(value),
        TaskOutcome::Failed(e) => render_error(&e) + "\n",
        TaskOutcome::Interrupted => "Interrupted\n".to_string(),
    }
}

const HELP: &str = "\
Available commands:
  :profiles                      List saved connection profiles
  :save <name> <url> [driver]    Save a profile
  :delete <name>                 Delete a profile
  :connect <name>                Connect using a saved profile
  :disconnect                    Close the active connection
  :run [line]                    Execute the statement at a buffer line (default: last)
  :all                           Execute every statement in the buffer
  :cancel                        Stop a running batch after the current statement
  :buffer                        Show the query buffer
  :clear                         Empty the query buffer
  :quit                          Exit

Any other input is appended to the query buffer.
";

/// Spawns a thread forwarding the reader's lines, so the UI loop can keep
/// pumping callbacks while waiting for input.
fn forward_lines<R: BufRead + Send + 'static>(reader: R) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// Runs the interactive shell until `:quit` or end of input.
pub fn run_repl<S: KeyValueStore + 'static>(mut session: Session<S>) {
    println!("Welcome to termsql! Type :help for commands, :quit to exit.");
    let input = forward_lines(io::BufReader::new(io::stdin()));

    loop {
        print!("{}> ", session.connections.current_profile().unwrap_or_default());
        let _ = io::stdout().flush();

        let line = loop {
            match input.recv_timeout(POLL) {
                Ok(line) => break Some(line),
                Err(RecvTimeoutError::Timeout) => {
                    session.ui.run_pending();
                }
                Err(RecvTimeoutError::Disconnected) => break None,
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match session.handle(parse_command(&line), &input) {
            Flow::Continue(text) => print!("{}", text),
            Flow::Quit => break,
        }
    }

    if let Some(error) = session.close(&input) {
        eprintln!("{}", error);
    }
}
