use anyhow::{anyhow, Context, Result};
use bmc_api::ApiClient;
use bmc_core::{EventBuffer, LogEvent, DEFAULT_BUFFER_CAPACITY};
use bmc_logstream::{resolve_log_endpoint, CloseReason, LogStream, LogStreamConfig, StreamEvent};
use clap::{Parser, Subcommand};
use crossterm::{
    execute,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env, fs,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};
use tracing::info;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const CONFIG_FILE: &str = "config.json";
const DEFAULT_HISTORY_LINES: usize = 10;

#[derive(Parser)]
#[command(name = "bmc")]
#[command(about = "Bot management console", long_about = None)]
struct Cli {
    /// Server URL or configured alias; falls back to BMC_SERVER, then the default server
    #[arg(long, global = true, default_value = "")]
    server: String,
    /// Append structured logs to this file
    #[arg(long, global = true, default_value = "")]
    log_file: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log into a server and store the auth token
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Check that the stored token is still valid
    Ping,
    /// Stream server logs to the terminal
    Tail {
        /// Dim events from loggers other than this one
        #[arg(long, default_value = "")]
        focus: String,
        /// History lines to print before live events (0 prints everything)
        #[arg(long, default_value_t = DEFAULT_HISTORY_LINES)]
        history: usize,
        /// Events kept in the scrollback buffer (0 keeps everything)
        #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
        capacity: usize,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConsoleConfig {
    #[serde(default)]
    servers: HashMap<String, String>,
    #[serde(default)]
    aliases: HashMap<String, String>,
    #[serde(default)]
    default_server: Option<String>,
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    stderr_enabled: bool,
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.log_file);

    if let Err(err) = run(cli).await {
        eprintln!("bmc: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_console_config();
    match cli.command {
        Commands::Login { username, password } => {
            login(&cli.server, &mut config, &username, &password).await
        }
        Commands::Ping => ping(&cli.server, &config).await,
        Commands::Tail {
            focus,
            history,
            capacity,
        } => tail(&cli.server, &config, &focus, history, capacity).await,
    }
}

async fn login(
    server_flag: &str,
    config: &mut ConsoleConfig,
    username: &str,
    password: &str,
) -> Result<()> {
    let server = resolve_server(server_flag, config)?;
    let mut api = ApiClient::new(&server)?;
    api.discover_base_path().await;

    let token = api.login(username, password).await?;
    config.servers.insert(server.clone(), token);
    if config.default_server.is_none() {
        config.default_server = Some(server.clone());
    }
    save_console_config(config)?;
    println!("Logged in to {server}");
    Ok(())
}

async fn ping(server_flag: &str, config: &ConsoleConfig) -> Result<()> {
    let server = resolve_server(server_flag, config)?;
    let token = stored_token(config, &server)?;
    let mut api = ApiClient::new(&server)?;
    api.discover_base_path().await;

    let username = api.ping(&token).await?;
    let version = api
        .version(&token)
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    println!("Logged in to {server} as {username} (server version {version})");
    Ok(())
}

async fn tail(
    server_flag: &str,
    config: &ConsoleConfig,
    focus: &str,
    history: usize,
    capacity: usize,
) -> Result<()> {
    let server = resolve_server(server_flag, config)?;
    let token = stored_token(config, &server)?;
    let mut api = ApiClient::new(&server)?;
    api.discover_base_path().await;

    let endpoint = resolve_log_endpoint(api.console_url(), api.base_path())?;
    info!(event = "tail_start", endpoint = %endpoint);

    let mut buffer = if capacity == 0 {
        EventBuffer::unbounded()
    } else {
        EventBuffer::with_capacity(capacity)
    };
    if !focus.trim().is_empty() {
        buffer.set_focus(Some(focus.trim().to_string()));
    }

    let (stream, mut events) = LogStream::spawn(LogStreamConfig::new(endpoint, token));
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                print_notice(&mut stdout, "Stopping", Color::Yellow)?;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                handle_stream_event(&mut stdout, &mut buffer, history, event)?;
            }
        }
    }

    stream.stopped().await;
    Ok(())
}

fn handle_stream_event(
    stdout: &mut io::Stdout,
    buffer: &mut EventBuffer,
    history: usize,
    event: StreamEvent,
) -> Result<()> {
    match event {
        StreamEvent::Connected => {
            print_notice(stdout, "Connected, authenticating...", Color::Green)?;
        }
        StreamEvent::AuthOk => {
            print_notice(stdout, "Authentication successful", Color::Green)?;
        }
        StreamEvent::AuthFailed => {
            print_notice(stdout, "Authentication failed", Color::Red)?;
        }
        StreamEvent::History(batch) => {
            buffer.append_history(batch);
            let skip = if history == 0 {
                0
            } else {
                buffer.len().saturating_sub(history)
            };
            for event in buffer.events().skip(skip) {
                print_event(stdout, event, buffer.is_focused(event))?;
            }
        }
        StreamEvent::Event(event) => {
            print_event(stdout, &event, buffer.is_focused(&event))?;
            buffer.append_one(event);
        }
        StreamEvent::Closed {
            code,
            reason,
            retry_in,
        } => {
            let text = match reason {
                CloseReason::AuthFailure => "Disconnected: authentication failed".to_string(),
                CloseReason::ServerRestart => "Disconnected: server is restarting".to_string(),
                CloseReason::Other => match code {
                    Some(code) => format!("Disconnected (close code {code})"),
                    None => "Disconnected".to_string(),
                },
            };
            let notice = if retry_in.is_zero() {
                format!("{text}; reconnecting")
            } else {
                format!("{text}; retrying in {}s", retry_in.as_secs())
            };
            print_notice(stdout, &notice, Color::Yellow)?;
        }
    }
    Ok(())
}

fn format_line(event: &LogEvent) -> String {
    let time = match event.time {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "unknown".to_string(),
    };
    let message = match (&event.http_request, &event.message) {
        (Some(request), _) => format!("{} {}", request.method, request.path),
        (None, Some(message)) => message.clone(),
        (None, None) => String::new(),
    };
    let mut line = format!("[{time}] [{}@{}] {message}", event.level, event.name);
    if let Some(exc) = &event.exc_info {
        line.push('\n');
        line.push_str(exc);
    }
    line
}

fn level_color(level: &str) -> Option<Color> {
    match level {
        "INFO" => Some(Color::Cyan),
        "WARNING" => Some(Color::Yellow),
        "ERROR" => Some(Color::Red),
        "FATAL" | "CRITICAL" => Some(Color::Magenta),
        _ => None,
    }
}

fn print_event(stdout: &mut io::Stdout, event: &LogEvent, focused: bool) -> io::Result<()> {
    let line = format_line(event);
    if let Some(color) = level_color(&event.level) {
        execute!(stdout, SetForegroundColor(color))?;
    }
    if !focused {
        execute!(stdout, SetAttribute(Attribute::Dim))?;
    }
    execute!(
        stdout,
        Print(&line),
        Print("\n"),
        ResetColor,
        SetAttribute(Attribute::Reset)
    )?;
    Ok(())
}

fn print_notice(stdout: &mut io::Stdout, text: &str, color: Color) -> io::Result<()> {
    execute!(
        stdout,
        SetForegroundColor(color),
        Print(text),
        Print("\n"),
        ResetColor
    )?;
    Ok(())
}

fn resolve_server(flag: &str, config: &ConsoleConfig) -> Result<String> {
    let candidate = if !flag.trim().is_empty() {
        flag.to_string()
    } else if let Some(value) = env_server() {
        value
    } else if let Some(value) = &config.default_server {
        value.clone()
    } else {
        return Err(anyhow!(
            "no server given; pass --server, set BMC_SERVER or log in first"
        ));
    };
    Ok(config
        .aliases
        .get(&candidate)
        .cloned()
        .unwrap_or(candidate))
}

fn env_server() -> Option<String> {
    if let Ok(value) = env::var("BMC_SERVER") {
        if !value.trim().is_empty() {
            return Some(value);
        }
    }
    None
}

fn stored_token(config: &ConsoleConfig, server: &str) -> Result<String> {
    config
        .servers
        .get(server)
        .cloned()
        .ok_or_else(|| anyhow!("not logged in to {server}; run `bmc login` first"))
}

fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| anyhow!("could not locate a config directory"))?;
    Ok(base.join("bmc").join(CONFIG_FILE))
}

fn load_console_config() -> ConsoleConfig {
    match config_path() {
        Ok(path) => load_config_from(&path),
        Err(_) => ConsoleConfig::default(),
    }
}

fn load_config_from(path: &Path) -> ConsoleConfig {
    if let Ok(content) = fs::read_to_string(path) {
        match serde_json::from_str(&content) {
            Ok(config) => return config,
            Err(err) => {
                eprintln!("Warning: failed to parse {}: {}", path.display(), err);
            }
        }
    }
    ConsoleConfig::default()
}

fn save_console_config(config: &ConsoleConfig) -> Result<()> {
    let path = config_path()?;
    save_config_to(&path, config)
}

fn save_config_to(path: &Path, config: &ConsoleConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let payload = serde_json::to_string_pretty(config)?;
    fs::write(path, payload).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn init_logging(log_file: &str) -> Option<LogGuard> {
    let level = if let Ok(level) = env::var("BMC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_file) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let stderr_enabled = resolve_log_stderr();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stderr_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn open_log_file(log_file: &str) -> io::Result<LogGuard> {
    if log_file.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let path = PathBuf::from(log_file);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .write(true)
        .open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}

fn resolve_log_stderr() -> bool {
    if let Ok(value) = env::var("BMC_LOG_STDERR") {
        match value.trim() {
            "1" | "true" | "TRUE" | "yes" | "YES" => return true,
            "0" | "false" | "FALSE" | "no" | "NO" => return false,
            _ => {}
        }
    }
    false
}

impl MultiWriter {
    fn new(file: Option<Arc<StdMutex<std::fs::File>>>, stderr_enabled: bool) -> Self {
        Self {
            stderr_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr_enabled {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr_enabled {
            let _ = io::stderr().flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}
