//! Chat commands and their replies.
//!
//! Parsing and reply text are pure; [`handle`] is the only place that
//! touches the monitor.

use tankwatch::{ChatId, ConnectionState, ConnectionTest, Monitor, StatusSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to notifications
    Start,
    /// Unsubscribe
    Stop,
    /// Current level
    Status,
    /// Connection self-check
    Test,
    Help,
    Unknown(String),
}

impl Command {
    /// Parse a message text. Returns `None` for plain text and for commands
    /// addressed to a different bot (`/status@otherbot`).
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Command> {
        let first = text.split_whitespace().next()?;
        let command = first.strip_prefix('/')?;

        let (name, target) = match command.split_once('@') {
            Some((name, target)) => (name, Some(target)),
            None => (command, None),
        };
        if let (Some(target), Some(me)) = (target, bot_username) {
            if !target.eq_ignore_ascii_case(me) {
                return None;
            }
        }

        Some(match name.to_ascii_lowercase().as_str() {
            "start" | "subscribe" => Command::Start,
            "stop" | "unsubscribe" => Command::Stop,
            "status" => Command::Status,
            "test" => Command::Test,
            "help" => Command::Help,
            other => Command::Unknown(other.to_string()),
        })
    }
}

/// Run a command for a chat and produce the reply text.
pub fn handle(command: &Command, chat: ChatId, monitor: &Monitor) -> String {
    match command {
        Command::Start => start_reply(monitor.subscribe(chat)),
        Command::Stop => stop_reply(monitor.unsubscribe(chat)),
        Command::Status => status_reply(&monitor.status()),
        Command::Test => test_reply(&monitor.test_connection(), &monitor.status()),
        Command::Help => help_reply(),
        Command::Unknown(name) => format!("Unknown command /{}.\n\n{}", name, help_reply()),
    }
}

pub fn start_reply(added: bool) -> String {
    if added {
        "Welcome to ISS Urine Tank Tracker! 🚀🚽\n\
         You will receive notifications when the urine tank level changes."
            .to_string()
    } else {
        "You're already subscribed!".to_string()
    }
}

pub fn stop_reply(removed: bool) -> String {
    if removed {
        "You've been unsubscribed from notifications.".to_string()
    } else {
        "You weren't subscribed!".to_string()
    }
}

pub fn status_reply(status: &StatusSnapshot) -> String {
    let mut reply = format!("Connection Status: {}\n", state_label(status.state));

    match &status.latest {
        Some(reading) => {
            reply.push_str(&format!("Current ISS Urine Tank Level: {:.1}%", reading.value));
            if let Some(age) = status.data_age {
                reply.push_str(&format!("\nLast update: {} ago", format_age(age.as_secs())));
            }
            if status.state != ConnectionState::Connected {
                reply.push_str("\n(value may be out of date)");
            }
        }
        None => reply.push_str("Unable to fetch current urine tank level."),
    }

    reply
}

pub fn test_reply(test: &ConnectionTest, status: &StatusSnapshot) -> String {
    format!(
        "🔍 Connection Test:\n\
         Connection Status: {}\n\
         Current Value: {}\n\
         Last Update Value: {}\n\
         Subscribers: {}\n\
         Result: {} ({})",
        state_label(status.state),
        percent_or_none(status.latest.as_ref().map(|r| r.value)),
        percent_or_none(status.last_notified.as_ref().map(|r| r.value)),
        status.subscribers,
        if test.ok { "OK" } else { "FAILED" },
        test.detail,
    )
}

pub fn help_reply() -> String {
    "ISS Urine Tank Tracker commands:\n\
     /start - get notified when the tank level changes\n\
     /stop - stop notifications\n\
     /status - current tank level\n\
     /test - check the telemetry connection\n\
     /help - this message"
        .to_string()
}

fn state_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connected => "Connected",
        ConnectionState::Connecting => "Connecting",
        ConnectionState::Degraded => "Connected (no recent data)",
        ConnectionState::Disconnected => "Disconnected",
    }
}

fn percent_or_none(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v))
        .unwrap_or_else(|| "None".to_string())
}

fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}
