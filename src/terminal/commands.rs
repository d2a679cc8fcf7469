//! Pseudo-commands
//!
//! Directives prefixed with `/` are answered by the session itself and
//! never reach the allow-list or the process runner.

/// First message of every session
pub const READY_MESSAGE: &str = "terminal websocket ready, send /help to search for all commands";

/// Reply when a command is submitted while another one runs
pub const BUSY_MESSAGE: &str =
    "A command is already running. Use /stop to cancel this command first.";

pub const HELP_TEXT: &str = "\
Info:
System Information:
    uptime: Display system uptime
    hostname: Display the hostname
    uname: Display system information
    date: Display current date and time
    lscpu: Display CPU information
    lsmem: Display memory information
System Monitoring:
    top: Display process information
    df: Display disk usage
    free: Display memory usage
    ps: Display current processes
    lsblk: Display block device information
File Operations:
    ls: Display current directory contents
    tree: Display directory tree structure
    pwd: Display current working directory
    cat: Display file contents
    file: Display file type information
    stat: Display file status information
Network:
    ifconfig: Display network interface information
    ping: Test network connectivity
Utilities:
    whoami: Display currently system user
    echo: Output a string
    clear: Clear the terminal screen
    skip: Do nothing
Help:
    /help: Display this help message
    /version: Display the version of the server
    /status: Display the command currently running
    /stop: Stop the current command
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoCommand {
    Help,
    Version,
    Status,
    Stop,
}

impl PseudoCommand {
    /// Look up a trimmed `/name` directive
    pub fn parse(command: &str) -> Option<Self> {
        match command {
            "/help" => Some(PseudoCommand::Help),
            "/version" => Some(PseudoCommand::Version),
            "/status" => Some(PseudoCommand::Status),
            "/stop" => Some(PseudoCommand::Stop),
            _ => None,
        }
    }
}

/// Server version line for `/version`
pub fn version_text() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
