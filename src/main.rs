//! jkc - line-oriented console for a Jupyter kernel.
//!
//! Plain lines are executed in blocking mode. A line ending in `\` continues
//! onto the next one. Commands start with `:`; see `:help`.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jupyter_kernel_client::config::resolve_connection_file;
use jupyter_kernel_client::{ClientConfig, KernelClient, KernelLauncher, LauncherConfig};

const HELP: &str = "\
Commands:
  :connect [file]      connect using a connection file
  :start [file]        start an IPython kernel on the file and connect
  :async <code>        run code without waiting, prints its id
  :poll <id>           collect output of a non-blocking execution
  :interrupt <id>      interrupt a running execution
  :exists <name>       check whether a variable is defined
  :pending             list executions awaiting collection
  :status              show connection status
  :disconnect          close the connection (the kernel keeps running)
  :help                show this help
  :quit                disconnect and exit
Any other line is executed and its output printed.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Connect(Option<String>),
    Start(Option<String>),
    Execute(String),
    Async(String),
    Poll(String),
    Interrupt(String),
    Exists(String),
    Pending,
    Status,
    Disconnect,
    Help,
    Quit,
    Empty,
    Invalid(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix(':') else {
            return Command::Execute(line.to_string());
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let optional = (!arg.is_empty()).then(|| arg.to_string());
        let required = |build: fn(String) -> Command| match &optional {
            Some(arg) => build(arg.clone()),
            None => Command::Invalid(format!(":{} needs an argument", name)),
        };

        match name {
            "connect" => Command::Connect(optional.clone()),
            "start" => Command::Start(optional.clone()),
            "async" => required(Command::Async),
            "poll" => required(Command::Poll),
            "interrupt" => required(Command::Interrupt),
            "exists" => required(Command::Exists),
            "pending" => Command::Pending,
            "status" => Command::Status,
            "disconnect" => Command::Disconnect,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => Command::Invalid(format!("Unknown command :{} (try :help)", other)),
        }
    }
}

struct Console {
    client: KernelClient,
    launcher: KernelLauncher,
}

impl Console {
    /// Run one command. Returns `false` when the console should exit.
    async fn run(&mut self, command: Command) -> bool {
        match command {
            Command::Empty => {}
            Command::Help => println!("{}", HELP),
            Command::Invalid(message) => println!("{}", message),
            Command::Connect(file) => {
                let path = resolve_connection_file(file.as_deref());
                match self.client.connect_file(&path).await {
                    Ok(status) => println!("{}", status),
                    Err(e) => println!("Error: {}", e),
                }
            }
            Command::Start(file) => {
                let path = resolve_connection_file(file.as_deref());
                match self.client.start_kernel(&self.launcher, &path).await {
                    Ok((process, status)) => {
                        println!("{}\nPID file: {}", process, process.pid_file.display());
                        println!("{}", status);
                    }
                    Err(e) => println!("Error: {}", e),
                }
            }
            Command::Execute(code) => match self.client.execute(&code).await {
                Ok(outcome) => println!("{}", outcome),
                Err(e) => println!("Error: {}", e),
            },
            Command::Async(code) => match self.client.execute_nonblocking(&code).await {
                Ok(id) => println!("Started execution {}\nUse :poll {} to collect output", id, id),
                Err(e) => println!("Error: {}", e),
            },
            Command::Poll(id) => match self.client.check_execution(&id).await {
                Ok(outcome) => println!("{}", outcome),
                Err(e) => println!("Error: {}", e),
            },
            Command::Interrupt(id) => match self.client.interrupt(&id).await {
                Ok(()) => println!("Interrupt sent for execution {}", id),
                Err(e) => println!("Error: {}", e),
            },
            Command::Exists(name) => match self.client.variable_exists(&name).await {
                Ok(Some(true)) => println!("{} is defined", name),
                Ok(Some(false)) => println!("{} is not defined", name),
                Ok(None) => println!("Could not determine whether {} is defined", name),
                Err(e) => println!("Error: {}", e),
            },
            Command::Pending => {
                let ids = self.client.pending_executions();
                if ids.is_empty() {
                    println!("No pending executions");
                } else {
                    for id in ids {
                        println!("{}", id);
                    }
                }
            }
            Command::Status => println!("{}", self.client.status()),
            Command::Disconnect => {
                self.client.disconnect().await;
                println!("Disconnected from kernel");
            }
            Command::Quit => return false,
        }
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "jupyter_kernel_client=info,jkc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting jkc v{}", env!("CARGO_PKG_VERSION"));

    let mut console = Console {
        client: KernelClient::new(ClientConfig::from_env()),
        launcher: KernelLauncher::new(LauncherConfig::from_env()),
    };

    if let Some(file) = std::env::args().nth(1) {
        console.run(Command::Connect(Some(file))).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = String::new();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };

        if let Some(partial) = line.strip_suffix('\\') {
            buffer.push_str(partial);
            buffer.push('\n');
            continue;
        }
        buffer.push_str(&line);
        let input = std::mem::take(&mut buffer);

        if !console.run(Command::parse(&input)).await {
            break;
        }
    }

    console.client.disconnect().await;
    tracing::info!("jkc exited cleanly");
    Ok(())
}
