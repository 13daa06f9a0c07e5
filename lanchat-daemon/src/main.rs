// LanChat: log in, discover peers on the LAN, chat and send files from a line-based console.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context};
use lanchat_core::TransferId;
use lanchat_daemon::{config, Session};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP: &str = "commands:
  peers                     list known peers
  msg <addr> <text>         send a message
  file <addr> <path>        send a file
  transfers                 list transfers
  pause|resume|cancel <id>  control a transfer
  quit                      log out";

#[derive(Debug, PartialEq)]
enum Command {
    Peers,
    Message(SocketAddr, String),
    File(SocketAddr, PathBuf),
    Transfers,
    Pause(TransferId),
    Resume(TransferId),
    Cancel(TransferId),
    Help,
    Quit,
}

fn parse_command(line: &str) -> anyhow::Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();
    let addr_and = |what: &str| -> anyhow::Result<(SocketAddr, String)> {
        let (addr, tail) = rest
            .split_once(char::is_whitespace)
            .with_context(|| format!("usage: {verb} <addr> <{what}>"))?;
        let addr: SocketAddr = addr.parse().with_context(|| format!("bad address {addr:?}"))?;
        Ok((addr, tail.trim_start().to_string()))
    };
    let id = || -> anyhow::Result<TransferId> {
        rest.parse().with_context(|| format!("bad transfer id {rest:?}"))
    };
    let cmd = match verb {
        "peers" => Command::Peers,
        "msg" => {
            let (addr, text) = addr_and("text")?;
            Command::Message(addr, text)
        }
        "file" => {
            let (addr, path) = addr_and("path")?;
            Command::File(addr, PathBuf::from(path))
        }
        "transfers" => Command::Transfers,
        "pause" => Command::Pause(id()?),
        "resume" => Command::Resume(id()?),
        "cancel" => Command::Cancel(id()?),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command {other:?}, try help"),
    };
    Ok(Some(cmd))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Cannot serialize output"),
    }
}

/// Run one command. Returns false when the session should end.
async fn run_command(session: &Session, cmd: Command) -> anyhow::Result<bool> {
    match cmd {
        Command::Peers => print_json(&session.peer_list().await),
        Command::Message(addr, text) => print_json(&session.send_message(addr, &text).await?),
        Command::File(addr, path) => print_json(&session.send_file(addr, path).await?),
        Command::Transfers => print_json(&session.transfers().await),
        Command::Pause(id) => print_json(&session.pause_transfer(id).await?),
        Command::Resume(id) => print_json(&session.resume_transfer(id).await?),
        Command::Cancel(id) => print_json(&session.cancel_transfer(id).await?),
        Command::Help => eprintln!("{HELP}"),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

struct Args {
    name: Option<String>,
    device: String,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args {
        name: None,
        device: String::new(),
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lanchat {VERSION}");
                return Ok(None);
            }
            "--name" => args.name = Some(it.next().context("--name needs a value")?),
            "--device" => args.device = it.next().context("--device needs a value")?,
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(Some(args))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lanchat_daemon=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let name = match args.name {
        Some(name) => name,
        None => {
            eprint!("display name: ");
            lines.next_line().await?.context("no display name given")?
        }
    };
    let session = Session::login(&name, &args.device, cfg).await?;

    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_json(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event output lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    eprintln!("{HELP}");
    let signal = shutdown_signal();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let outcome = match parse_command(&line) {
                    Ok(Some(cmd)) => run_command(&session, cmd).await,
                    Ok(None) => Ok(true),
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            result = &mut signal => {
                result?;
                break;
            }
        }
    }

    let summary = session.logout().await;
    print_json(&summary);
    printer.abort();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_message_with_spaces() {
        let cmd = parse_command("msg 192.168.1.7:45681   hi there  ").unwrap().unwrap();
        assert_eq!(
            cmd,
            Command::Message("192.168.1.7:45681".parse().unwrap(), "hi there".into())
        );
    }

    #[test]
    fn parses_transfer_controls() {
        let id = TransferId::new();
        let cmd = parse_command(&format!("cancel {id}")).unwrap().unwrap();
        assert_eq!(cmd, Command::Cancel(id));
        assert!(parse_command("pause nope").is_err());
    }

    #[test]
    fn blank_and_unknown_lines() {
        assert!(parse_command("   ").unwrap().is_none());
        assert!(parse_command("dance").is_err());
        assert!(parse_command("msg 10.0.0.1:1").is_err());
        assert_eq!(parse_command("quit").unwrap(), Some(Command::Quit));
    }
}
