#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio::sync::mpsc::{self, UnboundedSender};

use sfu_client::config::{self, Config};
use sfu_client::peer::WebRtcPeerFactory;
use sfu_client::session::{ChatEvent, UserEvent};
use sfu_client::signaller::UserKind;
use sfu_client::transfer::FileTransferEventKind;
use sfu_client::{
    Credentials, FileTransferEvent, Result, Session, StreamEvent, TransferKey,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Server URL, overrides the config file
    #[arg(long)]
    url: Option<String>,
    /// Group to join
    #[arg(short, long)]
    group: Option<String>,
    /// Username to join as
    #[arg(short, long)]
    username: Option<String>,
    /// Group password, overrides the credentials in the config file
    #[arg(short, long)]
    password: Option<String>,
    /// File to offer once the user named by --to shows up
    #[arg(long, requires = "to")]
    send_file: Option<PathBuf>,
    /// Username of the file's recipient
    #[arg(long)]
    to: Option<String>,
    /// Log debug output
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

/// Work queued by event subscribers for the main loop.
enum Command {
    Accept(TransferKey),
    Save { name: String, data: Bytes },
    SendTo(String),
}

fn setup_logger(verbose: bool) -> std::result::Result<(), fern::InitError> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Warn)
        .level_for("sfu_client", level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn subscribe(session: &mut Session, commands: UnboundedSender<Command>, recipient: Option<String>) {
    session.events.on_joined.subscribe(|event| {
        info!("{:?} {}: {}", event.kind, event.group, event.message.as_deref().unwrap_or(""));
    });
    let user_commands = commands.clone();
    session.events.on_user.subscribe(move |event: &UserEvent| {
        info!("User {} {:?}", event.id, event.kind);
        if event.kind == UserKind::Add && recipient.is_some() {
            let _ = user_commands.send(Command::SendTo(event.id.clone()));
        }
    });
    session.events.on_chat.subscribe(|event: &ChatEvent| {
        let from = event.message.username.as_deref().unwrap_or("(anonymous)");
        match event.message.value.as_str() {
            Some(text) => info!("<{}> {}", from, text),
            None => info!("<{}> {}", from, event.message.value),
        }
    });
    session.events.on_down_stream.subscribe(|stream| {
        info!("{} is sending {}", stream.username(), stream.label());
    });
    session.events.on_stream.subscribe(|event: &StreamEvent| {
        debug!("Stream {} ({}): {:?}", event.id, event.label, event.kind);
    });
    let mut names = HashMap::new();
    session.events.on_file_transfer.subscribe(move |event: &FileTransferEvent| {
        match &event.kind {
            FileTransferEventKind::Invited { name, size, .. } => {
                info!("Accepting {} ({} bytes) from {}", name, size, event.key.user_id);
                names.insert(event.key.clone(), name.clone());
                let _ = commands.send(Command::Accept(event.key.clone()));
            }
            FileTransferEventKind::Completed { data: Some(data) } => {
                let name = names
                    .remove(&event.key)
                    .unwrap_or_else(|| event.key.id.clone());
                let _ = commands.send(Command::Save {
                    name,
                    data: data.clone(),
                });
            }
            FileTransferEventKind::Completed { data: None } => {
                info!("File transfer {} delivered", event.key.id)
            }
            FileTransferEventKind::Cancelled { reason } => {
                names.remove(&event.key);
                warn!("File transfer {} cancelled: {}", event.key.id, reason)
            }
            _ => {}
        }
    });
}

async fn save_file(dir: &Path, name: &str, data: Bytes) -> Result<()> {
    // never let the sender pick the directory
    let name = Path::new(name)
        .file_name()
        .context("refusing to save a file without a name")?;
    let path = dir.join(name);
    tokio::fs::write(&path, &data)
        .await
        .with_context(|| format!("couldn't write {}", path.display()))?;
    info!("Saved {} bytes to {}", data.len(), path.display());
    Ok(())
}

async fn handle(session: &mut Session, config: &Config, args: &Args, command: Command) -> Result<()> {
    match command {
        Command::Accept(key) => session.accept_file(&key).await,
        Command::Save { name, data } => save_file(&config.download_dir, &name, data).await,
        Command::SendTo(user_id) => {
            let (Some(path), Some(to)) = (&args.send_file, &args.to) else {
                return Ok(());
            };
            let matches = session
                .user(&user_id)
                .and_then(|u| u.username.as_deref())
                .map_or(false, |name| name == to);
            if !matches {
                return Ok(());
            }
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("couldn't read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            session.send_file(&user_id, &name, "application/octet-stream", data.into())?;
            Ok(())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = config::load(Path::new(&args.config))?;
    if let Some(url) = &args.url {
        config.server_url = url.clone();
    }
    let group = args
        .group
        .clone()
        .or_else(|| config.group.clone())
        .context("no group given")?;
    let username = args
        .username
        .clone()
        .or_else(|| config.username.clone())
        .unwrap_or_default();
    let credentials = match &args.password {
        Some(password) => Credentials::from(password.as_str()),
        None => config
            .credentials
            .clone()
            .unwrap_or_else(|| Credentials::from("")),
    };

    let peers = Arc::new(WebRtcPeerFactory::new()?);
    let mut session = Session::new(config.session.clone(), peers);
    let (commands, mut queued) = mpsc::unbounded_channel();
    subscribe(&mut session, commands, args.to.clone());

    session.connect(&config.server_url).await?;
    let message = session.join(&group, &username, &credentials, None).await?;
    info!(
        "Joined {} as {}{}",
        group,
        username,
        message.map(|m| format!(": {}", m)).unwrap_or_default()
    );

    let closer = session.close_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, leaving");
            closer.close();
        }
    });
    loop {
        while let Ok(command) = queued.try_recv() {
            if let Err(e) = handle(&mut session, &config, &args, command).await {
                warn!("{:#}", e);
            }
        }
        if !session.step().await? {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = setup_logger(args.verbose) {
        eprintln!("couldn't set up logging: {}", e);
    }
    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
