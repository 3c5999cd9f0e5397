use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::StreamExt;
use shared::domain::{ChannelId, MessageId, NotificationId, Role, UserId, WorkspaceId};
use sync_core::{
    api::HttpSyncApi,
    config::load_settings,
    transport::{ReconnectPolicy, WebSocketTransport},
    ClientEvent, Session, SyncClient,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the server url from sync.toml / environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    workspace: String,
    #[arg(long, default_value = "member", value_parser = parse_role)]
    role: Role,
    #[arg(long)]
    guest: bool,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw {
        "admin" => Ok(Role::Admin),
        "member" => Ok(Role::Member),
        "guest" => Ok(Role::Guest),
        other => Err(format!("unknown role '{other}' (admin, member, guest)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    let api_url = settings.api_url().context("invalid server url")?;
    let ws_url = settings.ws_url().context("invalid websocket url")?;

    let transport = WebSocketTransport::new(
        ws_url,
        args.token.clone(),
        ReconnectPolicy {
            initial: settings.reconnect_initial,
            max: settings.reconnect_max,
        },
        settings.event_buffer,
    );
    let api = Arc::new(HttpSyncApi::new(api_url, args.token.clone()));
    let client = SyncClient::new(
        Session {
            actor_id: UserId::new(args.user),
            workspace_id: WorkspaceId::new(args.workspace),
            workspace_role: args.role,
            is_guest: args.guest || args.role == Role::Guest,
            bearer_token: args.token,
        },
        settings,
        api,
        transport.clone(),
    );

    let mut events = client.event_stream();
    let pump = client.start().await;
    let connection = transport.start();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    });

    println!("commands: /join <channel> /older /edit <id> <text> /rm <id> /react <id> <emoji> /retry <tmp> /discard <tmp> /read <notification> /list /caps /unread /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&client, line).await {
            warn!(error = %err, "console: command failed");
            println!("error: {err}");
        }
    }

    connection.abort();
    pump.abort();
    info!("console: bye");
    Ok(())
}

async fn run_command(client: &Arc<SyncClient>, line: &str) -> Result<()> {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let mut arg = || {
        parts
            .next()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("missing argument for {command}"))
    };

    match command {
        "/join" => client.select_channel(ChannelId::new(arg()?)).await?,
        "/older" => {
            if !client.load_older().await? {
                println!("no older messages");
            }
        }
        "/edit" => {
            let id = MessageId::new(arg()?);
            client.edit(&id, arg()?).await?;
        }
        "/rm" => client.remove(&MessageId::new(arg()?)).await?,
        "/react" => {
            let id = MessageId::new(arg()?);
            client.react(&id, &arg()?).await?;
        }
        "/retry" => {
            let handle = client.retry(&MessageId::new(arg()?)).await?;
            println!("retrying {}", handle.temp_id);
        }
        "/discard" => client.discard(&MessageId::new(arg()?)).await?,
        "/read" => client.mark_read(&NotificationId::new(arg()?)).await?,
        "/list" => {
            let channel_id = client
                .active_channel()
                .await
                .ok_or_else(|| anyhow!("no channel selected"))?;
            for message in client.messages(&channel_id).await {
                let reactions = client.reactions(&message.id).await;
                let reactions: Vec<String> = reactions
                    .iter()
                    .map(|summary| format!("{}x{}", summary.emoji, summary.count))
                    .collect();
                println!(
                    "[{}] {} <{}> {} {:?} {}",
                    message.created_at.format("%H:%M:%S"),
                    message.id,
                    message.author_id,
                    message.text.as_deref().unwrap_or("<attachment>"),
                    message.delivery,
                    reactions.join(" ")
                );
            }
        }
        "/caps" => println!("{:#?}", client.capabilities().await),
        "/unread" => println!("unread: {}", client.unread_count().await),
        _ if command.starts_with('/') => return Err(anyhow!("unknown command {command}")),
        _ => {
            let handle = client.send_to_active(line.to_string()).await?;
            println!("sending {}", handle.temp_id);
        }
    }
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessagesChanged { channel_id } => println!("* messages changed in {channel_id}"),
        ClientEvent::ReactionsChanged { message_id } => println!("* reactions changed on {message_id}"),
        ClientEvent::ChannelsChanged => println!("* channels changed"),
        ClientEvent::CapabilitiesChanged(caps) => {
            println!("* capabilities changed (write={}, react={})", caps.can_write, caps.can_react)
        }
        ClientEvent::UnreadChanged(count) => println!("* unread {count}"),
        ClientEvent::RoomJoined(room) => println!("* joined {room}"),
        ClientEvent::Connected { resumed } => println!("* connected (resumed={resumed})"),
        ClientEvent::Disconnected { reason } => println!("* disconnected: {reason}"),
        ClientEvent::Error(message) => println!("! {message}"),
    }
}
