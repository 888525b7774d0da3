/// EstateChat terminal client
///
/// Inquirer:  chat --user u1 --property p1 --counterpart o1
/// Owner:     chat --user o1 --property p1 --owner
use colored::*;
use estatechat_core::owner::OwnerInbox;
use estatechat_core::types::{ChatEvent, Message, MessageStatus, User};
use estatechat_core::{ChatEngine, Config, Session, SessionHandle};
use std::collections::HashSet;
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct ClientArgs {
    user: Option<String>,
    token: Option<String>,
    property: Option<String>,
    counterpart: Option<String>,
    conversation: Option<String>,
    owner: bool,
}

impl ClientArgs {
    fn parse(args: &[String]) -> Self {
        let mut out = Self::default();
        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1).cloned();
            match args[i].as_str() {
                "--user" => out.user = value,
                "--token" => out.token = value,
                "--property" => out.property = value,
                "--counterpart" => out.counterpart = value,
                "--conversation" => out.conversation = value,
                "--owner" => {
                    out.owner = true;
                    i += 1;
                    continue;
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            i += 2;
        }
        out
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage(&args[0]);
        return Ok(());
    }
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let client = ClientArgs::parse(&args);

    let (user, property) = match (client.user.clone(), client.property.clone()) {
        (Some(u), Some(p)) => (u, p),
        _ => {
            print_usage(&args[0]);
            return Ok(());
        }
    };
    // The stub backend accepts the user id as bearer token
    let token = client.token.clone().unwrap_or_else(|| user.clone());
    let session = SessionHandle::with_session(Session::new(user.clone(), token));

    let engine = ChatEngine::with_http(config, session)
        .map_err(|e| anyhow::anyhow!("Engine error: {}", e))?;
    let mut events = engine.subscribe();

    let inbox = if client.owner {
        let inbox = engine
            .owner_inbox(&user)?
            .ok_or_else(|| anyhow::anyhow!("{} cannot open the owner view", user))?;
        let list = inbox.load_for_property(&property).await?;
        print_inbox(&inbox);
        if list.is_empty() {
            println!("{}", "No conversations about this property yet.".dimmed());
        }
        Some(inbox)
    } else {
        let counterpart = client
            .counterpart
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--counterpart is required (or use --owner)"))?;
        match client.conversation.clone() {
            Some(id) => {
                engine
                    .open_conversation(Some(id), &property, User::bare(counterpart))
                    .await?
            }
            None => {
                let resolved = engine
                    .open_with_counterpart(&property, User::bare(counterpart.clone()))
                    .await?;
                if resolved.is_none() {
                    println!(
                        "{} New chat with {}; your first message starts it.",
                        "•".cyan(),
                        counterpart.cyan()
                    );
                }
            }
        }
        None
    };

    println!(
        "{} Type a message and press Enter. {} {} {}",
        "⚡".bright_cyan(),
        "/retry".cyan(),
        (if inbox.is_some() { "/switch <n>" } else { "" }).cyan(),
        "/quit".cyan()
    );

    let mut shown: HashSet<String> = HashSet::new();
    print_new(&engine.messages(), &user, &mut shown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(l) => l,
                    None => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    "/quit" => break,
                    "/retry" => match engine.failed_messages().first() {
                        Some(failed) => {
                            if let Err(e) = engine.retry(&failed.id) {
                                eprintln!("{} {}", "✗".red().bold(), e);
                            }
                        }
                        None => println!("{}", "Nothing to retry.".dimmed()),
                    },
                    cmd if cmd.starts_with("/switch") => {
                        let Some(inbox) = inbox.as_ref() else {
                            eprintln!("{} /switch is only available with --owner", "✗".red().bold());
                            continue;
                        };
                        switch(inbox, cmd, &mut shown).await;
                        print_new(&engine.messages(), &user, &mut shown);
                    }
                    content => {
                        if let Err(e) = engine.send(content) {
                            eprintln!("{} {}", "✗".red().bold(), e);
                        }
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(ChatEvent::MessagesChanged { .. }) => {
                        print_new(&engine.messages(), &user, &mut shown);
                    }
                    Ok(ChatEvent::MessageConfirmed { message_id, .. }) => {
                        shown.insert(message_id);
                        println!("  {}", "✓ delivered".green().dimmed());
                    }
                    Ok(ChatEvent::MessageFailed { reason, .. }) => {
                        println!(
                            "  {} {} ({} to send again)",
                            "✗ not sent:".red().bold(),
                            reason,
                            "/retry".yellow()
                        );
                    }
                    Ok(ChatEvent::ConversationActivated { conversation_id }) => {
                        println!("{} {}", "→ conversation".dimmed(), conversation_id.dimmed());
                    }
                    Ok(ChatEvent::ConversationsLoaded { .. }) => {}
                    Err(RecvError::Lagged(_)) => {
                        print_new(&engine.messages(), &user, &mut shown);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    engine.close();
    Ok(())
}

async fn switch(inbox: &OwnerInbox, cmd: &str, shown: &mut HashSet<String>) {
    let conversations = inbox.conversations();
    let picked = cmd
        .split_whitespace()
        .nth(1)
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
        .and_then(|n| conversations.get(n));
    match picked {
        Some(c) => {
            shown.clear();
            if let Err(e) = inbox.select_conversation(&c.id).await {
                eprintln!("{} {}", "✗".red().bold(), e);
            }
        }
        None => {
            eprintln!("{} Usage: /switch <n>", "✗".red().bold());
            print_inbox(inbox);
        }
    }
}

fn print_inbox(inbox: &OwnerInbox) {
    let selected = inbox.selected();
    println!("{}", "Conversations:".bright_white().bold());
    for (i, c) in inbox.conversations().iter().enumerate() {
        let who = c
            .other_user
            .as_ref()
            .map(|u| if u.name.is_empty() { u.id.clone() } else { u.name.clone() })
            .unwrap_or_default();
        let marker = if selected.as_deref() == Some(c.id.as_str()) { "▶" } else { " " };
        let preview = c
            .last_message
            .as_ref()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let unread = if c.unread_count > 0 {
            format!(" ({} new)", c.unread_count).yellow().to_string()
        } else {
            String::new()
        };
        println!(
            "{} {} {}{} {}",
            marker.cyan(),
            format!("{}.", i + 1).dimmed(),
            who.cyan(),
            unread,
            preview.dimmed()
        );
    }
}

/// Print messages not printed before, oldest first
fn print_new(messages: &[Message], me: &str, shown: &mut HashSet<String>) {
    for m in messages.iter().rev() {
        if !shown.insert(m.id.clone()) {
            continue;
        }
        let time = m.created_at.format("%H:%M").to_string();
        let marker = match m.status {
            MessageStatus::Sending => "…".dimmed(),
            MessageStatus::Sent => "".normal(),
            MessageStatus::Failed => "✗".red(),
        };
        if m.sender_id == me {
            println!("{} {} {} {}", time.dimmed(), "me:".green().bold(), m.content, marker);
        } else {
            println!("{} {} {}", time.dimmed(), format!("{}:", m.sender_id).cyan().bold(), m.content);
        }
    }
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ EstateChat".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!(
        "  {} --user <id> --property <id> --counterpart <id> [--conversation <id>]",
        bin.cyan()
    );
    println!("  {} --user <owner id> --property <id> --owner", bin.cyan());
    println!();
    println!("{}", "Options:".bright_white().bold());
    println!("  {} <token>      Bearer token (defaults to the user id)", "--token".cyan());
    println!("  {} <url>      Backend base URL", "--api-url".cyan());
    println!("  {} <ms>       Poll interval", "--poll-ms".cyan());
    println!("  {} <ms>    Request timeout", "--timeout-ms".cyan());
    println!("  {}       One send at a time", "--single-send".cyan());
}
