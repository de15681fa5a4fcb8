//! cadence-queue - Manage accounts, media and the post queue
//!
//! Command-line front end to the Cadence engine. Every command operates on
//! behalf of one user (`--user` / `CADENCE_USER`).

use clap::{Args, Parser, Subcommand};
use libcadence::scheduling::parse_schedule;
use libcadence::types::PublishAttempt;
use libcadence::{Account, CadenceError, CadenceService, MediaItem, Network, Post, PostStatus, Result};
use std::io::Read;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "cadence-queue")]
#[command(version)]
#[command(about = "Manage accounts, media and scheduled posts")]
#[command(long_about = "\
cadence-queue - Manage accounts, media and scheduled posts

DESCRIPTION:
    cadence-queue talks to the Cadence database directly. Drafts are edited
    with optimistic versioning: pass the version you last saw with --version
    and the command fails with exit code 4 if someone changed the post since.

USAGE EXAMPLES:
    # Connect a Facebook login (open the URL, then paste the code back)
    cadence-queue auth begin facebook
    cadence-queue auth complete <CODE> <STATE>

    # Upload an image and draft a post with it
    cadence-queue media upload ./launch.png --folder launch
    cadence-queue draft create --account <ACCOUNT_ID> --media <MEDIA_ID> \"We're live!\"

    # Schedule it
    cadence-queue schedule <POST_ID> \"tomorrow 9am\"
    cadence-queue schedule <POST_ID> random:1h-3h

    # Cancel, or publish right away
    cadence-queue cancel <POST_ID>
    cadence-queue now <POST_ID>

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml

    Override with environment variables:
        CADENCE_CONFIG    - Path to config file
        CADENCE_DB_PATH   - Path to database file
        CADENCE_USER      - User to act as

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Authorization or configuration error
    3 - Invalid input (bad id, time format, media, state)
    4 - Conflict (stale version, post already claimed)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// User to act as
    #[arg(long, global = true, env = "CADENCE_USER", default_value = "default")]
    user: String,

    /// Output format: text or json
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect network accounts
    #[command(subcommand)]
    Auth(AuthCommand),

    /// List or disconnect connected accounts
    #[command(subcommand)]
    Accounts(AccountsCommand),

    /// Upload, list and delete media
    #[command(subcommand)]
    Media(MediaCommand),

    /// Create, edit and delete drafts
    #[command(subcommand)]
    Draft(DraftCommand),

    /// Schedule a draft
    Schedule {
        post_id: String,

        /// When to publish (e.g. "2h", "tomorrow 9am", RFC 3339, unix seconds, "random:1h-3h")
        when: String,

        /// Version you last saw; defaults to the current version
        #[arg(long)]
        version: Option<i64>,
    },

    /// Return a scheduled post to draft
    Cancel { post_id: String },

    /// Publish a draft or scheduled post immediately
    Now { post_id: String },

    /// List posts
    List {
        /// Only posts in this state
        #[arg(short, long)]
        status: Option<PostStatus>,

        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Show a post with its publish attempts and metrics
    Show { post_id: String },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Print the authorization URL for a network
    Begin { network: Network },

    /// Finish authorization with the code the network redirected back with
    Complete { code: String, state: String },
}

#[derive(Subcommand, Debug)]
enum AccountsCommand {
    List {
        /// Include disconnected accounts
        #[arg(long)]
        all: bool,
    },

    Disconnect { account_id: String },
}

#[derive(Subcommand, Debug)]
enum MediaCommand {
    Upload {
        path: String,

        #[arg(long)]
        folder: Option<String>,

        /// Override the content type guessed from the file extension
        #[arg(long)]
        content_type: Option<String>,
    },

    List {
        #[arg(long)]
        folder: Option<String>,
    },

    Delete { media_id: String },
}

#[derive(Args, Debug)]
struct ContentArgs {
    /// Post text; read from stdin when omitted
    content: Option<String>,

    /// Attach a media item (repeatable, order is kept)
    #[arg(long = "media")]
    media_ids: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum DraftCommand {
    Create {
        #[arg(long)]
        account: String,

        #[command(flatten)]
        body: ContentArgs,
    },

    Update {
        post_id: String,

        #[arg(long)]
        version: i64,

        #[command(flatten)]
        body: ContentArgs,
    },

    Delete { post_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libcadence::logging::LoggingConfig::from_env("error", cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::parse(&cli.format)?;
    let service = CadenceService::new().await?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Auth(AuthCommand::Begin { network }) => {
            let redirect = service.begin_auth(user, network).await?;
            match format {
                OutputFormat::Json => print_json(&redirect),
                OutputFormat::Text => {
                    println!("Open this URL to authorize {}:", network);
                    println!("{}", redirect.url);
                    println!("state: {}", redirect.state);
                }
            }
        }
        Commands::Auth(AuthCommand::Complete { code, state }) => {
            let outcome = service.complete_auth(&code, &state).await?;
            match format {
                OutputFormat::Json => print_json(&outcome),
                OutputFormat::Text => {
                    for account in &outcome.accounts {
                        println!("Connected {}", account_line(account));
                    }
                    for failure in &outcome.failures {
                        eprintln!(
                            "Skipped {} ({}): {}",
                            failure.destination_name, failure.destination_id, failure.error
                        );
                    }
                }
            }
        }
        Commands::Accounts(AccountsCommand::List { all }) => {
            let accounts = service.list_accounts(user, all).await?;
            match format {
                OutputFormat::Json => print_json(&accounts),
                OutputFormat::Text => accounts.iter().for_each(|a| println!("{}", account_line(a))),
            }
        }
        Commands::Accounts(AccountsCommand::Disconnect { account_id }) => {
            service.disconnect_account(user, &account_id).await?;
            println!("Disconnected account {}", account_id);
        }
        Commands::Media(command) => cmd_media(&service, user, format, command).await?,
        Commands::Draft(command) => cmd_draft(&service, user, format, command).await?,
        Commands::Schedule {
            post_id,
            when,
            version,
        } => {
            let version = match version {
                Some(version) => version,
                None => service.get_post(&post_id).await?.version,
            };
            let anchor = service.latest_scheduled_for(user).await?;
            let at = parse_schedule(&when, chrono::Utc::now(), anchor)?;
            let post = service.schedule(&post_id, version, at).await?;
            print_post(format, &post);
        }
        Commands::Cancel { post_id } => {
            let post = service.cancel_schedule(&post_id).await?;
            print_post(format, &post);
        }
        Commands::Now { post_id } => {
            let post = service.publish_now(&post_id).await?;
            print_post(format, &post);
            if post.status == PostStatus::Failed {
                eprintln!(
                    "Error: post {} failed: {}",
                    post.id,
                    post.last_error.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
        }
        Commands::List { status, limit } => {
            let posts = service.list_posts(user, status, limit).await?;
            match format {
                OutputFormat::Json => print_json(&posts),
                OutputFormat::Text => {
                    let now = chrono::Utc::now().timestamp();
                    for post in &posts {
                        println!("{}", post_line(post, now));
                    }
                }
            }
        }
        Commands::Show { post_id } => {
            let post = service.get_post(&post_id).await?;
            let attempts = service.post_attempts(&post_id).await?;
            let metrics = service.post_metrics(&post_id).await?;
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "post": post,
                    "attempts": attempts,
                    "metrics": metrics.map(|(m, fetched_at)| serde_json::json!({
                        "fetched_at": fetched_at,
                        "impressions": m.impressions,
                        "likes": m.likes,
                        "comments": m.comments,
                        "shares": m.shares,
                    })),
                })),
                OutputFormat::Text => {
                    println!("{}", post_line(&post, chrono::Utc::now().timestamp()));
                    println!("version: {}  retries: {}", post.version, post.retry_count);
                    if let Some(error) = &post.last_error {
                        println!("last error: {}", error);
                    }
                    for attempt in &attempts {
                        println!("  {}", attempt_line(attempt));
                    }
                    if let Some((m, _)) = metrics {
                        println!(
                            "metrics: {} impressions, {} likes, {} comments, {} shares",
                            m.impressions, m.likes, m.comments, m.shares
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

async fn cmd_media(
    service: &CadenceService,
    user: &str,
    format: OutputFormat,
    command: MediaCommand,
) -> Result<()> {
    match command {
        MediaCommand::Upload {
            path,
            folder,
            content_type,
        } => {
            let bytes = std::fs::read(&path).map_err(|e| {
                CadenceError::InvalidInput(format!("Failed to read {}: {}", path, e))
            })?;
            let content_type = match content_type {
                Some(content_type) => content_type,
                None => guess_content_type(Path::new(&path))?.to_string(),
            };
            let item = service
                .upload_media(user, &bytes, &content_type, folder.as_deref())
                .await?;
            match format {
                OutputFormat::Json => print_json(&item),
                OutputFormat::Text => println!("{}", media_line(&item)),
            }
        }
        MediaCommand::List { folder } => {
            let items = service.list_media(user, folder.as_deref()).await?;
            match format {
                OutputFormat::Json => print_json(&items),
                OutputFormat::Text => items.iter().for_each(|m| println!("{}", media_line(m))),
            }
        }
        MediaCommand::Delete { media_id } => {
            service.delete_media(user, &media_id).await?;
            println!("Deleted media {}", media_id);
        }
    }
    Ok(())
}

async fn cmd_draft(
    service: &CadenceService,
    user: &str,
    format: OutputFormat,
    command: DraftCommand,
) -> Result<()> {
    match command {
        DraftCommand::Create { account, body } => {
            let content = read_content(body.content)?;
            let post = service
                .create_draft(user, &account, content, body.media_ids)
                .await?;
            print_post(format, &post);
        }
        DraftCommand::Update {
            post_id,
            version,
            body,
        } => {
            let content = read_content(body.content)?;
            let post = service
                .update_draft(&post_id, version, content, body.media_ids)
                .await?;
            print_post(format, &post);
        }
        DraftCommand::Delete { post_id } => {
            service.delete_draft(&post_id).await?;
            println!("Deleted draft {}", post_id);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(CadenceError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

fn read_content(content: Option<String>) -> Result<String> {
    match content {
        Some(content) => Ok(content),
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| CadenceError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
            Ok(buffer.trim_end().to_string())
        }
    }
}

fn guess_content_type(path: &Path) -> Result<&'static str> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        "gif" => Ok("image/gif"),
        "webp" => Ok("image/webp"),
        "mp4" => Ok("video/mp4"),
        "mov" => Ok("video/quicktime"),
        "webm" => Ok("video/webm"),
        _ => Err(CadenceError::InvalidInput(format!(
            "Cannot tell the content type of {}; pass --content-type",
            path.display()
        ))),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to encode output: {}", e),
    }
}

fn print_post(format: OutputFormat, post: &Post) {
    match format {
        OutputFormat::Json => print_json(post),
        OutputFormat::Text => println!("{}", post_line(post, chrono::Utc::now().timestamp())),
    }
}

fn account_line(account: &Account) -> String {
    let state = if account.is_active {
        account.connection_status.to_string()
    } else {
        "disconnected".to_string()
    };
    format!(
        "{} | {} | {} | {}",
        account.id, account.network, account.display_name, state
    )
}

fn media_line(item: &MediaItem) -> String {
    format!(
        "{} | {} | {} bytes | {} | {}",
        item.id,
        item.kind,
        item.size_bytes,
        item.folder.as_deref().unwrap_or("-"),
        item.public_url
    )
}

fn post_line(post: &Post, now: i64) -> String {
    let when = match (post.status, post.scheduled_for, post.published_at) {
        (PostStatus::Scheduled, Some(at), _) => format_time_until(now, at),
        (PostStatus::Published, _, Some(at)) => format!("published {}", format_timestamp(at)),
        _ => "-".to_string(),
    };
    format!(
        "{} | {} | {} | v{} | {} | {}",
        post.id,
        post.network,
        post.status,
        post.version,
        when,
        truncate_content(&post.content, 50)
    )
}

fn attempt_line(attempt: &PublishAttempt) -> String {
    format!(
        "#{} {} at {}{}",
        attempt.attempt,
        attempt.outcome.as_str(),
        format_timestamp(attempt.finished_at),
        attempt
            .error
            .as_deref()
            .map(|e| format!(": {}", e))
            .unwrap_or_default()
    )
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Truncate content to max characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let single_line = content.replace('\n', " ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let head: String = single_line.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_until() {
        assert_eq!(format_time_until(0, -5), "overdue");
        assert_eq!(format_time_until(0, 30), "in <1 minute");
        assert_eq!(format_time_until(0, 120), "in 2 minutes");
        assert_eq!(format_time_until(0, 3600), "in 1 hour");
        assert_eq!(format_time_until(0, 3 * 86_400), "in 3 days");
    }

    #[test]
    fn test_truncate_content_counts_chars() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_content("a\nb", 10), "a b");
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("a/b.JPG")).unwrap(), "image/jpeg");
        assert_eq!(guess_content_type(Path::new("clip.mov")).unwrap(), "video/quicktime");
        assert!(guess_content_type(Path::new("notes.txt")).is_err());
        assert!(guess_content_type(Path::new("noext")).is_err());
    }
}
