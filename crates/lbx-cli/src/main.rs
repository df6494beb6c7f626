//! lbx: lockbox command-line client
//!
//! Account:
//!   register <email>            - create an account (a code is mailed)
//!   login <email>               - open a session; works offline after the first login
//!   verify <email> <code>       - confirm the mailed code and log in
//!   logout / status
//!
//! Vault:
//!   add password|card|text|binary <name>
//!   get <id> / list / rm <id>
//!   conflicts [<id> <updated-at>] - list or open shelved local edits
//!   sync / watch                  - one sync cycle / sync periodically until Ctrl-C

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use lbx_core::config::ClientConfig;
use lbx_core::{Binary, Card, Meta, Password, SecretValue, Text};
use lbx_crypto::KdfParams;
use lbx_storage::SqliteLocalStore;
use lbx_sync::{
    run_scheduler, GrpcRemote, ItemSummary, LoginMode, OpenedItem, ScheduleSettings, SyncOutcome,
    SyncReport, VaultClient,
};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "lbx", version, about = "Lockbox: end-to-end encrypted secrets vault")]
struct Cli {
    /// Path to the client config file
    #[arg(long, short = 'c', env = "LBX_CONFIG", default_value = "~/.config/lbx/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LBX_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an account; the server mails a verification code
    Register { email: String },

    /// Log in; falls back to the local vault when the server is unreachable
    Login { email: String },

    /// Log in with the code from the verification mail
    Verify { email: String, code: String },

    /// End the session and forget the local key
    Logout,

    /// Show the logged-in user and whether the session is online
    Status,

    /// Encrypt and store a new secret
    Add {
        #[command(subcommand)]
        kind: AddKind,
    },

    /// Decrypt and print a secret
    Get {
        id: String,
        /// Write binary content to this file instead of printing base64
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
    },

    /// List stored secrets (names only, nothing is decrypted)
    List,

    /// Delete a secret on every device
    Rm { id: String },

    /// List local edits displaced by newer versions, or open one
    Conflicts {
        #[arg(requires = "updated_at")]
        id: Option<String>,
        updated_at: Option<i64>,
    },

    /// Run one sync cycle
    Sync,

    /// Sync periodically until Ctrl-C
    Watch,
}

#[derive(Args, Debug)]
struct ItemArgs {
    /// Display name
    name: String,

    /// Replace the item with this id instead of creating a new one
    #[arg(long)]
    id: Option<String>,

    /// Extra annotation, repeatable
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
    meta: Vec<(String, String)>,
}

#[derive(Subcommand, Debug)]
enum AddKind {
    /// Login and password; the password is prompted
    Password {
        #[command(flatten)]
        item: ItemArgs,
        #[arg(long)]
        login: String,
    },
    /// Bank card; number and CSC are prompted
    Card {
        #[command(flatten)]
        item: ItemArgs,
        #[arg(long)]
        holder: String,
        /// MM/YY
        #[arg(long)]
        expires: String,
    },
    /// Free text, from the argument or stdin
    Text {
        #[command(flatten)]
        item: ItemArgs,
        text: Option<String>,
    },
    /// Small file stored inline
    Binary {
        #[command(flatten)]
        item: ItemArgs,
        path: PathBuf,
    },
}

fn parse_meta(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config_path = expand_tilde(&cli.config);
    let config = load_config(&config_path).await?;
    let client = open_client(&config).await?;

    match cli.command {
        Commands::Register { email } => cmd_register(&client, &email).await,
        Commands::Login { email } => cmd_login(&client, &email).await,
        Commands::Verify { email, code } => cmd_verify(&client, &email, &code).await,
        Commands::Logout => {
            client.logout().await?;
            println!("Logged out.");
            Ok(())
        }
        Commands::Status => cmd_status(&client, &config),
        Commands::Add { kind } => cmd_add(&client, kind).await,
        Commands::Get { id, out } => cmd_get(&client, &id, out.as_deref()).await,
        Commands::List => {
            print_summaries(&client.list_items()?);
            Ok(())
        }
        Commands::Rm { id } => {
            if client.delete_item(&id).await?.dirty {
                println!("Deleted {id} locally (server not reached; run `lbx sync` later)");
            } else {
                println!("Deleted {id}");
            }
            Ok(())
        }
        Commands::Conflicts { id: None, .. } => {
            print_summaries(&client.list_conflicts()?);
            Ok(())
        }
        Commands::Conflicts {
            id: Some(id),
            updated_at: Some(updated_at),
        } => print_item(&client.open_conflict(&id, updated_at)?, None).await,
        Commands::Conflicts { .. } => bail!("conflicts: an id needs its updated-at stamp"),
        Commands::Sync => {
            let report = client.sync().await?;
            print_report(&report);
            Ok(())
        }
        Commands::Watch => cmd_watch(&client, &config).await,
    }
}

// ── Config + client ───────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        tracing::warn!("config file not found: {}  (using defaults)", path.display());
        return Ok(ClientConfig::default());
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
}

/// Expand a leading `~/` to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

async fn open_client(config: &ClientConfig) -> Result<VaultClient<GrpcRemote>> {
    let db_path = expand_tilde(&config.storage.db_path);
    if let Some(dir) = db_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = SqliteLocalStore::open(&db_path, Duration::from_millis(config.storage.busy_timeout_ms))
        .with_context(|| format!("opening local vault {}", db_path.display()))?;
    let remote = GrpcRemote::new(&config.remote).context("configuring server endpoint")?;
    let kdf = KdfParams {
        mem_cost_kib: config.kdf.mem_cost_kib,
        time_cost: config.kdf.time_cost,
        parallelism: config.kdf.parallelism,
    };
    Ok(VaultClient::new(remote, Arc::new(store), kdf, tracing::info_span!("lbx")))
}

fn prompt_secret(prompt: &str) -> Result<SecretString> {
    let value = rpassword::prompt_password(prompt).context("reading from terminal")?;
    Ok(SecretString::from(value))
}

// ── Account ───────────────────────────────────────────────────────────────────

async fn cmd_register(client: &VaultClient<GrpcRemote>, email: &str) -> Result<()> {
    let password = prompt_secret("Master password: ")?;
    let again = prompt_secret("Repeat master password: ")?;
    if password.expose_secret() != again.expose_secret() {
        bail!("passwords do not match");
    }
    client.register(email, password).await?;
    println!("Registered {email}. Check your mail, then run: lbx verify {email} <code>");
    Ok(())
}

async fn cmd_login(client: &VaultClient<GrpcRemote>, email: &str) -> Result<()> {
    let password = prompt_secret("Master password: ")?;
    match client.login(email, password).await? {
        LoginMode::Online => println!("Logged in as {email}."),
        LoginMode::Offline => println!("Server unreachable; opened the local vault of {email}."),
    }
    Ok(())
}

async fn cmd_verify(client: &VaultClient<GrpcRemote>, email: &str, code: &str) -> Result<()> {
    let password = prompt_secret("Master password: ")?;
    // An unverified login is refused but leaves the derived keys pending.
    match client.login(email, password).await {
        Ok(_) => {
            println!("{email} is already verified; logged in.");
            return Ok(());
        }
        Err(e) if e.kind() == lbx_core::ErrorKind::UserEmailNotVerified => {}
        Err(e) => return Err(e.into()),
    }
    client.verify_email(code).await?;
    println!("Email verified. Logged in as {email}.");
    Ok(())
}

fn cmd_status(client: &VaultClient<GrpcRemote>, config: &ClientConfig) -> Result<()> {
    match client.current_user()? {
        Some(email) => {
            let session = if client.is_online()? { "online" } else { "offline (log in again to sync)" };
            println!("user:     {email}");
            println!("session:  {session}");
        }
        None => println!("user:     (not logged in)"),
    }
    println!("server:   {}", config.remote.endpoint);
    println!("vault:    {}", expand_tilde(&config.storage.db_path).display());
    Ok(())
}

// ── Items ─────────────────────────────────────────────────────────────────────

async fn cmd_add(client: &VaultClient<GrpcRemote>, kind: AddKind) -> Result<()> {
    let (item, value) = match kind {
        AddKind::Password { item, login } => {
            let password = prompt_secret("Password to store: ")?;
            let value = SecretValue::Password(Password {
                meta: meta(&item),
                login,
                password: password.expose_secret().to_string(),
            });
            (item, value)
        }
        AddKind::Card { item, holder, expires } => {
            let number = prompt_secret("Card number: ")?;
            let csc = prompt_secret("CSC: ")?;
            let value = SecretValue::Card(Card {
                meta: meta(&item),
                holder,
                expires,
                number: number.expose_secret().to_string(),
                csc: csc.expose_secret().to_string(),
            });
            (item, value)
        }
        AddKind::Text { item, text } => {
            let text = match text {
                Some(text) => text,
                None => tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin()))
                    .await
                    .context("reading stdin")?
                    .context("reading stdin")?,
            };
            let value = SecretValue::Text(Text { meta: meta(&item), text });
            (item, value)
        }
        AddKind::Binary { item, path } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let value = SecretValue::Binary(Binary {
                meta: meta(&item),
                filename,
                data,
            });
            (item, value)
        }
    };

    let saved = client.put_item(item.id.as_deref(), &item.name, &value).await?;
    if saved.dirty {
        println!("Saved {} ({}) locally; server not reached, run `lbx sync` later", saved.id, saved.item_type);
    } else {
        println!("Saved {} ({})", saved.id, saved.item_type);
    }
    Ok(())
}

fn meta(item: &ItemArgs) -> Meta {
    item.meta.iter().cloned().collect()
}

async fn cmd_get(client: &VaultClient<GrpcRemote>, id: &str, out: Option<&Path>) -> Result<()> {
    let opened = client.get_item(id)?;
    print_item(&opened, out).await
}

async fn print_item(opened: &OpenedItem, out: Option<&Path>) -> Result<()> {
    println!("id:       {}", opened.summary.id);
    println!("name:     {}", opened.summary.name);
    println!("type:     {}", opened.summary.item_type);
    match &opened.value {
        SecretValue::Password(p) => {
            println!("login:    {}", p.login);
            println!("password: {}", p.password);
        }
        SecretValue::Card(c) => {
            println!("holder:   {}", c.holder);
            println!("number:   {}", c.number);
            println!("expires:  {}", c.expires);
            println!("csc:      {}", c.csc);
        }
        SecretValue::Text(t) => println!("text:\n{}", t.text),
        SecretValue::Binary(b) => {
            println!("file:     {} ({} bytes)", b.filename, b.data.len());
            match out {
                Some(path) => {
                    tokio::fs::write(path, &b.data)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("written:  {}", path.display());
                }
                None => println!("{}", base64::engine::general_purpose::STANDARD.encode(&b.data)),
            }
        }
    }
    for (k, v) in opened.value.meta() {
        println!("meta:     {k}={v}");
    }
    Ok(())
}

fn print_summaries(items: &[ItemSummary]) {
    if items.is_empty() {
        println!("(none)");
        return;
    }
    for item in items {
        let marker = if item.dirty { "*" } else { " " };
        println!(
            "{marker} {:<36}  {:<12}  {:>16}  {}",
            item.id, item.item_type, item.updated_at, item.name
        );
    }
}

// ── Sync ──────────────────────────────────────────────────────────────────────

fn print_report(report: &SyncReport) {
    let outcome = match report.outcome {
        SyncOutcome::Completed => "done",
        SyncOutcome::PushConflict => "push conflict, retried next cycle",
        SyncOutcome::NeedsLogin => "session expired, run: lbx login",
        SyncOutcome::Offline => "server unreachable, changes kept locally",
    };
    println!(
        "Sync {outcome}: {} pulled, {} pushed, {} conflicts",
        report.pulled, report.pushed, report.conflicts
    );
}

async fn cmd_watch(client: &VaultClient<GrpcRemote>, config: &ClientConfig) -> Result<()> {
    let settings = ScheduleSettings::from_config(&config.sync);
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C");
        stop.cancel();
    });

    println!("Syncing every {}s; Ctrl-C to stop.", settings.interval.as_secs());
    run_scheduler(
        client.engine(),
        &settings,
        shutdown,
        |result| match result {
            Ok(report) => print_report(report),
            Err(e) => eprintln!("sync failed: {e}"),
        },
        tracing::info_span!("scheduler"),
    )
    .await;
    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_meta() {
        assert_eq!(parse_meta("site=bank.example").unwrap(), ("site".into(), "bank.example".into()));
        assert_eq!(parse_meta("note=a=b").unwrap(), ("note".into(), "a=b".into()));
        assert!(parse_meta("=x").is_err());
        assert!(parse_meta("novalue").is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_tilde(Path::new("~/x/y.db")), PathBuf::from(home).join("x/y.db"));
        assert_eq!(expand_tilde(Path::new("/etc/lbx.toml")), PathBuf::from("/etc/lbx.toml"));
    }

    #[test]
    fn test_add_password_parses() {
        let cli = Cli::try_parse_from([
            "lbx", "add", "password", "bank", "--login", "alice", "--meta", "site=bank.example",
        ])
        .unwrap();
        match cli.command {
            Commands::Add {
                kind: AddKind::Password { item, login },
            } => {
                assert_eq!(item.name, "bank");
                assert_eq!(login, "alice");
                assert_eq!(meta(&item).get("site").map(String::as_str), Some("bank.example"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_conflict_id_requires_stamp() {
        assert!(Cli::try_parse_from(["lbx", "conflicts", "abc"]).is_err());
        assert!(Cli::try_parse_from(["lbx", "conflicts", "abc", "123"]).is_ok());
        assert!(Cli::try_parse_from(["lbx", "conflicts"]).is_ok());
    }
}
