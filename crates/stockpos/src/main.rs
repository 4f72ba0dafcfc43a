use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use stockpos_core::auth::{
    AuthError, AuthManager, Destination, Identity, LogoutOutcome, Navigator, RouteKind,
    SchedulerEvent, SchedulerState, Session,
};
use stockpos_core::config::Settings;
use stockpos_core::services::{Product, ProductService, UnitOfMeasure};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_PROFILE: &str = "default";
const LOG_ENV: &str = "STOCKPOS_LOG";

#[derive(Parser, Debug)]
#[command(author, version, about = "stockpos point-of-sale client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in and out of the identity provider
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Keep a session alive in the foreground
    #[command(subcommand)]
    Session(SessionCommand),
    /// Product catalogue
    #[command(subcommand)]
    Product(ProductCommand),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in through the browser (authorization code with PKCE)
    Login(LoginArgs),
    /// Sign out and forget stored credentials for a profile
    Logout(ProfileArgs),
    /// Show who is signed in and when the token expires
    Status(StatusArgs),
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// Run the silent refresh scheduler and print every change.
    ///
    /// Lines on stdin are forwarded as events: `foreground`, `online`, `public`, `protected`.
    Watch(ProfileArgs),
}

#[derive(Subcommand, Debug)]
enum ProductCommand {
    /// Search products by name or barcode
    Search(SearchArgs),
}

#[derive(Args, Debug)]
struct ProfileArgs {
    /// Profile name for stored credentials
    #[arg(long, default_value = DEFAULT_PROFILE)]
    profile: String,
}

#[derive(Args, Debug)]
struct LoginArgs {
    /// Profile name for stored credentials
    #[arg(long, default_value = DEFAULT_PROFILE)]
    profile: String,
    /// Use manual copy/paste flow instead of a loopback listener
    #[arg(long)]
    manual: bool,
    /// Print the authorization URL without launching a browser
    #[arg(long = "no-browser")]
    no_browser: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Profile name for stored credentials
    #[arg(long, default_value = DEFAULT_PROFILE)]
    profile: String,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Product name fragment or barcode
    term: String,
    /// Profile name for stored credentials
    #[arg(long, default_value = DEFAULT_PROFILE)]
    profile: String,
    /// Maximum number of products to return
    #[arg(long, default_value_t = 20)]
    size: u32,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

/// Reports navigation decisions on the terminal.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, destination: Destination) {
        match destination {
            Destination::Home => {}
            Destination::Login { notice: Some(notice) } => eprintln!("{notice}"),
            Destination::Login { notice: None } => eprintln!("Signed out."),
            Destination::SecurityError { message } => {
                eprintln!("Login rejected for security reasons: {message}")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(args).await?,
            AuthCommand::Logout(args) => auth_logout(args).await?,
            AuthCommand::Status(args) => auth_status(args).await?,
        },
        Commands::Session(cmd) => match cmd {
            SessionCommand::Watch(args) => session_watch(args).await?,
        },
        Commands::Product(cmd) => match cmd {
            ProductCommand::Search(args) => product_search(args).await?,
        },
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_manager(profile: &str) -> Result<(Settings, AuthManager)> {
    let settings = Settings::from_env().context("invalid STOCKPOS_* configuration")?;
    let manager = AuthManager::from_settings(&settings, Arc::new(TerminalNavigator), profile)
        .context("failed to initialise authentication")?;
    Ok((settings, manager))
}

/// Restore the profile's session, refreshing it if needed.
async fn load_session(manager: &AuthManager, profile: &str) -> Result<Session> {
    manager
        .restore()
        .context("failed to read stored credentials")?;
    manager.ensure_fresh_session().await?.ok_or_else(|| {
        anyhow!(
            "no credentials stored for profile '{}'; run `stockpos auth login`",
            profile
        )
    })
}

async fn auth_login(args: LoginArgs) -> Result<()> {
    let (_, manager) = build_manager(&args.profile)?;
    let open_browser = !args.no_browser;

    let identity = if args.manual {
        manual_login(&manager, open_browser).await
    } else {
        match manager
            .authenticate_browser(open_browser, print_authorization_url)
            .await
        {
            Ok(identity) => Ok(identity),
            Err(AuthError::BrowserLaunch(reason)) => {
                eprintln!(
                    "Failed to launch browser ({reason}); falling back to manual copy/paste flow."
                );
                manual_login(&manager, false).await
            }
            Err(AuthError::Io(err)) => {
                eprintln!(
                    "Unable to listen on the redirect address ({err}); using manual copy/paste flow."
                );
                manual_login(&manager, false).await
            }
            Err(other) => Err(other),
        }
    }
    .context("login failed")?;

    println!(
        "Login succeeded. Credentials stored for profile '{}'.",
        args.profile
    );
    print_identity(&identity);
    if let Some(expiry) = manager.session().snapshot().expires_at {
        println!("Token expires at {} (UTC).", expiry);
    }
    Ok(())
}

async fn manual_login(manager: &AuthManager, open_browser: bool) -> Result<Identity, AuthError> {
    manager
        .authenticate_manual(open_browser, print_authorization_url, || async {
            prompt_for_redirect().await
        })
        .await
}

async fn auth_logout(args: ProfileArgs) -> Result<()> {
    let (_, manager) = build_manager(&args.profile)?;
    manager
        .restore()
        .context("failed to read stored credentials")?;
    match manager.logout().await {
        LogoutOutcome::SignedOut => {
            println!("Deleted credentials for profile '{}'.", args.profile)
        }
        LogoutOutcome::AlreadySignedOut => {
            println!("No credentials stored for profile '{}'.", args.profile)
        }
        LogoutOutcome::AlreadyInProgress => println!("Logout already in progress."),
    }
    Ok(())
}

async fn auth_status(args: StatusArgs) -> Result<()> {
    let (_, manager) = build_manager(&args.profile)?;
    let session = load_session(&manager, &args.profile).await;

    if args.json {
        let body = match &session {
            Ok(session) => json!({
                "profile": args.profile,
                "authenticated": true,
                "user": session.user,
                "expiresAt": session.expires_at,
            }),
            Err(_) => json!({ "profile": args.profile, "authenticated": false }),
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let session = session?;
    println!("Profile   : {}", args.profile);
    if let Some(user) = &session.user {
        print_identity(user);
    }
    match session.expires_at {
        Some(expiry) => println!("Expires   : {} (UTC)", expiry),
        None => println!("Expires   : unknown"),
    }
    Ok(())
}

async fn session_watch(args: ProfileArgs) -> Result<()> {
    let (_, manager) = build_manager(&args.profile)?;
    let session = load_session(&manager, &args.profile).await?;
    render_session(&session);

    let scheduler = manager.start_silent_refresh(RouteKind::Protected);
    let mut states = scheduler.subscribe();
    let mut sessions = manager.session().subscribe();
    let _ = sessions.borrow_and_update();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                render_scheduler_state(state);
            }
            changed = sessions.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = sessions.borrow_and_update().clone();
                render_session(&session);
                if !session.is_authenticated && !session.is_authenticating {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match parse_event(&line) {
                    Some(event) => {
                        debug!(?event, "forwarding scheduler event");
                        scheduler.notify(event);
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("unknown event '{}'", line.trim()),
                },
                None => stdin_open = false,
            },
        }
    }

    scheduler.shutdown().await;
    Ok(())
}

fn parse_event(line: &str) -> Option<SchedulerEvent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "foreground" | "visible" => Some(SchedulerEvent::Foreground),
        "online" => Some(SchedulerEvent::Online),
        "public" => Some(SchedulerEvent::Navigated(RouteKind::Public)),
        "protected" => Some(SchedulerEvent::Navigated(RouteKind::Protected)),
        _ => None,
    }
}

async fn product_search(args: SearchArgs) -> Result<()> {
    let (settings, manager) = build_manager(&args.profile)?;
    load_session(&manager, &args.profile).await?;
    let client = manager
        .api_client(settings.api_url.clone())
        .context("failed to build API client")?;
    let products = ProductService::new(client);

    let page = products
        .search(&args.term, args.size)
        .await
        .context("product search failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page.content)?);
        return Ok(());
    }
    render_product_list(&page.content);
    if let Some(total) = page.total_elements {
        if total > page.content.len() as u64 {
            println!("({} of {} shown)", page.content.len(), total);
        }
    }
    Ok(())
}

async fn prompt_for_redirect() -> Result<String, AuthError> {
    task::spawn_blocking(|| {
        use std::io::{self, Write};
        print!("Paste the redirect URL from the browser: ");
        io::stdout()
            .flush()
            .map_err(AuthError::from)?;
        let mut input = String::new();
        io::stdin()
            .read_line(&mut input)
            .map_err(AuthError::from)?;
        Ok(input.trim().to_owned())
    })
    .await
    .map_err(|_| AuthError::Cancelled)?
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    println!("\nAuthorize the application by visiting:\n  {}\n", url);
    Ok(())
}

fn print_identity(identity: &Identity) {
    if identity.email.is_empty() {
        println!("Signed in : {}", identity.name);
    } else {
        println!("Signed in : {} <{}>", identity.name, identity.email);
    }
    if !identity.roles.is_empty() {
        println!("Roles     : {}", identity.roles.join(", "));
    }
}

fn render_session(session: &Session) {
    let who = session
        .user
        .as_ref()
        .map(|user| user.name.as_str())
        .unwrap_or("-");
    match (session.is_authenticated, session.expires_at) {
        (true, Some(expiry)) => {
            let left = (expiry - Utc::now()).num_seconds().max(0);
            println!(
                "session   : {who}, expires {} ({left}s left)",
                expiry.to_rfc3339()
            )
        }
        (true, None) => println!("session   : {who}"),
        (false, _) if session.is_authenticating => println!("session   : signing in"),
        (false, _) => println!("session   : signed out"),
    }
}

fn render_scheduler_state(state: SchedulerState) {
    match state {
        SchedulerState::Idle => println!("scheduler : idle"),
        SchedulerState::Checking => println!("scheduler : checking"),
        SchedulerState::Armed { refresh_at } => {
            println!("scheduler : refresh at {}", refresh_at.to_rfc3339())
        }
        SchedulerState::Refreshing => println!("scheduler : refreshing"),
    }
}

fn render_product_list(products: &[Product]) {
    if products.is_empty() {
        println!("No products found.");
        return;
    }
    println!(
        "{:<6} {:<14} {:<32} {:>10} {:>10}",
        "ID", "BARCODE", "NAME", "STOCK", "PRICE"
    );
    for product in products {
        println!(
            "{:<6} {:<14} {:<32} {:>10} {:>10.2}",
            product.id,
            product.barcode,
            truncate(&product.name, 32),
            format!("{} {}", product.stock, unit_label(product)),
            product.price
        );
    }
}

fn unit_label(product: &Product) -> &'static str {
    match product.unit {
        UnitOfMeasure::Unit => "un",
        UnitOfMeasure::Kilogram => "kg",
    }
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_owned();
    }
    let mut truncated = value
        .chars()
        .take(max_len.saturating_sub(1))
        .collect::<String>();
    truncated.push('…');
    truncated
}
