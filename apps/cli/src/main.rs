use std::{
    path::PathBuf,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use borea_core::{
    CollectorConfig, HttpTransport, Tracker, TrackerConfig,
    config::{DOMAIN_ENV, PORT_ENV},
    enrich::{IPIFY_ENDPOINT, fetch_ip_address, ip_location},
    sim::{SimulatedBrowser, SimulatedPage},
};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::storage::{FileStorage, get_state_dir, local_storage_path, session_storage_path};

mod storage;

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", secs / 60.0, secs % 60.0)
    }
}

#[derive(Parser)]
#[command(name = "borea")]
#[command(about = "Replay a page visit through the borea session tracker and send its beacon")]
struct Cli {
    /// Page URL the visit starts on
    url: String,

    /// Actions in order: an event type to fire on the window ("click"),
    /// "/path" to push a history entry, or "back:/path" for back/forward
    actions: Vec<String>,

    /// Referrer of the first page load
    #[arg(short, long)]
    referrer: Option<String>,

    /// User ID to associate with the session
    #[arg(short, long)]
    user_id: Option<String>,

    /// Tracker options as a JSON object, e.g. '{"trackPaths":true}'
    #[arg(short, long)]
    options: Option<String>,

    /// Collector domain used for non-local pages; read from the environment when absent
    #[arg(long)]
    domain: Option<String>,

    /// Collector port used when the page is served from localhost
    #[arg(long, env = PORT_ENV)]
    port: Option<u16>,

    /// User agent reported by the simulated page
    #[arg(long)]
    user_agent: Option<String>,

    /// Preferred language reported by the simulated page
    #[arg(long)]
    language: Option<String>,

    /// Tab name; runs with the same tab continue one session
    #[arg(short, long, default_value = "default")]
    tab: String,

    /// Close the tab first, discarding its session
    #[arg(long)]
    new_tab: bool,

    /// Restored sessions idle for longer than this many minutes start over
    #[arg(long)]
    inactivity_minutes: Option<i64>,

    /// Look up the public IP address and attach it as the session location
    #[arg(long)]
    enrich_ip: bool,

    /// Print the beacon body instead of sending it
    #[arg(long)]
    dry_run: bool,

    /// Directory holding simulated browser storage
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

enum Action {
    Fire(String),
    Push(String),
    Back(String),
}

impl From<&str> for Action {
    fn from(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix("back:") {
            Action::Back(path.to_owned())
        } else if raw.starts_with('/') {
            Action::Push(raw.to_owned())
        } else {
            Action::Fire(raw.to_owned())
        }
    }
}

fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "borea_core=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let origin = url::Url::parse(&cli.url)
        .with_context(|| format!("invalid page URL: {}", cli.url))?
        .origin()
        .ascii_serialization();
    let state_dir = cli.state_dir.clone().unwrap_or_else(get_state_dir);

    let session_storage = FileStorage::open(session_storage_path(&state_dir, &origin, &cli.tab));
    if cli.new_tab {
        session_storage
            .clear()
            .with_context(|| format!("failed to close tab {}", cli.tab))?;
    }
    let local_storage = FileStorage::open(local_storage_path(&state_dir, &origin));

    println!(
        "\n{}  {}\n",
        style("borea").cyan().bold(),
        style("Session Tracker").dim()
    );

    let mut page = SimulatedPage::new(&cli.url);
    if let Some(referrer) = &cli.referrer {
        page = page.with_referrer(referrer);
    }
    if let Some(user_agent) = &cli.user_agent {
        page = page.with_user_agent(user_agent);
    }
    if let Some(language) = &cli.language {
        page = page.with_language(language);
    }
    let browser = SimulatedBrowser::builder(page)
        .session_storage(Rc::new(session_storage))
        .local_storage(Rc::new(local_storage))
        .build();

    let mut collector = match &cli.domain {
        Some(domain) => CollectorConfig::new(domain),
        None => CollectorConfig::from_env().unwrap_or_else(|e| {
            println!("{} {}", style("!").yellow().bold(), style(e).dim());
            CollectorConfig::new("")
        }),
    };
    if let Some(port) = cli.port {
        collector = collector.with_local_port(port);
    }

    let mut config = TrackerConfig::new(collector).with_transport(Arc::new(HttpTransport::new()));
    if let Some(minutes) = cli.inactivity_minutes {
        let timeout = chrono::TimeDelta::try_minutes(minutes)
            .context("--inactivity-minutes is out of range")?;
        config = config.with_inactivity_timeout(timeout);
    }

    let tracker = Tracker::attached(browser.env(), config);
    if let Some(raw) = &cli.options {
        let options: serde_json::Value =
            serde_json::from_str(raw).context("--options is not valid JSON")?;
        tracker.update_options(options);
    }
    if let Some(user_id) = &cli.user_id {
        tracker.set_user_id(user_id.as_str());
    }

    let session_id = tracker.session_id().unwrap_or_default();
    println!(
        "{} Session {} {}",
        style("✓").green().bold(),
        style(&session_id).yellow(),
        style(format!("(tab {})", cli.tab)).dim()
    );

    println!("{}", style("─".repeat(60)).dim());

    if cli.enrich_ip {
        let spinner = create_spinner("Looking up public IP address...");
        match fetch_ip_address(&reqwest::Client::new(), IPIFY_ENDPOINT).await {
            Ok(ip) => {
                tracker.set_location(ip_location(&ip));
                spinner.finish_with_message(format!(
                    "{} Location: {}",
                    style("✓").green().bold(),
                    style(ip).yellow()
                ));
            }
            Err(e) => spinner.finish_with_message(format!(
                "{} Location lookup failed: {}",
                style("!").yellow().bold(),
                style(e).dim()
            )),
        }
    }

    for action in cli.actions.iter().map(|raw| Action::from(raw.as_str())) {
        match action {
            Action::Fire(event_type) => {
                let listeners = browser.fire(&event_type);
                println!(
                    "{} {} {}",
                    style("•").cyan(),
                    event_type,
                    style(format!("({listeners} listeners)")).dim()
                );
            }
            Action::Push(path) => {
                browser.push_state(&path);
                println!("{} push {}", style("→").cyan(), path);
            }
            Action::Back(path) => {
                browser.go_to(&path);
                println!("{} back {}", style("←").cyan(), path);
            }
        }
    }

    if cli.dry_run {
        tracker.update_options(serde_json::json!({ "postData": false }));
    }

    let start = Instant::now();
    browser.fire("beforeunload");

    if let Some(beacon) = tracker.take_pending_beacon() {
        let spinner = create_spinner("Sending session beacon...");
        beacon.await.context("beacon task panicked")?;
        spinner.finish_with_message(format!(
            "{} Beacon sent {}",
            style("✓").green().bold(),
            style(format!("[{}]", format_duration(start.elapsed()))).dim()
        ));
    } else if !cli.dry_run {
        println!(
            "{} Beacon not sent {}",
            style("!").yellow().bold(),
            style(format!("(set {DOMAIN_ENV} or use a localhost URL)")).dim()
        );
    }

    let captured = tracker.captured();
    let duration_ms = tracker
        .session_data()
        .and_then(|s| s.session_duration)
        .unwrap_or(0);
    println!("{}", style("─".repeat(60)).dim());
    println!(
        "{} {}",
        style("Duration:").dim(),
        style(format!("{duration_ms} ms")).cyan().bold()
    );
    println!("{} {}", style("Captured:").dim(), style(captured.len()).cyan());
    for event_type in captured.event_types() {
        println!("  {} x{}", event_type, captured.of_type(event_type).len());
    }
    println!(
        "{} {}",
        style("State:").dim(),
        style(session_storage_path(&state_dir, &origin, &cli.tab).display()).cyan()
    );

    if cli.dry_run {
        let body = tracker.beacon_body().context("no session to report")?;
        let pretty = serde_json::to_string_pretty(&serde_json::from_str::<serde_json::Value>(&body)?)?;
        println!("\n{}", pretty);
    }

    Ok(())
}
