//! CLI commands for orchestra-relay using clap.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audit::{
    AuditLogger, AuditQuery, MessageReplay, MessageStatus, ReplayOptions, ReplayResult,
    SearchCriteria, StoredMessage, TimeRange, TrendInterval,
};
use crate::config::{get_home_dir, load_settings_from, save_settings, Settings, HOME_ENV};
use crate::protocol::{BodyType, Priority};
use crate::relay::{Relay, SubmitOutcome};
use crate::routing::{AgentInfo, AgentRegistry};
use crate::validation::EnvelopeValidator;

/// orchestra-relay - validated, prioritized and audited agent messaging.
#[derive(Parser)]
#[command(name = "orchestra-relay")]
#[command(version)]
#[command(about = "Message backbone for multi-agent orchestration", long_about = None)]
pub struct Commands {
    /// Relay home directory
    #[arg(long, global = true, env = HOME_ENV)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write a default settings file
    Init {
        /// Overwrite an existing settings file
        #[arg(long)]
        force: bool,
    },

    /// Validate an envelope file without submitting it
    Validate {
        /// Envelope file
        file: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate, store and queue an envelope file
    Submit {
        /// Envelope file
        file: PathBuf,
    },

    /// Agent registry
    #[command(subcommand, alias = "a")]
    Agents(AgentsCommand),

    /// Queue operations
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Search stored messages
    Search(SearchArgs),

    /// Message statistics
    Stats {
        #[command(flatten)]
        window: Window,
    },

    /// Most active agents
    Top {
        #[command(subcommand)]
        which: TopCommand,
    },

    /// Message counts over time
    Trends {
        /// Bucket width: hour, day, week
        #[arg(default_value = "day")]
        interval: TrendInterval,

        #[command(flatten)]
        window: Window,
    },

    /// Replay stored messages
    #[command(subcommand)]
    Replay(ReplayCommand),

    /// Audit log
    #[command(subcommand)]
    Audit(AuditCommand),

    /// Apply the retention policy
    Prune,

    /// Run the relay maintenance loop until Ctrl-C
    Run,
}

#[derive(Subcommand)]
pub enum AgentsCommand {
    /// List registered agents
    List {
        /// Only agents of this department
        #[arg(long)]
        department: Option<String>,
    },

    /// Show one agent
    Show {
        /// Agent name
        name: String,
    },

    /// Check whether the registry routes sender -> recipient
    Route { sender: String, recipient: String },

    /// Registry statistics
    Stats,
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Pending messages by priority
    Stats,
}

#[derive(Subcommand)]
pub enum TopCommand {
    Senders {
        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[command(flatten)]
        window: Window,
    },
    Recipients {
        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[command(flatten)]
        window: Window,
    },
}

#[derive(Subcommand)]
pub enum ReplayCommand {
    /// Replay one message
    One {
        message_id: String,

        #[command(flatten)]
        flags: ReplayFlags,
    },

    /// Replay every message of a conversation
    Conversation {
        correlation_id: String,

        #[command(flatten)]
        flags: ReplayFlags,
    },

    /// Replay every failed message
    Failed {
        #[command(flatten)]
        flags: ReplayFlags,
    },

    /// Replay statistics
    Stats,
}

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Events of one message, oldest first
    Trail { message_id: String },

    /// Verify event hashes (one event, or all events in the window)
    Verify {
        event_id: Option<String>,

        #[command(flatten)]
        window: Window,
    },

    /// Compliance report
    Report {
        /// Hours covered by the report
        #[arg(long, default_value_t = 24)]
        hours: u32,

        #[arg(long)]
        json: bool,
    },

    /// Search events
    Search {
        #[arg(long)]
        message: Option<String>,

        /// Event type, e.g. delivery-failed
        #[arg(long = "type")]
        event_type: Option<crate::audit::AuditEventType>,

        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        window: Window,
    },

    /// Audit log statistics
    Stats,
}

/// Optional look-back window.
#[derive(Args, Clone, Copy, Debug, Default)]
pub struct Window {
    /// Only consider the last N hours
    #[arg(long)]
    pub hours: Option<u32>,
}

impl Window {
    fn range(&self) -> Option<TimeRange> {
        self.hours.map(TimeRange::last_hours)
    }
}

#[derive(Args, Clone, Debug)]
pub struct SearchArgs {
    #[arg(long)]
    pub sender: Option<String>,

    #[arg(long)]
    pub recipient: Option<String>,

    #[arg(long)]
    pub body_type: Option<BodyType>,

    #[arg(long)]
    pub priority: Option<Priority>,

    #[arg(long)]
    pub status: Option<MessageStatus>,

    /// Messages of one conversation
    #[arg(long, conflicts_with_all = ["sender", "recipient", "body_type", "priority", "status"])]
    pub correlation: Option<String>,

    #[arg(long)]
    pub limit: Option<usize>,

    #[command(flatten)]
    pub window: Window,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Clone, Copy, Debug)]
pub struct ReplayFlags {
    /// Validate only
    #[arg(long)]
    pub dry_run: bool,

    /// Start the retry budget over
    #[arg(long)]
    pub reset_retry_count: bool,

    /// Restamp the message with the current time
    #[arg(long)]
    pub update_timestamps: bool,
}

impl From<ReplayFlags> for ReplayOptions {
    fn from(flags: ReplayFlags) -> Self {
        Self {
            dry_run: flags.dry_run,
            reset_retry_count: flags.reset_retry_count,
            update_timestamps: flags.update_timestamps,
        }
    }
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let home = match &self.home {
            Some(home) => home.clone(),
            None => get_home_dir()?,
        };

        if let Command::Init { force } = &self.command {
            return cmd_init(&home, *force);
        }
        if let Command::Validate { file, json } = &self.command {
            return cmd_validate(file, *json);
        }

        let settings = load_settings_from(&home)
            .with_context(|| format!("loading settings from {}", home.display()))?;

        match &self.command {
            Command::Init { .. } | Command::Validate { .. } => Ok(()),
            Command::Submit { file } => cmd_submit(&settings, file),
            Command::Agents(cmd) => cmd_agents(&settings, cmd),
            Command::Queue(cmd) => cmd_queue(&settings, cmd),
            Command::Search(args) => cmd_search(&settings, args),
            Command::Stats { window } => cmd_stats(&settings, window),
            Command::Top { which } => cmd_top(&settings, which),
            Command::Trends { interval, window } => cmd_trends(&settings, *interval, window),
            Command::Replay(cmd) => cmd_replay(&settings, cmd),
            Command::Audit(cmd) => cmd_audit(&settings, cmd),
            Command::Prune => cmd_prune(&settings),
            Command::Run => cmd_run(&settings).await,
        }
    }
}

// Command implementations

fn cmd_init(home: &Path, force: bool) -> Result<()> {
    let path = home.join("settings.json");
    if path.exists() && !force {
        println!("Settings already exist at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    let settings = Settings::with_home(home);
    std::fs::create_dir_all(&settings.agents_dir)?;
    let path = save_settings(&settings, home)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_validate(file: &Path, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let validator = EnvelopeValidator::new();
    let validation = validator.validate(&raw);
    let report = validator.report(&validation, &raw);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", validator.reporter().format_as_text(&report));
    }

    if validation.is_valid() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} is not a valid envelope", file.display()))
    }
}

fn cmd_submit(settings: &Settings, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let relay = Relay::open(settings)?;

    match relay.submit(&raw)? {
        SubmitOutcome::Queued {
            message_id,
            warnings,
        } => {
            println!("Queued message: {}", message_id);
            for warning in &warnings {
                println!("  warning: {}", warning.message);
            }
            Ok(())
        }
        SubmitOutcome::Rejected { reason, report, .. } => {
            println!("{}", relay.validator().reporter().format_as_text(&report));
            Err(anyhow::anyhow!("Message rejected: {}", reason))
        }
    }
}

fn cmd_agents(settings: &Settings, cmd: &AgentsCommand) -> Result<()> {
    let registry = AgentRegistry::load(&settings.agents_dir)?;

    match cmd {
        AgentsCommand::List { department } => {
            let agents = match department {
                Some(department) => registry.find_by_department(department),
                None => registry.all(),
            };
            println!("Agents ({}):", agents.len());
            for agent in agents {
                print_agent(agent);
            }
            for skipped in registry.skipped() {
                println!("  skipped: {}", skipped.display());
            }
        }
        AgentsCommand::Show { name } => {
            let agent = registry
                .find_by_name(name)
                .ok_or_else(|| anyhow::anyhow!("Agent not found: {}", name))?;
            println!("{}", serde_json::to_string_pretty(agent)?);
        }
        AgentsCommand::Route { sender, recipient } => {
            if registry.can_route(sender, recipient) {
                println!("{} -> {}: allowed", sender, recipient);
            } else {
                println!("{} -> {}: refused", sender, recipient);
            }
        }
        AgentsCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&registry.stats())?);
        }
    }

    Ok(())
}

fn print_agent(agent: &AgentInfo) {
    println!(
        "  {:<32} {:<12} {:<7} {}",
        agent.name,
        agent.role,
        agent.tier,
        agent.department.as_deref().unwrap_or("-")
    );
}

fn cmd_queue(settings: &Settings, cmd: &QueueCommand) -> Result<()> {
    match cmd {
        QueueCommand::Stats => {
            let relay = Relay::open(settings)?;
            relay.restore_pending()?;
            println!("{}", serde_json::to_string_pretty(&relay.queue_stats()?)?);
        }
    }
    Ok(())
}

fn cmd_search(settings: &Settings, args: &SearchArgs) -> Result<()> {
    let relay = Relay::open(settings)?;
    let search = relay.search();

    let messages = match &args.correlation {
        Some(correlation) => search.find_conversation_chain(correlation)?,
        None => search.search(&SearchCriteria {
            sender: args.sender.clone(),
            recipient: args.recipient.clone(),
            body_type: args.body_type,
            priority: args.priority,
            status: args.status,
            range: args.window.range(),
            limit: args.limit,
        })?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else {
        println!("Messages ({}):", messages.len());
        for message in &messages {
            print_message(message);
        }
    }
    Ok(())
}

fn print_message(message: &StoredMessage) {
    println!(
        "  {}  {}  {} -> {}  {}/{}  {}",
        message.message_id,
        message.timestamp.format("%Y-%m-%d %H:%M:%S"),
        message.sender,
        message.recipient,
        message.body_type,
        message.priority,
        message.status
    );
}

fn cmd_stats(settings: &Settings, window: &Window) -> Result<()> {
    let relay = Relay::open(settings)?;
    let stats = relay.search().stats(window.range().as_ref())?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_top(settings: &Settings, which: &TopCommand) -> Result<()> {
    let relay = Relay::open(settings)?;
    let search = relay.search();
    let ranked = match which {
        TopCommand::Senders { limit, window } => search.top_senders(*limit, window.range().as_ref())?,
        TopCommand::Recipients { limit, window } => {
            search.top_recipients(*limit, window.range().as_ref())?
        }
    };
    for (rank, entry) in ranked.iter().enumerate() {
        println!("{:>3}. {:<32} {}", rank + 1, entry.agent, entry.count);
    }
    Ok(())
}

fn cmd_trends(settings: &Settings, interval: TrendInterval, window: &Window) -> Result<()> {
    let relay = Relay::open(settings)?;
    for point in relay.search().trends(interval, window.range().as_ref())? {
        println!("{:<20} {}", point.period, point.count);
    }
    Ok(())
}

fn cmd_replay(settings: &Settings, cmd: &ReplayCommand) -> Result<()> {
    let relay = Relay::open(settings)?;

    let results = match cmd {
        ReplayCommand::One { message_id, flags } => {
            vec![relay.replay(message_id, &ReplayOptions::from(*flags))?]
        }
        ReplayCommand::Conversation {
            correlation_id,
            flags,
        } => relay.replay_conversation(correlation_id, &ReplayOptions::from(*flags))?,
        ReplayCommand::Failed { flags } => relay.replay_failed(&ReplayOptions::from(*flags))?,
        ReplayCommand::Stats => {
            let stats = MessageReplay::new(relay.store()).replay_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            return Ok(());
        }
    };

    print_replays(&results);
    Ok(())
}

fn print_replays(results: &[ReplayResult]) {
    let succeeded = results.iter().filter(|r| r.success).count();
    println!("Replayed {}/{} message(s)", succeeded, results.len());
    for result in results {
        match &result.error {
            None => println!("  ok      {}", result.message_id),
            Some(error) => println!("  failed  {}: {}", result.message_id, error),
        }
    }
}

fn cmd_audit(settings: &Settings, cmd: &AuditCommand) -> Result<()> {
    let audit = AuditLogger::open(&settings.audit_database_path)?;

    match cmd {
        AuditCommand::Trail { message_id } => {
            let events = audit.trail(message_id)?;
            println!("Audit trail for {} ({} events):", message_id, events.len());
            for event in events {
                println!(
                    "  {}  {:<20} {:<12} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.event_type,
                    event.actor_agent,
                    event.details
                );
            }
        }
        AuditCommand::Verify { event_id, window } => match event_id {
            Some(event_id) => {
                if audit.verify_integrity(event_id)? {
                    println!("Event {} verified", event_id);
                } else {
                    return Err(anyhow::anyhow!("Event {} failed verification", event_id));
                }
            }
            None => {
                let report = audit.verify_integrity_batch(window.range().as_ref())?;
                println!(
                    "Verified {}/{} events ({} failed)",
                    report.verified, report.total, report.failed
                );
                if report.failed > 0 {
                    return Err(anyhow::anyhow!("{} audit event(s) failed verification", report.failed));
                }
            }
        },
        AuditCommand::Report { hours, json } => {
            let report = audit.report(&TimeRange::last_hours(*hours))?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Compliance report, last {} hour(s)", hours);
                println!("  events:               {}", report.total_events);
                for (kind, count) in &report.by_event_type {
                    println!("    {:<20} {}", kind, count);
                }
                println!("  validation failures:  {}", report.validation_failures);
                println!("  delivery success:     {:.1}%", report.delivery_success_rate);
                println!("  avg delivery time:    {:.2}s", report.average_delivery_seconds);
                println!("  expired messages:     {}", report.expired_messages);
            }
        }
        AuditCommand::Search {
            message,
            event_type,
            actor,
            limit,
            window,
        } => {
            let events = audit.search(&AuditQuery {
                message_id: message.clone(),
                event_type: *event_type,
                actor: actor.clone(),
                range: window.range(),
                limit: *limit,
            })?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        AuditCommand::Stats => {
            println!("{}", serde_json::to_string_pretty(&audit.stats()?)?);
        }
    }

    Ok(())
}

fn cmd_prune(settings: &Settings) -> Result<()> {
    let relay = Relay::open(settings)?;
    let report = relay.prune(&settings.retention)?;
    println!(
        "Pruned {} message(s) older than {} days and {} audit event(s) older than {} days",
        report.messages,
        settings.retention.message_days,
        report.audit_events,
        settings.retention.audit_days
    );
    Ok(())
}

async fn cmd_run(settings: &Settings) -> Result<()> {
    let relay = Relay::open(settings)?;
    let restored = relay.restore_pending()?;
    relay.prune(&settings.retention)?;
    println!(
        "Relay running ({} pending message(s) restored). Press Ctrl-C to stop.",
        restored
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.maintenance.interval_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = relay.maintain() {
                    tracing::warn!("Maintenance tick failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Relay stopping");
                break;
            }
        }
    }

    Ok(())
}
