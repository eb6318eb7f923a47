//! meetboard CLI
//!
//! Thin command-line front end over the sync coordinator. Results are
//! printed as JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use serde::Serialize;
use thiserror::Error;

use meetboard_lib::error::{ErrorContext, Operation};
use meetboard_lib::flatfile::row::{parse_bool, parse_date, parse_timestamp};
use meetboard_lib::{
    Config, ConfigError, Dashboard, ErrorPayload, ImportMode, ImportOptions, MeetingFields,
    MeetingFilter, MeetingId, MeetingStatus, StoreError,
};

#[derive(Parser)]
#[command(name = "meetboard", version, about = "Meeting dashboard storage")]
struct Cli {
    /// Config file (defaults to ~/.meetboard/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Acting user recorded in the audit log
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a meeting
    Add {
        #[command(flatten)]
        fields: FieldArgs,
        /// Mark as completed right away
        #[arg(long)]
        completed: bool,
    },
    /// Change fields of an existing meeting
    Edit {
        id: MeetingId,
        #[command(flatten)]
        fields: FieldArgs,
        /// Set the Completed override
        #[arg(long, conflicts_with = "reopen")]
        complete: bool,
        /// Clear the Completed override
        #[arg(long)]
        reopen: bool,
    },
    /// Delete a meeting
    Delete { id: MeetingId },
    /// Show one meeting
    Show { id: MeetingId },
    /// List meetings
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Per-status counts
    Counts {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Audit trail of one meeting, or the most recent entries
    History {
        id: Option<MeetingId>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Replay changes that only reached the flat file
    Reconcile,
    /// List changes waiting for reconciliation
    Pending,
    /// How the two copies of a meeting relate
    SyncState { id: MeetingId },
    /// Write all meetings, with status, to a CSV file
    Export { dest: PathBuf },
    /// Load meetings from a CSV or Excel file
    Import {
        path: PathBuf,
        /// add-new-only, update-existing or update-and-add-new
        #[arg(short, long, default_value = "update-and-add-new")]
        mode: ImportMode,
        /// Take the sheet's Completed state for existing meetings
        #[arg(long)]
        overwrite_status: bool,
    },
    /// Hot-copy the relational database to a file
    Backup { dest: PathBuf },
}

#[derive(Args, Default)]
struct FilterArgs {
    #[arg(short, long, value_parser = parse_status)]
    status: Option<MeetingStatus>,
    /// First day, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_day)]
    from: Option<NaiveDate>,
    /// Last day, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_day)]
    to: Option<NaiveDate>,
    /// Case-insensitive text search
    #[arg(short = 'q', long)]
    search: Option<String>,
}

impl From<FilterArgs> for MeetingFilter {
    fn from(args: FilterArgs) -> Self {
        MeetingFilter {
            status: args.status,
            from: args.from,
            to: args.to,
            search: args.search,
            as_of: None,
        }
    }
}

/// Meeting fields settable from the command line. Unset flags keep the
/// current value; an empty string clears an optional field.
#[derive(Args, Default)]
struct FieldArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    organization: Option<String>,
    #[arg(long)]
    client: Option<String>,
    #[arg(long)]
    stakeholder: Option<String>,
    #[arg(long)]
    purpose: Option<String>,
    #[arg(long)]
    agenda: Option<String>,
    /// Start time (RFC 3339 or "YYYY-MM-DD HH:MM", UTC)
    #[arg(long, value_parser = parse_when)]
    start: Option<DateTime<Utc>>,
    #[arg(long, value_parser = parse_when)]
    end: Option<DateTime<Utc>>,
    #[arg(long)]
    time_zone: Option<String>,
    #[arg(long)]
    meeting_type: Option<String>,
    #[arg(long)]
    link: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    priority: Option<String>,
    #[arg(long)]
    attendees: Option<String>,
    #[arg(long)]
    guests: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long)]
    next_action: Option<String>,
    #[arg(long, value_parser = parse_day)]
    follow_up: Option<NaiveDate>,
    #[arg(long, value_parser = parse_flag)]
    reminder_sent: Option<bool>,
    #[arg(long, value_parser = parse_flag)]
    calendar_sync: Option<bool>,
    #[arg(long)]
    calendar_event_title: Option<String>,
}

impl FieldArgs {
    fn apply(self, mut fields: MeetingFields) -> MeetingFields {
        fn set(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value {
                *slot = Some(v);
            }
        }
        if let Some(title) = self.title {
            fields.title = title;
        }
        if let Some(start) = self.start {
            fields.start_at = start;
        }
        if let Some(end) = self.end {
            fields.end_at = end;
        }
        set(&mut fields.organization, self.organization);
        set(&mut fields.client, self.client);
        set(&mut fields.stakeholder_name, self.stakeholder);
        set(&mut fields.purpose, self.purpose);
        set(&mut fields.agenda, self.agenda);
        set(&mut fields.time_zone, self.time_zone);
        set(&mut fields.meeting_type, self.meeting_type);
        set(&mut fields.meeting_link, self.link);
        set(&mut fields.location, self.location);
        set(&mut fields.priority, self.priority);
        set(&mut fields.attendees, self.attendees);
        set(&mut fields.guests, self.guests);
        set(&mut fields.notes, self.notes);
        set(&mut fields.next_action, self.next_action);
        set(&mut fields.calendar_event_title, self.calendar_event_title);
        if self.follow_up.is_some() {
            fields.follow_up_date = self.follow_up;
        }
        if let Some(sent) = self.reminder_sent {
            fields.reminder_sent = sent;
        }
        if let Some(sync) = self.calendar_sync {
            fields.calendar_sync = sync;
        }
        fields.normalized()
    }
}

fn parse_when(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("invalid date-time: {raw}"))
}

fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    parse_date(raw).ok_or_else(|| format!("invalid date: {raw}"))
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    parse_bool(raw).ok_or_else(|| format!("expected yes/no, got: {raw}"))
}

fn parse_status(raw: &str) -> Result<MeetingStatus, String> {
    raw.parse()
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Usage(String),

    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Store(err)) => {
            let payload = ErrorPayload::from(&err);
            match serde_json::to_string_pretty(&payload) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{err}"),
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(actor) = cli.actor {
        config.actor = actor;
    }
    let dashboard = config.open()?;
    let audit = config.audit_context();

    match cli.command {
        Commands::Add { fields, completed } => {
            let (Some(start), Some(end)) = (fields.start, fields.end) else {
                return Err(CliError::Usage("add requires --start and --end".into()));
            };
            let base = MeetingFields {
                start_at: start,
                end_at: end,
                status_override: completed,
                ..Default::default()
            };
            print_json(&dashboard.create(fields.apply(base), &audit)?)
        }
        Commands::Edit {
            id,
            fields,
            complete,
            reopen,
        } => {
            let current = require_meeting(&dashboard, id)?;
            let mut updated = fields.apply(current);
            if complete {
                updated.status_override = true;
            } else if reopen {
                updated.status_override = false;
            }
            print_json(&dashboard.update(id, updated, &audit)?)
        }
        Commands::Delete { id } => print_json(&dashboard.delete(id, &audit)?),
        Commands::Show { id } => {
            let outcome = dashboard.get(id)?;
            if outcome.value.is_none() {
                let ctx = ErrorContext::new(Operation::Get, outcome.source).meeting(id);
                return Err(StoreError::not_found(ctx).into());
            }
            print_json(&outcome)
        }
        Commands::List { filter } => print_json(&dashboard.read(&filter.into())?),
        Commands::Counts { filter } => print_json(&dashboard.counts(&filter.into())?),
        Commands::History { id: Some(id), .. } => print_json(&dashboard.history(id)?),
        Commands::History { id: None, limit } => print_json(&dashboard.recent_audit(limit)?),
        Commands::Reconcile => {
            let report = dashboard.reconcile(&audit)?;
            if report.unreconciled > 0 {
                log::warn!("{} changes still pending", report.unreconciled);
            }
            print_json(&report)
        }
        Commands::Pending => print_json(&dashboard.pending()?),
        Commands::SyncState { id } => print_json(&dashboard.sync_state(id)?),
        Commands::Export { dest } => print_json(&dashboard.export(&dest)?),
        Commands::Import {
            path,
            mode,
            overwrite_status,
        } => {
            let options = ImportOptions {
                mode,
                overwrite_status,
            };
            print_json(&dashboard.import_file(&path, options, &audit)?)
        }
        Commands::Backup { dest } => {
            let db = dashboard.primary().ok_or_else(|| {
                CliError::Usage("Relational backend is disabled; nothing to back up".into())
            })?;
            db.backup_to(&dest)?;
            print_json(&serde_json::json!({ "backup": dest }))
        }
    }
}

fn require_meeting(dashboard: &Dashboard, id: MeetingId) -> Result<MeetingFields, CliError> {
    let outcome = dashboard.get(id)?;
    match outcome.value {
        Some(view) => Ok(view.meeting.fields),
        None => {
            let ctx = ErrorContext::new(Operation::Update, outcome.source).meeting(id);
            Err(StoreError::not_found(ctx).into())
        }
    }
}
