mod cache;
mod config;
mod logging;
mod pull;
mod rapidpro;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::error::ErrorKind;
use clap::{ArgAction, ArgGroup, CommandFactory, Parser};
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error};

use crate::cache::{NoopStorage, SqliteStorage};
use crate::config::{CacheLocation, Config, DEFAULT_ADDRESS, DEFAULT_TIMEOUT_SECS};
use crate::pull::{PullRequest, PullTask};
use crate::rapidpro::client::RapidProClient;
use crate::rapidpro::error::RemoteError;
use crate::rapidpro::source::Filter;
use crate::rapidpro::types::{Association, Kind};

#[derive(Parser, Debug)]
#[command(name = "rapidpro-pull")]
#[command(about = "Pull runs, flows and contacts from RapidPro, optionally through a local cache")]
#[command(version)]
#[command(group(
  ArgGroup::new("endpoint")
    .required(true)
    .args(["flow_runs", "flows", "contacts"])
))]
struct Args {
  /// Download flow runs
  #[arg(long)]
  flow_runs: bool,

  /// Download flows
  #[arg(long)]
  flows: bool,

  /// Download contacts
  #[arg(long)]
  contacts: bool,

  /// RapidPro API token (default: config file, then $RAPIDPRO_API_TOKEN)
  #[arg(short = 't', long)]
  api_token: Option<String>,

  /// RapidPro server (default: rapidpro.io)
  #[arg(short, long)]
  address: Option<String>,

  /// Download everything older than this ISO 8601 date/time
  #[arg(long, value_parser = parse_timestamp)]
  before: Option<DateTime<Utc>>,

  /// Download everything newer than this ISO 8601 date/time
  #[arg(long, value_parser = parse_timestamp)]
  after: Option<DateTime<Utc>>,

  /// Fetch objects matching UUID (repeatable)
  #[arg(long = "uuid", value_name = "UUID", conflicts_with = "flow_runs")]
  uuids: Vec<String>,

  /// Download the flows of the pulled runs, too
  #[arg(long, conflicts_with_all = ["flows", "contacts"])]
  with_flows: bool,

  /// Download the contacts of the pulled runs, too
  #[arg(long, conflicts_with_all = ["flows", "contacts"])]
  with_contacts: bool,

  /// Use this database as cache, e.g. sqlite:////var/cache/rapidpro.db
  #[arg(long, value_name = "DATABASE_URL")]
  cache: Option<String>,

  /// Path to config file (default: $XDG_CONFIG_HOME/rapidpro-pull/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// More log output on stderr (repeatable)
  #[arg(short, long, action = ArgAction::Count)]
  verbose: u8,
}

impl Args {
  fn kind(&self) -> Kind {
    if self.flows {
      Kind::Flow
    } else if self.contacts {
      Kind::Contact
    } else {
      Kind::Run
    }
  }

  fn request(&self) -> PullRequest {
    let mut associations = BTreeSet::new();
    if self.with_flows {
      associations.insert(Association::Flows);
    }
    if self.with_contacts {
      associations.insert(Association::Contacts);
    }

    PullRequest {
      kind: self.kind(),
      filter: Filter {
        before: self.before,
        after: self.after,
        ids: self.uuids.iter().cloned().collect(),
      },
      associations,
    }
  }
}

/// Usage error for a pull without any API token.
fn missing_token() -> clap::Error {
  Args::command().error(
    ErrorKind::MissingRequiredArgument,
    "RapidPro API token not found. Pass --api-token or set RAPIDPRO_API_TOKEN.",
  )
}

/// Accepts RFC 3339, or a date/time without offset (taken as UTC), or a date.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
  if let Ok(t) = DateTime::parse_from_rfc3339(s) {
    return Ok(t.with_timezone(&Utc));
  }
  if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
    return Ok(t.and_utc());
  }
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|t| t.and_utc())
    .ok_or_else(|| format!("'{}' is not an ISO 8601 date/time", s))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(args.verbose, config.log_file.as_deref())?;

  // Command line overrides the config file
  let token = match args
    .api_token
    .clone()
    .or_else(|| config.api_token.clone())
    .or_else(Config::get_api_token)
  {
    Some(token) => token,
    None => missing_token().exit(),
  };
  let address = args
    .address
    .clone()
    .or_else(|| config.address.clone())
    .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
  let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));

  let client = RapidProClient::new(&address, &token, timeout)?;
  let request = args.request();
  debug!(address = %address, kind = %request.kind, "starting pull");

  let outcome = match args.cache.as_deref().or(config.cache.as_deref()) {
    Some(url) => {
      let store = match CacheLocation::parse(url)? {
        CacheLocation::Memory => SqliteStorage::open_in_memory()?,
        CacheLocation::File(path) => SqliteStorage::open(&path)?,
      };
      PullTask::new(&client, &store).run(&request).await
    }
    None => PullTask::new(&client, &NoopStorage).run(&request).await,
  };

  match outcome {
    Ok(pulled) => {
      let json = serde_json::to_string(&pulled)
        .map_err(|e| eyre!("Failed to serialize result: {}", e))?;
      println!("{}", json);
      Ok(ExitCode::SUCCESS)
    }
    Err(report) => match report.downcast_ref::<RemoteError>() {
      Some(err) => {
        if let RemoteError::Connection { reason } = err {
          error!(reason = %reason, "connection failed");
        }
        eprintln!("{}", err);
        Ok(ExitCode::FAILURE)
      }
      None => Err(report),
    },
  }
}
