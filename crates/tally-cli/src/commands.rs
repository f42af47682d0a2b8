use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Duration;
use colored::{ColoredString, Colorize};
use serde_json::{json, Value};
use tally_ledger::{BackendConfig, Ledger, LedgerConfig, StateRecord};
use tally_store::SyncMode;
use tally_types::{Identity, ItemState};
use tracing::debug;

use crate::cli::*;

const JOURNAL_FILE: &str = "records.journal";

/// What a command produced, rendered once at the end.
enum Output {
    Record(Arc<StateRecord>),
    Records(Vec<Arc<StateRecord>>),
    Count { label: &'static str, count: usize },
    Removed(Identity),
    Hash(Identity),
    Config(String),
}

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let output = match &cli.command {
        Command::Hash(args) => Output::Hash(Identity::of(args.text.as_bytes())),
        Command::Config => Output::Config(ledger_config(&cli)?.to_toml()?),
        command => {
            let config = ledger_config(&cli)?;
            debug!(backend = config.backend.kind(), "opening ledger");
            let ledger = Ledger::open(&config).context("cannot open ledger")?;
            execute(&ledger, command)?
        }
    };
    println!("{}", render(&output, format));
    Ok(())
}

/// The config file if one was given, otherwise a durable journal under
/// the data directory.
fn ledger_config(cli: &Cli) -> anyhow::Result<LedgerConfig> {
    let mut config = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::durable(cli.data_dir.join(JOURNAL_FILE)),
    };
    if cli.fsync {
        if let BackendConfig::Durable { sync, .. } = &mut config.backend {
            *sync = SyncMode::EveryWrite;
        }
    }
    Ok(config)
}

fn execute(ledger: &Ledger, command: &Command) -> anyhow::Result<Output> {
    let output = match command {
        Command::Create(args) => Output::Record(ledger.find_or_create(&args.id)?),
        Command::Get(args) => Output::Record(ledger.record(&args.id)?),
        Command::Approve(args) => transition(ledger, &args.id, StateRecord::approve)?,
        Command::Decline(args) => transition(ledger, &args.id, StateRecord::decline)?,
        Command::Revoke(args) => transition(ledger, &args.id, StateRecord::revoke)?,
        Command::Discard(args) => transition(ledger, &args.id, StateRecord::discard)?,
        Command::Unlock(args) => {
            let record = ledger.record(&args.id)?;
            let reserved = record.state() == ItemState::LockedForCreation;
            record.unlock()?;
            if reserved {
                Output::Removed(args.id)
            } else {
                Output::Record(record)
            }
        }
        Command::Destroy(args) => {
            ledger.record(&args.id)?.destroy()?;
            Output::Removed(args.id)
        }
        Command::Lock(args) => {
            let claimant = ledger.record(&args.claimant)?;
            Output::Record(ledger.lock_to_revoke(claimant.record_key(), &args.target)?)
        }
        Command::Reserve(args) => {
            let owner = ledger.record(&args.owner)?;
            match ledger.create_output_lock_record(owner.record_key(), &args.id)? {
                Some(record) => Output::Record(record),
                None => bail!("{} is already in use", args.id),
            }
        }
        Command::Expire(args) => {
            let expires_at = match (args.in_secs, args.never) {
                (Some(secs), _) => Some(expiry_after(secs)?),
                (None, true) => None,
                (None, false) => bail!("pass --in-secs or --never"),
            };
            let record = ledger.record(&args.id)?;
            record.set_expires_at(expires_at);
            record.save()?;
            Output::Record(record)
        }
        Command::Locks(args) => {
            let holder = ledger.record(&args.id)?;
            Output::Records(ledger.locks_held_by(holder.record_key())?)
        }
        Command::Release(args) => {
            let holder = ledger.record(&args.id)?;
            Output::Count {
                label: "released",
                count: ledger.release_locks(holder.record_key())?,
            }
        }
        Command::Sweep => Output::Count {
            label: "swept",
            count: ledger.sweep_expired()?,
        },
        Command::Compact => Output::Count {
            label: "kept",
            count: ledger.compact()?,
        },
        Command::Count => Output::Count {
            label: "records",
            count: ledger.record_count()?,
        },
        Command::Hash(args) => Output::Hash(Identity::of(args.text.as_bytes())),
        Command::Config => bail!("config does not need an open ledger"),
    };
    Ok(output)
}

/// The instant `secs` seconds from now, refusing offsets chrono cannot represent.
fn expiry_after(secs: i64) -> anyhow::Result<tally_types::Timestamp> {
    Duration::try_seconds(secs)
        .and_then(|offset| tally_types::now().checked_add_signed(offset))
        .with_context(|| format!("--in-secs {secs} is out of range"))
}

fn transition(
    ledger: &Ledger,
    id: &Identity,
    apply: fn(&StateRecord) -> tally_ledger::LedgerResult<()>,
) -> anyhow::Result<Output> {
    let record = ledger.record(id)?;
    apply(&record)?;
    Ok(Output::Record(record))
}

fn render(output: &Output, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => render_json(output).to_string(),
        OutputFormat::Text => render_text(output),
    }
}

fn render_json(output: &Output) -> Value {
    match output {
        Output::Record(record) => record_json(record),
        Output::Records(records) => {
            Value::Array(records.iter().map(|r| record_json(r)).collect())
        }
        Output::Count { label, count } => {
            let mut map = serde_json::Map::new();
            map.insert(label.to_string(), json!(count));
            Value::Object(map)
        }
        Output::Removed(id) => json!({ "removed": id.to_hex() }),
        Output::Hash(id) => json!({ "id": id.to_hex() }),
        Output::Config(text) => json!({ "config": text }),
    }
}

fn record_json(record: &StateRecord) -> Value {
    json!({
        "id": record.id().to_hex(),
        "key": record.record_key().get(),
        "state": record.state().as_str(),
        "created_at": record.created_at().to_rfc3339(),
        "expires_at": record.expires_at().map(|at| at.to_rfc3339()),
        "locked_by": record.locked_by().map(|key| key.get()),
        "revision": record.revision(),
    })
}

fn render_text(output: &Output) -> String {
    match output {
        Output::Record(record) => record_text(record),
        Output::Records(records) if records.is_empty() => "no locks held".dimmed().to_string(),
        Output::Records(records) => records
            .iter()
            .map(|r| record_text(r))
            .collect::<Vec<_>>()
            .join("\n\n"),
        Output::Count { label, count } => format!("{} {count} {label}", "✓".green().bold()),
        Output::Removed(id) => format!("{} removed {}", "✓".green().bold(), id.to_hex()),
        Output::Hash(id) => id.to_hex(),
        Output::Config(text) => text.trim_end().to_string(),
    }
}

fn record_text(record: &StateRecord) -> String {
    let mut lines = vec![format!(
        "{} {}",
        paint(record.state()),
        record.id().to_hex().bold()
    )];
    lines.push(format!("  key        {}", record.record_key()));
    lines.push(format!("  revision   {}", record.revision()));
    lines.push(format!("  created    {}", record.created_at().to_rfc3339()));
    if let Some(at) = record.expires_at() {
        lines.push(format!("  expires    {}", at.to_rfc3339()));
    }
    if let Some(holder) = record.locked_by() {
        lines.push(format!("  locked by  {}", holder.to_string().yellow()));
    }
    lines.join("\n")
}

fn paint(state: ItemState) -> ColoredString {
    let label = state.as_str().to_uppercase();
    match state {
        ItemState::Pending => label.yellow(),
        ItemState::Approved => label.green().bold(),
        ItemState::Locked | ItemState::LockedForCreation => label.cyan(),
        ItemState::Declined | ItemState::Discarded => label.dimmed(),
        ItemState::Revoked => label.red(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::*;

    fn run(ledger: &Ledger, args: &[&str]) -> anyhow::Result<Value> {
        let cli = Cli::try_parse_from(std::iter::once("tally").chain(args.iter().copied()))?;
        Ok(render_json(&execute(ledger, &cli.command)?))
    }

    #[test]
    fn create_and_approve() {
        let ledger = Ledger::in_memory();
        let created = run(&ledger, &["create", "@coin"]).unwrap();
        assert_eq!(created["state"], "pending");
        assert_eq!(created["id"], Identity::of(b"coin").to_hex());

        let approved = run(&ledger, &["approve", "@coin"]).unwrap();
        assert_eq!(approved["state"], "approved");
        assert_eq!(approved["revision"], 1);
        assert!(run(&ledger, &["decline", "@coin"]).is_err());
    }

    #[test]
    fn get_missing_fails() {
        let ledger = Ledger::in_memory();
        let err = run(&ledger, &["get", "@ghost"]).unwrap_err();
        assert!(err.to_string().contains("no live record"));
    }

    #[test]
    fn lock_reserve_and_release() {
        let ledger = Ledger::in_memory();
        run(&ledger, &["create", "@tx"]).unwrap();
        run(&ledger, &["create", "@coin"]).unwrap();
        run(&ledger, &["approve", "@coin"]).unwrap();

        let locked = run(&ledger, &["lock", "--claimant", "@tx", "@coin"]).unwrap();
        assert_eq!(locked["state"], "locked");
        let reserved = run(&ledger, &["reserve", "--owner", "@tx", "@out"]).unwrap();
        assert_eq!(reserved["state"], "locked_for_creation");
        assert_eq!(reserved["locked_by"], locked["locked_by"]);
        assert!(run(&ledger, &["reserve", "--owner", "@coin", "@out"]).is_err());

        let held = run(&ledger, &["locks", "@tx"]).unwrap();
        assert_eq!(held.as_array().unwrap().len(), 2);
        assert_eq!(run(&ledger, &["release", "@tx"]).unwrap()["released"], 2);
        assert_eq!(run(&ledger, &["get", "@coin"]).unwrap()["state"], "approved");
        assert!(run(&ledger, &["get", "@out"]).is_err());
    }

    #[test]
    fn unlock_reservation_removes_it() {
        let ledger = Ledger::in_memory();
        run(&ledger, &["create", "@tx"]).unwrap();
        run(&ledger, &["reserve", "--owner", "@tx", "@out"]).unwrap();
        let out = run(&ledger, &["unlock", "@out"]).unwrap();
        assert_eq!(out["removed"], Identity::of(b"out").to_hex());
        assert_eq!(run(&ledger, &["count"]).unwrap()["records"], 1);
    }

    #[test]
    fn expired_record_disappears() {
        let ledger = Ledger::in_memory();
        run(&ledger, &["create", "@old"]).unwrap();
        run(&ledger, &["expire", "@old", "--in-secs", "-1"]).unwrap();
        assert!(run(&ledger, &["get", "@old"]).is_err());
        assert_eq!(run(&ledger, &["sweep"]).unwrap()["swept"], 1);
        assert!(run(&ledger, &["expire", "@missing"]).is_err());
    }

    #[test]
    fn out_of_range_expiry_is_an_error() {
        let ledger = Ledger::in_memory();
        run(&ledger, &["create", "@far"]).unwrap();
        for secs in [i64::MAX, i64::MIN, i64::MAX / 1000] {
            let secs = secs.to_string();
            let err = run(&ledger, &["expire", "@far", "--in-secs", &secs]).unwrap_err();
            assert!(err.to_string().contains("out of range"), "{err}");
        }
        assert_eq!(run(&ledger, &["get", "@far"]).unwrap()["expires_at"], Value::Null);
    }

    #[test]
    fn fsync_applies_to_durable_backend() {
        let cli =
            Cli::try_parse_from(["tally", "count", "--data-dir", "/srv/t", "--fsync"]).unwrap();
        let config = ledger_config(&cli).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Durable {
                path: PathBuf::from("/srv/t").join(JOURNAL_FILE),
                sync: SyncMode::EveryWrite,
            }
        );
    }

    #[test]
    fn state_survives_between_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let open = || {
            let cli = Cli::try_parse_from(["tally", "count", "--data-dir", data_dir]).unwrap();
            Ledger::open(&ledger_config(&cli).unwrap()).unwrap()
        };

        run(&open(), &["create", "@coin"]).unwrap();
        run(&open(), &["approve", "@coin"]).unwrap();
        assert_eq!(run(&open(), &["get", "@coin"]).unwrap()["state"], "approved");
        assert_eq!(run(&open(), &["compact"]).unwrap()["kept"], 1);
    }
}
