use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tally_types::Identity;

#[derive(Parser)]
#[command(name = "tally", about = "Tally - state ledger for approvable items", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the record journal
    #[arg(long, global = true, default_value = ".tally")]
    pub data_dir: PathBuf,

    /// Ledger configuration file (overrides --data-dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// fsync the journal after every write
    #[arg(long, global = true)]
    pub fsync: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Find the record for an identity, creating it PENDING if absent
    Create(IdArgs),
    /// Show the live record for an identity
    Get(IdArgs),
    /// PENDING -> APPROVED
    Approve(IdArgs),
    /// PENDING -> DECLINED
    Decline(IdArgs),
    /// Revoke an item (PENDING, LOCKED or APPROVED -> REVOKED)
    Revoke(IdArgs),
    /// PENDING, DECLINED or LOCKED_FOR_CREATION -> DISCARDED
    Discard(IdArgs),
    /// Lock a target for revocation on behalf of a claimant
    Lock(LockArgs),
    /// Reserve an identity for creation on behalf of an owner
    Reserve(ReserveArgs),
    /// Release the lock a record is in
    Unlock(IdArgs),
    /// Remove a record
    Destroy(IdArgs),
    /// Set or clear a record's expiry
    Expire(ExpireArgs),
    /// List the records a holder has locked
    Locks(IdArgs),
    /// Release every lock a holder has taken
    Release(IdArgs),
    /// Purge expired records
    Sweep,
    /// Drop expired records and rewrite the journal as a snapshot
    Compact,
    /// Count live records
    Count,
    /// Print the identity of a piece of text
    Hash(HashArgs),
    /// Print the effective ledger configuration as TOML
    Config,
}

/// Identities are 64 hex digits (optionally prefixed `id:`), or `@text`
/// for the identity of `text`.
pub fn parse_identity(s: &str) -> Result<Identity, String> {
    match s.strip_prefix('@') {
        Some(text) => Ok(Identity::of(text.as_bytes())),
        None => Identity::from_hex(s).map_err(|e| e.to_string()),
    }
}

#[derive(Args)]
pub struct IdArgs {
    #[arg(value_parser = parse_identity)]
    pub id: Identity,
}

#[derive(Args)]
pub struct LockArgs {
    /// Record taking the lock
    #[arg(long, value_parser = parse_identity)]
    pub claimant: Identity,
    /// Item to lock
    #[arg(value_parser = parse_identity)]
    pub target: Identity,
}

#[derive(Args)]
pub struct ReserveArgs {
    /// Record owning the reservation
    #[arg(long, value_parser = parse_identity)]
    pub owner: Identity,
    /// Identity to reserve
    #[arg(value_parser = parse_identity)]
    pub id: Identity,
}

#[derive(Args)]
pub struct ExpireArgs {
    #[arg(value_parser = parse_identity)]
    pub id: Identity,
    /// Seconds from now; zero or negative expires immediately
    #[arg(long, allow_hyphen_values = true, conflicts_with = "never")]
    pub in_secs: Option<i64>,
    /// Clear the expiry
    #[arg(long)]
    pub never: bool,
}

#[derive(Args)]
pub struct HashArgs {
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn parse_create_hex() {
        let cli = Cli::try_parse_from(["tally", "create", HEX]).unwrap();
        if let Command::Create(args) = cli.command {
            assert_eq!(args.id, Identity::from_digest([1; 32]));
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_text_identity() {
        let cli = Cli::try_parse_from(["tally", "get", "@coin"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.id, Identity::of(b"coin"));
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn bad_identity_is_rejected() {
        assert!(Cli::try_parse_from(["tally", "get", "zz"]).is_err());
        assert!(Cli::try_parse_from(["tally", "get", "abcd"]).is_err());
    }

    #[test]
    fn parse_lock() {
        let cli = Cli::try_parse_from(["tally", "lock", "--claimant", "@tx", "@coin"]).unwrap();
        if let Command::Lock(args) = cli.command {
            assert_eq!(args.claimant, Identity::of(b"tx"));
            assert_eq!(args.target, Identity::of(b"coin"));
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_expire_negative() {
        let cli = Cli::try_parse_from(["tally", "expire", "@coin", "--in-secs", "-5"]).unwrap();
        if let Command::Expire(args) = cli.command {
            assert_eq!(args.in_secs, Some(-5));
            assert!(!args.never);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn expire_flags_conflict() {
        assert!(
            Cli::try_parse_from(["tally", "expire", "@coin", "--in-secs", "5", "--never"])
                .is_err()
        );
    }

    #[test]
    fn global_flags() {
        let cli = Cli::try_parse_from([
            "tally", "count", "--format", "json", "--data-dir", "/tmp/t", "-v",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/t"));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Count));
    }
}
