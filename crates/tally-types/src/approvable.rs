use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Category of a problem found while checking an [`Approvable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    FailedCheck,
    BadValue,
    BadRevoke,
    BadNewItem,
    Forbidden,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailedCheck => "failed_check",
            Self::BadValue => "bad_value",
            Self::BadRevoke => "bad_revoke",
            Self::BadNewItem => "bad_new_item",
            Self::Forbidden => "forbidden",
        };
        f.write_str(s)
    }
}

/// One accumulated validation problem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    /// Name of the offending object or field, may be empty.
    pub object: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(code: ErrorCode, object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            object: object.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.object.is_empty() {
            write!(f, "{}: {}", self.code, self.message)
        } else {
            write!(f, "{} [{}]: {}", self.code, self.object, self.message)
        }
    }
}

/// Anything the network can approve.
///
/// The consensus layer stages an approvable's effects against the ledger:
/// referenced items stay valid for the duration of the vote, revoking items
/// are exclusively locked and revoked on success, new items are reserved and
/// approved on success. An approvable with neither revoking nor new items
/// does not change the ledger.
pub trait Approvable {
    fn id(&self) -> Identity;

    /// Items that must stay valid until consensus is found.
    fn referenced_items(&self) -> BTreeSet<Identity> {
        BTreeSet::new()
    }

    /// Items revoked on positive consensus.
    fn revoking_items(&self) -> BTreeSet<Identity> {
        BTreeSet::new()
    }

    /// Items created on positive consensus, besides the approvable itself.
    fn new_items(&self) -> BTreeSet<Identity> {
        BTreeSet::new()
    }

    /// Check the item assuming everything it mentions is valid.
    fn check(&mut self) -> bool;

    fn add_error(&mut self, _record: ErrorRecord) {}

    fn errors(&self) -> &[ErrorRecord] {
        &[]
    }

    fn report(&mut self, code: ErrorCode, object: &str, message: &str) {
        self.add_error(ErrorRecord::new(code, object, message));
    }

    fn changes_ledger(&self) -> bool {
        !self.revoking_items().is_empty() || !self.new_items().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Transfer {
        id: Identity,
        spends: Identity,
        errors: Vec<ErrorRecord>,
    }

    impl Approvable for Transfer {
        fn id(&self) -> Identity {
            self.id
        }

        fn revoking_items(&self) -> BTreeSet<Identity> {
            BTreeSet::from([self.spends])
        }

        fn new_items(&self) -> BTreeSet<Identity> {
            BTreeSet::from([Identity::of(self.id.as_bytes())])
        }

        fn check(&mut self) -> bool {
            if self.spends == self.id {
                self.report(ErrorCode::BadRevoke, "spends", "item cannot revoke itself");
            }
            self.errors.is_empty()
        }

        fn add_error(&mut self, record: ErrorRecord) {
            self.errors.push(record);
        }

        fn errors(&self) -> &[ErrorRecord] {
            &self.errors
        }
    }

    #[test]
    fn errors_accumulate_through_report() {
        let id = Identity::of(b"self-spend");
        let mut t = Transfer {
            id,
            spends: id,
            errors: vec![],
        };
        assert!(!t.check());
        assert_eq!(t.errors().len(), 1);
        assert_eq!(
            t.errors()[0].to_string(),
            "bad_revoke [spends]: item cannot revoke itself"
        );
    }

    #[test]
    fn default_sets_are_empty() {
        struct Reader(Identity);
        impl Approvable for Reader {
            fn id(&self) -> Identity {
                self.0
            }
            fn check(&mut self) -> bool {
                true
            }
        }

        let mut r = Reader(Identity::random());
        r.add_error(ErrorRecord::new(ErrorCode::BadValue, "", "ignored"));
        assert!(r.errors().is_empty());
        assert!(r.check());
        assert!(!r.changes_ledger());
    }

    #[test]
    fn code_names_match_serde() {
        for code in [
            ErrorCode::FailedCheck,
            ErrorCode::BadValue,
            ErrorCode::BadRevoke,
            ErrorCode::BadNewItem,
            ErrorCode::Forbidden,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{code}\""));
        }
    }

    #[test]
    fn transfer_changes_ledger() {
        let t = Transfer {
            id: Identity::of(b"a"),
            spends: Identity::of(b"b"),
            errors: vec![],
        };
        assert!(t.changes_ledger());
        assert!(t.referenced_items().is_empty());
    }
}
