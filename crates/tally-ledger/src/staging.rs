use std::sync::Arc;

use tally_types::{Approvable, ErrorCode, ItemState};
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::record::StateRecord;
use crate::transaction::TxOutcome;

/// Ledger state held for one approvable while consensus decides on it:
/// its own PENDING record, revocation locks on what it spends and
/// reservations for what it creates.
#[derive(Debug)]
pub struct StagedItem {
    ledger: Ledger,
    record: Arc<StateRecord>,
    revoking: Vec<Arc<StateRecord>>,
    created: Vec<Arc<StateRecord>>,
}

impl StagedItem {
    pub fn record(&self) -> &Arc<StateRecord> {
        &self.record
    }

    pub fn revoking(&self) -> &[Arc<StateRecord>] {
        &self.revoking
    }

    pub fn created(&self) -> &[Arc<StateRecord>] {
        &self.created
    }

    /// Positive consensus: revoke what was locked, approve what was
    /// reserved and the item itself, all in one transaction.
    pub fn approve(self) -> LedgerResult<()> {
        self.ledger.transaction(|| {
            for record in &self.revoking {
                record.revoke()?;
            }
            for record in &self.created {
                record.set_state(ItemState::Approved)?;
                record.save()?;
            }
            self.record.approve()?;
            Ok(TxOutcome::Commit(()))
        })?;
        debug!(item = %self.record.id(), "staged item approved");
        Ok(())
    }

    /// Negative consensus: release every lock and reservation and decline
    /// the item, all in one transaction.
    pub fn decline(self) -> LedgerResult<()> {
        self.ledger.transaction(|| {
            for record in self.revoking.iter().chain(&self.created) {
                record.unlock()?;
            }
            self.record.decline()?;
            Ok(TxOutcome::Commit(()))
        })?;
        debug!(item = %self.record.id(), "staged item declined");
        Ok(())
    }
}

impl Ledger {
    /// Check `item` and take everything its effects need.
    ///
    /// Referenced items must be APPROVED, items to revoke must be APPROVED
    /// (or already locked by this item) and are locked for revocation, and
    /// new identities must be free and are reserved. Any failure is reported
    /// on `item`, nothing is kept, and the result is `None`. Storage failures
    /// are returned as errors.
    pub fn stage(&self, item: &mut dyn Approvable) -> LedgerResult<Option<StagedItem>> {
        if !item.check() {
            return Ok(None);
        }
        let id = item.id();
        let staged = self.transaction(|| {
            let record = self.find_or_create(&id)?;
            if !record.is_pending() {
                item.report(ErrorCode::Forbidden, &id.short_id(), "item is already resolved");
                return Ok(TxOutcome::Rollback);
            }

            for referenced in item.referenced_items() {
                let approved = self
                    .get_record(&referenced)?
                    .is_some_and(|r| r.is_approved());
                if !approved {
                    item.report(
                        ErrorCode::BadValue,
                        &referenced.short_id(),
                        "referenced item is not approved",
                    );
                    return Ok(TxOutcome::Rollback);
                }
            }

            let mut revoking = Vec::new();
            for target in item.revoking_items() {
                let spendable = self.get_record(&target)?.is_some_and(|r| {
                    r.is_approved() || r.locked_by() == Some(record.record_key())
                });
                if !spendable {
                    item.report(
                        ErrorCode::BadRevoke,
                        &target.short_id(),
                        "item to revoke is not approved",
                    );
                    return Ok(TxOutcome::Rollback);
                }
                match record.lock_to_revoke(&target) {
                    Ok(locked) => revoking.push(locked),
                    Err(err @ LedgerError::LockConflict { .. }) => {
                        item.report(ErrorCode::BadRevoke, &target.short_id(), &err.to_string());
                        return Ok(TxOutcome::Rollback);
                    }
                    Err(err) => return Err(err),
                }
            }

            let mut created = Vec::new();
            for new_id in item.new_items() {
                match record.create_output_lock_record(&new_id)? {
                    Some(reserved) => created.push(reserved),
                    None => {
                        item.report(
                            ErrorCode::BadNewItem,
                            &new_id.short_id(),
                            "identity is already in use",
                        );
                        return Ok(TxOutcome::Rollback);
                    }
                }
            }

            Ok(TxOutcome::Commit(StagedItem {
                ledger: self.clone(),
                record,
                revoking,
                created,
            }))
        })?;

        if staged.is_none() {
            debug!(item = %id, "staging refused");
        }
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use tally_types::{ErrorRecord, Identity};

    use super::*;

    struct Transfer {
        id: Identity,
        spends: Identity,
        mints: Identity,
        valid: bool,
        errors: Vec<ErrorRecord>,
    }

    impl Transfer {
        fn new(seed: &[u8], spends: Identity) -> Self {
            Self {
                id: Identity::of(seed),
                spends,
                mints: Identity::of(&[seed, b"/out".as_slice()].concat()),
                valid: true,
                errors: vec![],
            }
        }
    }

    impl Approvable for Transfer {
        fn id(&self) -> Identity {
            self.id
        }

        fn revoking_items(&self) -> BTreeSet<Identity> {
            BTreeSet::from([self.spends])
        }

        fn new_items(&self) -> BTreeSet<Identity> {
            BTreeSet::from([self.mints])
        }

        fn check(&mut self) -> bool {
            if !self.valid {
                self.report(ErrorCode::FailedCheck, "", "signature mismatch");
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

    fn approved_coin(ledger: &Ledger, seed: &[u8]) -> Identity {
        let coin = ledger.find_or_create(&Identity::of(seed)).unwrap();
        coin.approve().unwrap();
        coin.id()
    }

    #[test]
    fn approved_transfer_spends_and_mints() {
        let ledger = Ledger::in_memory();
        let coin = approved_coin(&ledger, b"coin");
        let mut transfer = Transfer::new(b"transfer", coin);

        let staged = ledger.stage(&mut transfer).unwrap().unwrap();
        assert_eq!(staged.revoking()[0].state(), ItemState::Locked);
        assert_eq!(staged.created()[0].state(), ItemState::LockedForCreation);
        assert!(staged.record().is_pending());
        staged.approve().unwrap();

        assert!(ledger.record(&coin).unwrap().is_archived());
        assert!(ledger.record(&transfer.mints).unwrap().is_approved());
        assert!(ledger.record(&transfer.id).unwrap().is_approved());
        assert_eq!(ledger.record(&transfer.mints).unwrap().locked_by(), None);
    }

    #[test]
    fn double_spend_loses() {
        let ledger = Ledger::in_memory();
        let coin = approved_coin(&ledger, b"coin");
        let mut first = Transfer::new(b"first", coin);
        let mut second = Transfer::new(b"second", coin);

        let staged = ledger.stage(&mut first).unwrap().unwrap();
        assert!(ledger.stage(&mut second).unwrap().is_none());
        assert_eq!(second.errors()[0].code, ErrorCode::BadRevoke);

        // The loser keeps nothing.
        assert!(ledger.get_record(&second.id).unwrap().is_none());
        assert!(ledger.get_record(&second.mints).unwrap().is_none());

        staged.decline().unwrap();
        assert!(ledger.record(&coin).unwrap().is_approved());
        assert!(ledger.get_record(&first.mints).unwrap().is_none());
        assert_eq!(
            ledger.record(&first.id).unwrap().state(),
            ItemState::Declined
        );
    }

    #[test]
    fn failed_check_touches_nothing() {
        let ledger = Ledger::in_memory();
        let coin = approved_coin(&ledger, b"coin");
        let mut transfer = Transfer::new(b"forged", coin);
        transfer.valid = false;

        assert!(ledger.stage(&mut transfer).unwrap().is_none());
        assert_eq!(transfer.errors()[0].code, ErrorCode::FailedCheck);
        assert_eq!(ledger.record_count().unwrap(), 1);
    }

    #[test]
    fn taken_output_rolls_back_locks() {
        let ledger = Ledger::in_memory();
        let coin = approved_coin(&ledger, b"coin");
        let mut transfer = Transfer::new(b"transfer", coin);
        ledger.find_or_create(&transfer.mints).unwrap();

        assert!(ledger.stage(&mut transfer).unwrap().is_none());
        assert_eq!(transfer.errors()[0].code, ErrorCode::BadNewItem);
        let coin = ledger.record(&coin).unwrap();
        assert!(coin.is_approved());
        assert_eq!(coin.locked_by(), None);
    }

    #[test]
    fn unknown_spend_is_refused() {
        let ledger = Ledger::in_memory();
        let mut transfer = Transfer::new(b"transfer", Identity::of(b"nothing"));

        assert!(ledger.stage(&mut transfer).unwrap().is_none());
        assert_eq!(transfer.errors()[0].code, ErrorCode::BadRevoke);
        assert!(ledger.get_record(&Identity::of(b"nothing")).unwrap().is_none());
    }
}
