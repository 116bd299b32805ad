//! Ledger and provenance tests across threads and operation sequences.
//!
//! These tests check that the audit trail always reconciles with the stored
//! balance, that no debit is ever partial, and that trial attribution never
//! exceeds what was granted as trial.

#[cfg(test)]
mod tests {
    use crate::ledger::{LedgerStore, Mutation};
    use crate::metrics::EconomyMetrics;
    use crate::store::testing::{test_store, test_store_with, TestStore};
    use crate::store::StoreConfig;
    use crate::EconomyError;
    use proptest::prelude::*;
    use rusqlite::{Connection, TransactionBehavior};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use vaultline_types::TokenKind;

    const USER: u64 = 7;
    const TOKEN: TokenKind = TokenKind::DiceTicket;

    fn ledger(ts: &TestStore) -> LedgerStore {
        LedgerStore::new(ts.store.clone(), Arc::new(EconomyMetrics::default()))
    }

    #[test]
    fn test_concurrent_consumes_both_succeed_and_reconcile() {
        let ts = test_store();
        let ledger = ledger(&ts);
        ledger
            .grant(Mutation::new(USER, TOKEN, 100, "SEED"))
            .expect("grant");

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ledger.consume(Mutation::new(USER, TOKEN, 30, "PLAY"))
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join").expect("consume");
        }

        assert_eq!(ledger.balance(USER, TOKEN).expect("balance"), 40);
        let debits: Vec<i64> = ledger
            .entries(USER, TOKEN)
            .expect("entries")
            .iter()
            .map(|entry| entry.delta)
            .filter(|delta| *delta < 0)
            .collect();
        assert_eq!(debits, vec![-30, -30]);
        assert!(ledger.reconcile(USER, TOKEN).expect("reconcile").is_balanced());
    }

    #[test]
    fn test_insufficient_balance_leaves_no_trace() {
        let ts = test_store();
        let ledger = ledger(&ts);
        ledger
            .grant(Mutation::new(USER, TOKEN, 20, "SEED"))
            .expect("grant");

        let err = ledger
            .consume(Mutation::new(USER, TOKEN, 30, "PLAY"))
            .expect_err("should fail");
        match err {
            EconomyError::InsufficientBalance {
                needed, available, ..
            } => {
                assert_eq!(needed, 30);
                assert_eq!(available, 20);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(ledger.balance(USER, TOKEN).expect("balance"), 20);
        assert_eq!(ledger.entries(USER, TOKEN).expect("entries").len(), 1);
    }

    #[test]
    fn test_oversubscribed_consumes_never_go_negative() {
        let ts = test_store();
        let ledger = ledger(&ts);
        ledger
            .grant(Mutation::new(USER, TOKEN, 10, "SEED"))
            .expect("grant");

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let ledger = ledger.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    ledger.consume(Mutation::new(USER, TOKEN, 2, "PLAY"))
                })
            })
            .collect();
        let mut succeeded = 0;
        for handle in handles {
            match handle.join().expect("join") {
                Ok(_) => succeeded += 1,
                Err(EconomyError::InsufficientBalance { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(succeeded, 5);
        assert_eq!(ledger.balance(USER, TOKEN).expect("balance"), 0);
        assert!(ledger.reconcile(USER, TOKEN).expect("reconcile").is_balanced());
    }

    #[test]
    fn test_zero_amount_is_rejected_before_any_write() {
        let ts = test_store();
        let ledger = ledger(&ts);
        for result in [
            ledger.grant(Mutation::new(USER, TOKEN, 0, "SEED")),
            ledger.revoke(Mutation::new(USER, TOKEN, 0, "ADMIN_REVOKE")),
        ] {
            assert!(matches!(result, Err(EconomyError::InvalidAmount(0))));
        }
        assert!(matches!(
            ledger.consume(Mutation::new(USER, TOKEN, 0, "PLAY")),
            Err(EconomyError::InvalidAmount(0))
        ));
        assert!(ledger.entries(USER, TOKEN).expect("entries").is_empty());
    }

    #[test]
    fn test_balance_materializes_zero_account() {
        let ts = test_store();
        let ledger = ledger(&ts);
        let account = ledger.account(USER, TokenKind::GoldKey).expect("account");
        assert_eq!(account.balance, 0);
        assert_eq!(account.updated_at_ms, 1_000);
        assert!(ledger
            .reconcile(USER, TokenKind::GoldKey)
            .expect("reconcile")
            .is_balanced());
    }

    #[test]
    fn test_consume_attributes_trial_units_partially() {
        let ts = test_store();
        let ledger = ledger(&ts);
        ledger
            .grant(Mutation::new(USER, TOKEN, 2, "PURCHASE"))
            .expect("grant");
        ledger
            .grant_trial(Mutation::new(USER, TOKEN, 3, "FIRST_FREE_PLAY"))
            .expect("trial grant");

        let first = ledger
            .consume(Mutation::new(USER, TOKEN, 4, "PLAY"))
            .expect("consume");
        assert_eq!(first.trial_units, 3);
        assert!(first.consumed_from_trial());

        let second = ledger
            .consume(Mutation::new(USER, TOKEN, 1, "PLAY"))
            .expect("consume");
        assert_eq!(second.trial_units, 0);
        assert!(!second.consumed_from_trial());

        let entries = ledger.entries(USER, TOKEN).expect("entries");
        let last = entries.last().expect("entry");
        assert_eq!(last.meta["consumed_from_trial"], false);
        assert_eq!(entries[2].meta["trial_units"], 3);
        assert_eq!(entries[1].meta["trial_grant"], true);
    }

    #[test]
    fn test_revoke_does_not_attribute_trial_units() {
        let ts = test_store();
        let ledger = ledger(&ts);
        ledger
            .grant(Mutation::new(USER, TOKEN, 5, "PURCHASE"))
            .expect("grant");
        ledger
            .grant_trial(Mutation::new(USER, TOKEN, 2, "FIRST_FREE_PLAY"))
            .expect("trial grant");

        ledger
            .revoke(Mutation::new(USER, TOKEN, 3, "ADMIN_REVOKE").with_label("chargeback"))
            .expect("revoke");
        assert_eq!(ledger.trial_bucket(USER, TOKEN).expect("bucket").balance, 2);

        ledger
            .revoke(Mutation::new(USER, TOKEN, 3, "ADMIN_REVOKE"))
            .expect("revoke");
        assert_eq!(ledger.balance(USER, TOKEN).expect("balance"), 1);
        assert_eq!(ledger.trial_bucket(USER, TOKEN).expect("bucket").balance, 1);
    }

    #[test]
    fn test_balance_reads_while_writer_holds_lock() {
        let ts = test_store_with(StoreConfig {
            lock_timeout: Duration::from_millis(50),
            max_idle_connections: 4,
        });
        let ledger = ledger(&ts);
        ledger
            .grant(Mutation::new(USER, TOKEN, 4, "SEED"))
            .expect("grant");

        let mut holder = Connection::open(ts.store.path()).expect("holder");
        let held = holder
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .expect("hold lock");
        assert_eq!(ledger.balance(USER, TOKEN).expect("balance"), 4);
        assert_eq!(ledger.balance(9, TokenKind::Diamond).expect("unknown account"), 0);
        assert!(matches!(
            ledger.grant(Mutation::new(USER, TOKEN, 1, "SEED")),
            Err(EconomyError::LockNotAcquired { .. })
        ));
        held.rollback().expect("release");
    }

    #[test]
    fn test_grant_with_source_key_applies_once() {
        let ts = test_store();
        let ledger = ledger(&ts);
        let reward = || Mutation::new(USER, TokenKind::GoldKey, 2, "MISSION_REWARD").with_source_key("MISSION:DAILY:1");
        assert_eq!(ledger.grant(reward()).expect("first"), 2);
        assert_eq!(ledger.grant(reward()).expect("again"), 2);
        assert_eq!(
            ledger
                .grant(Mutation::new(USER, TokenKind::GoldKey, 2, "MISSION_REWARD").with_source_key("MISSION:DAILY:2"))
                .expect("next claim"),
            4
        );
        assert_eq!(ledger.entries(USER, TokenKind::GoldKey).expect("entries").len(), 2);
    }

    #[test]
    fn test_revoke_requires_balance() {
        let ts = test_store();
        let ledger = ledger(&ts);
        assert!(matches!(
            ledger.revoke(Mutation::new(USER, TOKEN, 1, "ADMIN_REVOKE")),
            Err(EconomyError::InsufficientBalance { available: 0, .. })
        ));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Grant(u64),
        GrantTrial(u64),
        Consume(u64),
        Revoke(u64),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..50).prop_map(Op::Grant),
            (1u64..50).prop_map(Op::GrantTrial),
            (1u64..50).prop_map(Op::Consume),
            (1u64..50).prop_map(Op::Revoke),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Property: any operation sequence keeps the ledger reconciled, the
        /// balance equal to a simple model, and the trial bucket within
        /// `trial granted - trial consumed` and the balance.
        #[test]
        fn prop_ledger_reconciles_and_caps_provenance(ops in prop::collection::vec(arb_op(), 1..25)) {
            let ts = test_store();
            let ledger = ledger(&ts);
            let mut balance: u64 = 0;
            let mut trial_granted: u64 = 0;
            let mut trial_consumed: u64 = 0;

            for op in ops {
                match op {
                    Op::Grant(amount) => {
                        balance = ledger.grant(Mutation::new(USER, TOKEN, amount, "GRANT")).expect("grant");
                    }
                    Op::GrantTrial(amount) => {
                        balance = ledger.grant_trial(Mutation::new(USER, TOKEN, amount, "TRIAL")).expect("trial");
                        trial_granted += amount;
                    }
                    Op::Consume(amount) => match ledger.consume(Mutation::new(USER, TOKEN, amount, "PLAY")) {
                        Ok(outcome) => {
                            prop_assert_eq!(outcome.balance, balance - amount);
                            balance = outcome.balance;
                            trial_consumed += outcome.trial_units;
                        }
                        Err(EconomyError::InsufficientBalance { available, .. }) => {
                            prop_assert!(amount > balance);
                            prop_assert_eq!(available, balance);
                        }
                        Err(other) => return Err(TestCaseError::fail(other.to_string())),
                    },
                    Op::Revoke(amount) => match ledger.revoke(Mutation::new(USER, TOKEN, amount, "REVOKE")) {
                        Ok(next) => balance = next,
                        Err(EconomyError::InsufficientBalance { .. }) => prop_assert!(amount > balance),
                        Err(other) => return Err(TestCaseError::fail(other.to_string())),
                    },
                }

                let reconciliation = ledger.reconcile(USER, TOKEN).expect("reconcile");
                prop_assert!(reconciliation.is_balanced());
                prop_assert_eq!(reconciliation.balance, balance);
                let bucket = ledger.trial_bucket(USER, TOKEN).expect("bucket").balance;
                prop_assert!(bucket <= trial_granted - trial_consumed);
                prop_assert!(bucket <= balance);
            }
        }
    }
}
