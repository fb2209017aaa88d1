//! CLI command tests
//!
//! This module contains all tests for the CLI commands.

use chrono::NaiveDate;
use tally_core::config::BackendKind;
use tally_core::db::Database;
use tally_core::models::{Classification, ClassificationStatus, RuleState, Transaction};
use tally_core::{CancelToken, CheckpointManager, Config, ScriptedPrompter};

use crate::commands::{self, truncate};

fn setup_test_db() -> Database {
    let db = Database::in_memory().unwrap();
    db.seed_default_categories().unwrap();
    db
}

fn mock_config() -> Config {
    let mut config = Config::default();
    config.ai.backend = BackendKind::Mock;
    config
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, day).unwrap()
}

fn insert_sample_transactions(db: &Database) {
    db.insert_transactions(&[
        Transaction::new("1", date(1), "NETFLIX.COM", 15.49),
        Transaction::new("2", date(2), "STARBUCKS #881", 5.25),
        Transaction::new("3", date(3), "HARDWARE HUT", 42.0),
        Transaction::new("4", date(4), "HARDWARE HUT", 18.0),
    ])
    .unwrap();
}

// ========== Core Command Tests ==========

#[test]
fn test_cmd_init_seeds_categories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tally.db");

    commands::cmd_init(&path, true).unwrap();

    let db = commands::open_db(&path, true).unwrap();
    assert_eq!(db.count_categories().unwrap(), 17);

    // Running init again is harmless
    drop(db);
    commands::cmd_init(&path, true).unwrap();
    let db = commands::open_db(&path, true).unwrap();
    assert_eq!(db.count_categories().unwrap(), 17);
}

#[test]
fn test_cmd_categories() {
    let db = setup_test_db();
    assert!(commands::cmd_categories(&db).is_ok());
}

#[test]
fn test_build_classifier_uses_mock_backend() {
    let db = setup_test_db();
    let client = commands::build_classifier(&db, &mock_config()).unwrap();
    assert!(matches!(client, tally_core::ClassifierClient::Mock(_)));
}

#[test]
fn test_truncate() {
    assert_eq!(truncate("short", 10), "short");
    assert_eq!(truncate("a much longer merchant", 10), "a much ...");
    assert_eq!(truncate("café crème brûlée", 8), "café ...");
}

// ========== Rules Command Tests ==========

#[test]
fn test_cmd_vendor_add_list_deactivate() {
    let db = setup_test_db();

    commands::cmd_vendor_add(&db, "CORNER DELI", "Dining", false).unwrap();
    commands::cmd_vendor_add(&db, "^SHELL.*", "Transport", true).unwrap();
    assert!(commands::cmd_vendor_list(&db).is_ok());

    let rules = db.list_vendor_rules().unwrap();
    assert_eq!(rules.len(), 2);
    let deli = rules.iter().find(|r| r.merchant == "CORNER DELI").unwrap();

    commands::cmd_vendor_deactivate(&db, deli.id).unwrap();
    assert_eq!(db.list_vendor_rules().unwrap().len(), 1);
    assert!(commands::cmd_vendor_deactivate(&db, deli.id).is_err());
}

#[test]
fn test_cmd_vendor_add_unknown_category() {
    let db = setup_test_db();
    let result = commands::cmd_vendor_add(&db, "CORNER DELI", "Snacks", false);
    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("Category not found"));
}

#[test]
fn test_cmd_check_add_and_deactivate() {
    let db = setup_test_db();
    let args = commands::CheckPatternArgs {
        name: "Rent".into(),
        category: "Housing".into(),
        amount: Some(1500.0),
        days: Some("1-5".into()),
        boost: 0.9,
        ..Default::default()
    };
    commands::cmd_check_add(&db, &args).unwrap();
    assert!(commands::cmd_check_list(&db, false).is_ok());

    let patterns = db.list_check_patterns(false).unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].day_range.unwrap().max, 5);

    commands::cmd_check_deactivate(&db, patterns[0].id).unwrap();
    assert!(db.list_check_patterns(false).unwrap().is_empty());
    let all = db.list_check_patterns(true).unwrap();
    assert_eq!(all[0].state, RuleState::Inactive);
}

#[test]
fn test_cmd_check_add_rejects_mixed_amounts() {
    let db = setup_test_db();
    let args = commands::CheckPatternArgs {
        name: "Allowance".into(),
        category: "Personal".into(),
        amount: Some(20.0),
        amounts: vec![20.0, 40.0],
        boost: 0.8,
        ..Default::default()
    };
    assert!(commands::cmd_check_add(&db, &args).is_err());
    assert!(db.list_check_patterns(true).unwrap().is_empty());
}

#[test]
fn test_cmd_pattern_add_and_deactivate() {
    let db = setup_test_db();
    let args = commands::PatternRuleArgs {
        name: "Big hardware".into(),
        category: "Shopping".into(),
        merchant: Some("HARDWARE".into()),
        regex: true,
        amount_op: "ge".into(),
        amount: Some(40.0),
        direction: Some("expense".into()),
        confidence: 0.85,
        priority: 10,
        ..Default::default()
    };
    commands::cmd_pattern_add(&db, &args).unwrap();
    assert!(commands::cmd_pattern_list(&db, false).is_ok());

    let rules = db.list_pattern_rules(false).unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].priority, 10);

    commands::cmd_pattern_deactivate(&db, rules[0].id).unwrap();
    assert!(db.list_pattern_rules(false).unwrap().is_empty());
}

#[test]
fn test_cmd_pattern_add_bad_input() {
    let db = setup_test_db();
    let base = commands::PatternRuleArgs {
        name: "Bad".into(),
        category: "Shopping".into(),
        amount_op: "ge".into(),
        confidence: 0.8,
        ..Default::default()
    };
    // ge needs a value
    assert!(commands::cmd_pattern_add(&db, &base).is_err());

    let args = commands::PatternRuleArgs {
        amount_op: "between".into(),
        ..base.clone()
    };
    assert!(commands::cmd_pattern_add(&db, &args).is_err());

    let args = commands::PatternRuleArgs {
        amount_op: "any".into(),
        direction: Some("sideways".into()),
        ..base
    };
    assert!(commands::cmd_pattern_add(&db, &args).is_err());
}

// ========== Classify Command Tests ==========

#[tokio::test]
async fn test_cmd_classify_sequential() {
    let db = setup_test_db();
    insert_sample_transactions(&db);

    commands::cmd_classify(
        &db,
        &mock_config(),
        &CancelToken::new(),
        None,
        ScriptedPrompter::new(),
    )
    .await
    .unwrap();

    assert_eq!(db.count_classifications().unwrap(), 4);
    assert_eq!(
        db.get_classification("1").unwrap().unwrap().category,
        "Subscriptions"
    );
}

#[tokio::test]
async fn test_cmd_classify_canceled_is_clean_stop() {
    let db = setup_test_db();
    insert_sample_transactions(&db);
    let cancel = CancelToken::new();
    cancel.cancel();

    let result = commands::cmd_classify(
        &db,
        &mock_config(),
        &cancel,
        None,
        ScriptedPrompter::new(),
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(db.count_classifications().unwrap(), 0);
}

#[tokio::test]
async fn test_cmd_classify_batch_takes_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup_test_db();
    insert_sample_transactions(&db);
    let checkpoints = CheckpointManager::new(dir.path()).unwrap();
    let overrides = commands::BatchOverrides {
        workers: Some(2),
        threshold: Some(0.9),
        ..Default::default()
    };

    commands::cmd_classify_batch(
        &db,
        &mock_config(),
        &checkpoints,
        &CancelToken::new(),
        None,
        &overrides,
        ScriptedPrompter::new(),
    )
    .await
    .unwrap();

    let listed = checkpoints.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].is_auto);
    // The checkpoint was taken before anything was classified
    assert_eq!(listed[0].classification_count, 0);
    assert_eq!(db.count_classifications().unwrap(), 4);
}

#[test]
fn test_batch_overrides_validate() {
    let config = mock_config();
    let options = commands::BatchOverrides {
        workers: Some(8),
        batch_size: Some(5),
        threshold: None,
        skip_review: true,
    }
    .apply(&config)
    .unwrap();
    assert_eq!(options.workers, 8);
    assert_eq!(options.batch_size, 5);
    assert_eq!(options.auto_accept_threshold, 0.95);
    assert!(options.skip_manual_review);

    let bad = commands::BatchOverrides {
        threshold: Some(1.5),
        ..Default::default()
    };
    assert!(bad.apply(&config).is_err());
}

// ========== Checkpoint Command Tests ==========

#[test]
fn test_cmd_checkpoint_create_restore() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tally.db");
    let checkpoints = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();

    let db = commands::open_db(&db_path, true).unwrap();
    db.seed_default_categories().unwrap();
    insert_sample_transactions(&db);
    let info = commands::cmd_checkpoint_create(&db, &checkpoints, Some("before"), "test").unwrap();
    assert_eq!(info.transaction_count, 4);

    db.insert_transaction(&Transaction::new("5", date(5), "EXTRA", 1.0))
        .unwrap();
    assert!(commands::cmd_checkpoint_list(&checkpoints).is_ok());
    assert!(commands::cmd_checkpoint_info(&checkpoints, "before", true).is_ok());

    commands::cmd_checkpoint_restore(db, &checkpoints, "before", true).unwrap();

    let db = commands::open_db(&db_path, true).unwrap();
    assert_eq!(db.count_transactions().unwrap(), 4);
    // The pre-restore state was saved as a manual checkpoint
    let listed = checkpoints.list().unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|c| !c.is_auto));
    assert!(listed
        .iter()
        .any(|c| c.id != "before" && c.transaction_count == 5));
}

#[test]
fn test_cmd_checkpoint_restore_refuses_shared_handle() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointManager::new(dir.path().join("checkpoints")).unwrap();
    let db = commands::open_db(&dir.path().join("tally.db"), true).unwrap();
    commands::cmd_checkpoint_create(&db, &checkpoints, Some("cp"), "").unwrap();

    let other = db.clone();
    let result = commands::cmd_checkpoint_restore(db, &checkpoints, "cp", true);
    assert!(result.is_err());
    // The store is still usable through the other handle
    assert_eq!(other.count_transactions().unwrap(), 0);
}

#[test]
fn test_cmd_checkpoint_unknown_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointManager::new(dir.path()).unwrap();
    assert!(commands::cmd_checkpoint_info(&checkpoints, "missing", false).is_err());
    assert!(commands::cmd_checkpoint_delete(&checkpoints, "missing").is_err());

    let db = setup_test_db();
    commands::cmd_checkpoint_create(&db, &checkpoints, Some("gone"), "").unwrap();
    commands::cmd_checkpoint_delete(&checkpoints, "gone").unwrap();
    assert!(checkpoints.list().unwrap().is_empty());
}

// ========== Analyze Command Tests ==========

#[tokio::test]
async fn test_cmd_analyze_apply_fixes_inconsistency() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointManager::new(dir.path()).unwrap();
    let db = setup_test_db();
    db.insert_transactions(&[
        Transaction::new("s1", date(1), "SHELL OIL 1001", 40.0),
        Transaction::new("s2", date(8), "SHELL OIL 1002", 42.0),
        Transaction::new("s3", date(15), "SHELL OIL 1003", 38.0),
    ])
    .unwrap();
    for (id, category) in [("s1", "Transport"), ("s2", "Transport"), ("s3", "Groceries")] {
        db.upsert_classification(&Classification::new(
            id,
            category,
            ClassificationStatus::ClassifiedByAi,
            0.8,
        ))
        .unwrap();
    }

    let args = commands::AnalyzeArgs {
        apply: true,
        min_confidence: 0.6,
        ..Default::default()
    };
    commands::cmd_analyze(&db, &mock_config(), &checkpoints, &CancelToken::new(), &args)
        .await
        .unwrap();

    let fixed = db.get_classification("s3").unwrap().unwrap();
    assert_eq!(fixed.category, "Transport");
    assert_eq!(fixed.status, ClassificationStatus::UserModified);
    // Fixes are preceded by an automatic checkpoint
    assert_eq!(checkpoints.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_cmd_analyze_without_apply_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = CheckpointManager::new(dir.path()).unwrap();
    let db = setup_test_db();
    insert_sample_transactions(&db);

    let args = commands::AnalyzeArgs {
        json: true,
        ..Default::default()
    };
    commands::cmd_analyze(&db, &mock_config(), &checkpoints, &CancelToken::new(), &args)
        .await
        .unwrap();

    assert_eq!(db.list_analysis_sessions().unwrap().len(), 1);
    assert_eq!(db.count_classifications().unwrap(), 0);
    assert!(checkpoints.list().unwrap().is_empty());
}
