use std::{
    fs,
    path::{Path, PathBuf},
};

use machine_learning::{arch::CausalLm, schedule::WarmupCosine};
use trainer::{
    TrainErr, TrainingConfig,
    dist::{ExecutionContext, Role},
    report::{MemoryTracker, Reporter},
    train_with,
};

const EXAMPLES: &str = r#"{"input_ids": [1, 2, 3, 4, 5]}
{"input_ids": [6, 7, 8], "labels": [6, 7, 8]}
{"input_ids": [9, 10, 11, 12], "prompt_len": 2}
{"input_ids": [13, 14, 15, 1, 2, 3]}
"#;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("normtune-e2e-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn config(dir: &Path, data: &str, extra: &str) -> TrainingConfig {
    let train_data = dir.join("train.jsonl");
    fs::write(&train_data, data).unwrap();

    let raw = format!(
        r#"{{
            "model_init": {{ "vocab_size": 16, "hidden_size": 8 }},
            "train_data": {:?},
            "optimizer": "type=sgd,lr=0.1"
            {extra}
        }}"#,
        train_data.to_string_lossy()
    );

    TrainingConfig::from_json(&raw).unwrap()
}

fn local(config: &TrainingConfig, tracker: &MemoryTracker) -> ExecutionContext {
    let reporter = Reporter::new(Role::Primary, Some(Box::new(tracker.clone())));
    ExecutionContext::local(config.precision(), reporter)
}

#[tokio::test]
async fn two_steps_over_four_examples() -> Result<(), TrainErr> {
    let dir = scratch("two-steps");
    let config = config(
        &dir,
        EXAMPLES,
        r#", "max_steps": 2, "micro_batch_size": 1, "global_batch_size": 1"#,
    );
    let tracker = MemoryTracker::new();

    let summary = train_with(&config, local(&config, &tracker)).await?;

    assert_eq!(summary.steps, 2);
    assert_eq!(summary.optimizer_updates, 2);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.epoch_restarts, 0);
    assert!(summary.final_loss.is_some_and(f32::is_finite));

    let records = tracker.records();
    assert_eq!(records.len(), 2);

    let field = |name| records.iter().map(|r| r.get(name).unwrap()).collect::<Vec<_>>();
    assert!(field("step").windows(2).all(|w| w[0] <= w[1]));
    assert!(field("time").windows(2).all(|w| w[0] <= w[1]));
    assert!(field("train_penalty").iter().all(|&p| p == 0.));
    assert_eq!(tracker.finished(), 1);

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[tokio::test]
async fn learning_rate_ignores_accumulation() -> Result<(), TrainErr> {
    let dir = scratch("lr");
    let mut lrs = Vec::new();

    for global in [1, 2] {
        let extra = format!(
            r#", "max_steps": 3, "warmup_ratio": 0.34, "global_batch_size": {global}"#
        );
        let config = config(&dir, EXAMPLES, &extra);
        let tracker = MemoryTracker::new();

        let summary = train_with(&config, local(&config, &tracker)).await?;
        assert_eq!(summary.optimizer_updates, 3);
        assert_eq!(summary.batches, 3 * global);

        let run: Vec<_> = tracker.records().iter().map(|r| r.get("lr").unwrap()).collect();
        lrs.push(run);
    }

    let schedule = WarmupCosine::with_ratio(0.1, 0.34, 3);
    let expected: Vec<_> = (1..=3).map(|s| f64::from(schedule.lr_at(s))).collect();

    assert_eq!(lrs[0], expected);
    assert_eq!(lrs[1], expected);

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[tokio::test]
async fn penalized_runs_report_the_penalty_and_save_the_bare_model() -> Result<(), TrainErr> {
    let dir = scratch("penalty");
    let save_dir = dir.join("out");
    let extra = format!(
        r#", "max_steps": 5, "norm": 0.01, "save_dir": {:?}"#,
        save_dir.to_string_lossy()
    );
    let config = config(&dir, EXAMPLES, &extra);
    let tracker = MemoryTracker::new();

    let summary = train_with(&config, local(&config, &tracker)).await?;
    assert_eq!(summary.epoch_restarts, 1);

    let records = tracker.records();
    assert!(records.iter().all(|r| r.get("train_penalty").unwrap() > 0.));

    let model = CausalLm::from_pretrained(&save_dir)?;
    assert_eq!(model.config().vocab_size, 16);

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[tokio::test]
async fn zero_steps_still_save_the_model() -> Result<(), TrainErr> {
    let dir = scratch("zero-steps");
    let save_dir = dir.join("out");
    let extra = format!(
        r#", "max_steps": 0, "save_dir": {:?}"#,
        save_dir.to_string_lossy()
    );
    let config = config(&dir, EXAMPLES, &extra);
    let tracker = MemoryTracker::new();

    let summary = train_with(&config, local(&config, &tracker)).await?;

    assert_eq!(summary.steps, 0);
    assert_eq!(summary.optimizer_updates, 0);
    assert_eq!(summary.final_loss, None);
    assert!(tracker.records().is_empty());
    assert_eq!(tracker.finished(), 1);
    assert!(CausalLm::from_pretrained(&save_dir).is_ok());

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[tokio::test]
async fn validation_runs_before_training() -> Result<(), TrainErr> {
    let dir = scratch("validation");
    let val_data = dir.join("val.jsonl");
    fs::write(&val_data, EXAMPLES)?;

    let extra = format!(
        r#", "max_steps": 4, "eval_steps": 2, "val_batch_size": 2, "val_data": {:?}"#,
        val_data.to_string_lossy()
    );
    let config = config(&dir, EXAMPLES, &extra);
    let tracker = MemoryTracker::new();

    train_with(&config, local(&config, &tracker)).await?;

    let val_steps: Vec<_> = tracker
        .records()
        .iter()
        .filter_map(|r| r.get("val_loss").map(|_| r.get("step").unwrap()))
        .collect();
    assert_eq!(val_steps, [0., 2.]);

    fs::remove_dir_all(dir)?;
    Ok(())
}

#[tokio::test]
async fn empty_loaders_fail_and_close_the_tracker() {
    let dir = scratch("empty");
    let config = config(&dir, "", r#", "max_steps": 1"#);
    let tracker = MemoryTracker::new();

    let res = train_with(&config, local(&config, &tracker)).await;

    assert!(matches!(res, Err(TrainErr::EmptyLoader)));
    assert_eq!(tracker.finished(), 1);
    assert!(tracker.records().is_empty());

    fs::remove_dir_all(dir).unwrap();
}
