//! End-to-end evaluation tests: config file in, results table out.

use emocv::prelude::*;
use emocv::runner;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(content.as_bytes()).unwrap();
    path
}

/// 4 speakers x 4 instances, 2 well-separated classes.
fn write_dataset(dir: &Path) -> (PathBuf, PathBuf) {
    let mut features = String::from("name,f1,f2\n");
    let mut labels = String::from("name,label,speaker\n");
    for s in 0..4 {
        for i in 0..4 {
            let class = i % 2;
            let base = if class == 0 { 0.0 } else { 6.0 };
            features.push_str(&format!(
                "u{}_{},{},{}\n",
                s,
                i,
                base + 0.2 * s as f64,
                base + 0.1 * i as f64
            ));
            labels.push_str(&format!(
                "u{}_{},{},spk{}\n",
                s,
                i,
                if class == 0 { "anger" } else { "sadness" },
                s
            ));
        }
    }
    (
        write_file(dir, "features.csv", &features),
        write_file(dir, "labels.csv", &labels),
    )
}

fn base_config(dir: &Path, features: &Path, labels: &Path) -> String {
    format!(
        "corpus: testcorp\nfeatures: {}\nlabels: {}\nfeature_set: egemaps\n\
         clf: centroid\nnormalise: speaker\nresults: {}\n",
        features.display(),
        labels.display(),
        dir.join("results.csv").display()
    )
}

#[test]
fn test_leave_one_speaker_out_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let yaml = base_config(dir.path(), &features, &labels);
    let config_path = write_file(dir.path(), "run.yaml", &yaml);

    let config = RunConfig::from_yaml_file(&config_path).unwrap();
    let summary = runner::execute(&config, CancelToken::new()).unwrap();

    // One fold per speaker, all separable
    assert_eq!(summary.outcomes.len(), 4);
    assert_eq!(summary.n_success(), 4);
    assert!((summary.mean_uar - 1.0).abs() < 1e-10);
    assert_eq!(summary.pooled.total(), 16);

    let rows = ResultsStore::new(dir.path().join("results.csv")).load().unwrap();
    assert_eq!(rows.len(), 4);
    for row in &rows {
        assert_eq!(row.corpus, "testcorp");
        assert_eq!(row.classifier, "centroid");
        assert_eq!(row.status, "ok");
        assert_eq!(row.n_test, 4);
        assert!(row.test_groups.starts_with("spk"));
        // Every test split holds both classes
        assert!(!row.degenerate);
    }
}

#[test]
fn test_rerun_overwrite_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let yaml = base_config(dir.path(), &features, &labels);
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();
    let results = dir.path().join("results.csv");

    runner::execute(&config, CancelToken::new()).unwrap();
    let first = std::fs::read(&results).unwrap();
    runner::execute(&config, CancelToken::new()).unwrap();
    let second = std::fs::read(&results).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_append_mode_accumulates_rows() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let yaml = format!("{}append: true\n", base_config(dir.path(), &features, &labels));
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();

    runner::execute(&config, CancelToken::new()).unwrap();
    runner::execute(&config, CancelToken::new()).unwrap();
    let rows = ResultsStore::new(dir.path().join("results.csv")).load().unwrap();
    assert_eq!(rows.len(), 8);
}

#[test]
fn test_single_class_speaker_recorded_as_failure() {
    let dir = TempDir::new().unwrap();
    // spk0 holds every sadness instance: the fold testing spk0 trains on a
    // single class and must fail while the other folds succeed.
    let features = write_file(
        dir.path(),
        "features.csv",
        "name,f1\nu0,0.0\nu1,6.0\nu2,0.1\nu3,0.2\nu4,0.3\nu5,0.4\n",
    );
    let labels = write_file(
        dir.path(),
        "labels.csv",
        "name,label,speaker\nu0,anger,spk0\nu1,sadness,spk0\nu2,anger,spk1\n\
         u3,anger,spk1\nu4,anger,spk2\nu5,anger,spk2\n",
    );
    let yaml = format!(
        "corpus: testcorp\nfeatures: {}\nlabels: {}\nfeature_set: egemaps\n\
         clf: centroid\nnormalise: none\nresults: {}\n",
        features.display(),
        labels.display(),
        dir.path().join("results.csv").display()
    );
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();

    let summary = runner::execute(&config, CancelToken::new()).unwrap();
    assert_eq!(summary.outcomes.len(), 3);
    assert_eq!(summary.n_failed(), 1);

    let rows = ResultsStore::new(dir.path().join("results.csv")).load().unwrap();
    let failed: Vec<_> = rows.iter().filter(|r| r.status != "ok").collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, "data");
    assert_eq!(failed[0].test_groups, "spk0");
    assert_eq!(failed[0].uar, None);
    assert!(!failed[0].degenerate);

    // spk1 and spk2 test splits are all-anger: scored, but flagged as
    // low-confidence in the table.
    for row in rows.iter().filter(|r| r.status == "ok") {
        assert!(row.degenerate);
    }
}

#[test]
fn test_nested_search_persists_chosen_params() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let grid = write_file(dir.path(), "grid.yaml", "learning_rate: [0.5, 0.05]\nepochs: [300]\n");
    let yaml = format!(
        "corpus: testcorp\nfeatures: {}\nlabels: {}\nfeature_set: egemaps\n\
         clf: logistic\nnormalise: online\ninner_kfold: 2\nparam_grid: {}\n\
         balanced: true\nresults: {}\n",
        features.display(),
        labels.display(),
        grid.display(),
        dir.path().join("results.csv").display()
    );
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();

    let summary = runner::execute(&config, CancelToken::new()).unwrap();
    assert_eq!(summary.n_success(), 4);

    let rows = ResultsStore::new(dir.path().join("results.csv")).load().unwrap();
    for row in &rows {
        assert!(row.params.contains("learning_rate"));
        assert!(row.params.contains("epochs"));
    }

    // The whole search pipeline is deterministic
    let results = dir.path().join("results.csv");
    let first = std::fs::read(&results).unwrap();
    runner::execute(&config, CancelToken::new()).unwrap();
    assert_eq!(first, std::fs::read(&results).unwrap());
}

#[test]
fn test_group_subsets_partition_runs() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let yaml = format!(
        "{}kfold: 2\nseed: 7\n",
        base_config(dir.path(), &features, &labels)
    );
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();

    let summary = runner::execute(&config, CancelToken::new()).unwrap();
    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.pooled.total(), 16);

    // 2 test groups per fold, every speaker tested exactly once
    let rows = ResultsStore::new(dir.path().join("results.csv")).load().unwrap();
    let mut tested: Vec<String> = rows
        .iter()
        .flat_map(|r| r.test_groups.split(';').map(str::to_string))
        .collect();
    tested.sort();
    assert_eq!(tested, vec!["spk0", "spk1", "spk2", "spk3"]);
}

#[test]
fn test_map_groups_buckets_metrics() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let map = write_file(
        dir.path(),
        "map.yaml",
        "spk0: sess1\nspk1: sess1\nspk2: sess2\nspk3: sess2\n",
    );
    let yaml = format!(
        "{}map_groups: {}\n",
        base_config(dir.path(), &features, &labels),
        map.display()
    );
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();

    let summary = runner::execute(&config, CancelToken::new()).unwrap();
    // Partitioning stays per-speaker; only reporting is bucketed
    assert_eq!(summary.outcomes.len(), 4);
    assert_eq!(
        summary.bucket_uars.keys().collect::<Vec<_>>(),
        vec!["sess1", "sess2"]
    );
}

#[test]
fn test_parallel_run_matches_sequential() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let yaml = base_config(dir.path(), &features, &labels);
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let mut config = RunConfig::from_yaml_file(&config_path).unwrap();

    let seq = runner::execute(&config, CancelToken::new()).unwrap();
    let seq_bytes = std::fs::read(dir.path().join("results.csv")).unwrap();

    config.parallel = true;
    let par = runner::execute(&config, CancelToken::new()).unwrap();
    let par_bytes = std::fs::read(dir.path().join("results.csv")).unwrap();

    assert_eq!(seq.fold_uars, par.fold_uars);
    assert_eq!(seq_bytes, par_bytes);
}

#[test]
fn test_unknown_classifier_rejected_before_running() {
    let dir = TempDir::new().unwrap();
    let (features, labels) = write_dataset(dir.path());
    let yaml = format!(
        "corpus: testcorp\nfeatures: {}\nlabels: {}\nfeature_set: egemaps\n\
         clf: svm-rbf\nresults: {}\n",
        features.display(),
        labels.display(),
        dir.path().join("results.csv").display()
    );
    let config_path = write_file(dir.path(), "run.yaml", &yaml);
    let config = RunConfig::from_yaml_file(&config_path).unwrap();

    let err = runner::execute(&config, CancelToken::new()).unwrap_err();
    assert!(matches!(err, EvalError::UnknownClassifier(_)));
    assert!(!dir.path().join("results.csv").exists());
}
