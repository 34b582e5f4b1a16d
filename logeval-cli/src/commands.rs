use anyhow::Context;
use anyhow::Result;
use logeval_core::Harness;
use logeval_core::hub::download_hint;
use logeval_core::model::ensure_weights;
use logeval_core::render_report;
use logeval_core::session::Session;
use std::path::Path;

pub fn handle_info(harness: &Harness) -> Result<()> {
    let paths = harness.paths();
    let config = harness.config();

    println!("Loaded configuration from {}", paths.config_file.display());
    println!("Data directory:  {}", paths.data_dir.display());
    println!("State directory: {}", paths.state_dir.display());
    println!("Model endpoint:  {}", config.models.base_url);
    println!(
        "Batch size {} / workers {} / max_seq_len {} / max_content_len {}",
        config.evaluation.batch_size,
        config.evaluation.workers,
        config.evaluation.max_seq_len,
        config.evaluation.max_content_len
    );

    if config.datasets.is_empty() {
        println!("No datasets configured yet. Add a [[datasets]] entry to evaluate.");
        return Ok(());
    }

    println!("\nDatasets:");
    for dataset in harness.resolve_datasets()? {
        let status = if dataset.test_path.is_file() {
            "ready"
        } else if dataset.log_path.is_file() {
            "needs prepare"
        } else {
            "missing"
        };
        println!(
            "  {:<14} {:<14} {}",
            dataset.name,
            status,
            dataset.dir.display()
        );
    }

    Ok(())
}

pub fn handle_convert(
    harness: &Harness,
    input: Option<&Path>,
    output_dir: Option<&Path>,
) -> Result<()> {
    let summary = harness.convert(input, output_dir)?;

    println!("\n{}", "=".repeat(80));
    println!("HDFS conversion complete");
    println!("{}", "=".repeat(80));
    println!("Log lines written:  {}", summary.rows);
    println!("Unique block ids:   {}", summary.unique_blocks);
    println!("  Anomaly:          {}", summary.anomalies);
    println!("  Normal:           {}", summary.normals);
    println!("Log file size:      {:.2} MB", summary.log_size_mb());
    println!("\nGenerated files:");
    println!("  - {}", summary.log_path.display());
    println!("  - {}", summary.label_path.display());
    println!("\nNext steps:");
    println!("  1. logeval prepare HDFS_v1");
    println!("  2. logeval eval HDFS_v1");

    Ok(())
}

pub fn handle_prepare(harness: &Harness, dataset: Option<&str>) -> Result<()> {
    let name = match dataset {
        Some(name) => name.to_string(),
        None => harness
            .config()
            .dataset_names()
            .into_iter()
            .next()
            .context("no dataset provided and configuration has no datasets")?,
    };

    let (split, files) = harness.prepare(&name)?;

    println!("Prepared dataset '{name}':");
    println!(
        "  train: {} sequences ({} anomalous) -> {}",
        split.train.len(),
        anomalous(&split.train),
        files.train.display()
    );
    println!(
        "  test:  {} sequences ({} anomalous) -> {}",
        split.test.len(),
        anomalous(&split.test),
        files.test.display()
    );
    if split.unlabeled_blocks > 0 {
        println!("  dropped {} blocks without a label", split.unlabeled_blocks);
    }
    if split.skipped_lines > 0 {
        println!("  skipped {} malformed log lines", split.skipped_lines);
    }

    Ok(())
}

fn anomalous(sessions: &[Session]) -> usize {
    sessions.iter().filter(|s| s.label.is_anomaly()).count()
}

pub async fn handle_eval(harness: &Harness, dataset: &str) -> Result<()> {
    let result = harness.evaluate(dataset).await?;
    println!("{}", render_report(&result));
    Ok(())
}

pub async fn handle_eval_all(harness: &Harness, output: Option<&Path>) -> Result<()> {
    let summary = harness.evaluate_all().await;

    for result in &summary.results {
        println!("{}\n", render_report(result));
    }
    println!("{}", summary.render_table());

    if let Some(path) = output {
        summary.write_json(path)?;
        println!("Summary written to {}", path.display());
    }

    Ok(())
}

pub fn handle_upload(harness: &Harness) -> Result<()> {
    let report = harness.upload()?;
    print!("{}", report.render());
    println!(
        "\nRestore with: logeval download (bucket {}data/)",
        harness.config().transfer.bucket
    );
    Ok(())
}

pub fn handle_download(harness: &Harness) -> Result<()> {
    let report = harness.download()?;
    print!("{}", report.render());
    println!("\nData saved under {}", harness.paths().data_dir.display());
    Ok(())
}

pub async fn handle_check_models(harness: &Harness, generate: bool) -> Result<()> {
    let checks = harness.check_models()?;

    println!("\n{}", "=".repeat(80));
    println!("Model weights");
    println!("{}", "=".repeat(80));
    for check in &checks {
        let mark = if check.present { "ok  " } else { "MISS" };
        println!("[{mark}] {:<24} {}", check.label, check.path.display());
    }

    ensure_weights(&checks)?;

    if generate {
        let name = harness
            .config()
            .dataset_names()
            .into_iter()
            .next()
            .context("no dataset configured to pick an adapter for the smoke generation")?;
        let output = harness.smoke_test(&name).await?;
        println!("\nSmoke generation ({name}): {output}");
    }
    Ok(())
}

pub async fn handle_hub_check(harness: &Harness) -> Result<()> {
    let report = harness.hub_check().await?;
    print!("{}", report.render());
    if report.identity.is_err() {
        println!("\nTo authenticate, create a read token and export HF_TOKEN=<token>.");
    }
    if report.dataset.is_ok() {
        println!("\nNext step: logeval download-hdfs");
    }
    Ok(())
}

pub async fn handle_download_hdfs(harness: &Harness, output: Option<&Path>) -> Result<()> {
    let repo = &harness.config().hub.dataset;
    println!("Downloading {repo} from {}", harness.config().hub.endpoint);

    match harness.download_hdfs(output).await {
        Ok(download) => {
            print!("{}", download.render());
            println!("\nNext step: logeval convert --input {}", download.dest.display());
            Ok(())
        }
        Err(err) => {
            if let Some(hint) = download_hint(&err, repo) {
                eprintln!("\n{hint}");
            }
            Err(err)
        }
    }
}
