use clap::Parser;
use dhis2_recon::adapters::{load_history, Dhis2Client, LocalStorage, ReportWriter};
use dhis2_recon::core::validation::ValidationEngine;
use dhis2_recon::domain::model::{PublishOutcome, RunReport};
use dhis2_recon::utils::error::{ErrorSeverity, ReconError};
use dhis2_recon::utils::{logger, validation::Validate};
use dhis2_recon::{CliConfig, ComparisonPipeline, ReconEngine, RunConfig};
use tokio_util::sync::CancellationToken;

fn fail(e: &ReconError) -> ! {
    tracing::error!(
        "❌ Reconciliation failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    if e.is_retryable() {
        eprintln!("🔁 這是暫時性錯誤，可稍後重新執行");
    }

    // 根據錯誤嚴重程度決定退出碼
    let exit_code = match e.severity() {
        ErrorSeverity::Low => 0,
        ErrorSeverity::Medium => 2, // 可重試
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    };
    std::process::exit(exit_code);
}

fn print_plan(config: &RunConfig) -> dhis2_recon::Result<()> {
    let settings = config.run_settings(false)?;
    println!("📋 Run '{}' for period {}", settings.name, settings.period);
    println!("   Org units: {}", settings.org_units.join(", "));
    for source in config.source_descriptors()? {
        println!(
            "   {} = dataset {} on {} ({})",
            source.label, source.dataset_id, source.instance.id, source.instance.base_url
        );
    }
    println!("   {} element groups, {} rules", config.groups.len(), config.rules.len());
    if let Some(dest) = config.destination_descriptor()? {
        println!("   Destination: dataset {} on {}", dest.dataset_id, dest.instance.id);
    }
    println!("   Output: {} ({})", config.output.path, config.output.formats.join(", "));
    Ok(())
}

fn print_summary(report: &RunReport, written: &[String], output_path: &str) {
    let s = &report.comparison.summary;
    println!("✅ Reconciliation completed for period {}", report.period);
    println!(
        "📊 {} records: {} valid, {} mismatched, {} missing, {} out of range",
        s.total_records,
        s.valid_records,
        s.mismatched_records,
        s.missing_records,
        s.out_of_range_records
    );
    let failed = report.validation.iter().filter(|r| !r.passed).count();
    println!(
        "🔎 {} validation checks, {} failed ({} blocking)",
        report.validation.len(),
        failed,
        report.blocking_failures()
    );
    if !report.fallback_sources.is_empty() {
        println!("🔄 Analytics fallback used for: {}", report.fallback_sources.join(", "));
    }
    match &report.publish {
        PublishOutcome::Skipped => {}
        PublishOutcome::Blocked { errors } => {
            println!("⛔ Publish blocked by {} error-severity failures", errors)
        }
        PublishOutcome::Published(summary) => println!(
            "📤 Published: {} imported, {} updated, {} ignored",
            summary.imported, summary.updated, summary.ignored
        ),
    }
    println!("📁 Output saved to: {} ({})", output_path, written.join(", "));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();

    let mut config = match RunConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logger::init_cli_logger(&logger::default_directive(cli.verbose, None));
            fail(&e);
        }
    };
    config.apply_overrides(cli.period.clone(), cli.org_units.clone(), cli.output.clone());

    // 初始化日誌
    let directive = logger::default_directive(cli.verbose, config.log_level());
    if config.json_logs() {
        logger::init_json_logger(&directive);
    } else {
        logger::init_cli_logger(&directive);
    }

    tracing::info!("Starting dhis2-recon with {}", cli.config);
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        fail(&e);
    }

    if cli.dry_run {
        if let Err(e) = print_plan(&config) {
            fail(&e);
        }
        return Ok(());
    }

    let (settings, sources, destination) = match (
        config.run_settings(!cli.no_publish),
        config.source_descriptors(),
        config.destination_descriptor(),
    ) {
        (Ok(settings), Ok(sources), Ok(destination)) => (settings, sources, destination),
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => fail(&e),
    };

    let client = match Dhis2Client::new() {
        Ok(client) => client,
        Err(e) => fail(&e),
    };
    let mut pipeline = ComparisonPipeline::new(
        client,
        settings,
        sources,
        config.element_groups(),
        ValidationEngine::new(config.rules.clone()),
    );

    if let Some(history_file) = config.history_file() {
        match load_history(&LocalStorage::new("."), history_file).await {
            Ok(history) => pipeline = pipeline.with_history(history),
            Err(e) => tracing::warn!(
                "⚠️ Could not read history file {}: {}; outliers use the current batch",
                history_file,
                e
            ),
        }
    }
    if let Some(destination) = destination {
        pipeline = pipeline.with_destination(destination);
    }

    let engine = ReconEngine::new(pipeline).with_progress(|step: &str, percent: u8| {
        tracing::debug!("⏳ [{:>3}%] {}", percent, step);
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let report = match engine.run(&cancel).await {
        Ok(report) => report,
        Err(e) => fail(&e),
    };

    let writer = ReportWriter::new(LocalStorage::new(&config.output.path), config.output_formats());
    match writer.write(&report).await {
        Ok(written) => {
            tracing::info!("📁 Output saved to: {}", config.output.path);
            print_summary(&report, &written, &config.output.path);
        }
        Err(e) => fail(&e),
    }

    Ok(())
}
