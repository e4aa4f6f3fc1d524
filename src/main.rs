use anyhow::Result;
use std::env;
use std::path::Path;
use std::sync::Arc;

use sensitivity_insight::{
    write_csv_file, ConnectionConfig, DateRange, FetchOutcome, NightscoutClient, Progress,
    SensitivityPipeline, Settings,
};

fn print_usage() {
    println!("Usage:");
    println!("  sensitivity-insight fetch <START> <END> [--csv PATH]   dates as YYYY-MM-DD");
    println!("  sensitivity-insight test-connection");
    println!();
    println!("Connection is read from NIGHTSCOUT_URL and NIGHTSCOUT_API_SECRET (.env supported)");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("fetch") => run_fetch(&args[2..]).await?,
        Some("test-connection") => run_test_connection().await?,
        _ => print_usage(),
    }

    Ok(())
}

fn client(settings: &Settings) -> Result<NightscoutClient> {
    let config = ConnectionConfig::from_env()?;
    Ok(NightscoutClient::new(config, settings.request_timeout)?)
}

async fn run_fetch(args: &[String]) -> Result<()> {
    let (start, end) = match (args.first(), args.get(1)) {
        (Some(start), Some(end)) => (start, end),
        _ => {
            print_usage();
            return Ok(());
        }
    };
    let csv_path = args
        .iter()
        .position(|a| a == "--csv")
        .and_then(|i| args.get(i + 1));

    println!("🩸 Sensitivity Insight - {} to {}", start, end);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let range = DateRange::parse(start, end)?;
    let settings = Settings::from_env()?;
    let source = client(&settings)?;

    println!("\n📡 Source: {}", source.config().base_url);
    let pipeline = SensitivityPipeline::new(Arc::new(source), settings);

    let progress = |p: Progress| {
        if p.current == p.total {
            println!("✓ Processed {}", p);
        } else {
            log::debug!("Processing {}", p);
        }
    };

    let report = match pipeline.fetch(range, &progress).await {
        Ok(FetchOutcome::Completed(report)) => report,
        Ok(FetchOutcome::Rejected) => {
            println!("⏳ A fetch is already running");
            return Ok(());
        }
        Err(e) => {
            eprintln!("❌ {}", e.user_message());
            std::process::exit(1);
        }
    };

    println!("\n📊 {}", report.summary());
    for degradation in &report.degradations {
        println!("⚠️  {}", degradation.describe());
    }

    let stats = &report.stats;
    let tir = stats.time_in_range;
    println!(
        "\n🎯 Time in range: {:.1}% below, {:.1}% in range, {:.1}% above ({} readings)",
        tir.below_percent, tir.in_range_percent, tir.above_percent, tir.total
    );
    if let Some(spread) = stats.deviation {
        println!(
            "📏 Dynamic vs profile gap: avg {:.1}, max {:.1}, min {:.1} mg/dL/U",
            spread.avg, spread.max, spread.min
        );
    }
    for period in stats.periods.iter().filter(|p| p.count > 0) {
        println!(
            "   {:?}: dyn {:.0} prof {:.0} ({:+.0}%, n={})",
            period.period, period.avg_isf_dynamic, period.avg_isf_profile, period.avg_deviation, period.count
        );
    }
    for rec in &stats.recommendations {
        let icon = if rec.is_warning() { "⚠️ " } else { "💡" };
        println!("{} {}", icon, rec.message());
    }

    println!("\n🕐 Hourly deviation in {} (rows with sensitivity only):", report.time_zone);
    for hour in report.series.hourly_stats.iter().filter(|h| h.sample_count > 0) {
        println!(
            "   {:02}:00  {:>7.1}%  dyn {:>6.1}  prof {:>6.1}  (n={})",
            hour.hour, hour.avg_deviation, hour.avg_isf_dynamic, hour.avg_isf_profile, hour.sample_count
        );
    }

    if let Some(path) = csv_path {
        let written = write_csv_file(Path::new(path), &report.series.table_data)?;
        println!("\n💾 Wrote {} rows to {}", written, path);
    }

    Ok(())
}

async fn run_test_connection() -> Result<()> {
    println!("🔌 Testing Nightscout connection...");

    let settings = Settings::from_env()?;
    let source = client(&settings)?;

    match source.test_connection().await {
        Ok(status) => {
            let name = status.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
            let version = status.get("version").and_then(|v| v.as_str()).unwrap_or("unknown");
            println!("✅ Connected to {} (version {})", name, version);
        }
        Err(e) => {
            eprintln!("❌ Connection failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
