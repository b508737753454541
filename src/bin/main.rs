use perfstream::{
    BoxError, IngressRequest, IngressResponse, PerfSettings, PerformanceService, WarmEntry,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize settings
    let settings = PerfSettings::new()?;

    // Connect the cache and build the service
    let service = PerformanceService::from_settings(&settings).await?;
    let _background = service.start_background();
    let mut events = service.subscribe();

    // Warm a few reference entries
    let warmed = service
        .coordinator()
        .warm_cache(vec![
            WarmEntry { key: "reference:sites".into(), value: "[\"breast\",\"lung\"]".into(), ttl_secs: 3600 },
            WarmEntry { key: "reference:stages".into(), value: "[\"I\",\"II\",\"III\",\"IV\"]".into(), ttl_secs: 3600 },
        ])
        .await;
    println!(
        "\nCache warming: {} written, {} skipped, {} failed",
        warmed.written, warmed.skipped, warmed.failed
    );

    // Stampede-protected report computation
    for _ in 0..3 {
        let report: Vec<u64> = service
            .coordinator()
            .get_or_compute("report:cases-by-stage", 1800, || async {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                Ok::<_, BoxError>(vec![120, 340, 210, 95])
            })
            .await?;
        println!("Cases by stage: {:?}", report);
    }
    let stats = service.coordinator().report_hit_rate();
    println!("Cache hit rate: {:.1}%", stats.hit_rate_percent);

    // Stream a synthetic dataset
    let records: Vec<u64> = (0..25_000).collect();
    let summary = service
        .stream_dataset(
            "registry.export",
            |offset, limit| {
                let batch: Vec<u64> = records.iter().skip(offset).take(limit).copied().collect();
                async move { Ok(batch) }
            },
            |batch, _index| async move {
                let _checksum: u64 = batch.iter().sum();
                Ok(())
            },
        )
        .await?;
    println!(
        "\nStreamed {} records in {} batches ({:.1}ms)",
        summary.total_processed, summary.batches, summary.duration_ms
    );

    // Batch processing with retries
    let retry = service
        .process_with_retry((0..1_000u32).collect(), |batch, index| async move {
            if batch.is_empty() {
                return Err::<(), BoxError>(format!("batch {} empty", index).into());
            }
            Ok(())
        })
        .await;
    println!(
        "Processed {} items, {} failed batches",
        retry.total_processed, retry.failed_batches
    );

    // Cached HTTP handler
    let handler = service.ingress().wrap(|request: IngressRequest| async move {
        IngressResponse::new(200, format!("{{\"path\":\"{}\"}}", request.path))
    });
    for _ in 0..2 {
        let response = handler(IngressRequest::get("/reports/annual", "year=2024")).await;
        println!(
            "GET /reports/annual -> {} (x-cache: {})",
            response.status,
            response.header("x-cache").unwrap_or("-")
        );
    }

    // Summary and export
    let summary = service.get_summary();
    println!("\nOperations: {}", summary.total_operations);
    println!("Average duration: {:.2}ms", summary.average_duration_ms);
    println!("Error rate: {:.1}%", summary.error_rate_percent);
    println!("Healthy: {}", service.is_healthy());

    println!("\nEvents:");
    while let Ok(event) = events.try_recv() {
        println!("- {}", event.name());
    }

    println!("\n{}", service.prometheus_export());

    Ok(())
}
