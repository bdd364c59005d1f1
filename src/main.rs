use stress_test::{stress_test_scaling, stress_test_tree, StressConfig};
use tracing_subscriber::EnvFilter;
pub mod stress_test;

fn main() -> Result<(), canopy_sdk::SdkError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), canopy_sdk::SdkError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: small scale
    let stats = stress_test_tree(StressConfig::default()).await?;
    stats.print();

    // Test 2: medium scale
    let stats = stress_test_tree(StressConfig {
        num_replicas: 10,
        ops_per_replica: 300,
        num_syncs: 1000,
        ..StressConfig::default()
    })
    .await?;
    stats.print();

    // Test 3: scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(12, 2).await?;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
