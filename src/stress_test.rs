use async_stream::stream;
use canopy_sdk::{NodeId, Replica, ReplicaConfigBuilder, SdkError};
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// Shape of one stress run.
#[derive(Clone, Debug)]
pub struct StressConfig {
    pub num_replicas: usize,
    pub ops_per_replica: usize,
    pub num_syncs: usize,
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            num_replicas: 4,
            ops_per_replica: 100,
            num_syncs: 200,
            seed: 42,
        }
    }
}

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_replicas: usize,
    pub operations_per_replica: usize,
    pub total_syncs: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
    pub final_nodes: usize,
    pub converged: bool,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>30} ║", self.num_replicas);
        println!("║  Operations per Replica:    {:>30} ║", self.operations_per_replica);
        println!("║  Total Sync Operations:     {:>30} ║", self.total_syncs);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>28}µs ║", self.avg_sync_time.as_micros());
        println!("║  Operations/Second:         {:>30.0} ║", self.ops_per_second);
        println!("║  Nodes after convergence:   {:>30} ║", self.final_nodes);
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Generator that yields replica indices for synchronization patterns
fn replica_sync_generator(
    num_replicas: usize,
    num_syncs: usize,
    seed: u64,
) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..num_syncs {
            let replica_a = rng.gen_range(0..num_replicas);
            let replica_b = rng.gen_range(0..num_replicas);
            yield (replica_a, replica_b);
        }
    }
}

/// Random local edits on one replica.
///
/// Each replica appends its own log entries, writes only keys in its own
/// namespace and may tombstone any visible log entry.
async fn run_writer(
    replica: Replica,
    idx: usize,
    ops: usize,
    seed: u64,
) -> Result<(), SdkError> {
    let mut rng = StdRng::seed_from_u64(seed ^ (idx as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    let log = replica.node_at("/log")?;
    let props = replica.node_at("/props")?;

    for i in 0..ops {
        let roll: f64 = rng.gen();
        if roll < 0.5 {
            let entry = format!("\"r{}-{}\"", idx, i);
            replica.import_json_at(entry.as_bytes(), &log, "", None)?;
        } else if roll < 0.8 {
            let key = format!("r{}-k{}", idx, rng.gen_range(0..5));
            replica.set_key(&props, &key, i as i64)?;
        } else {
            let visible: Vec<NodeId> = replica.read(|tree| {
                tree.children(&log)
                    .map(|nodes| nodes.iter().map(|n| n.id().clone()).collect())
                    .unwrap_or_default()
            });
            if !visible.is_empty() {
                let victim = &visible[rng.gen_range(0..visible.len())];
                replica.delete(victim)?;
            }
        }

        if i % 25 == 0 {
            tokio::task::yield_now().await;
        }
    }
    Ok(())
}

/// Sync everybody through replica 0 until all replicas hold the same state.
fn settle(replicas: &[Replica]) -> Result<usize, SdkError> {
    let mut syncs = 0;
    let (hub, rest) = match replicas.split_first() {
        Some(split) => split,
        None => return Ok(0),
    };
    for other in rest {
        hub.sync_with(other)?;
        syncs += 1;
    }
    for other in rest {
        other.sync_with(hub)?;
        syncs += 1;
    }
    Ok(syncs)
}

fn all_converged(replicas: &[Replica]) -> Result<bool, SdkError> {
    let mut saved = Vec::with_capacity(replicas.len());
    for replica in replicas {
        saved.push(replica.read(|tree| tree.save())?);
    }
    Ok(saved.windows(2).all(|pair| pair[0] == pair[1]))
}

/// Concurrent writers, random pairwise syncs, then a final settle round.
pub async fn stress_test_tree(config: StressConfig) -> Result<StressTestStats, SdkError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Tree CRDT Stress Test (Async)                       ║");
    println!("║  Replicas: {} | Ops/Replica: {} | Syncs: {} ║",
             config.num_replicas, config.ops_per_replica, config.num_syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();

    // Initialize replicas from a shared document
    let replicas: Vec<Replica> = (0..config.num_replicas.max(1))
        .map(|i| Replica::new(ReplicaConfigBuilder::new().replica_id(format!("replica-{:02}", i)).build()))
        .collect();
    replicas[0].import_json(br#"{"log": [], "props": {}}"#)?;
    settle(&replicas)?;

    println!("\n[Phase 1/3] Concurrent local edits...");

    let mut handles = vec![];
    for (idx, replica) in replicas.iter().cloned().enumerate() {
        let ops = config.ops_per_replica;
        let seed = config.seed;
        handles.push(tokio::spawn(run_writer(replica, idx, ops, seed)));
    }
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcome?,
            Err(err) => tracing::error!(error = %err, "writer task failed"),
        }
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Random pairwise syncs...");

    let mut sync_times = vec![];
    let mut sync_gen = Box::pin(replica_sync_generator(
        replicas.len(),
        config.num_syncs,
        config.seed,
    ));
    let mut total_syncs = 0;
    while let Some((a, b)) = sync_gen.next().await {
        if a == b {
            continue;
        }
        let sync_start = Instant::now();
        replicas[a].sync_with(&replicas[b])?;
        sync_times.push(sync_start.elapsed());
        total_syncs += 1;

        if total_syncs % 100 == 0 {
            println!("  Syncs completed: {}/{}", total_syncs, config.num_syncs);
        }
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Settling...");
    total_syncs += settle(&replicas)?;
    let converged = all_converged(&replicas)?;
    if !converged {
        tracing::warn!(replicas = replicas.len(), "replicas did not converge");
    }
    println!("[Phase 3/3] ✓ Completed");

    let total_time = start.elapsed();
    let avg_sync_time = if !sync_times.is_empty() {
        sync_times.iter().sum::<Duration>() / sync_times.len() as u32
    } else {
        Duration::ZERO
    };
    let total_operations = (replicas.len() * config.ops_per_replica) + total_syncs;
    let ops_per_second = total_operations as f64 / total_time.as_secs_f64();

    Ok(StressTestStats {
        num_replicas: replicas.len(),
        operations_per_replica: config.ops_per_replica,
        total_syncs,
        total_time,
        avg_sync_time,
        ops_per_second,
        final_nodes: replicas[0].read(|tree| tree.node_count()),
        converged,
    })
}

/// Stress runs at increasing replica counts
pub async fn stress_test_scaling(max_replicas: usize, step_size: usize) -> Result<(), SdkError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Sync Cost vs Replicas             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_replicas = step_size.max(2);
    while current_replicas <= max_replicas {
        let config = StressConfig {
            num_replicas: current_replicas,
            ops_per_replica: 30,
            num_syncs: current_replicas * 10,
            ..StressConfig::default()
        };
        stress_test_tree(config).await?.print();
        current_replicas += step_size.max(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_small_run_converges() {
        let config = StressConfig {
            num_replicas: 3,
            ops_per_replica: 40,
            num_syncs: 30,
            seed: 7,
        };
        let stats = stress_test_tree(config).await.unwrap();
        assert!(stats.converged);
        assert_eq!(stats.num_replicas, 3);
    }
}
