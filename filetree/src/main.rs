use filetree::simulation::{ExtentAllocator, Simulator, SimulatorConfig};
use filetree::{EngineConfig, FileTree, MemoryStorage};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filetree=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_demo(&config) {
        tracing::error!("Demo failed: {e}");
        std::process::exit(1);
    }

    let sim_config = SimulatorConfig::new(config.sim_seed).with_degree(config.degree);
    match Simulator::new(sim_config).run() {
        Ok(result) => tracing::info!(
            inserts = result.inserts,
            removes = result.removes,
            reads = result.reads,
            skipped_inserts = result.skipped_inserts,
            final_size = result.final_size,
            "Simulation passed"
        ),
        Err(e) => {
            tracing::error!("Simulation failed: {e}");
            std::process::exit(1);
        }
    }
}

fn run_demo(config: &EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let storage = MemoryStorage::new(config.storage_capacity);
    let mut file = FileTree::new("demo", storage, config.degree)?;
    let mut allocator = ExtentAllocator::new(config.storage_capacity);

    let base = b"hello, extent tree";
    let extent = allocator
        .allocate(base.len() as u64)
        .ok_or("storage exhausted")?;
    file.insert(0, vec![extent], base)?;

    // splice into the middle: the straddled key splits at the boundary
    let patch = b" there";
    let extent = allocator
        .allocate(patch.len() as u64)
        .ok_or("storage exhausted")?;
    file.insert(5, vec![extent], patch)?;
    tracing::info!(
        name = file.name(),
        size = file.len(),
        contents = %String::from_utf8_lossy(&file.read_all()?.to_vec()),
        "After inserts"
    );

    file.remove(5, patch.len() as u64)?;
    let coalesced = file.shrink();
    tracing::info!(
        size = file.len(),
        coalesced,
        contents = %String::from_utf8_lossy(&file.read_all()?.to_vec()),
        "After remove + shrink"
    );

    Ok(())
}
