use std::path::Path;
use std::sync::Arc;

use stowage_core::StowageConfig;
use stowage_placement::{StageContext, StageRegistry, StaticInventory, StaticTags};

/// Parse and validate `path`, then resolve every enabled stage name.
pub fn check_config(path: &str) -> anyhow::Result<()> {
    let config = match load(Path::new(path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid config: {e}");
            return Err(e);
        }
    };
    println!("✓ {path} is valid");
    println!("  Filters:  {}", config.scheduler.enabled_filters.join(", "));
    println!("  Weighers: {}", config.scheduler.enabled_weighers.join(", "));
    println!("  Alternates: {}", config.scheduler.max_alternates);
    match config.migration.candidate_budget() {
        Some(budget) => println!("  Migration candidates: {budget}"),
        None => println!("  Migration candidates: unbounded"),
    }
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<StowageConfig> {
    let config = StowageConfig::from_file(path)?;
    let ctx = StageContext::from_services(
        config.clone(),
        Arc::new(StaticInventory::default()),
        Arc::new(StaticTags::new()),
    );
    let registry = StageRegistry::default();
    registry.filter_pipeline(&ctx)?;
    registry.weigher_pipeline(&ctx)?;
    Ok(config)
}
