//! `taskpilot config` — Configuration management commands.

use super::load_config;
use std::path::Path;
use taskpilot_config::FlowConfig;

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    match load_config(path) {
        Ok(config) => {
            println!("   ✅ Config parsed successfully");

            let mut warnings = Vec::new();

            if !config.guard.enabled {
                warnings.push("Loop guard is disabled; repeated invocations will not be caught");
            }

            if config.admission.max_concurrent > 1 && config.admission.base_delay_ms == 0 {
                warnings.push("Concurrent admissions without a base delay may trip rate limits");
            }

            if config.admission.default_timeout_ms < config.admission.batch_window_ms {
                warnings.push("Default call timeout is shorter than the batch window");
            }

            if config.items.max_invocations > config.guard.cumulative_ceiling as usize {
                warnings.push("max_invocations exceeds the guard's cumulative ceiling");
            }

            if warnings.is_empty() {
                println!("   ✅ All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   ⚠️  {w}");
                }
            }

            let a = &config.admission;
            println!();
            println!(
                "   Admission:  {} concurrent, delay {}ms ({}–{}ms), queue {}",
                a.max_concurrent, a.base_delay_ms, a.min_delay_ms, a.max_delay_ms, a.max_queue_size
            );
            println!(
                "   Batching:   up to {} per key, {}ms window",
                a.batch_size, a.batch_window_ms
            );
            println!(
                "   Guard:      repeat limit {}, ceiling {}",
                config.guard.consecutive_threshold, config.guard.cumulative_ceiling
            );
            println!(
                "   Items:      {} attempts, {} replans, {} in parallel",
                config.items.max_attempts, config.items.max_replans, config.items.max_parallel_items
            );
        }
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = FlowConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}
