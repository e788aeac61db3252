use frecent::config::{resolve_data_dir, FrecentConfig, CONFIG_KEYS};

/// Run the config command
pub fn run_config(key: Option<&str>, value: Option<&str>) -> Result<(), String> {
    let data_dir = resolve_data_dir().map_err(|e| format!("Failed to create data directory: {}", e))?;
    let mut config = FrecentConfig::new(data_dir);

    match (key, value) {
        (None, None) => print_keys(&config),
        (Some(k), None) => {
            if let Some(v) = config.get(k) {
                println!("{}: {}", k, v);
            } else if let Some(known) = CONFIG_KEYS.iter().find(|c| c.key == k) {
                println!("{}: {} (default)", k, known.default);
            } else {
                println!("{}: (not set)", k);
            }
        }
        (Some(k), Some(v)) => {
            if !CONFIG_KEYS.iter().any(|c| c.key == k) {
                println!("Note: {} is not a known setting", k);
            }
            config.set(k, v).map_err(|e| format!("Failed to save: {}", e))?;
            println!("Set {} = {}", k, v);
        }
        (None, Some(_)) => {
            return Err("Key required when setting a value".to_string());
        }
    }

    Ok(())
}

fn print_keys(config: &FrecentConfig) {
    println!("Current configuration:\n");
    println!("{:2} {:36} {:10} {}", "", "Key", "Value", "Description");
    println!("{}", "-".repeat(80));

    for key in CONFIG_KEYS {
        let (marker, value) = match config.get(key.key) {
            Some(v) => (" *", v),
            None => ("  ", key.default.to_string()),
        };
        println!("{} {:36} {:10} {}", marker, key.key, value, key.description);
    }

    println!("\n* = set in _config.yaml");
    println!("\nChange a setting with: frecent config <key> <value>");
}
