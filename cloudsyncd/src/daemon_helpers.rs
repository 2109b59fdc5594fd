/// Updates the storage records after a folder was renamed or removed on disk.
fn apply_directory_event(config: &ConfigFile, event: &DirectoryEvent) -> anyhow::Result<()> {
    match event {
        DirectoryEvent::Renamed {
            local_unique_id,
            new_name,
        } => {
            let renamed = config
                .rename_storage(*local_unique_id, new_name)
                .context("failed to save renamed storage")?;
            if !renamed {
                warn!(local_unique_id, new_name = %new_name, "rename for unknown storage folder");
            }
        }
        DirectoryEvent::Deleted { local_unique_id } => {
            match config
                .remove_storage(*local_unique_id)
                .context("failed to save removed storage")?
            {
                Some(record) => info!(
                    storage = %record.id,
                    name = %record.display_name,
                    "storage folder is gone, storage removed"
                ),
                None => warn!(local_unique_id, "deletion for unknown storage folder"),
            }
        }
    }
    Ok(())
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_CONFIG_DIR_NAME)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
