use serde::{Serialize, Deserialize};
use std::fs::File;
use parking_lot::RwLock;
use crate::result::*;
use crate::util::{convert_io_result, convert_serde_json_result, get_path_relative_to_cwd};

const CONFIG_FILE: &str = "kcore.cfg";

pub const DEFAULT_PROCESS_THREAD_LIMIT: u32 = 608;
pub const DEFAULT_TLS_PAGE_LIMIT: u32 = 64;
pub const DEFAULT_TRACKING_PAGE_SIZE: u64 = 0x1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub process_thread_limit: u32,
    pub tls_page_limit: u32,
    pub tracking_page_size: u64,
    pub log_scheduling: bool,
    pub log_memory_tracking: bool
}

impl Default for Config {
    fn default() -> Self {
        Self {
            process_thread_limit: DEFAULT_PROCESS_THREAD_LIMIT,
            tls_page_limit: DEFAULT_TLS_PAGE_LIMIT,
            tracking_page_size: DEFAULT_TRACKING_PAGE_SIZE,
            log_scheduling: false,
            log_memory_tracking: false
        }
    }
}

static G_CONFIG: RwLock<Option<Config>> = parking_lot::const_rwlock(None);
static G_CONFIG_PATH: RwLock<Option<String>> = parking_lot::const_rwlock(None);

/// Returns the loaded configuration, or the defaults if nothing was loaded yet.
pub fn get_config() -> Config {
    G_CONFIG.read().unwrap_or_default()
}

pub fn get_config_path() -> Option<String> {
    G_CONFIG_PATH.read().clone()
}

pub fn set_config(cfg: Config, path: Option<String>) {
    *G_CONFIG.write() = Some(cfg);
    if path.is_some() {
        *G_CONFIG_PATH.write() = path;
    }
}

pub fn read_config_file(path: &str) -> Result<Config> {
    let file = convert_io_result(File::open(path))?;
    convert_serde_json_result(serde_json::from_reader(file))
}

pub fn write_config_file(path: &str, cfg: &Config) -> Result<()> {
    let file = convert_io_result(File::create(path))?;
    convert_serde_json_result(serde_json::to_writer_pretty(file, cfg))
}

pub fn load_config(path: String) -> Result<()> {
    let cfg = read_config_file(&path)?;
    set_config(cfg, Some(path));

    Ok(())
}

pub fn save_config() -> Result<()> {
    match get_config_path() {
        Some(path) => write_config_file(&path, &get_config()),
        None => crate::result::ResultIoFailure::make_err()
    }
}

pub fn initialize() -> Result<()> {
    let config_path = get_path_relative_to_cwd(CONFIG_FILE)?;
    if load_config(config_path.clone()).is_err() {
        set_config(Config::default(), Some(config_path));
        save_config()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_loading() {
        let cfg = Config::default();
        assert_eq!(cfg.process_thread_limit, 608);
        assert_eq!(cfg.tls_page_limit, 64);
        assert_eq!(cfg.tracking_page_size, 0x1000);
        assert!(!cfg.log_scheduling);
        assert!(!cfg.log_memory_tracking);
    }

    #[test]
    fn file_round_trip_and_partial_files() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("kcore-cfg-test-{}.cfg", std::process::id()));
        let path_str = path.display().to_string();

        let cfg = Config {
            process_thread_limit: 32,
            tls_page_limit: 2,
            tracking_page_size: 0x4000,
            log_scheduling: true,
            log_memory_tracking: false
        };
        write_config_file(&path_str, &cfg).unwrap();
        assert_eq!(read_config_file(&path_str).unwrap(), cfg);

        // Missing fields fall back to their defaults
        std::fs::write(&path, "{ \"tls_page_limit\": 3 }").unwrap();
        let partial = read_config_file(&path_str).unwrap();
        assert_eq!(partial.tls_page_limit, 3);
        assert_eq!(partial.process_thread_limit, DEFAULT_PROCESS_THREAD_LIMIT);

        std::fs::write(&path, "not json").unwrap();
        let rc = read_config_file(&path_str).unwrap_err();
        assert!(crate::result::ResultInvalidJson::matches(rc));

        let _ = std::fs::remove_file(&path);
    }
}
