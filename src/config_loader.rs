/// Configuration loader for the film scanner
///
/// Single source of truth is film_scanner.yaml (next to Cargo.toml unless
/// overridden). Host blocks are looked up by hostname under the per-OS
/// sections, with an optional `default` block as fallback. Environment
/// variables (optionally from `.env`) are applied on top.

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "film_scanner.yaml";

const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

#[derive(Debug, Clone, PartialEq)]
pub struct ScannerSettings {
    pub ard_port: Option<String>, // None means auto-discover
    pub ard_baud: u32,
    pub ard_reset_delay_ms: u64,
    pub ard_command_timeout_ms: u64,
    pub fine_step: i64,
    pub coarse_step: i64,
    pub default_advance: i64,
    pub scan_root: PathBuf,
    pub gphoto2_path: String,
    pub capture_timeout_s: u64,
    pub preview_timeout_s: u64,
    pub camera_check_interval_s: u64,
    pub kill_gphoto2: bool,
    pub web_bind: String,
    pub web_port: u16,
    pub simulate: bool,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            ard_port: None,
            ard_baud: 115200,
            ard_reset_delay_ms: 2000,
            ard_command_timeout_ms: 500,
            fine_step: 8,
            coarse_step: 64,
            default_advance: 1200,
            scan_root: expand_home("~/scans"),
            gphoto2_path: "gphoto2".to_string(),
            capture_timeout_s: 20,
            preview_timeout_s: 10,
            camera_check_interval_s: 5,
            kill_gphoto2: true,
            web_bind: "0.0.0.0".to_string(),
            web_port: 5000,
            simulate: false,
        }
    }
}

/// Location of film_scanner.yaml: FILM_SCANNER_CONFIG if set, else the crate directory.
pub fn default_config_path() -> PathBuf {
    let _ = dotenv();
    env::var("FILM_SCANNER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` using $HOME.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Find the block for `hostname` under RaspberryPi / Ubuntu / macOS, falling back to `default`.
fn find_host_block<'a>(yaml: &'a serde_yaml::Value, hostname: &str) -> Option<&'a serde_yaml::Mapping> {
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return v.as_mapping();
                }
            }
        }
    }
    yaml.get("default").and_then(|v| v.as_mapping())
}

fn get_i64(block: &serde_yaml::Mapping, key: &str) -> Option<i64> {
    block.get(&serde_yaml::Value::from(key)).and_then(|v| v.as_i64())
}

fn get_bool(block: &serde_yaml::Mapping, key: &str) -> Option<bool> {
    block.get(&serde_yaml::Value::from(key)).and_then(|v| v.as_bool())
}

fn get_str(block: &serde_yaml::Mapping, key: &str) -> Option<String> {
    block.get(&serde_yaml::Value::from(key)).and_then(|v| {
        if v.is_null() {
            None
        } else {
            v.as_str().map(|s| s.to_string())
        }
    })
}

/// Parse scanner settings for `hostname` from YAML text.
pub fn parse_scanner_settings(text: &str, hostname: &str) -> Result<ScannerSettings> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text)
        .map_err(|e| anyhow!("Malformed {}: {}", CONFIG_FILE_NAME, e))?;
    let mut settings = ScannerSettings::default();

    let Some(block) = find_host_block(&yaml, hostname) else {
        log::warn!(target: "config_loader", "No host entry for '{}' and no default block in {} - using built-in defaults", hostname, CONFIG_FILE_NAME);
        return Ok(settings);
    };

    settings.ard_port = get_str(block, "ARD_PORT");
    if let Some(v) = get_i64(block, "ARD_BAUD") {
        settings.ard_baud = u32::try_from(v).map_err(|_| anyhow!("ARD_BAUD {} out of range", v))?;
    }
    if let Some(v) = get_i64(block, "ARD_RESET_DELAY_MS") { settings.ard_reset_delay_ms = v.max(0) as u64; }
    if let Some(v) = get_i64(block, "ARD_COMMAND_TIMEOUT_MS") { settings.ard_command_timeout_ms = v.max(0) as u64; }
    if let Some(v) = get_i64(block, "FINE_STEP") { settings.fine_step = v; }
    if let Some(v) = get_i64(block, "COARSE_STEP") { settings.coarse_step = v; }
    if let Some(v) = get_i64(block, "DEFAULT_ADVANCE") { settings.default_advance = v; }
    if let Some(v) = get_str(block, "SCAN_ROOT") { settings.scan_root = expand_home(&v); }
    if let Some(v) = get_str(block, "GPHOTO2_PATH") { settings.gphoto2_path = v; }
    if let Some(v) = get_i64(block, "CAPTURE_TIMEOUT_S") { settings.capture_timeout_s = v.max(1) as u64; }
    if let Some(v) = get_i64(block, "PREVIEW_TIMEOUT_S") { settings.preview_timeout_s = v.max(1) as u64; }
    if let Some(v) = get_i64(block, "CAMERA_CHECK_INTERVAL_S") { settings.camera_check_interval_s = v.max(0) as u64; }
    if let Some(v) = get_bool(block, "KILL_GPHOTO2") { settings.kill_gphoto2 = v; }
    if let Some(v) = get_str(block, "WEB_BIND") { settings.web_bind = v; }
    if let Some(v) = get_i64(block, "WEB_PORT") {
        settings.web_port = u16::try_from(v).map_err(|_| anyhow!("WEB_PORT {} out of range", v))?;
    }
    if let Some(v) = get_bool(block, "SIMULATE") { settings.simulate = v; }

    if settings.fine_step <= 0 || settings.coarse_step <= 0 {
        return Err(anyhow!("FINE_STEP and COARSE_STEP must be positive for '{}'", hostname));
    }
    Ok(settings)
}

impl ScannerSettings {
    /// Apply SCANNER_* overrides. `lookup` is usually `env::var(..).ok()`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SCANNER_ARD_PORT") {
            self.ard_port = if port.trim().is_empty() { None } else { Some(port) };
        }
        if let Some(port) = lookup("SCANNER_WEB_PORT") {
            self.web_port = port.trim().parse()
                .with_context(|| format!("SCANNER_WEB_PORT is not a port number: {}", port))?;
        }
        if let Some(root) = lookup("SCANNER_SCAN_ROOT") {
            self.scan_root = expand_home(root.trim());
        }
        if let Some(sim) = lookup("SCANNER_SIMULATE") {
            self.simulate = matches!(sim.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(())
    }
}

/// Load settings for `hostname` from `path`. A missing file is not fatal.
pub fn load_scanner_settings(path: &Path, hostname: &str) -> Result<ScannerSettings> {
    let _ = dotenv();
    let mut settings = match File::open(path) {
        Ok(mut file) => {
            let mut text = String::new();
            std::io::Read::read_to_string(&mut file, &mut text)
                .with_context(|| format!("Failed to read {:?}", path))?;
            parse_scanner_settings(&text, hostname)?
        }
        Err(e) => {
            log::warn!(target: "config_loader", "No {} at {:?} ({}) - using built-in defaults", CONFIG_FILE_NAME, path, e);
            ScannerSettings::default()
        }
    };
    settings.apply_overrides(|key| env::var(key).ok())?;

    log::info!(target: "config_loader", "ScannerSettings: host={}, port={:?}, fine={}, coarse={}, scan_root={:?}, web={}:{}, simulate={}",
               hostname, settings.ard_port, settings.fine_step, settings.coarse_step,
               settings.scan_root, settings.web_bind, settings.web_port, settings.simulate);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const YAML: &str = r#"
RaspberryPi:
  scanpi:
    ARD_PORT: /dev/ttyACM0
    FINE_STEP: 4
    COARSE_STEP: 32
    WEB_PORT: 8080
    KILL_GPHOTO2: false
Ubuntu:
  bench:
    ARD_PORT: null
    SIMULATE: true
default:
  COARSE_STEP: 100
"#;

    #[test]
    fn test_host_block_lookup() {
        let s = parse_scanner_settings(YAML, "scanpi").unwrap();
        assert_eq!(s.ard_port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(s.fine_step, 4);
        assert_eq!(s.coarse_step, 32);
        assert_eq!(s.web_port, 8080);
        assert!(!s.kill_gphoto2);

        let bench = parse_scanner_settings(YAML, "bench").unwrap();
        assert_eq!(bench.ard_port, None);
        assert!(bench.simulate);
        assert_eq!(bench.fine_step, 8);
    }

    #[test]
    fn test_default_block_fallback() {
        let s = parse_scanner_settings(YAML, "unknown-host").unwrap();
        assert_eq!(s.coarse_step, 100);
        assert_eq!(s.fine_step, 8);
    }

    #[test]
    fn test_rejects_non_positive_steps() {
        let yaml = "default:\n  FINE_STEP: 0\n";
        assert!(parse_scanner_settings(yaml, "x").is_err());
    }

    #[test]
    fn test_rejects_out_of_range_numbers() {
        assert!(parse_scanner_settings("default:\n  ARD_BAUD: -1\n", "x").is_err());
        assert!(parse_scanner_settings("default:\n  ARD_BAUD: 4294967296\n", "x").is_err());
        assert!(parse_scanner_settings("default:\n  WEB_PORT: 70000\n", "x").is_err());
        assert_eq!(parse_scanner_settings("default:\n  ARD_BAUD: 57600\n", "x").unwrap().ard_baud, 57600);
    }

    #[test]
    fn test_malformed_yaml_is_error() {
        assert!(parse_scanner_settings("default: [unterminated", "x").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SCANNER_WEB_PORT", "6001"),
            ("SCANNER_SIMULATE", "yes"),
            ("SCANNER_SCAN_ROOT", "/tmp/film"),
        ].into_iter().collect();
        let mut s = ScannerSettings::default();
        s.apply_overrides(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.web_port, 6001);
        assert!(s.simulate);
        assert_eq!(s.scan_root, PathBuf::from("/tmp/film"));

        let mut bad = ScannerSettings::default();
        assert!(bad.apply_overrides(|k| (k == "SCANNER_WEB_PORT").then(|| "http".to_string())).is_err());
    }
}
