//! Host prerequisite checks for radio access.

use std::fmt;
use std::path::Path;

use meshcore_store::Store;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.passed { "OK" } else { "FAIL" };
        write!(f, "[{label}] {}: {}", self.name, self.detail)
    }
}

/// Runs every check; none short-circuits the others.
pub fn run_checks(config: &Config) -> Vec<Check> {
    vec![
        Check {
            name: "linux",
            passed: cfg!(target_os = "linux"),
            detail: format!("expected Linux host, found {}", std::env::consts::OS),
        },
        device_check("spidev", &config.hardware.spi_device, "SPI device"),
        device_check("gpiochip", &config.hardware.gpio_chip, "GPIO chip"),
        device_check("driver", &config.hardware.device_path, "radio driver device"),
        database_check(config),
    ]
}

pub fn all_passed(checks: &[Check]) -> bool {
    checks.iter().all(|c| c.passed)
}

fn device_check(name: &'static str, path: &str, what: &str) -> Check {
    let passed = Path::new(path).exists();
    Check {
        name,
        passed,
        detail: if passed {
            format!("{what} {path} present")
        } else {
            format!("expected {what} {path}")
        },
    }
}

fn database_check(config: &Config) -> Check {
    let path = &config.database.path;
    match Store::open(path, config.db_settings()) {
        Ok(_) => Check {
            name: "database",
            passed: true,
            detail: format!("{path} opened, schema current"),
        },
        Err(e) => Check {
            name: "database",
            passed: false,
            detail: format!("{path}: {e}"),
        },
    }
}
