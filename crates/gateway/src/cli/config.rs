//! `relay config show|validate`.

use relay_domain::config::ConfigSeverity;
use relay_domain::Config;

pub fn show(config: &Config) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Prints every issue and returns `false` if any is `Error` severity, so the
/// caller can pick a process exit code.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config OK, no issues found");
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues.iter().any(|i| i.severity == ConfigSeverity::Error)
}
