//! `relay doctor` — validate configuration and probe that the configured
//! backend binaries are resolvable on `PATH`.

use relay_domain::config::ConfigSeverity;
use relay_domain::Config;

pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("relay doctor");
    println!("============");

    let config_exists = std::path::Path::new(config_path).exists();
    print_check(
        "config file",
        true,
        &format!(
            "{config_path}: {}",
            if config_exists { "found" } else { "not found, using defaults" }
        ),
    );

    let issues = config.validate();
    let config_ok = !issues.iter().any(|i| i.severity == ConfigSeverity::Error);
    print_check("config validation", config_ok, &format!("{} issue(s)", issues.len()));
    for issue in &issues {
        println!("    - {issue}");
    }

    let persistent_ok = probe_binary(&config.backends.persistent_path);
    print_check(
        "persistent backend binary",
        persistent_ok,
        &config.backends.persistent_path,
    );

    let ephemeral_ok = probe_binary(&config.backends.ephemeral_path);
    print_check(
        "ephemeral backend binary",
        ephemeral_ok,
        &config.backends.ephemeral_path,
    );

    let workspace_ok = config.workspace.state_path.parent().map(|p| p.exists() || p == std::path::Path::new("")).unwrap_or(true);
    print_check(
        "state directory parent exists",
        workspace_ok,
        &config.workspace.state_path.display().to_string(),
    );

    let all_ok = config_ok && persistent_ok && ephemeral_ok;
    println!();
    println!(
        "{}",
        if all_ok { "all checks passed" } else { "one or more checks failed" }
    );
    Ok(all_ok)
}

fn print_check(label: &str, passed: bool, detail: &str) {
    let marker = if passed { "ok" } else { "FAIL" };
    println!("[{marker:>4}] {label}: {detail}");
}

/// Resolves `name` against `PATH` the way a shell would, without shelling
/// out: absolute/relative paths are checked directly, bare names are
/// searched across `PATH` entries.
fn probe_binary(name: &str) -> bool {
    let candidate = std::path::Path::new(name);
    if candidate.is_absolute() || name.contains(std::path::MAIN_SEPARATOR) {
        return candidate.is_file();
    }
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_path_is_checked_directly() {
        assert!(probe_binary("/bin/sh") || probe_binary("/usr/bin/sh"));
        assert!(!probe_binary("/definitely/not/a/real/binary"));
    }

    #[test]
    fn bare_name_is_searched_across_path() {
        assert!(probe_binary("sh") || probe_binary("ls"));
        assert!(!probe_binary("definitely-not-a-real-binary-xyz"));
    }
}
