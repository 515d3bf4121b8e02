use std::path::PathBuf;
use std::time::Duration;

pub(crate) const DATA_DIR_ENV: &str = "DATA_DIR";
pub(crate) const TARGET_SIZE_ENV: &str = "SRC_TARGET_SIZE";
pub(crate) const WORKERS_ENV: &str = "INDEXSERVER_WORKERS";
pub(crate) const LISTEN_ENV: &str = "INDEXSERVER_LISTEN";

pub(crate) const DEFAULT_TARGET_SIZE_MIB: u64 = 2000;
pub(crate) const DEFAULT_LISTEN: &str = "127.0.0.1:6072";
const DEFAULT_INDEX_SUBDIR: &str = "index";
const MAX_WORKERS: usize = 64;
const MAX_TARGET_SIZE_MIB: u64 = 1024 * 1024;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Shard directory: `--index`, else `$DATA_DIR/index`, else `./index`.
pub(crate) fn resolve_index_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| {
        env_nonempty(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_INDEX_SUBDIR)
    })
}

fn parse_target_size_mib(raw: Option<&str>) -> u64 {
    raw.map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_TARGET_SIZE_MIB)
        .min(MAX_TARGET_SIZE_MIB)
}

/// Merge target in MiB: `--merge-target-size`, else `$SRC_TARGET_SIZE`.
pub(crate) fn resolve_target_size_mib(flag: Option<u64>) -> u64 {
    match flag {
        Some(mib) => mib.min(MAX_TARGET_SIZE_MIB),
        None => parse_target_size_mib(env_nonempty(TARGET_SIZE_ENV).as_deref()),
    }
}

pub(crate) fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(1024 * 1024)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .div_ceil(2)
}

fn parse_workers(raw: Option<&str>, default_value: usize) -> usize {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
        .clamp(1, MAX_WORKERS)
}

pub(crate) fn resolve_workers(flag: Option<usize>) -> usize {
    match flag {
        Some(n) => n.clamp(1, MAX_WORKERS),
        None => parse_workers(env_nonempty(WORKERS_ENV).as_deref(), default_workers()),
    }
}

pub(crate) fn resolve_listen(flag: Option<String>) -> String {
    flag.or_else(|| env_nonempty(LISTEN_ENV))
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
}

/// Parses `30s`, `5m`, `2h`, `250ms` or a bare number of seconds.
pub(crate) fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid interval '{raw}'"))?;
    let interval = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => return Err(format!("unknown interval unit '{unit}' in '{raw}'")),
    };
    if interval.is_zero() {
        return Err("interval must be positive".to_string());
    }
    Ok(interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_size_parse_clamps_and_defaults() {
        assert_eq!(parse_target_size_mib(None), DEFAULT_TARGET_SIZE_MIB);
        assert_eq!(parse_target_size_mib(Some("abc")), DEFAULT_TARGET_SIZE_MIB);
        assert_eq!(parse_target_size_mib(Some("0")), DEFAULT_TARGET_SIZE_MIB);
        assert_eq!(parse_target_size_mib(Some(" 64 ")), 64);
        assert_eq!(parse_target_size_mib(Some("99999999999")), MAX_TARGET_SIZE_MIB);
    }

    #[test]
    fn workers_parse_clamps() {
        assert_eq!(parse_workers(Some("0"), 4), 1);
        assert_eq!(parse_workers(Some("1000"), 4), MAX_WORKERS);
        assert_eq!(parse_workers(Some(""), 4), 4);
        assert_eq!(parse_workers(None, 3), 3);
    }

    #[test]
    fn explicit_index_flag_wins() {
        assert_eq!(
            resolve_index_dir(Some(PathBuf::from("/srv/idx"))),
            PathBuf::from("/srv/idx")
        );
    }

    #[test]
    fn intervals_accept_units() {
        assert_eq!(parse_interval("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_interval("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_interval("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_interval("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_interval("12"), Ok(Duration::from_secs(12)));
        assert!(parse_interval("0s").is_err());
        assert!(parse_interval("5d").is_err());
        assert!(parse_interval("m").is_err());
    }

    #[test]
    fn mib_conversion_saturates() {
        assert_eq!(mib_to_bytes(2), 2 * 1024 * 1024);
        assert_eq!(mib_to_bytes(u64::MAX), u64::MAX);
    }
}
