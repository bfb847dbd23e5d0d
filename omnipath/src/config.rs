//! Environment-driven configuration, read once per process.
use crate::{Error, Result};
use std::{env, sync::OnceLock};

pub const DEFAULT_READER_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_READER_MAX_BUFFER_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_WRITER_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_WRITER_MAX_BUFFER_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_MAX_RETRY_TIMES: usize = 10;
pub const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCacheMode {
    ThreadLocal,
    ProcessLocal,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub reader_block_size: u64,
    pub reader_max_buffer_size: u64,
    pub writer_block_size: u64,
    pub writer_max_buffer_size: u64,
    pub writer_block_autoscale: bool,
    pub max_workers: usize,
    pub s3_max_retry_times: usize,
    pub http_max_retry_times: usize,
    pub s3_client_cache_mode: ClientCacheMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reader_block_size: DEFAULT_READER_BLOCK_SIZE,
            reader_max_buffer_size: DEFAULT_READER_MAX_BUFFER_SIZE,
            writer_block_size: DEFAULT_WRITER_BLOCK_SIZE,
            writer_max_buffer_size: DEFAULT_WRITER_MAX_BUFFER_SIZE,
            writer_block_autoscale: true,
            max_workers: DEFAULT_MAX_WORKERS,
            s3_max_retry_times: DEFAULT_MAX_RETRY_TIMES,
            http_max_retry_times: DEFAULT_MAX_RETRY_TIMES,
            s3_client_cache_mode: ClientCacheMode::ThreadLocal,
        }
    }
}

impl Config {
    fn from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Some(value) = env_var("OMNIPATH_READER_BLOCK_SIZE") {
            config.reader_block_size = parse_positive_quantity("OMNIPATH_READER_BLOCK_SIZE", &value)?;
        }
        if let Some(value) = env_var("OMNIPATH_READER_MAX_BUFFER_SIZE") {
            config.reader_max_buffer_size = parse_quantity(&value)?;
        }
        if let Some(value) = env_var("OMNIPATH_WRITER_BLOCK_SIZE") {
            config.writer_block_size = parse_positive_quantity("OMNIPATH_WRITER_BLOCK_SIZE", &value)?;
            // a pinned block size opts out of autoscaling unless explicitly
            // re-enabled below
            config.writer_block_autoscale = false;
        }
        if let Some(value) = env_var("OMNIPATH_WRITER_MAX_BUFFER_SIZE") {
            config.writer_max_buffer_size = parse_quantity(&value)?;
        }
        if let Some(value) = env_var("OMNIPATH_WRITER_BLOCK_AUTOSCALE") {
            config.writer_block_autoscale = to_boolean(&value);
        }
        if let Some(value) = env_var("OMNIPATH_MAX_WORKERS") {
            config.max_workers = parse_usize("OMNIPATH_MAX_WORKERS", &value)?.max(1);
        }

        let default_retries = match env_var("OMNIPATH_MAX_RETRY_TIMES") {
            Some(value) => parse_usize("OMNIPATH_MAX_RETRY_TIMES", &value)?,
            None => DEFAULT_MAX_RETRY_TIMES,
        };
        config.s3_max_retry_times = match env_var("OMNIPATH_S3_MAX_RETRY_TIMES") {
            Some(value) => parse_usize("OMNIPATH_S3_MAX_RETRY_TIMES", &value)?,
            None => default_retries,
        };
        config.http_max_retry_times = match env_var("OMNIPATH_HTTP_MAX_RETRY_TIMES") {
            Some(value) => parse_usize("OMNIPATH_HTTP_MAX_RETRY_TIMES", &value)?,
            None => default_retries,
        };

        config.s3_client_cache_mode = match env_var("OMNIPATH_S3_CLIENT_CACHE_MODE").as_deref() {
            None | Some("thread_local") => ClientCacheMode::ThreadLocal,
            Some("process_local") => ClientCacheMode::ProcessLocal,
            Some(other) => {
                return Err(Error::Misconfigured {
                    detail: format!("unknown OMNIPATH_S3_CLIENT_CACHE_MODE: {:?}", other),
                })
            }
        };

        Ok(config)
    }
}

/// The process-wide configuration snapshot, parsed once on first use.
/// Invalid values fail fast rather than silently falling back.
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match Config::from_env() {
        Ok(config) => config,
        Err(err) => panic!("invalid environment configuration: {err}"),
    })
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn to_boolean(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| Error::Misconfigured {
        detail: format!("{name} must be an integer, got {value:?}"),
    })
}

fn parse_positive_quantity(name: &str, value: &str) -> Result<u64> {
    let quantity = parse_quantity(value)?;
    if quantity == 0 {
        return Err(Error::Misconfigured {
            detail: format!("{name} must be bigger than 0, got {value:?}"),
        });
    }
    Ok(quantity)
}

/// Parse a canonical-form quantity like `200Mi` or `8M` into bytes.
///
/// Supported suffixes, base 1024: `Ki | Mi | Gi | Ti | Pi | Ei`;
/// base 1000: `k | M | G | T | P | E` (bare `K` is accepted as `k`).
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    const EXPONENTS: [(char, u32); 7] = [
        ('K', 1),
        ('k', 1),
        ('M', 2),
        ('G', 3),
        ('T', 4),
        ('P', 5),
        ('E', 6),
    ];

    fn exponent(suffix: char) -> Option<u32> {
        EXPONENTS
            .iter()
            .find(|(c, _)| *c == suffix)
            .map(|(_, e)| *e)
    }

    let invalid = || Error::Misconfigured {
        detail: format!("invalid quantity: {:?}", quantity),
    };

    let chars: Vec<char> = quantity.chars().collect();
    let (number, base, exp) = if chars.len() >= 2 && chars[chars.len() - 1] == 'i' {
        let suffix = chars[chars.len() - 2];
        // the SI inconsistency: `ki` is not a unit
        if suffix == 'k' {
            return Err(invalid());
        }
        match exponent(suffix) {
            Some(exp) => (&quantity[..quantity.len() - 2], 1024u64, exp),
            None => return Err(invalid()),
        }
    } else if let Some(&last) = chars.last() {
        match exponent(last) {
            Some(exp) => (&quantity[..quantity.len() - 1], 1000u64, exp),
            None => (quantity, 1u64, 0),
        }
    } else {
        return Err(invalid());
    };

    let number: u64 = number.trim().parse().map_err(|_| invalid())?;
    Ok(number * base.pow(exp))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_numbers() {
        assert_eq!(parse_quantity("0").unwrap(), 0);
        assert_eq!(parse_quantity("8388608").unwrap(), 8388608);
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("8Mi").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_quantity("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn si_suffixes() {
        assert_eq!(parse_quantity("1k").unwrap(), 1000);
        assert_eq!(parse_quantity("1K").unwrap(), 1000);
        assert_eq!(parse_quantity("3M").unwrap(), 3_000_000);
        assert_eq!(parse_quantity("1T").unwrap(), 1_000_000_000_000);
    }

    #[test]
    fn invalid_suffixes_fail_fast() {
        assert!(parse_quantity("1ki").is_err());
        assert!(parse_quantity("1Q").is_err());
        assert!(parse_quantity("1Qi").is_err());
        assert!(parse_quantity("Mi").is_err());
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("1.5M").is_err());
    }
}
