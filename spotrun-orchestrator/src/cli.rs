use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RankingArg {
    ReliabilityFirst,
    Weighted,
}

/// Launch a training run on a spot GPU marketplace and tear the instance down afterwards.
///
/// Exit code is the training exit code when training ran. Reserved codes: 64 config,
/// 65 missing credential, 69 no matching offer, 70 catalog unavailable, 71 provisioning
/// exhausted, 72 instance lost, 73 run timed out, 74 image step, 75 marketplace error,
/// 100 termination failed, 130 cancelled.
#[derive(Parser, Debug, Clone)]
#[command(name = "spotrun")]
#[command(version)]
pub struct Cli {
    /// Container image to run.
    #[arg(
        short = 'i',
        long = "image",
        env = "SPOTRUN_IMAGE",
        default_value = "pytorch/pytorch:2.1.0-cuda12.1-cudnn8-runtime"
    )]
    pub image: String,

    /// Training config path inside the image.
    #[arg(short, long, env = "SPOTRUN_CONFIG", default_value = "configs/config.yaml")]
    pub config: String,

    /// Training command; `--config <path>` and the extra args are appended.
    #[arg(long, env = "SPOTRUN_ENTRYPOINT", default_value = "python train.py")]
    pub entrypoint: String,

    /// GPU model filter (repeatable, or comma separated). `*` wildcards, `^` anchors.
    #[arg(long = "gpu-type", env = "SPOTRUN_GPU_TYPES", value_delimiter = ',', num_args = 1..)]
    pub gpu_types: Vec<String>,

    /// Maximum price in USD per hour.
    #[arg(long, env = "SPOTRUN_MAX_PRICE", default_value_t = 2.0)]
    pub max_price: f64,

    /// Minimum host reliability in [0, 1].
    #[arg(long, env = "SPOTRUN_MIN_RELIABILITY", default_value_t = 0.9)]
    pub min_reliability: f64,

    #[arg(long, env = "SPOTRUN_GPUS", default_value_t = 1)]
    pub gpus: u32,

    /// Disk to allocate, in GB. Also the minimum offer disk.
    #[arg(long, env = "SPOTRUN_DISK", default_value_t = 50.0)]
    pub disk: f64,

    #[arg(long, env = "SPOTRUN_MIN_INET_DOWN", default_value_t = 100.0)]
    pub min_inet_down: f64,

    #[arg(long, env = "SPOTRUN_MIN_INET_UP", default_value_t = 100.0)]
    pub min_inet_up: f64,

    /// Case-insensitive substring of the host location, e.g. "US" or "Norway".
    #[arg(long, env = "SPOTRUN_REGION")]
    pub region: Option<String>,

    /// Offers tried, best first, before giving up.
    #[arg(long, env = "SPOTRUN_MAX_OFFERS", default_value_t = 3)]
    pub max_offers: usize,

    #[arg(long, env = "SPOTRUN_BOOT_TIMEOUT", default_value = "10m", value_parser = parse_duration)]
    pub boot_timeout: Duration,

    #[arg(long, env = "SPOTRUN_BOOT_POLL_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub boot_poll_interval: Duration,

    /// Wall-clock budget for training.
    #[arg(long, env = "SPOTRUN_RUN_TIMEOUT", default_value = "24h", value_parser = parse_duration)]
    pub run_timeout: Duration,

    /// Status poll interval while training runs.
    #[arg(long, env = "SPOTRUN_POLL_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Training log lines fetched per poll (0 disables).
    #[arg(long, env = "SPOTRUN_LOG_TAIL", default_value_t = 50)]
    pub log_tail: usize,

    #[arg(long, env = "SPOTRUN_RANKING", value_enum, default_value_t = RankingArg::ReliabilityFirst)]
    pub ranking: RankingArg,

    /// Reliability bucket width for `reliability-first`.
    #[arg(long, env = "SPOTRUN_RELIABILITY_TOLERANCE", default_value_t = 0.0)]
    pub reliability_tolerance: f64,

    #[arg(long, env = "SPOTRUN_PRICE_WEIGHT", default_value_t = 30.0)]
    pub price_weight: f64,

    #[arg(long, env = "SPOTRUN_RELIABILITY_WEIGHT", default_value_t = 15.0)]
    pub reliability_weight: f64,

    /// Select an offer and print it; create nothing.
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub skip_build: bool,

    #[arg(long)]
    pub skip_push: bool,

    /// Build and push the image from this Dockerfile before launching.
    #[arg(long, env = "SPOTRUN_DOCKERFILE")]
    pub dockerfile: Option<String>,

    #[arg(long, env = "SPOTRUN_BUILD_TIMEOUT", default_value = "1h", value_parser = parse_duration)]
    pub build_timeout: Duration,

    /// List your instances and exit.
    #[arg(long)]
    pub list: bool,

    /// Write a JSON run report here.
    #[arg(long, env = "SPOTRUN_REPORT")]
    pub report: Option<PathBuf>,

    /// POSTed to when an instance could not be destroyed.
    #[arg(long, env = "SPOTRUN_ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    #[arg(long, env = "GITHUB_ACTIONS", hide = true)]
    pub github_actions: bool,

    #[arg(long, env = "SPOTRUN_PROVIDER", default_value = "vastai")]
    pub provider: String,

    #[arg(long, env = "VAST_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "VAST_API_URL")]
    pub api_url: Option<String>,

    #[arg(long, env = "WANDB_API_KEY", hide_env_values = true)]
    pub wandb_key: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_key: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret: Option<String>,

    #[arg(long, env = "AWS_DEFAULT_REGION")]
    pub aws_region: Option<String>,

    /// Synced to `--data-dir` before training.
    #[arg(long, env = "S3_DATA_PATH")]
    pub s3_path: Option<String>,

    #[arg(long, env = "SPOTRUN_DATA_DIR", default_value = "/workspace/data")]
    pub data_dir: String,

    /// Passed to training verbatim, after `--`.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

/// `90`, `500ms`, `10s`, `10m`, `24h`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration '{}'", raw))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, raw)),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration '{}'", raw));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn extra_args_after_double_dash() {
        let cli = Cli::parse_from([
            "spotrun",
            "--gpu-type",
            "RTX 4090,A100",
            "--gpu-type",
            "H100",
            "--",
            "--lr",
            "3e-4",
            "--dry-run",
        ]);
        assert_eq!(cli.gpu_types, vec!["RTX 4090", "A100", "H100"]);
        assert_eq!(cli.extra_args, vec!["--lr", "3e-4", "--dry-run"]);
        assert!(!cli.dry_run);
        assert_eq!(cli.boot_timeout, Duration::from_secs(600));
    }
}
