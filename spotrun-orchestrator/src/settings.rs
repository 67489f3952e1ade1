use crate::alert::AlertSettings;
use crate::cli::{Cli, RankingArg};
use crate::error::LaunchError;
use crate::image::ImageSettings;
use crate::launch::{LaunchSpec, Secrets};
use crate::monitor::MonitorSettings;
use crate::provisioner::ProvisionSettings;
use crate::ranker::RankingPolicy;
use crate::retry::RetryPolicy;
use spotrun_common::gpu_filter::parse_gpu_types;
use spotrun_common::SelectionCriteria;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Launch,
    DryRun,
    List,
}

#[derive(Clone, PartialEq)]
pub struct MarketplaceSettings {
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for MarketplaceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketplaceSettings")
            .field("provider", &self.provider)
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Everything a run needs, built once at startup. Components get their slice by
/// reference and never look at the environment themselves.
#[derive(Debug, Clone)]
pub struct Settings {
    pub run_id: Uuid,
    pub mode: Mode,
    pub marketplace: MarketplaceSettings,
    pub criteria: SelectionCriteria,
    pub ranking: RankingPolicy,
    pub catalog_retry: RetryPolicy,
    pub destroy_retry: RetryPolicy,
    pub provision: ProvisionSettings,
    pub monitor: MonitorSettings,
    pub launch: LaunchSpec,
    pub image: ImageSettings,
    pub alert: AlertSettings,
    pub report_path: Option<PathBuf>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn positive(name: &str, d: Duration) -> Result<(), LaunchError> {
    if d.is_zero() {
        return Err(LaunchError::Config(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Self, LaunchError> {
        let run_id = Uuid::new_v4();
        let mode = if cli.list {
            Mode::List
        } else if cli.dry_run {
            Mode::DryRun
        } else {
            Mode::Launch
        };

        let provider = cli.provider.trim().to_lowercase();
        let api_key = non_empty(cli.api_key.clone());
        let api_key = match (api_key, provider.as_str()) {
            (Some(k), _) => k,
            (None, "mock") => String::new(),
            (None, _) => return Err(LaunchError::MissingCredential("VAST_API_KEY")),
        };
        let base_url = non_empty(cli.api_url.clone());

        let gpu_types = parse_gpu_types(Some(&cli.gpu_types.join(",")));
        let criteria = SelectionCriteria {
            gpu_types,
            max_price_per_hour: cli.max_price,
            min_reliability: cli.min_reliability,
            region: non_empty(cli.region.clone()),
            num_gpus: cli.gpus,
            min_disk_gb: cli.disk,
            min_inet_down_mbps: cli.min_inet_down,
            min_inet_up_mbps: cli.min_inet_up,
        };

        let ranking = match cli.ranking {
            RankingArg::ReliabilityFirst => RankingPolicy::ReliabilityFirst {
                tolerance: cli.reliability_tolerance,
            },
            RankingArg::Weighted => RankingPolicy::Weighted {
                price_weight: cli.price_weight,
                reliability_weight: cli.reliability_weight,
            },
        };

        let entrypoint: Vec<String> = cli
            .entrypoint
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let launch = LaunchSpec {
            image: cli.image.trim().to_string(),
            disk_gb: cli.disk,
            config_path: cli.config.trim().to_string(),
            entrypoint,
            extra_args: cli.extra_args.clone(),
            data_dir: cli.data_dir.clone(),
            secrets: Secrets {
                vast_api_key: Some(api_key.clone()).filter(|k| !k.is_empty()),
                wandb_api_key: non_empty(cli.wandb_key.clone()),
                aws_access_key_id: non_empty(cli.aws_key.clone()),
                aws_secret_access_key: non_empty(cli.aws_secret.clone()),
                aws_region: non_empty(cli.aws_region.clone()),
                s3_data_path: non_empty(cli.s3_path.clone()),
            },
            label: format!("spotrun-{}", run_id),
            api_url: base_url
                .clone()
                .unwrap_or_else(|| "https://console.vast.ai/api/v0".to_string()),
        };

        // Without a Dockerfile there is nothing to build; the image is used as published.
        let no_dockerfile = cli.dockerfile.is_none();
        let image = ImageSettings {
            image: launch.image.clone(),
            dockerfile: cli.dockerfile.clone().unwrap_or_else(|| "Dockerfile".to_string()),
            context_dir: ".".to_string(),
            skip_build: cli.skip_build || no_dockerfile,
            skip_push: cli.skip_push || no_dockerfile,
            timeout: cli.build_timeout,
        };

        let settings = Settings {
            run_id,
            mode,
            marketplace: MarketplaceSettings {
                provider,
                api_key,
                base_url,
            },
            criteria,
            ranking,
            catalog_retry: RetryPolicy::default(),
            destroy_retry: RetryPolicy::default(),
            provision: ProvisionSettings {
                poll_interval: cli.boot_poll_interval,
                boot_timeout: cli.boot_timeout,
                max_offers: cli.max_offers,
            },
            monitor: MonitorSettings {
                poll_interval: cli.poll_interval,
                run_timeout: cli.run_timeout,
                log_tail_lines: cli.log_tail,
            },
            launch,
            image,
            alert: AlertSettings {
                webhook_url: non_empty(cli.alert_webhook.clone()),
                github_annotations: cli.github_actions,
            },
            report_path: cli.report.clone(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), LaunchError> {
        let c = &self.criteria;
        if !(c.max_price_per_hour.is_finite() && c.max_price_per_hour > 0.0) {
            return Err(LaunchError::Config(format!(
                "max price must be positive, got {}",
                c.max_price_per_hour
            )));
        }
        if !(0.0..=1.0).contains(&c.min_reliability) {
            return Err(LaunchError::Config(format!(
                "min reliability must be within [0, 1], got {}",
                c.min_reliability
            )));
        }
        if c.gpu_types.is_empty() {
            return Err(LaunchError::Config("at least one GPU type is required".into()));
        }
        if c.num_gpus == 0 {
            return Err(LaunchError::Config("at least one GPU is required".into()));
        }
        if !(self.launch.disk_gb.is_finite() && self.launch.disk_gb > 0.0) {
            return Err(LaunchError::Config("disk size must be positive".into()));
        }
        if self.provision.max_offers == 0 {
            return Err(LaunchError::Config("max offers must be at least 1".into()));
        }
        positive("boot poll interval", self.provision.poll_interval)?;
        positive("boot timeout", self.provision.boot_timeout)?;
        positive("poll interval", self.monitor.poll_interval)?;
        positive("run timeout", self.monitor.run_timeout)?;
        if self.mode != Mode::List {
            if self.launch.image.is_empty() {
                return Err(LaunchError::Config("image is required".into()));
            }
            if self.launch.entrypoint.is_empty() {
                return Err(LaunchError::Config("entrypoint is required".into()));
            }
        }
        if let RankingPolicy::ReliabilityFirst { tolerance } = self.ranking {
            if !(tolerance.is_finite() && tolerance >= 0.0) {
                return Err(LaunchError::Config("reliability tolerance must be >= 0".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["spotrun", "--provider", "mock"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn defaults_match_launcher() {
        let s = Settings::from_cli(cli(&[])).unwrap();
        assert_eq!(s.mode, Mode::Launch);
        assert_eq!(s.criteria.gpu_types, vec!["RTX 4090"]);
        assert_eq!(s.criteria.max_price_per_hour, 2.0);
        assert_eq!(s.criteria.min_reliability, 0.9);
        assert_eq!(s.provision.max_offers, 3);
        assert_eq!(s.provision.boot_timeout, Duration::from_secs(600));
        assert_eq!(s.monitor.run_timeout, Duration::from_secs(86400));
        assert_eq!(s.launch.entrypoint, vec!["python", "train.py"]);
        assert!(s.launch.label.starts_with("spotrun-"));
        assert!(s.image.skip_build && s.image.skip_push);
    }

    #[test]
    fn real_provider_needs_api_key() {
        let c = Cli::parse_from(["spotrun", "--provider", "vastai", "--api-key", " "]);
        assert!(matches!(
            Settings::from_cli(c),
            Err(LaunchError::MissingCredential("VAST_API_KEY"))
        ));
    }

    #[test]
    fn rejects_bad_limits() {
        for args in [
            &["--max-price", "0"][..],
            &["--min-reliability", "1.5"][..],
            &["--max-offers", "0"][..],
            &["--poll-interval", "0s"][..],
            &["--gpus", "0"][..],
        ] {
            let err = Settings::from_cli(cli(args)).unwrap_err();
            assert_eq!(err.exit_code(), crate::error::exit_codes::CONFIG, "{:?}", args);
        }
    }

    #[test]
    fn modes_and_ranking() {
        let s = Settings::from_cli(cli(&["--dry-run", "--ranking", "weighted"])).unwrap();
        assert_eq!(s.mode, Mode::DryRun);
        assert_eq!(s.ranking, RankingPolicy::weighted_default());
        let s = Settings::from_cli(cli(&["--list", "--dry-run"])).unwrap();
        assert_eq!(s.mode, Mode::List);
    }

    #[test]
    fn dockerfile_enables_image_step() {
        let s = Settings::from_cli(cli(&["--dockerfile", "Dockerfile.train", "--skip-push"])).unwrap();
        assert!(!s.image.skip_build);
        assert!(s.image.skip_push);
    }
}
