use spotrun_common::{LaunchRequest, Offer};
use std::collections::BTreeMap;
use std::fmt;

/// Exit codes of the onstart script's own steps.
pub const ONSTART_MISSING_WANDB: i32 = 65;
pub const ONSTART_WANDB_LOGIN: i32 = 66;
pub const ONSTART_DATA_SYNC: i32 = 67;

pub const DEFAULT_AWS_REGION: &str = "ap-northeast-2";
pub const DEFAULT_DATA_DIR: &str = "/workspace/data";

#[derive(Clone, Default)]
pub struct Secrets {
    pub vast_api_key: Option<String>,
    pub wandb_api_key: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
    pub s3_data_path: Option<String>,
}

fn present(v: &Option<String>) -> bool {
    v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |v: &Option<String>| if present(v) { "<set>" } else { "<unset>" };
        f.debug_struct("Secrets")
            .field("vast_api_key", &mark(&self.vast_api_key))
            .field("wandb_api_key", &mark(&self.wandb_api_key))
            .field("aws_access_key_id", &mark(&self.aws_access_key_id))
            .field("aws_secret_access_key", &mark(&self.aws_secret_access_key))
            .field("aws_region", &self.aws_region)
            .field("s3_data_path", &self.s3_data_path)
            .finish()
    }
}

impl Secrets {
    pub fn has_wandb_key(&self) -> bool {
        present(&self.wandb_api_key)
    }
}

/// What runs on the instance. Identical for every offer tried during one run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image: String,
    pub disk_gb: f64,
    pub config_path: String,
    pub entrypoint: Vec<String>,
    /// Appended verbatim after `--config <path>`.
    pub extra_args: Vec<String>,
    pub data_dir: String,
    pub secrets: Secrets,
    /// Run label, `spotrun-<run id>`. Also used to find instances whose create call
    /// timed out after the marketplace accepted it.
    pub label: String,
    /// Marketplace API base the instance reports its exit code to.
    pub api_url: String,
}

impl LaunchSpec {
    pub fn env(&self) -> BTreeMap<String, String> {
        let s = &self.secrets;
        let region = s
            .aws_region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AWS_REGION.to_string());
        let pairs = [
            ("WANDB_API_KEY", s.wandb_api_key.clone()),
            ("AWS_ACCESS_KEY_ID", s.aws_access_key_id.clone()),
            ("AWS_SECRET_ACCESS_KEY", s.aws_secret_access_key.clone()),
            ("AWS_DEFAULT_REGION", Some(region)),
            ("S3_DATA_PATH", s.s3_data_path.clone()),
            ("VAST_API_KEY", s.vast_api_key.clone()),
            ("CONFIG_FILE", Some(self.config_path.clone())),
            ("SPOTRUN_API_URL", Some(self.api_url.clone())),
            ("SPOTRUN_LABEL", Some(self.label.clone())),
        ];
        pairs
            .into_iter()
            .filter_map(|(k, v)| {
                let v = v?;
                let v = v.trim();
                (!v.is_empty()).then(|| (k.to_string(), v.to_string()))
            })
            .collect()
    }

    /// Startup script: check credentials, log in to W&B, pull data, train, and report the
    /// exit code back through the instance label.
    pub fn onstart_script(&self) -> String {
        let mut cmd: Vec<String> = self.entrypoint.iter().map(|a| shell_quote(a)).collect();
        cmd.push("--config".to_string());
        cmd.push(shell_quote(&self.config_path));
        cmd.extend(self.extra_args.iter().map(|a| shell_quote(a)));

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            "set -u".to_string(),
            "INSTANCE_ID=\"${CONTAINER_ID:-${VAST_CONTAINERLABEL#C.}}\"".to_string(),
            "report_exit() {".to_string(),
            "  curl -s -m 30 --retry 5 -X PUT \"${SPOTRUN_API_URL}/instances/${INSTANCE_ID}/\" \\"
                .to_string(),
            "    -H \"Authorization: Bearer ${VAST_API_KEY:-}\" -H 'Content-Type: application/json' \\"
                .to_string(),
            "    -d \"{\\\"label\\\": \\\"exit=$1\\\"}\" >/dev/null".to_string(),
            "  exit \"$1\"".to_string(),
            "}".to_string(),
            format!(
                "[ -n \"${{WANDB_API_KEY:-}}\" ] || {{ echo 'WANDB_API_KEY is not set'; report_exit {}; }}",
                ONSTART_MISSING_WANDB
            ),
            format!(
                "wandb login \"$WANDB_API_KEY\" || report_exit {}",
                ONSTART_WANDB_LOGIN
            ),
        ];
        if present(&self.secrets.s3_data_path) {
            let dir = shell_quote(&self.data_dir);
            lines.push(format!("mkdir -p {}", dir));
            lines.push(format!(
                "aws s3 sync \"$S3_DATA_PATH\" {} || report_exit {}",
                dir, ONSTART_DATA_SYNC
            ));
        }
        lines.push(cmd.join(" "));
        lines.push("report_exit $?".to_string());
        lines.join("\n")
    }

    pub fn request_for(&self, offer: &Offer) -> LaunchRequest {
        LaunchRequest {
            offer_id: offer.id.clone(),
            image: self.image.clone(),
            disk_gb: self.disk_gb,
            onstart: self.onstart_script(),
            env: self.env(),
            label: self.label.clone(),
        }
    }
}

/// POSIX single-quoting. Plain words are left alone.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
