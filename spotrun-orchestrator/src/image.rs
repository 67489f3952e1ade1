use crate::error::LaunchError;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageSettings {
    pub image: String,
    pub dockerfile: String,
    pub context_dir: String,
    pub skip_build: bool,
    pub skip_push: bool,
    pub timeout: Duration,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            image: "pytorch/pytorch:2.1.0-cuda12.1-cudnn8-runtime".to_string(),
            dockerfile: "Dockerfile".to_string(),
            context_dir: ".".to_string(),
            skip_build: true,
            skip_push: true,
            timeout: Duration::from_secs(3600),
        }
    }
}

impl ImageSettings {
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "build".to_string(),
            "-f".to_string(),
            self.dockerfile.clone(),
            "-t".to_string(),
            self.image.clone(),
            self.context_dir.clone(),
        ]
    }

    pub fn push_args(&self) -> Vec<String> {
        vec!["push".to_string(), self.image.clone()]
    }
}

/// `docker build` then `docker push`, each bounded by `settings.timeout`.
pub async fn build_and_push(settings: &ImageSettings) -> Result<(), LaunchError> {
    if !settings.skip_build {
        run_docker("build", &settings.build_args(), settings.timeout).await?;
    }
    if !settings.skip_push {
        run_docker("push", &settings.push_args(), settings.timeout).await?;
    }
    Ok(())
}

async fn run_docker(step: &str, args: &[String], timeout: Duration) -> Result<(), LaunchError> {
    tracing::info!("🔵 [image] docker {}", args.join(" "));
    let mut command = Command::new("docker");
    command.args(args).kill_on_drop(true);

    let status = match tokio::time::timeout(timeout, command.status()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(LaunchError::Image(format!(
                "docker {} could not start: {}",
                step, e
            )))
        }
        Err(_) => {
            return Err(LaunchError::Image(format!(
                "docker {} timed out after {:?}",
                step, timeout
            )))
        }
    };
    if !status.success() {
        return Err(LaunchError::Image(format!(
            "docker {} failed with {}",
            step, status
        )));
    }
    tracing::info!("✅ [image] docker {} done", step);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_arguments() {
        let s = ImageSettings {
            image: "ghcr.io/acme/train:abc".into(),
            dockerfile: "docker/Dockerfile".into(),
            ..ImageSettings::default()
        };
        assert_eq!(
            s.build_args(),
            vec!["build", "-f", "docker/Dockerfile", "-t", "ghcr.io/acme/train:abc", "."]
        );
        assert_eq!(s.push_args(), vec!["push", "ghcr.io/acme/train:abc"]);
    }

    #[tokio::test]
    async fn skipped_steps_run_nothing() {
        build_and_push(&ImageSettings::default()).await.unwrap();
    }
}
