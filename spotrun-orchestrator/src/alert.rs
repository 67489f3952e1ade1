use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    /// Emit `::error::` workflow commands (GitHub Actions).
    pub github_annotations: bool,
}

/// Escalation for failures that keep costing money after the process exits.
pub struct Alerter {
    settings: AlertSettings,
    client: reqwest::Client,
}

impl Alerter {
    pub fn new(settings: AlertSettings) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { settings, client }
    }

    pub fn annotation(instance_id: &str, error: &str) -> String {
        format!(
            "::error title=spotrun termination failed::Instance {} could not be destroyed and may still be billing: {}",
            instance_id,
            error.replace('\n', " ")
        )
    }

    /// Logged, annotated and posted. Webhook failures are logged only.
    pub async fn termination_failed(&self, instance_id: &str, error: &str) {
        tracing::error!(
            instance_id = %instance_id,
            "❌ [alert] instance {} was NOT destroyed: {}. Destroy it manually.",
            instance_id,
            error
        );
        if self.settings.github_annotations {
            println!("{}", Self::annotation(instance_id, error));
        }

        let Some(url) = self.settings.webhook_url.as_deref() else {
            return;
        };
        let body = json!({
            "text": format!(
                "spotrun: instance {} could not be destroyed and may still be billing ({})",
                instance_id, error
            ),
            "instance_id": instance_id,
        });
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!("[alert] webhook notified for instance {}", instance_id)
            }
            Ok(resp) => tracing::warn!(
                "⚠️ [alert] webhook returned status {}",
                resp.status().as_u16()
            ),
            Err(e) => tracing::warn!("⚠️ [alert] webhook failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_is_single_line() {
        let line = Alerter::annotation("123", "status=500\nbody=oops");
        assert!(line.starts_with("::error"));
        assert!(line.contains("123"));
        assert!(!line.contains('\n'));
    }

    #[tokio::test]
    async fn no_webhook_is_a_no_op() {
        Alerter::new(AlertSettings::default())
            .termination_failed("123", "boom")
            .await;
    }
}
