use crate::{MarketResult, Marketplace, MarketplaceError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use spotrun_common::{
    InstanceSnapshot, InstanceStatus, InstanceSummary, LaunchRequest, Offer, SelectionCriteria,
};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://console.vast.ai/api/v0";

/// Label prefix the onstart script writes once the training process has exited.
pub const EXIT_LABEL_PREFIX: &str = "exit=";

pub struct VastAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl VastAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> anyhow::Result<Self> {
        // Default reqwest client has no overall timeout. If the API stalls, a run can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        let base_url = base_url
            .as_deref()
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .to_string();
        Ok(Self {
            client,
            base_url,
            api_key: api_key.trim().to_string(),
        })
    }

    fn headers(&self) -> MarketResult<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        let bearer = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| MarketplaceError::Other(anyhow::anyhow!("invalid API key header: {}", e)))?;
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(headers)
    }

    /// Turn a non-2xx response into a classified error; pass 2xx through.
    async fn check(method: &str, url: &str, resp: reqwest::Response) -> MarketResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        tracing::warn!(
            "❌ [Vast.ai API] {} {} failed: status={}, response={}",
            method,
            url,
            status.as_u16(),
            text
        );
        Err(MarketplaceError::from_status(status.as_u16(), text))
    }

    fn search_query(criteria: &SelectionCriteria) -> serde_json::Value {
        // Server-side pre-filter; GPU names and regions are matched client-side because the
        // API only supports exact name matches.
        json!({
            "rentable": {"eq": true},
            "rented": {"eq": false},
            "num_gpus": {"eq": criteria.num_gpus},
            "dph_total": {"lte": criteria.max_price_per_hour},
            "reliability2": {"gte": criteria.min_reliability},
            "disk_space": {"gte": criteria.min_disk_gb},
            "type": "on-demand",
            "order": [["score", "desc"]],
            "limit": 500
        })
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct VastOffer {
    id: u64,
    gpu_name: Option<String>,
    num_gpus: Option<u32>,
    dph_total: Option<f64>,
    reliability2: Option<f64>,
    reliability: Option<f64>,
    geolocation: Option<String>,
    disk_space: Option<f64>,
    inet_down: Option<f64>,
    inet_up: Option<f64>,
    /// MB
    gpu_ram: Option<f64>,
    rentable: Option<bool>,
}

impl From<VastOffer> for Offer {
    fn from(o: VastOffer) -> Self {
        Offer {
            id: o.id.to_string(),
            gpu_name: o.gpu_name.unwrap_or_default(),
            num_gpus: o.num_gpus.unwrap_or(1).max(1),
            // Missing price must never look cheap.
            price_per_hour: o.dph_total.unwrap_or(f64::INFINITY),
            reliability: o.reliability2.or(o.reliability).unwrap_or(0.0),
            region: o.geolocation.filter(|g| !g.trim().is_empty()),
            disk_space_gb: o.disk_space.unwrap_or(0.0),
            inet_down_mbps: o.inet_down.unwrap_or(0.0),
            inet_up_mbps: o.inet_up.unwrap_or(0.0),
            gpu_ram_gb: o.gpu_ram.unwrap_or(0.0) / 1024.0,
            rentable: o.rentable.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct VastInstance {
    id: u64,
    actual_status: Option<String>,
    intended_status: Option<String>,
    status_msg: Option<String>,
    label: Option<String>,
    gpu_name: Option<String>,
    dph_total: Option<f64>,
}

fn exit_code_from_label(label: Option<&str>) -> Option<i32> {
    label?
        .trim()
        .strip_prefix(EXIT_LABEL_PREFIX)?
        .trim()
        .parse::<i32>()
        .ok()
}

/// Map the Vast.ai view of an instance to a provider-neutral snapshot.
fn snapshot_from_vast(inst: &VastInstance) -> InstanceSnapshot {
    if let Some(code) = exit_code_from_label(inst.label.as_deref()) {
        return InstanceSnapshot::exited(code);
    }

    let actual = inst
        .actual_status
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let intended = inst
        .intended_status
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let msg = inst.status_msg.clone().filter(|m| !m.trim().is_empty());
    let msg_is_error = msg
        .as_deref()
        .map(|m| m.to_ascii_lowercase().contains("error"))
        .unwrap_or(false);

    let snapshot = match actual.as_str() {
        "running" => InstanceSnapshot::status(InstanceStatus::Running),
        "offline" => InstanceSnapshot::status(InstanceStatus::Lost),
        "exited" => InstanceSnapshot::status(InstanceStatus::Failed),
        _ if intended == "stopped" => InstanceSnapshot::status(InstanceStatus::Lost),
        _ if msg_is_error => InstanceSnapshot::status(InstanceStatus::Failed),
        _ => InstanceSnapshot::status(InstanceStatus::Provisioning),
    };
    match msg {
        Some(m) => snapshot.with_message(m),
        None => snapshot,
    }
}

#[async_trait]
impl Marketplace for VastAiProvider {
    fn name(&self) -> &'static str {
        "vastai"
    }

    async fn search_offers(&self, criteria: &SelectionCriteria) -> MarketResult<Vec<Offer>> {
        let url = format!("{}/bundles/", self.base_url);
        let q = Self::search_query(criteria).to_string();
        tracing::debug!("🔵 [Vast.ai API] GET {} q={}", url, q);

        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .query(&[("q", q.as_str())])
            .send()
            .await?;
        let resp = Self::check("GET", &url, resp).await?;

        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Body {
            offers: Vec<VastOffer>,
        }
        let body: Body = resp.json().await?;
        Ok(body.offers.into_iter().map(Offer::from).collect())
    }

    async fn create_instance(&self, request: &LaunchRequest) -> MarketResult<String> {
        let url = format!("{}/asks/{}/", self.base_url, request.offer_id);
        let body = json!({
            "client_id": "me",
            "image": request.image,
            "disk": request.disk_gb,
            "onstart": request.onstart,
            "env": request.env,
            "label": request.label,
            "runtype": "ssh",
        });

        tracing::info!(
            "🔵 [Vast.ai API] PUT {} - Creating instance: image={}, disk={}GB, label={}",
            url,
            request.image,
            request.disk_gb,
            request.label
        );

        let resp = self
            .client
            .put(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await?;
        let resp = Self::check("PUT", &url, resp).await?;

        let json_resp: serde_json::Value = resp.json().await?;
        if json_resp.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return Err(MarketplaceError::Rejected {
                status: 200,
                body: json_resp.to_string(),
            });
        }
        let contract = &json_resp["new_contract"];
        let instance_id = contract
            .as_u64()
            .map(|v| v.to_string())
            .or_else(|| contract.as_str().map(|s| s.to_string()))
            .ok_or_else(|| anyhow::anyhow!("No new_contract in create response: {}", json_resp))?;

        tracing::info!("✅ [Vast.ai API] Instance created: id={}", instance_id);
        Ok(instance_id)
    }

    async fn get_instance(&self, instance_id: &str) -> MarketResult<InstanceSnapshot> {
        let url = format!("{}/instances/{}/", self.base_url, instance_id);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        let resp = Self::check("GET", &url, resp).await?;

        let json_resp: serde_json::Value = resp.json().await?;
        // Single-instance lookups return an object; some API versions wrap it in a list.
        let raw = match &json_resp["instances"] {
            serde_json::Value::Array(items) => items.first().cloned(),
            serde_json::Value::Object(_) => Some(json_resp["instances"].clone()),
            _ => None,
        };
        let Some(raw) = raw else {
            return Err(MarketplaceError::NotFound(format!("instance {}", instance_id)));
        };
        let inst: VastInstance = serde_json::from_value(raw)
            .map_err(|e| anyhow::anyhow!("Unexpected instance payload: {}", e))?;
        Ok(snapshot_from_vast(&inst))
    }

    async fn destroy_instance(&self, instance_id: &str) -> MarketResult<()> {
        let url = format!("{}/instances/{}/", self.base_url, instance_id);
        tracing::info!("🔵 [Vast.ai API] DELETE {} - Destroying instance", url);

        let resp = self
            .client
            .delete(&url)
            .headers(self.headers()?)
            .send()
            .await?;
        let resp = Self::check("DELETE", &url, resp).await?;

        let json_resp: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if json_resp.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let msg = json_resp
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if msg.to_ascii_lowercase().contains("no such") {
                return Err(MarketplaceError::NotFound(msg));
            }
            return Err(MarketplaceError::Rejected {
                status: 200,
                body: json_resp.to_string(),
            });
        }
        tracing::info!("✅ [Vast.ai API] DELETE {} succeeded", url);
        Ok(())
    }

    async fn tail_logs(
        &self,
        instance_id: &str,
        max_lines: usize,
    ) -> MarketResult<Option<Vec<String>>> {
        // Logs are uploaded asynchronously: request them, then fetch whatever is there now.
        let url = format!("{}/instances/request_logs/{}/", self.base_url, instance_id);
        let resp = self
            .client
            .put(&url)
            .headers(self.headers()?)
            .json(&json!({"tail": max_lines.to_string()}))
            .send()
            .await?;
        let resp = Self::check("PUT", &url, resp).await?;
        let json_resp: serde_json::Value = resp.json().await?;
        let Some(result_url) = json_resp.get("result_url").and_then(|v| v.as_str()) else {
            return Ok(None);
        };

        let logs = self.client.get(result_url).send().await?;
        if !logs.status().is_success() {
            // Not uploaded yet.
            return Ok(None);
        }
        let text = logs.text().await?;
        let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        Ok(Some(lines))
    }

    async fn list_instances(&self) -> MarketResult<Vec<InstanceSummary>> {
        let url = format!("{}/instances/", self.base_url);
        let resp = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .query(&[("owner", "me")])
            .send()
            .await?;
        let resp = Self::check("GET", &url, resp).await?;

        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Body {
            instances: Vec<VastInstance>,
        }
        let body: Body = resp.json().await?;
        Ok(body
            .instances
            .into_iter()
            .map(|i| InstanceSummary {
                id: i.id.to_string(),
                gpu_name: i.gpu_name,
                price_per_hour: i.dph_total,
                status: i.actual_status.unwrap_or_else(|| "unknown".to_string()),
                label: i.label,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(actual: Option<&str>, intended: Option<&str>, label: Option<&str>, msg: Option<&str>) -> VastInstance {
        VastInstance {
            id: 7,
            actual_status: actual.map(String::from),
            intended_status: intended.map(String::from),
            status_msg: msg.map(String::from),
            label: label.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn offer_payload_maps_to_offer() {
        let raw = json!({
            "id": 12345,
            "gpu_name": "RTX 4090",
            "num_gpus": 1,
            "dph_total": 0.42,
            "reliability2": 0.987,
            "geolocation": "Sweden, SE",
            "disk_space": 120.5,
            "inet_down": 800.0,
            "inet_up": 400.0,
            "gpu_ram": 24564,
            "rentable": true,
            "some_new_field": "ignored"
        });
        let offer: Offer = serde_json::from_value::<VastOffer>(raw).unwrap().into();
        assert_eq!(offer.id, "12345");
        assert_eq!(offer.price_per_hour, 0.42);
        assert_eq!(offer.reliability, 0.987);
        assert_eq!(offer.region.as_deref(), Some("Sweden, SE"));
        assert!((offer.gpu_ram_gb - 23.99).abs() < 0.01);
        assert!(offer.rentable);
    }

    #[test]
    fn offer_without_price_is_never_cheap() {
        let offer: Offer = serde_json::from_value::<VastOffer>(json!({"id": 1})).unwrap().into();
        assert!(offer.price_per_hour.is_infinite());
        assert_eq!(offer.reliability, 0.0);
        assert!(!offer.rentable);
    }

    #[test]
    fn exit_label_wins_over_status() {
        let s = snapshot_from_vast(&inst(Some("running"), Some("running"), Some("exit=0"), None));
        assert_eq!(s.status, InstanceStatus::Succeeded);
        assert_eq!(s.exit_code, Some(0));

        let s = snapshot_from_vast(&inst(Some("running"), None, Some("exit=137"), None));
        assert_eq!(s.status, InstanceStatus::Failed);
        assert_eq!(s.exit_code, Some(137));
    }

    #[test]
    fn run_label_is_not_an_exit_code() {
        let s = snapshot_from_vast(&inst(Some("running"), None, Some("spotrun-abc"), None));
        assert_eq!(s.status, InstanceStatus::Running);
        assert_eq!(s.exit_code, None);
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (None, None, None, InstanceStatus::Provisioning),
            (Some("loading"), Some("running"), None, InstanceStatus::Provisioning),
            (Some("running"), Some("running"), None, InstanceStatus::Running),
            (Some("offline"), Some("running"), None, InstanceStatus::Lost),
            (Some("exited"), Some("running"), None, InstanceStatus::Failed),
            (Some("created"), Some("stopped"), None, InstanceStatus::Lost),
            (
                Some("created"),
                Some("running"),
                Some("Error response from daemon: pull access denied"),
                InstanceStatus::Failed,
            ),
        ];
        for (actual, intended, msg, expected) in cases {
            let s = snapshot_from_vast(&inst(actual, intended, None, msg));
            assert_eq!(s.status, expected, "actual={:?} intended={:?}", actual, intended);
        }
    }

    #[test]
    fn query_carries_price_and_reliability() {
        let criteria = SelectionCriteria {
            max_price_per_hour: 1.25,
            min_reliability: 0.95,
            ..Default::default()
        };
        let q = VastAiProvider::search_query(&criteria);
        assert_eq!(q["dph_total"]["lte"], 1.25);
        assert_eq!(q["reliability2"]["gte"], 0.95);
        assert_eq!(q["num_gpus"]["eq"], 1);
    }
}
