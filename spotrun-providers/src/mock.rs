use crate::{MarketResult, Marketplace, MarketplaceError};
use async_trait::async_trait;
use spotrun_common::{
    InstanceSnapshot, InstanceStatus, InstanceSummary, LaunchRequest, Offer, SelectionCriteria,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// In-memory marketplace driven by scripts, for tests and local dry runs.
///
/// Each created instance replays the status script registered for its offer (or the
/// default script): one snapshot per `get_instance` call, the last one repeating forever.
/// An empty script means "running forever".
pub struct MockMarketplace {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    offers: Vec<Offer>,
    scripts: HashMap<String, Vec<InstanceSnapshot>>,
    default_script: Vec<InstanceSnapshot>,
    rejected_offers: HashSet<String>,
    search_failures: u32,
    create_timeouts: u32,
    destroy_failures: u32,
    log_lines: Vec<String>,

    next_id: u64,
    instances: HashMap<String, MockInstance>,
    created: Vec<LaunchRequest>,

    search_calls: usize,
    create_calls: usize,
    get_calls: usize,
    destroy_calls: Vec<String>,
}

struct MockInstance {
    offer_id: String,
    label: String,
    script: VecDeque<InstanceSnapshot>,
    last: InstanceSnapshot,
    destroyed: bool,
}

impl MockMarketplace {
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            state: Mutex::new(MockState {
                offers,
                next_id: 1000,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the remaining assertions.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Status script for instances created from `offer_id`.
    pub fn with_status_script(self, offer_id: &str, script: Vec<InstanceSnapshot>) -> Self {
        self.lock().scripts.insert(offer_id.to_string(), script);
        self
    }

    /// Status script for offers without their own script.
    pub fn with_default_script(self, script: Vec<InstanceSnapshot>) -> Self {
        self.lock().default_script = script;
        self
    }

    /// Creating an instance from this offer fails as if someone else rented it first.
    pub fn with_rejected_offer(self, offer_id: &str) -> Self {
        self.lock().rejected_offers.insert(offer_id.to_string());
        self
    }

    /// The next `n` searches fail with a transient error.
    pub fn with_search_failures(self, n: u32) -> Self {
        self.lock().search_failures = n;
        self
    }

    /// The next `n` creates succeed on the marketplace side but answer with a transient
    /// error, leaving an instance the caller never learned the id of.
    pub fn with_create_timeouts(self, n: u32) -> Self {
        self.lock().create_timeouts = n;
        self
    }

    /// The next `n` destroy calls fail with a transient error.
    pub fn with_destroy_failures(self, n: u32) -> Self {
        self.lock().destroy_failures = n;
        self
    }

    pub fn with_logs(self, lines: &[&str]) -> Self {
        self.lock().log_lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn search_calls(&self) -> usize {
        self.lock().search_calls
    }

    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }

    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    /// Every destroy call received, in order, including failed and repeated ones.
    pub fn destroy_calls(&self) -> Vec<String> {
        self.lock().destroy_calls.clone()
    }

    pub fn destroy_count(&self, instance_id: &str) -> usize {
        self.lock()
            .destroy_calls
            .iter()
            .filter(|id| id.as_str() == instance_id)
            .count()
    }

    /// Launch requests accepted so far.
    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.lock().created.clone()
    }

    /// Instance ids created and not yet destroyed. Empty at the end of a correct run.
    pub fn live_instances(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .lock()
            .instances
            .iter()
            .filter(|(_, i)| !i.destroyed)
            .map(|(id, _)| id.clone())
            .collect();
        live.sort();
        live
    }

    /// Offer each instance was created from.
    pub fn offer_of(&self, instance_id: &str) -> Option<String> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|i| i.offer_id.clone())
    }
}

/// Convenience constructor for tests and fixtures.
pub fn mock_offer(id: &str, gpu_name: &str, price_per_hour: f64, reliability: f64) -> Offer {
    Offer {
        id: id.to_string(),
        gpu_name: gpu_name.to_string(),
        num_gpus: 1,
        price_per_hour,
        reliability,
        region: Some("Mockland, MK".to_string()),
        disk_space_gb: 200.0,
        inet_down_mbps: 1000.0,
        inet_up_mbps: 1000.0,
        gpu_ram_gb: 24.0,
        rentable: true,
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn search_offers(&self, _criteria: &SelectionCriteria) -> MarketResult<Vec<Offer>> {
        let mut st = self.lock();
        st.search_calls += 1;
        if st.search_failures > 0 {
            st.search_failures -= 1;
            return Err(MarketplaceError::Transient("mock: search unavailable".into()));
        }
        Ok(st.offers.clone())
    }

    async fn create_instance(&self, request: &LaunchRequest) -> MarketResult<String> {
        let mut st = self.lock();
        st.create_calls += 1;
        if st.rejected_offers.contains(&request.offer_id) {
            return Err(MarketplaceError::Rejected {
                status: 400,
                body: format!("offer {} is no longer available", request.offer_id),
            });
        }
        if !st.offers.iter().any(|o| o.id == request.offer_id) {
            return Err(MarketplaceError::NotFound(format!("offer {}", request.offer_id)));
        }

        st.next_id += 1;
        let id = st.next_id.to_string();
        let script: VecDeque<InstanceSnapshot> = st
            .scripts
            .get(&request.offer_id)
            .cloned()
            .unwrap_or_else(|| st.default_script.clone())
            .into();
        st.instances.insert(
            id.clone(),
            MockInstance {
                offer_id: request.offer_id.clone(),
                label: request.label.clone(),
                script,
                last: InstanceSnapshot::status(InstanceStatus::Running),
                destroyed: false,
            },
        );
        st.created.push(request.clone());
        if st.create_timeouts > 0 {
            st.create_timeouts -= 1;
            return Err(MarketplaceError::Transient("mock: create timed out".into()));
        }
        Ok(id)
    }

    async fn get_instance(&self, instance_id: &str) -> MarketResult<InstanceSnapshot> {
        let mut st = self.lock();
        st.get_calls += 1;
        let Some(inst) = st.instances.get_mut(instance_id) else {
            return Err(MarketplaceError::NotFound(format!("instance {}", instance_id)));
        };
        if inst.destroyed {
            return Ok(InstanceSnapshot::status(InstanceStatus::Destroyed));
        }
        if let Some(next) = inst.script.pop_front() {
            inst.last = next;
        }
        Ok(inst.last.clone())
    }

    async fn destroy_instance(&self, instance_id: &str) -> MarketResult<()> {
        let mut st = self.lock();
        st.destroy_calls.push(instance_id.to_string());
        if st.destroy_failures > 0 {
            st.destroy_failures -= 1;
            return Err(MarketplaceError::Transient("mock: destroy unavailable".into()));
        }
        match st.instances.get_mut(instance_id) {
            Some(inst) if !inst.destroyed => {
                inst.destroyed = true;
                Ok(())
            }
            _ => Err(MarketplaceError::NotFound(format!("instance {}", instance_id))),
        }
    }

    async fn tail_logs(
        &self,
        instance_id: &str,
        max_lines: usize,
    ) -> MarketResult<Option<Vec<String>>> {
        let st = self.lock();
        if !st.instances.contains_key(instance_id) || st.log_lines.is_empty() {
            return Ok(None);
        }
        let skip = st.log_lines.len().saturating_sub(max_lines);
        Ok(Some(st.log_lines[skip..].to_vec()))
    }

    async fn list_instances(&self) -> MarketResult<Vec<InstanceSummary>> {
        let st = self.lock();
        let mut out: Vec<InstanceSummary> = st
            .instances
            .iter()
            .map(|(id, inst)| {
                let offer = st.offers.iter().find(|o| o.id == inst.offer_id);
                let status = if inst.destroyed {
                    InstanceStatus::Destroyed
                } else {
                    inst.last.status
                };
                InstanceSummary {
                    id: id.clone(),
                    gpu_name: offer.map(|o| o.gpu_name.clone()),
                    price_per_hour: offer.map(|o| o.price_per_hour),
                    status: status.to_string(),
                    label: Some(inst.label.clone()),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
