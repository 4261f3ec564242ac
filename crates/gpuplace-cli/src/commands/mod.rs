//! CLI commands implementation

use anyhow::Result;
use gpuplace_core::{
    format_bytes, parse_memory, GpuAllocation, ParallelismConstraint, Placement, PlacementState,
    RuntimeKind, ScheduleOutcome, Slot, Workload,
};
use serde::Deserialize;
use uuid::Uuid;

/// API client for communicating with the scheduler
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Runner summary from API
#[derive(Debug, Deserialize)]
pub struct RunnerResponse {
    pub runner_id: String,
    pub gpu_count: u32,
    pub degraded: bool,
    pub endpoint: Option<String>,
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub effective_free_memory_bytes: u64,
    pub allocations: usize,
    pub last_seen_secs: u64,
}

/// Workload listing entry from API
#[derive(Debug, Deserialize)]
pub struct WorkloadResponse {
    pub id: Uuid,
    pub model: String,
    pub runtime: String,
    pub state: PlacementState,
    pub attempts: u32,
    pub runner_id: Option<String>,
    #[serde(default)]
    pub queued: bool,
}

/// Cancellation response from API
#[derive(Debug, Deserialize)]
pub struct CancelResponse {
    pub prior_state: PlacementState,
}

/// Disconnect response from API
#[derive(Debug, Deserialize)]
pub struct DisconnectResponse {
    pub lost_slots: Vec<Uuid>,
}

/// Scheduler counters
#[derive(Debug, Deserialize)]
pub struct Stats {
    pub scheduled: u64,
    pub unschedulable: u64,
    pub cancelled: u64,
    pub runtime_failures: u64,
    pub ledger_races: u64,
    #[serde(default)]
    pub queued: u64,
    #[serde(default)]
    pub stale_evictions: u64,
    pub runners_lost: u64,
    pub slots_lost: u64,
}

/// Overscheduled GPU from API
#[derive(Debug, Deserialize)]
pub struct OvercommitResponse {
    pub runner_id: String,
    pub gpu_index: u32,
    pub reserved_bytes: u64,
    pub total_memory_bytes: u64,
}

/// Scheduling decision from API
#[derive(Debug, Deserialize)]
pub struct DecisionResponse {
    pub at: String,
    pub workload_id: Uuid,
    pub kind: String,
    pub runner_id: Option<String>,
    pub gpus: Vec<u32>,
    pub detail: String,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub runners: usize,
    pub workloads: usize,
    pub slots: usize,
    pub allocations: usize,
    #[serde(default)]
    pub queued: usize,
    #[serde(default)]
    pub overcommitted: Vec<OvercommitResponse>,
    pub stats: Stats,
}

/// Options for a workload submission
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub model: String,
    pub runtime: Option<RuntimeKind>,
    pub memory: String,
    pub context_length: u32,
    pub divisor_of: Option<u32>,
    pub max_gpus: Option<u32>,
    pub args: Vec<String>,
}

/// Build a workload from submission options
pub fn build_workload(options: SubmitOptions) -> Result<Workload> {
    let memory = parse_memory(&options.memory)?;
    let runtime = options.runtime.unwrap_or(RuntimeKind::Vllm);

    let mut workload = Workload::new(options.model, runtime, memory);
    workload.context_length = options.context_length;
    workload.runtime_args = options.args;

    workload.parallelism = match (options.divisor_of, options.max_gpus) {
        (Some(_), Some(_)) => anyhow::bail!("--divisor-of and --max-gpus are mutually exclusive"),
        (Some(n), None) => Some(ParallelismConstraint::DivisorOf(n)),
        (None, Some(n)) => Some(ParallelismConstraint::AtMost(n)),
        (None, None) => None,
    };

    workload.validate()?;
    Ok(workload)
}

fn describe_placement(placement: &Placement) -> String {
    let gpus: Vec<String> = placement.gpu_indices().iter().map(|i| i.to_string()).collect();
    match placement {
        Placement::Single { .. } => format!("GPU {}", gpus.join(",")),
        Placement::Multi { .. } => format!("GPUs {} (tp={})", gpus.join(","), gpus.len()),
    }
}

/// Submit a workload
pub async fn submit(client: &ApiClient, options: SubmitOptions) -> Result<()> {
    let workload = build_workload(options)?;

    let response = client
        .client
        .post(client.url("/api/v1/workloads"))
        .json(&workload)
        .send()
        .await?;

    if !response.status().is_success() {
        let error = response.text().await?;
        eprintln!("Failed to submit workload: {}", error);
        return Ok(());
    }

    match response.json::<ScheduleOutcome>().await? {
        ScheduleOutcome::Scheduled { slot } => {
            println!("Workload {} scheduled", slot.workload_id);
            println!("  Slot: {}", slot.id);
            println!("  Runner: {}", slot.runner_id);
            println!("  Placement: {}", describe_placement(&slot.allocation.placement));
            println!("  State: {}", slot.state);
            if let Some(note) = slot.note {
                println!("  Note: {}", note);
            }
        }
        ScheduleOutcome::Unschedulable { reason } if reason.is_retryable() => {
            println!("Workload {} queued: {}", workload.id, reason);
            println!("  It will be placed once capacity frees up; cancel it to give up");
        }
        ScheduleOutcome::Unschedulable { reason } => {
            println!("Workload {} is unschedulable: {}", workload.id, reason);
        }
        ScheduleOutcome::Cancelled => {
            println!("Workload {} was cancelled", workload.id);
        }
    }

    Ok(())
}

/// Cancel a workload
pub async fn cancel(client: &ApiClient, id: Uuid) -> Result<()> {
    let response = client
        .client
        .delete(client.url(&format!("/api/v1/workloads/{}", id)))
        .send()
        .await?;

    if response.status().is_success() {
        let cancelled: CancelResponse = response.json().await?;
        println!("Workload {} cancelled (was {})", id, cancelled.prior_state);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to cancel workload: {}", error);
    }

    Ok(())
}

/// Mark a workload completed
pub async fn complete(client: &ApiClient, id: Uuid) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/api/v1/workloads/{}/complete", id)))
        .send()
        .await?;

    if response.status().is_success() {
        let slot: Slot = response.json().await?;
        println!(
            "Workload {} completed, released {} on {}",
            id,
            describe_placement(&slot.allocation.placement),
            slot.runner_id
        );
    } else {
        let error = response.text().await?;
        eprintln!("Failed to complete workload: {}", error);
    }

    Ok(())
}

/// Evict a slot
pub async fn evict(client: &ApiClient, slot_id: Uuid) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/api/v1/slots/{}/evict", slot_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let slot: Slot = response.json().await?;
        println!("Slot {} evicted from {}", slot.id, slot.runner_id);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to evict slot: {}", error);
    }

    Ok(())
}

/// Declare a runner disconnected
pub async fn disconnect(client: &ApiClient, runner_id: String) -> Result<()> {
    let response = client
        .client
        .delete(client.url(&format!("/api/v1/runners/{}", runner_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let body: DisconnectResponse = response.json().await?;
        println!(
            "Runner '{}' disconnected, {} slot(s) lost",
            runner_id,
            body.lost_slots.len()
        );
        for slot in body.lost_slots {
            println!("  {}", slot);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to disconnect runner: {}", error);
    }

    Ok(())
}

/// List runners
pub async fn runners(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/runners")).send().await?;

    if response.status().is_success() {
        let runners: Vec<RunnerResponse> = response.json().await?;

        if runners.is_empty() {
            println!("No runners registered");
        } else {
            println!(
                "{:<20} {:<5} {:<12} {:<12} {:<12} {:<7} {:<9} {:<30}",
                "RUNNER", "GPUS", "TOTAL", "FREE", "EFFECTIVE", "ALLOCS", "SEEN", "ENDPOINT"
            );
            println!("{}", "-".repeat(115));
            for r in runners {
                let name = if r.degraded {
                    format!("{} (degraded)", r.runner_id)
                } else {
                    r.runner_id
                };
                println!(
                    "{:<20} {:<5} {:<12} {:<12} {:<12} {:<7} {:<9} {:<30}",
                    name,
                    r.gpu_count,
                    format_bytes(r.total_memory_bytes),
                    format_bytes(r.free_memory_bytes),
                    format_bytes(r.effective_free_memory_bytes),
                    r.allocations,
                    format!("{}s ago", r.last_seen_secs),
                    r.endpoint.unwrap_or_else(|| "-".to_string())
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list runners: {}", error);
    }

    Ok(())
}

/// List ledger allocations
pub async fn allocations(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/allocations"))
        .send()
        .await?;

    if response.status().is_success() {
        let allocations: Vec<GpuAllocation> = response.json().await?;

        if allocations.is_empty() {
            println!("No allocations");
        } else {
            println!(
                "{:<36} {:<20} {:<24} {:<12}",
                "WORKLOAD", "RUNNER", "PLACEMENT", "MEMORY"
            );
            println!("{}", "-".repeat(95));
            for a in allocations {
                println!(
                    "{:<36} {:<20} {:<24} {:<12}",
                    a.workload_id,
                    a.runner_id,
                    describe_placement(&a.placement),
                    format_bytes(a.memory_requirement_bytes)
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list allocations: {}", error);
    }

    Ok(())
}

/// List slots
pub async fn slots(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/slots")).send().await?;

    if response.status().is_success() {
        let slots: Vec<Slot> = response.json().await?;

        if slots.is_empty() {
            println!("No slots");
        } else {
            println!(
                "{:<36} {:<20} {:<25} {:<8} {:<20} {:<10}",
                "SLOT", "RUNNER", "MODEL", "RUNTIME", "PLACEMENT", "STATE"
            );
            println!("{}", "-".repeat(124));
            for s in slots {
                println!(
                    "{:<36} {:<20} {:<25} {:<8} {:<20} {:<10}",
                    s.id,
                    s.runner_id,
                    s.model,
                    s.runtime.to_string(),
                    describe_placement(&s.allocation.placement),
                    s.state.to_string()
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list slots: {}", error);
    }

    Ok(())
}

/// List workloads
pub async fn ps(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/workloads"))
        .send()
        .await?;

    if response.status().is_success() {
        let workloads: Vec<WorkloadResponse> = response.json().await?;

        if workloads.is_empty() {
            println!("No workloads found");
        } else {
            println!(
                "{:<36} {:<25} {:<8} {:<14} {:<8} {:<20}",
                "ID", "MODEL", "RUNTIME", "STATE", "TRIES", "RUNNER"
            );
            println!("{}", "-".repeat(115));
            for w in workloads {
                let state = if w.queued {
                    "Queued".to_string()
                } else {
                    w.state.to_string()
                };
                println!(
                    "{:<36} {:<25} {:<8} {:<14} {:<8} {:<20}",
                    w.id,
                    w.model,
                    w.runtime,
                    state,
                    w.attempts,
                    w.runner_id.unwrap_or_else(|| "-".to_string())
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list workloads: {}", error);
    }

    Ok(())
}

/// Show recent scheduling decisions
pub async fn decisions(client: &ApiClient, limit: usize) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/decisions"))
        .query(&[("limit", limit)])
        .send()
        .await?;

    if response.status().is_success() {
        let decisions: Vec<DecisionResponse> = response.json().await?;

        if decisions.is_empty() {
            println!("No decisions recorded");
        } else {
            println!(
                "{:<32} {:<36} {:<14} {:<20} {:<10} DETAIL",
                "TIME", "WORKLOAD", "DECISION", "RUNNER", "GPUS"
            );
            println!("{}", "-".repeat(130));
            for d in decisions {
                let gpus = if d.gpus.is_empty() {
                    "-".to_string()
                } else {
                    d.gpus
                        .iter()
                        .map(|g| g.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                };
                println!(
                    "{:<32} {:<36} {:<14} {:<20} {:<10} {}",
                    d.at,
                    d.workload_id,
                    d.kind,
                    d.runner_id.unwrap_or_else(|| "-".to_string()),
                    gpus,
                    d.detail
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list decisions: {}", error);
    }

    Ok(())
}

/// Reset a slot's idle clock
pub async fn touch(client: &ApiClient, slot_id: Uuid) -> Result<()> {
    let response = client
        .client
        .post(client.url(&format!("/api/v1/slots/{}/activity", slot_id)))
        .send()
        .await?;

    if response.status().is_success() {
        let slot: Slot = response.json().await?;
        println!("Slot {} active at {}", slot.id, slot.last_activity_at);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to record activity: {}", error);
    }

    Ok(())
}

/// Show scheduler status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpuplace v{}", status.version);
        println!();
        println!("Runners: {}", status.runners);
        println!("Workloads: {}", status.workloads);
        println!("Slots: {}", status.slots);
        println!("Allocations: {}", status.allocations);
        println!("Queued: {}", status.queued);
        println!();
        println!("Scheduled: {}", status.stats.scheduled);
        println!("Unschedulable: {}", status.stats.unschedulable);
        println!("Cancelled: {}", status.stats.cancelled);
        println!("Runtime failures: {}", status.stats.runtime_failures);
        println!("Ledger races: {}", status.stats.ledger_races);
        println!("Idle slots evicted: {}", status.stats.stale_evictions);
        println!(
            "Runners lost: {} ({} slots)",
            status.stats.runners_lost, status.stats.slots_lost
        );
        for o in &status.overcommitted {
            println!(
                "OVERSCHEDULED: runner {} GPU {} holds {} of {}",
                o.runner_id,
                o.gpu_index,
                format_bytes(o.reserved_bytes),
                format_bytes(o.total_memory_bytes)
            );
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::GIB;

    fn options() -> SubmitOptions {
        SubmitOptions {
            model: "meta-llama/Llama-3-70B".to_string(),
            memory: "140GiB".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_workload() {
        let workload = build_workload(SubmitOptions {
            divisor_of: Some(64),
            args: vec!["--enforce-eager".to_string()],
            ..options()
        })
        .unwrap();

        assert_eq!(workload.runtime, RuntimeKind::Vllm);
        assert_eq!(workload.model_memory_requirement_bytes, 140 * GIB);
        assert_eq!(workload.parallelism, Some(ParallelismConstraint::DivisorOf(64)));
        assert_eq!(workload.runtime_args, vec!["--enforce-eager".to_string()]);
    }

    #[test]
    fn test_build_workload_rejects_conflicting_constraints() {
        let result = build_workload(SubmitOptions {
            divisor_of: Some(64),
            max_gpus: Some(4),
            ..options()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_build_workload_rejects_bad_memory() {
        let result = build_workload(SubmitOptions {
            memory: "lots".to_string(),
            ..options()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_describe_placement() {
        assert_eq!(describe_placement(&Placement::Single { gpu_index: 2 }), "GPU 2");
        assert_eq!(
            describe_placement(&Placement::Multi {
                gpu_indices: vec![0, 1]
            }),
            "GPUs 0,1 (tp=2)"
        );
    }
}
