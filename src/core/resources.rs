//! Capacity pool for workflow execution.
//!
//! The [`ResourceManager`] is the only owner of the pool. Capacity leaves it
//! as a [`ResourceLease`] and comes back when the lease is released or
//! dropped, so every grant is paired with exactly one release even when the
//! holder fails or is cancelled.
//!
//! Requests that do not fit wait in a queue. The queue is FIFO except that
//! high-priority requests are placed ahead of normal ones.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::EventPayload;

use super::error::CoreError;
use super::event_bus::EventBus;
use super::workflow::{Priority, StepSpec, Workload};

const CPU_EPSILON: f64 = 1e-9;

/// An amount of capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Capacity {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_cpu")]
    pub cpu: f64,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
}

fn default_workers() -> usize {
    4
}
fn default_cpu() -> f64 {
    4.0
}
fn default_memory_mb() -> u64 {
    4096
}

impl Default for Capacity {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
        }
    }
}

impl Capacity {
    pub const ZERO: Capacity = Capacity {
        workers: 0,
        cpu: 0.0,
        memory_mb: 0,
    };

    fn add(&mut self, other: &Capacity) {
        self.workers += other.workers;
        self.cpu += other.cpu;
        self.memory_mb += other.memory_mb;
    }

    fn sub(&mut self, other: &Capacity) {
        self.workers = self.workers.saturating_sub(other.workers);
        self.cpu = (self.cpu - other.cpu).max(0.0);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
    }
}

/// Capacity wanted for a batch of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub steps: Vec<String>,
    pub workers: usize,
    pub cpu: f64,
    pub memory_mb: u64,
    pub high_priority: bool,
}

impl ResourceRequest {
    /// One worker per step plus the sum of declared requirements
    pub fn for_steps(steps: &[&StepSpec]) -> Self {
        Self {
            steps: steps.iter().map(|s| s.id.clone()).collect(),
            workers: steps.len().max(1),
            cpu: steps.iter().map(|s| s.resources.cpu).sum(),
            memory_mb: steps.iter().map(|s| s.resources.memory_mb).sum(),
            high_priority: steps.iter().any(|s| s.priority == Priority::High),
        }
    }

    fn capacity(&self) -> Capacity {
        Capacity {
            workers: self.workers,
            cpu: self.cpu,
            memory_mb: self.memory_mb,
        }
    }
}

/// Outcome of an allocation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: Uuid,
    pub allocated: bool,
    pub requested: Capacity,
    pub granted: Capacity,

    /// Steps that must wait when nothing was granted
    pub queued_steps: Vec<String>,
}

struct Waiter {
    id: Uuid,
    request: ResourceRequest,
    grant: oneshot::Sender<ResourceAllocation>,
}

struct PoolState {
    available: Capacity,
    outstanding: HashMap<Uuid, Capacity>,
    waiters: VecDeque<Waiter>,
}

/// Sole owner of the worker/cpu/memory pool
pub struct ResourceManager {
    total: Capacity,
    state: Mutex<PoolState>,
    events: EventBus,
}

impl ResourceManager {
    pub fn new(total: Capacity, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            total,
            state: Mutex::new(PoolState {
                available: total,
                outstanding: HashMap::new(),
                waiters: VecDeque::new(),
            }),
            events,
        })
    }

    pub fn total_resources(&self) -> Capacity {
        self.total
    }

    /// Current free capacity
    pub fn available_resources(&self) -> Capacity {
        self.lock().available
    }

    /// Number of requests waiting for capacity
    pub fn queued_requests(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Grant capacity now, or report which steps would have to queue.
    ///
    /// Normal-priority requests never jump ahead of queued waiters.
    pub fn allocate_resources(self: &Arc<Self>, request: &ResourceRequest) -> ResourceAllocation {
        let allocation = {
            let mut state = self.lock();
            let blocked = !request.high_priority && !state.waiters.is_empty();
            match self.fit(request, &state.available).filter(|_| !blocked) {
                Some(granted) => Some(self.commit(&mut state, request, granted)),
                None => None,
            }
        };

        match allocation {
            Some(allocation) => {
                self.announce_grant(&allocation);
                allocation
            }
            None => {
                self.events.publish(EventPayload::ResourcesQueued {
                    steps: request.steps.clone(),
                    workers: request.workers,
                });
                ResourceAllocation {
                    id: Uuid::new_v4(),
                    allocated: false,
                    requested: request.capacity(),
                    granted: Capacity::ZERO,
                    queued_steps: request.steps.clone(),
                }
            }
        }
    }

    /// Wait for capacity and return it as a lease.
    ///
    /// Fails with [`CoreError::Cancelled`] if `cancel` fires first; a grant
    /// racing with cancellation is returned to the pool.
    pub async fn acquire(
        self: &Arc<Self>,
        request: ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<ResourceLease, CoreError> {
        let allocation = self.allocate_resources(&request);
        if allocation.allocated {
            return Ok(self.lease(allocation));
        }

        let waiter_id = Uuid::new_v4();
        let (grant, mut receiver) = oneshot::channel();
        {
            let mut state = self.lock();
            let waiter = Waiter {
                id: waiter_id,
                request: request.clone(),
                grant,
            };
            if request.high_priority {
                let position = state
                    .waiters
                    .iter()
                    .position(|w| !w.request.high_priority)
                    .unwrap_or(state.waiters.len());
                state.waiters.insert(position, waiter);
            } else {
                state.waiters.push_back(waiter);
            }
        }
        debug!(steps = ?request.steps, "Waiting for resources");

        // Capacity may have come back between the failed attempt and queueing
        self.process_queue();

        tokio::select! {
            granted = &mut receiver => match granted {
                Ok(allocation) => Ok(self.lease(allocation)),
                Err(_) => Err(CoreError::ResourceExhausted("allocation request dropped".to_string())),
            },
            _ = cancel.cancelled() => {
                self.lock().waiters.retain(|w| w.id != waiter_id);
                if let Ok(allocation) = receiver.try_recv() {
                    self.release_resources(allocation.id);
                }
                Err(CoreError::Cancelled("waiting for resources".to_string()))
            }
        }
    }

    /// Return an allocation's capacity and hand it to queued requests.
    ///
    /// Returns false if the allocation was unknown or already released.
    pub fn release_resources(&self, allocation_id: Uuid) -> bool {
        let granted = self.lock().outstanding.remove(&allocation_id);
        let Some(granted) = granted else {
            return false;
        };

        self.lock().available.add(&granted);
        self.events.publish(EventPayload::ResourcesReleased {
            allocation_id,
            workers: granted.workers,
        });
        self.process_queue();
        true
    }

    /// Rank steps by declared characteristics and size the concurrency
    pub fn optimize_allocation(&self, steps: &[&StepSpec], available: &Capacity) -> AllocationPlan {
        let mut ranked: Vec<&StepSpec> = steps.to_vec();
        ranked.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| workload_rank(a.workload).cmp(&workload_rank(b.workload)))
                .then_with(|| a.order.cmp(&b.order))
                .then_with(|| a.id.cmp(&b.id))
        });

        let cpu_bound = ranked.iter().filter(|s| s.workload == Workload::CpuBound).count();
        let io_bound = ranked.iter().filter(|s| s.workload == Workload::IoBound).count();

        let mut max_concurrency = ranked.len().min(available.workers).max(1);
        if cpu_bound > 0 {
            let cores = (available.cpu.floor() as usize).max(1);
            max_concurrency = max_concurrency.min(cores.max(ranked.len() - cpu_bound));
        }

        let strategy = if max_concurrency == 1 && ranked.len() > 1 {
            AllocationStrategy::Sequential
        } else if io_bound == ranked.len() {
            AllocationStrategy::IoParallel
        } else if cpu_bound == ranked.len() {
            AllocationStrategy::CpuBalanced
        } else {
            AllocationStrategy::Mixed
        };

        let cpu_share = available.cpu / max_concurrency as f64;
        let slots = ranked
            .iter()
            .enumerate()
            .map(|(rank, step)| {
                let cpu = match step.workload {
                    Workload::CpuBound => cpu_share.max(step.resources.cpu),
                    _ => step.resources.cpu,
                };
                (
                    step.id.clone(),
                    StepSlot {
                        rank,
                        wave: rank / max_concurrency,
                        cpu,
                    },
                )
            })
            .collect();

        AllocationPlan {
            strategy,
            max_concurrency,
            order: ranked.iter().map(|s| s.id.clone()).collect(),
            slots,
        }
    }

    fn lease(self: &Arc<Self>, allocation: ResourceAllocation) -> ResourceLease {
        ResourceLease {
            manager: Arc::clone(self),
            allocation,
        }
    }

    /// Clamp a request to the pool size and check it fits what is free
    fn fit(&self, request: &ResourceRequest, available: &Capacity) -> Option<Capacity> {
        let cpu = request.cpu.min(self.total.cpu);
        let memory_mb = request.memory_mb.min(self.total.memory_mb);
        let wanted_workers = request.workers.clamp(1, self.total.workers.max(1));

        if available.workers == 0
            || cpu > available.cpu + CPU_EPSILON
            || memory_mb > available.memory_mb
        {
            return None;
        }

        Some(Capacity {
            workers: wanted_workers.min(available.workers),
            cpu,
            memory_mb,
        })
    }

    fn commit(
        &self,
        state: &mut PoolState,
        request: &ResourceRequest,
        granted: Capacity,
    ) -> ResourceAllocation {
        let id = Uuid::new_v4();
        state.available.sub(&granted);
        state.outstanding.insert(id, granted);
        ResourceAllocation {
            id,
            allocated: true,
            requested: request.capacity(),
            granted,
            queued_steps: Vec::new(),
        }
    }

    /// Grant queued requests from the head while they fit
    fn process_queue(&self) {
        let mut granted = Vec::new();
        {
            let mut state = self.lock();
            loop {
                let Some(front) = state.waiters.front() else {
                    break;
                };
                let Some(capacity) = self.fit(&front.request, &state.available) else {
                    break;
                };
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                let allocation = self.commit(&mut state, &waiter.request, capacity);
                match waiter.grant.send(allocation) {
                    Ok(()) => granted.push((waiter.id, capacity)),
                    Err(allocation) => {
                        // Waiter went away; take the capacity back
                        state.outstanding.remove(&allocation.id);
                        state.available.add(&allocation.granted);
                    }
                }
            }
        }

        for (waiter_id, capacity) in granted {
            info!(%waiter_id, workers = capacity.workers, "Queued resource request granted");
        }
    }

    fn announce_grant(&self, allocation: &ResourceAllocation) {
        self.events.publish(EventPayload::ResourcesGranted {
            allocation_id: allocation.id,
            workers: allocation.granted.workers,
            cpu: allocation.granted.cpu,
            memory_mb: allocation.granted.memory_mb,
        });
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn workload_rank(workload: Workload) -> u8 {
    match workload {
        Workload::CpuBound => 0,
        Workload::Balanced => 1,
        Workload::IoBound => 2,
    }
}

/// Scoped hold on pool capacity; released exactly once
pub struct ResourceLease {
    manager: Arc<ResourceManager>,
    allocation: ResourceAllocation,
}

impl ResourceLease {
    pub fn allocation(&self) -> &ResourceAllocation {
        &self.allocation
    }

    pub fn workers(&self) -> usize {
        self.allocation.granted.workers
    }

    /// Release now instead of at drop
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.manager.release_resources(self.allocation.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Everything is io-bound: one slot per step up to the worker count
    IoParallel,
    /// Everything is cpu-bound: concurrency capped by cores
    CpuBalanced,
    Mixed,
    /// Only one step can run at a time
    Sequential,
}

/// Where a step sits in the launch order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSlot {
    pub rank: usize,

    /// Which wave of `max_concurrency` launches the step belongs to
    pub wave: usize,

    pub cpu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub strategy: AllocationStrategy,
    pub max_concurrency: usize,

    /// Step ids in launch order
    pub order: Vec<String>,

    pub slots: HashMap<String, StepSlot>,
}
