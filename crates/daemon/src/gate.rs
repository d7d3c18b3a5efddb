//! Per-class admission gate
//!
//! Admission never waits: a class at capacity rejects the request
//! immediately with the current occupancy. Every admitted job holds a
//! [`GateToken`]; the slot is returned exactly once, when the token drops.

use crate::concurrency::ConcurrencyPlan;
use crate::job::JobClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned when a class is at capacity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("maximum concurrent {class} jobs reached: {in_flight}/{capacity}")]
pub struct AdmissionRejected {
    pub class: JobClass,
    pub in_flight: u32,
    pub capacity: u32,
}

/// Occupancy of one class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub class: JobClass,
    pub in_flight: u32,
    pub capacity: Option<u32>,
}

#[derive(Debug)]
struct ClassSlot {
    capacity: Option<u32>,
    semaphore: Option<Arc<Semaphore>>,
    in_flight: AtomicU32,
}

impl ClassSlot {
    fn new(capacity: Option<u32>) -> Self {
        Self {
            capacity,
            semaphore: capacity.map(|c| Arc::new(Semaphore::new(c as usize))),
            in_flight: AtomicU32::new(0),
        }
    }
}

/// Admission control shared by every submitter
#[derive(Debug)]
pub struct ConcurrencyGate {
    slots: HashMap<JobClass, Arc<ClassSlot>>,
}

impl ConcurrencyGate {
    pub fn new(plan: &ConcurrencyPlan) -> Self {
        Self::with_capacities(|class| plan.capacity_for(class))
    }

    pub fn with_capacities(capacity: impl Fn(JobClass) -> Option<u32>) -> Self {
        let slots = JobClass::ALL
            .iter()
            .map(|class| (*class, Arc::new(ClassSlot::new(capacity(*class)))))
            .collect();
        Self { slots }
    }

    fn slot(&self, class: JobClass) -> &Arc<ClassSlot> {
        // every class is populated in with_capacities
        &self.slots[&class]
    }

    /// Admit one job of `class` or reject without waiting
    pub fn admit(&self, class: JobClass) -> Result<GateToken, AdmissionRejected> {
        let slot = self.slot(class);

        let permit = match &slot.semaphore {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let capacity = slot.capacity.unwrap_or(0);
                    return Err(AdmissionRejected {
                        class,
                        in_flight: slot.in_flight.load(Ordering::SeqCst).max(capacity),
                        capacity,
                    });
                }
            },
            None => None,
        };

        slot.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(GateToken {
            class,
            slot: Arc::clone(slot),
            _permit: permit,
        })
    }

    pub fn in_flight(&self, class: JobClass) -> u32 {
        self.slot(class).in_flight.load(Ordering::SeqCst)
    }

    pub fn capacity(&self, class: JobClass) -> Option<u32> {
        self.slot(class).capacity
    }

    pub fn status(&self) -> Vec<GateStatus> {
        JobClass::ALL
            .iter()
            .map(|class| GateStatus {
                class: *class,
                in_flight: self.in_flight(*class),
                capacity: self.capacity(*class),
            })
            .collect()
    }
}

/// Proof of admission; dropping it frees the slot
#[derive(Debug)]
pub struct GateToken {
    class: JobClass,
    slot: Arc<ClassSlot>,
    // Released after the counter is decremented, so in_flight never exceeds
    // the permits actually held.
    _permit: Option<OwnedSemaphorePermit>,
}

impl GateToken {
    pub fn class(&self) -> JobClass {
        self.class
    }

    /// Explicit release; equivalent to dropping the token
    pub fn release(self) {}
}

impl Drop for GateToken {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
