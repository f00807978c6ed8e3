//! Runtime self-audit: INV-1..INV-8 from spec.md §3.
//!
//! Most invariants are enforced structurally (the heap simply cannot pop
//! out-of-order ticks; the KV cache simply cannot allocate more blocks than
//! it has). The ones that need an explicit check because they are *global*
//! properties of the run — conservation, block conservation, causality — are
//! checked here, on demand, by [`crate::cluster::ClusterOrchestrator`].

use thiserror::Error;

/// A violated invariant. Carries enough context to name the instance and/or
/// request involved, per spec.md §7 ("abort with a diagnostic identifying
/// which invariant and which request/instance").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error(
        "INV-1 conservation violated for instance {instance}: injected={injected} != completed({completed}) + still_queued({still_queued}) + still_running({still_running}) + dropped_unservable({dropped})"
    )]
    Conservation {
        instance: Option<u32>,
        injected: u64,
        completed: u64,
        still_queued: u64,
        still_running: u64,
        dropped: u64,
    },

    #[error("INV-2 work-conserving violated: instance {instance} has a non-empty wait queue but no Step event is scheduled")]
    WorkConserving { instance: u32 },

    #[error("INV-3 clock monotonicity violated: popped tick {popped} after previous tick {previous}")]
    ClockMonotonicity { previous: u64, popped: u64 },

    #[error("INV-4 block conservation violated for instance {instance}: allocated({allocated}) + free({free}) != total({total})")]
    BlockConservation {
        instance: u32,
        allocated: u64,
        free: u64,
        total: u64,
    },

    #[error(
        "INV-5 causality violated for request {request}: arrival({arrival}) <= enqueue({enqueue}) <= schedule({schedule}) <= first_token({first_token}) <= completion({completion}) does not hold"
    )]
    Causality {
        request: u32,
        arrival: u64,
        enqueue: u64,
        schedule: u64,
        first_token: u64,
        completion: u64,
    },

    #[error("pending-requests counter for instance {instance} double-decremented")]
    DoubleDecrement { instance: u32 },

    #[error("negative scheduling delay for request {request}: schedule({schedule}) < arrival({arrival})")]
    NegativeSchedulingDelay {
        request: u32,
        arrival: u64,
        schedule: u64,
    },
}

/// Checks INV-5 causality for a single completed request. Called by
/// [`crate::simulator::InstanceSim`] when it records completion metrics.
pub fn check_causality(
    request: u32,
    arrival: u64,
    enqueue: u64,
    schedule: u64,
    first_token: u64,
    completion: u64,
) -> Result<(), InvariantViolation> {
    if arrival <= enqueue && enqueue <= schedule && schedule <= first_token && first_token <= completion {
        Ok(())
    } else {
        Err(InvariantViolation::Causality {
            request,
            arrival,
            enqueue,
            schedule,
            first_token,
            completion,
        })
    }
}

/// Checks INV-4 for one instance's KV cache.
pub fn check_block_conservation(
    instance: u32,
    allocated: u64,
    free: u64,
    total: u64,
) -> Result<(), InvariantViolation> {
    if allocated + free == total {
        Ok(())
    } else {
        Err(InvariantViolation::BlockConservation {
            instance,
            allocated,
            free,
            total,
        })
    }
}

/// Checks INV-1, either for one instance or for the whole cluster.
pub fn check_conservation(
    instance: Option<u32>,
    injected: u64,
    completed: u64,
    still_queued: u64,
    still_running: u64,
    dropped: u64,
) -> Result<(), InvariantViolation> {
    if injected == completed + still_queued + still_running + dropped {
        Ok(())
    } else {
        Err(InvariantViolation::Conservation {
            instance,
            injected,
            completed,
            still_queued,
            still_running,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causality_accepts_equal_timestamps() {
        assert!(check_causality(1, 10, 10, 10, 10, 10).is_ok());
    }

    #[test]
    fn causality_rejects_out_of_order() {
        let err = check_causality(1, 10, 5, 10, 10, 10).unwrap_err();
        assert!(matches!(err, InvariantViolation::Causality { .. }));
    }

    #[test]
    fn conservation_holds() {
        assert!(check_conservation(Some(0), 10, 4, 3, 2, 1).is_ok());
        assert!(check_conservation(Some(0), 10, 4, 3, 2, 2).is_err());
    }

    #[test]
    fn block_conservation_holds() {
        assert!(check_block_conservation(0, 3, 7, 10).is_ok());
        assert!(check_block_conservation(0, 3, 6, 10).is_err());
    }
}
