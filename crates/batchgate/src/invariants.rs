//! Debug assertion macros for batching invariants.
//!
//! Active only in debug builds (`debug_assert!`), so release builds pay
//! nothing for them.

// =============================================================================
// In-flight bound
// =============================================================================

/// Assert that the in-flight batch count stays within its limit.
///
/// **Invariant**: `0 ≤ pending_batches ≤ max_pending_requests`
///
/// Used in: flush after the pending count is incremented
macro_rules! debug_assert_pending_bounded {
    ($pending:expr, $max:expr) => {
        debug_assert!(
            $pending <= $max,
            "pending batch bound violated: {} in flight, limit {}",
            $pending,
            $max
        )
    };
}

// =============================================================================
// Pending counter underflow
// =============================================================================

/// Assert that a batch being released was counted as pending.
///
/// **Invariant**: every decrement of `pending_batches` matches an increment
///
/// Used in: completion fan-out and rejected-flush cleanup
macro_rules! debug_assert_pending_released {
    ($previous:expr) => {
        debug_assert!(
            $previous > 0,
            "pending batch counter underflow: released a batch with none in flight"
        )
    };
}

// =============================================================================
// Batch id monotonicity
// =============================================================================

/// Assert that batch ids strictly increase in flush order.
///
/// **Invariant**: `next_id > last_id` for consecutive flushes
///
/// Used in: flush, checked against the worker's last issued id
macro_rules! debug_assert_batch_id_increasing {
    ($last:expr, $next:expr) => {
        debug_assert!(
            $last.map_or(true, |last| $next > last),
            "batch id not increasing: {:?} followed by {}",
            $last,
            $next
        )
    };
}

// =============================================================================
// Staging byte accounting
// =============================================================================

/// Assert that the staging byte total equals the sum of staged sizes.
///
/// **Invariant**: `staging.total_size == Σ item.size`
///
/// Used in: flush, before the staged items are moved into a batch
macro_rules! debug_assert_staging_consistent {
    ($staging:expr) => {
        debug_assert!(
            $staging.recount() == $staging.total_size(),
            "staging byte total {} does not match staged sizes {}",
            $staging.total_size(),
            $staging.recount()
        )
    };
}

// =============================================================================
// Batch completed exactly once (compile-time enforced)
// =============================================================================

// **Invariant**: every accepted batch is completed exactly once
//
// `Batch::complete` takes the batch by value, so a second completion does not
// compile. The remaining failure, dropping an accepted batch without
// completing it, aborts in `Batch`'s `Drop` impl.

pub(crate) use debug_assert_batch_id_increasing;
pub(crate) use debug_assert_pending_bounded;
pub(crate) use debug_assert_pending_released;
pub(crate) use debug_assert_staging_consistent;
