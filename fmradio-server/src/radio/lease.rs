//! Single-consumer stream lease.
//!
//! Only one live listener may own the demodulator. Acquiring a lease cancels
//! the previous holder's token and bumps a generation counter; a holder may
//! only release the lease it was given, so a late release from a preempted
//! stream never clears the flags of its successor.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Handed to a live stream when it starts.
#[derive(Debug, Clone)]
pub struct StreamLease {
    pub generation: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
struct LeaseState {
    generation: u64,
    current: Option<CancellationToken>,
    streaming: bool,
}

/// Generation-counted lease holder.
#[derive(Debug, Default)]
pub struct LeaseManager {
    state: Mutex<LeaseState>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preempt any current holder and hand out a fresh lease.
    pub fn acquire(&self) -> StreamLease {
        let mut state = self.state.lock();
        if let Some(previous) = state.current.take() {
            previous.cancel();
        }
        state.generation += 1;
        let token = CancellationToken::new();
        state.current = Some(token.clone());
        state.streaming = true;
        StreamLease {
            generation: state.generation,
            token,
        }
    }

    /// Release the lease if `generation` is still the current one.
    ///
    /// Returns `false` for stale generations, which change nothing.
    pub fn release(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.current = None;
        state.streaming = false;
        true
    }

    /// Cancel the current holder but leave the lease in place until it releases.
    pub fn cancel_current(&self) {
        if let Some(token) = &self.state.lock().current {
            token.cancel();
        }
    }

    /// Cancel and forget the current holder.
    pub fn revoke(&self) {
        let mut state = self.state.lock();
        if let Some(token) = state.current.take() {
            token.cancel();
        }
        state.streaming = false;
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generations_increase() {
        let leases = LeaseManager::new();
        let a = leases.acquire();
        let b = leases.acquire();
        let c = leases.acquire();
        assert!(a.generation < b.generation && b.generation < c.generation);
        assert_eq!(leases.generation(), c.generation);
    }

    #[test]
    fn test_acquire_preempts_previous() {
        let leases = LeaseManager::new();
        let first = leases.acquire();
        assert!(!first.token.is_cancelled());

        let second = leases.acquire();
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(leases.is_streaming());
    }

    #[test]
    fn test_stale_release_is_ignored() {
        let leases = LeaseManager::new();
        let first = leases.acquire();
        let second = leases.acquire();

        assert!(!leases.release(first.generation));
        assert!(leases.is_streaming());

        assert!(leases.release(second.generation));
        assert!(!leases.is_streaming());
    }

    #[test]
    fn test_cancel_current_keeps_lease() {
        let leases = LeaseManager::new();
        let lease = leases.acquire();
        leases.cancel_current();
        assert!(lease.token.is_cancelled());
        assert!(leases.is_streaming());
        assert!(leases.release(lease.generation));
    }

    #[test]
    fn test_revoke() {
        let leases = LeaseManager::new();
        let lease = leases.acquire();
        leases.revoke();
        assert!(lease.token.is_cancelled());
        assert!(!leases.is_streaming());
        // The holder's own release afterwards is harmless.
        assert!(leases.release(lease.generation));
        assert!(!leases.is_streaming());
    }
}
