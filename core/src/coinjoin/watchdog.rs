//! Phase timeouts
//!
//! Run periodically by the binary. Input registration that times out with
//! enough alices closes early; without enough it simply starts over. Any
//! other phase that times out fails its round.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::coordinator::Coordinator;
use super::round::RoundPhase;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutReport {
    pub advanced: usize,
    pub restarted: usize,
    pub failed: usize,
}

pub async fn enforce_phase_timeouts(coordinator: &Coordinator, now: Instant) -> TimeoutReport {
    let mut report = TimeoutReport::default();

    for round in coordinator.registry().running_rounds().await {
        if !round.is_phase_expired(now) {
            continue;
        }

        let phase = round.phase();
        if phase != RoundPhase::InputRegistration {
            warn!(round_id = %round.id(), %phase, "Phase timed out, failing round");
            round.fail();
            report.failed += 1;
            continue;
        }

        if round.alice_count() >= round.config().min_anonymity_set {
            match round.advance_phase(RoundPhase::ConnectionConfirmation) {
                Ok(()) => {
                    info!(round_id = %round.id(), alices = round.alice_count(), "Input registration timed out, proceeding");
                    report.advanced += 1;
                }
                // Filled up or failed concurrently
                Err(e) => debug!(round_id = %round.id(), error = %e, "Round moved on before timeout"),
            }
        } else {
            debug!(round_id = %round.id(), alices = round.alice_count(), "Input registration timed out, waiting longer");
            round.restart_phase_timer();
            report.restarted += 1;
        }
    }

    report
}
