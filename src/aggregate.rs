/// Pure aggregation rules: fold finalized events into agent profiles and
/// sessions, and price token usage. No I/O happens here.
use crate::model::{AgentProfile, Event, Session, UNKNOWN_TICKET};
use crate::pricing::{round_usd, PricingTable};

/// Fold one finalized event into an agent profile.
///
/// Counters only ever grow; the streak resets on any non-success status.
pub fn fold_event_into_profile(profile: &AgentProfile, event: &Event) -> AgentProfile {
    let mut next = profile.clone();
    next.total_invocations += 1;
    if event.status.is_success() {
        next.successful_invocations += 1;
        next.current_streak += 1;
        next.best_streak = next.best_streak.max(next.current_streak);
    } else {
        next.failed_invocations += 1;
        next.current_streak = 0;
    }
    next.total_tokens += event.total_tokens;
    next.total_cost_usd = round_usd(next.total_cost_usd + event.cost_usd);
    next.total_duration_secs += event.duration_secs;
    next.last_active = Some(event.ended_at);
    next.refresh_derived();
    next
}

/// Fold one finalized event into the session it belongs to.
pub fn fold_event_into_session(session: &Session, event: &Event) -> Session {
    let mut next = session.clone();
    if !next.agents_invoked.contains(&event.agent) {
        next.agents_invoked.push(event.agent.clone());
    }
    if event.ticket != UNKNOWN_TICKET && !next.tickets_worked.contains(&event.ticket) {
        next.tickets_worked.push(event.ticket.clone());
    }
    next.total_tokens += event.total_tokens;
    next.total_cost_usd = round_usd(next.total_cost_usd + event.cost_usd);
    next.event_ids.push(event.id.clone());
    next
}

/// Estimated USD cost of a call, rounded to currency precision.
pub fn compute_cost(
    pricing: &PricingTable,
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> f64 {
    let rate = pricing.rate_for(model);
    round_usd(
        input_tokens as f64 * rate.input_per_token()
            + output_tokens as f64 * rate.output_per_token(),
    )
}
