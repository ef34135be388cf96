/// Execute an aggregate command deterministically (no IO, no async).
///
/// Canonical decide-then-evolve lifecycle:
///
/// 1. **Decide**: `aggregate.handle(command)` produces events (pure).
/// 2. **Evolve**: each event is applied via `aggregate.apply(event)`.
///
/// Useful for unit tests and inline processing. Production paths go through
/// the infra dispatcher, which adds persistence, publication, and the
/// optimistic-concurrency check.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: apexfin_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
