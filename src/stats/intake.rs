use anyhow::Result;
use tracing::warn;

use crate::sql::flush::FlushHandler;

use super::definitions::StatisticDefinitionSource;
use super::event::StatisticEvent;
use super::map::AggregateMap;
use super::precision::Precision;
use super::rollup::roll_up_event;

/// Outcome of one intake batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IntakeSummary {
    /// Events rolled up and staged.
    pub accepted: usize,
    /// Events dropped: unknown statistic, schema mismatch, or validation
    /// failure.
    pub skipped: usize,
    /// Distinct aggregate keys flushed to the staging table.
    pub staged_rows: usize,
}

/// Front door for raw events: looks up each event's definition, applies its
/// rollup policy, accumulates into a fresh per-batch aggregate map, and
/// flushes the map to the staging table.
///
/// Per-event validation failures are this component's call to make as the
/// map's caller: offending events are logged and skipped, the rest of the
/// batch proceeds.
pub struct EventIntake<'a, S: StatisticDefinitionSource> {
    definitions: &'a S,
    flush: &'a FlushHandler,
}

impl<'a, S: StatisticDefinitionSource> EventIntake<'a, S> {
    pub fn new(definitions: &'a S, flush: &'a FlushHandler) -> Self {
        Self { definitions, flush }
    }

    /// Rolls up and stages one batch of raw events.
    pub async fn process_batch(&self, events: Vec<StatisticEvent>) -> Result<IntakeSummary> {
        let mut summary = IntakeSummary::default();
        let mut map = AggregateMap::new();

        for event in events {
            let Some(definition) = self.definitions.definition(&event.name) else {
                warn!(name = %event.name, "dropping event for undeclared statistic");
                summary.skipped += 1;
                continue;
            };

            if event.statistic_type() != definition.statistic_type {
                warn!(
                    name = %event.name,
                    expected = definition.statistic_type.as_str(),
                    got = event.statistic_type().as_str(),
                    "dropping event with mismatched statistic type"
                );
                summary.skipped += 1;
                continue;
            }

            if event.tags.len() != definition.tag_names.len() {
                warn!(
                    name = %event.name,
                    expected = definition.tag_names.len(),
                    got = event.tags.len(),
                    "dropping event with mismatched tag count"
                );
                summary.skipped += 1;
                continue;
            }

            // Keys are positional, so tags must also match the schema order
            // by name; swapped tags would otherwise be keyed silently wrong.
            if let Some((pos, pair)) = event
                .tags
                .iter()
                .enumerate()
                .find(|(pos, pair)| pair.tag != definition.tag_names[*pos])
            {
                warn!(
                    name = %event.name,
                    position = pos,
                    expected = %definition.tag_names[pos],
                    got = %pair.tag,
                    "dropping event with mismatched tag name"
                );
                summary.skipped += 1;
                continue;
            }

            let rolled = match roll_up_event(event, &definition.rollup) {
                Ok(rolled) => rolled,
                Err(err) => {
                    warn!(error = %err, "dropping event that failed rollup");
                    summary.skipped += 1;
                    continue;
                }
            };

            match map.add_rolled_up_event(&rolled, Precision::finest()) {
                Ok(()) => summary.accepted += 1,
                Err(err) => {
                    warn!(error = %err, "dropping event that failed validation");
                    summary.skipped += 1;
                }
            }
        }

        summary.staged_rows = self.flush.exec(map).await?;

        Ok(summary)
    }
}
