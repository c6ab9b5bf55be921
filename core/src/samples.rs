//! Per-dive sample time series and the depth aggregates derived from it.
//!
//! Samples are written in fixed-size batches, one transaction per batch. A
//! batch that fails (collision, bad value, storage error) stops the call, but
//! batches written before it stay committed. The entry's depth aggregates are
//! recomputed whenever anything was written, so they always describe what is
//! actually stored.

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tracing::{debug, error, info, instrument};

use crate::config::PipelineConfig;
use crate::error::{LogbookError, Result};
use crate::events::{DomainEvent, Outbox};
use crate::models::{LogEntry, LogEntryId, Sample};
use crate::storage::{DepthAggregate, LogEntryRepository, SampleRepository};

/// What a successful `save_samples` call wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SaveSummary {
    pub saved: u64,
    pub batches: u64,
    /// Aggregate over every stored sample after the write, in the entry's unit.
    pub depths: DepthAggregate,
}

pub struct SampleStore<S> {
    store: Arc<S>,
    config: PipelineConfig,
    outbox: Option<Outbox>,
}

impl<S> SampleStore<S> {
    pub fn new(store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            store,
            config,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: Outbox) -> Self {
        self.outbox = Some(outbox);
        self
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(outbox) = &self.outbox {
            outbox.publish(event);
        }
    }
}

impl<S> SampleStore<S>
where
    S: SampleRepository + LogEntryRepository,
{
    async fn entry(&self, id: &LogEntryId) -> Result<LogEntry> {
        self.store
            .get_log_entry(id)
            .await?
            .ok_or_else(|| LogbookError::not_found("log entry", id))
    }

    /// Consumes `samples` in batches of `sampleBatchSize`, in any time order.
    ///
    /// Each batch is checked against the stored samples before it is written;
    /// any collision fails the call with `Conflict` naming every colliding
    /// offset, and that batch is not written.
    #[instrument(skip(self, samples), fields(log_entry = %entry_id))]
    pub async fn save_samples<St>(&self, entry_id: &LogEntryId, samples: St) -> Result<SaveSummary>
    where
        St: Stream<Item = Sample> + Send,
    {
        let entry = self.entry(entry_id).await?;
        let batch_size = self.config.sample_batch_size.max(1);
        let mut batches = std::pin::pin!(samples.chunks(batch_size));

        let mut summary = SaveSummary::default();
        let mut failure = None;
        while let Some(batch) = batches.next().await {
            if let Err(err) = self.write_batch(&entry.id, summary.saved, &batch).await {
                failure = Some(err);
                break;
            }
            summary.saved += batch.len() as u64;
            summary.batches += 1;
            debug!(batch = summary.batches, samples = batch.len(), "sample batch written");
        }

        if let Some(err) = failure {
            if summary.saved > 0 {
                if let Err(refresh) = self.refresh_depths(&entry).await {
                    error!(error = %refresh, "depth refresh after failed save failed");
                }
                self.publish(DomainEvent::SamplesSaved {
                    log_entry: entry.id.clone(),
                    saved: summary.saved,
                });
            }
            return Err(err);
        }

        summary.depths = self.refresh_depths(&entry).await?;
        info!(saved = summary.saved, batches = summary.batches, "samples saved");
        self.publish(DomainEvent::SamplesSaved {
            log_entry: entry.id.clone(),
            saved: summary.saved,
        });
        Ok(summary)
    }

    /// Convenience for callers holding samples in memory.
    pub async fn save_samples_from_iter<I>(
        &self,
        entry_id: &LogEntryId,
        samples: I,
    ) -> Result<SaveSummary>
    where
        I: IntoIterator<Item = Sample>,
        I::IntoIter: Send,
    {
        self.save_samples(entry_id, futures::stream::iter(samples))
            .await
    }

    async fn write_batch(
        &self,
        entry: &LogEntryId,
        first_index: u64,
        batch: &[Sample],
    ) -> Result<()> {
        for (i, sample) in batch.iter().enumerate() {
            validate_sample(first_index as usize + i, sample)?;
        }

        let duplicates = duplicate_offsets(batch);
        if !duplicates.is_empty() {
            return Err(LogbookError::Conflict {
                log_entry: entry.clone(),
                time_offsets: duplicates,
            });
        }

        let offsets: Vec<u32> = batch.iter().map(|s| s.time_offset).collect();
        let colliding = self.store.find_sample_collisions(entry, &offsets).await?;
        if !colliding.is_empty() {
            return Err(LogbookError::Conflict {
                log_entry: entry.clone(),
                time_offsets: colliding,
            });
        }

        // The unique index still rejects a concurrent writer that slips in here.
        self.store.insert_samples(entry, batch).await
    }

    async fn refresh_depths(&self, entry: &LogEntry) -> Result<DepthAggregate> {
        let aggregate = self
            .store
            .aggregate_depths(&entry.id, entry.depths.depth_unit)
            .await?;
        // Once samples exist the depth fields are derived, even if that means null.
        if aggregate.stored_samples > 0 {
            self.store
                .update_depths(&entry.id, aggregate.max_depth, aggregate.average_depth)
                .await?;
            debug!(
                max_depth = ?aggregate.max_depth,
                average_depth = ?aggregate.average_depth,
                "depth aggregates updated"
            );
        }
        Ok(aggregate)
    }

    /// Removes every sample of the entry. Depth fields are left as they are.
    #[instrument(skip(self), fields(log_entry = %entry_id))]
    pub async fn clear_samples(&self, entry_id: &LogEntryId) -> Result<u64> {
        let entry = self.entry(entry_id).await?;
        let removed = self.store.delete_samples(&entry.id).await?;
        info!(removed, "samples cleared");
        self.publish(DomainEvent::SamplesCleared {
            log_entry: entry.id,
            removed,
        });
        Ok(removed)
    }
}

impl<S> SampleStore<S>
where
    S: SampleRepository + LogEntryRepository + 'static,
{
    /// The entry's samples in ascending time order, fetched one page at a time
    /// as the stream is polled. Each call starts over from the first sample.
    pub fn get_samples(
        &self,
        entry_id: LogEntryId,
    ) -> impl Stream<Item = Result<Sample>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let page_size = self.config.sample_page_size.max(1);

        stream! {
            match store.get_log_entry(&entry_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    yield Err(LogbookError::not_found("log entry", &entry_id));
                    return;
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }

            let mut skip = 0;
            loop {
                let page = match store.list_samples(&entry_id, skip, page_size).await {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                let fetched = page.len();
                debug!(log_entry = %entry_id, skip, fetched, "sample page fetched");
                for sample in page {
                    yield Ok(sample);
                }
                if fetched < page_size {
                    break;
                }
                skip += fetched;
            }
        }
    }
}

fn validate_sample(index: usize, sample: &Sample) -> Result<()> {
    let fail = |field: &str, message: &str| LogbookError::validation(Some(index), field, message);
    if let Some(depth) = sample.depth {
        if !depth.is_finite() || depth < 0.0 {
            return Err(fail("depth", "must be a non-negative number"));
        }
    }
    if sample.temperature.is_some_and(|t| !t.is_finite()) {
        return Err(fail("temperature", "must be a finite number"));
    }
    if let Some(gps) = sample.gps {
        if !(-90.0..=90.0).contains(&gps.lat) {
            return Err(fail("gps.lat", "must be between -90 and 90"));
        }
        if !(-180.0..=180.0).contains(&gps.lon) {
            return Err(fail("gps.lon", "must be between -180 and 180"));
        }
    }
    Ok(())
}

/// Offsets that occur more than once in `samples`, ascending.
pub(crate) fn duplicate_offsets(samples: &[Sample]) -> Vec<u32> {
    let mut seen = HashSet::with_capacity(samples.len());
    let mut duplicates: Vec<u32> = samples
        .iter()
        .map(|s| s.time_offset)
        .filter(|offset| !seen.insert(*offset))
        .collect();
    duplicates.sort_unstable();
    duplicates.dedup();
    duplicates
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use futures::TryStreamExt;

    use super::*;
    use crate::models::{
        Conditions, DepthUnit, Depths, EquipmentUsage, GpsPoint, NewLogEntry, Timing, UserId,
    };
    use crate::storage::SqliteStorage;

    async fn setup(
        config: PipelineConfig,
        unit: DepthUnit,
    ) -> (Arc<SqliteStorage>, SampleStore<SqliteStorage>, LogEntryId) {
        let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let entry_time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let entry = LogEntry::from_new(
            UserId::from("usr_1"),
            None,
            NewLogEntry {
                log_number: Some(1),
                site: None,
                operator: None,
                timing: Timing {
                    entry_time,
                    local_entry_time: entry_time.naive_utc(),
                    timezone: "Etc/UTC".into(),
                    duration: 45.0,
                    bottom_time: None,
                },
                depths: Depths {
                    max_depth: Some(99.0),
                    average_depth: Some(50.0),
                    depth_unit: unit,
                },
                conditions: Conditions::default(),
                equipment: EquipmentUsage::default(),
                air: Vec::new(),
                notes: None,
                tags: Vec::new(),
            },
        );
        store.insert_log_entry(&entry).await.unwrap();
        let samples = SampleStore::new(Arc::clone(&store), config);
        (store, samples, entry.id)
    }

    #[tokio::test]
    async fn aggregates_in_the_entry_unit() {
        let (store, samples, id) = setup(PipelineConfig::default(), DepthUnit::Feet).await;
        let summary = samples
            .save_samples_from_iter(
                &id,
                vec![
                    Sample::at(10).with_depth(10.0, DepthUnit::Meters),
                    Sample::at(0).with_depth(20.0, DepthUnit::Feet),
                    Sample::at(20),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.saved, 3);
        assert_eq!(summary.depths.sample_count, 2);

        let entry = store.get_log_entry(&id).await.unwrap().unwrap();
        let max = entry.depths.max_depth.unwrap();
        assert!((max - 32.8084).abs() < 1e-6);
        let avg = entry.depths.average_depth.unwrap();
        assert!((avg - (32.8084 + 20.0) / 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn earlier_batches_stay_committed_when_a_later_one_conflicts() {
        let config = PipelineConfig {
            sample_batch_size: 2,
            ..Default::default()
        };
        let (store, samples, id) = setup(config, DepthUnit::Meters).await;

        let err = samples
            .save_samples_from_iter(
                &id,
                vec![
                    Sample::at(0).with_depth(5.0, DepthUnit::Meters),
                    Sample::at(1).with_depth(7.0, DepthUnit::Meters),
                    Sample::at(2).with_depth(9.0, DepthUnit::Meters),
                    Sample::at(1).with_depth(40.0, DepthUnit::Meters),
                ],
            )
            .await
            .unwrap_err();
        assert_matches!(
            err,
            LogbookError::Conflict { time_offsets, .. } if time_offsets == vec![1]
        );

        let stored: Vec<_> = samples.get_samples(id.clone()).try_collect().await.unwrap();
        assert_eq!(stored.len(), 2);
        let entry = store.get_log_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.depths.max_depth, Some(7.0));
        assert_eq!(entry.depths.average_depth, Some(6.0));
    }

    #[tokio::test]
    async fn depthless_samples_replace_authored_depths() {
        let (store, samples, id) = setup(PipelineConfig::default(), DepthUnit::Meters).await;
        let summary = samples
            .save_samples_from_iter(&id, vec![Sample::at(0), Sample::at(10)])
            .await
            .unwrap();
        assert_eq!(summary.depths.stored_samples, 2);
        assert_eq!(summary.depths.sample_count, 0);

        let entry = store.get_log_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.depths.max_depth, None);
        assert_eq!(entry.depths.average_depth, None);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_conflict() {
        let (_, samples, id) = setup(PipelineConfig::default(), DepthUnit::Meters).await;
        let err = samples
            .save_samples_from_iter(&id, vec![Sample::at(3), Sample::at(4), Sample::at(3)])
            .await
            .unwrap_err();
        assert_matches!(
            err,
            LogbookError::Conflict { time_offsets, .. } if time_offsets == vec![3]
        );
        assert_eq!(samples.clear_samples(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_out_of_range_values() {
        let (_, samples, id) = setup(PipelineConfig::default(), DepthUnit::Meters).await;
        let mut bad = Sample::at(2);
        bad.gps = Some(GpsPoint { lat: 91.0, lon: 0.0 });
        let err = samples
            .save_samples_from_iter(&id, vec![Sample::at(1), bad])
            .await
            .unwrap_err();
        assert_matches!(
            err,
            LogbookError::Validation { record: Some(1), field: Some(f), .. } if f == "gps.lat"
        );
    }

    #[tokio::test]
    async fn clearing_keeps_depths_and_unknown_entries_are_not_found() {
        let (store, samples, id) = setup(PipelineConfig::default(), DepthUnit::Meters).await;
        samples
            .save_samples_from_iter(&id, vec![Sample::at(0).with_depth(12.0, DepthUnit::Meters)])
            .await
            .unwrap();
        assert_eq!(samples.clear_samples(&id).await.unwrap(), 1);
        let entry = store.get_log_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.depths.max_depth, Some(12.0));

        let missing = LogEntryId::from("log_missing");
        assert_matches!(
            samples.clear_samples(&missing).await,
            Err(LogbookError::NotFound { .. })
        );
        let first = samples.get_samples(missing).try_collect::<Vec<_>>().await;
        assert_matches!(first, Err(LogbookError::NotFound { .. }));
    }

    #[test]
    fn finds_duplicate_offsets() {
        let samples: Vec<_> = [5, 1, 5, 2, 1, 5].into_iter().map(Sample::at).collect();
        assert_eq!(duplicate_offsets(&samples), vec![1, 5]);
        assert!(duplicate_offsets(&[Sample::at(1)]).is_empty());
    }
}
