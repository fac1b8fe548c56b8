use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use taxi_protocol::{DriverView, RideView};
use taxi_store::{AuditEvent, DriverLocationRecord, EarningsRecord, EventFilter, RideStore};

const DRIVERS_FILE: &str = "drivers.jsonl";
const LOCATIONS_FILE: &str = "driver_locations.jsonl";
const RIDES_FILE: &str = "rides.jsonl";
const EARNINGS_FILE: &str = "earnings.jsonl";
const EVENTS_FILE: &str = "events.jsonl";

/// Small tables are never compacted below this many lines.
const COMPACT_FLOOR: usize = 64;

/// How many rows the append-only history tables keep; older rows are
/// dropped oldest first.
#[derive(Debug, Clone, Copy)]
pub struct RetentionLimits {
    pub events: usize,
    pub locations: usize,
}

impl Default for RetentionLimits {
    fn default() -> Self {
        Self {
            events: 20_000,
            locations: 10_000,
        }
    }
}

/// Rows with a natural key. Writing a row again under the same key
/// replaces it.
trait Keyed {
    fn key(&self) -> String;
}

impl Keyed for DriverView {
    fn key(&self) -> String {
        self.driver_id.clone()
    }
}

impl Keyed for RideView {
    fn key(&self) -> String {
        self.ride_id.clone()
    }
}

impl Keyed for EarningsRecord {
    fn key(&self) -> String {
        format!("{}/{}", self.ride_id, self.driver_id)
    }
}

impl Keyed for AuditEvent {
    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Keyed for DriverLocationRecord {
    fn key(&self) -> String {
        format!("{}@{}", self.driver_id, self.timestamp.to_rfc3339())
    }
}

/// What a table change needs on disk.
#[derive(Debug, PartialEq)]
enum Flush<T> {
    Skip,
    Append(T),
    Rewrite(Vec<T>),
}

/// One JSON-lines file. Memory holds the latest row per key in first-write
/// order; the file holds every write since the last compaction and is
/// rewritten from memory once stale lines outnumber live rows.
struct LogTable<T> {
    file: &'static str,
    rows: HashMap<String, T>,
    order: VecDeque<String>,
    limit: Option<usize>,
    lines_on_disk: usize,
    dirty: bool,
}

impl<T: Keyed + Clone + PartialEq> LogTable<T> {
    fn new(file: &'static str, limit: Option<usize>) -> Self {
        Self {
            file,
            rows: HashMap::new(),
            order: VecDeque::new(),
            limit,
            lines_on_disk: 0,
            dirty: false,
        }
    }

    fn replay(file: &'static str, limit: Option<usize>, lines: Vec<T>) -> Self {
        let mut table = Self::new(file, limit);
        table.lines_on_disk = lines.len();
        for row in lines {
            table.put(row);
        }
        table
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    /// Oldest first.
    fn rows(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|key| self.rows.get(key))
    }

    fn upsert(&mut self, row: T) -> Flush<T> {
        if !self.dirty && self.rows.get(&row.key()) == Some(&row) {
            return Flush::Skip;
        }
        self.put(row.clone());
        self.lines_on_disk += 1;
        if self.dirty || self.lines_on_disk > 2 * self.rows.len().max(COMPACT_FLOOR) {
            self.dirty = false;
            self.lines_on_disk = self.rows.len();
            Flush::Rewrite(self.rows().cloned().collect())
        } else {
            Flush::Append(row)
        }
    }

    /// The file no longer matches memory; the next change rewrites it.
    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn put(&mut self, row: T) {
        let key = row.key();
        if self.rows.insert(key.clone(), row).is_none() {
            self.order.push_back(key);
        }
        if let Some(limit) = self.limit {
            while self.order.len() > limit {
                if let Some(oldest) = self.order.pop_front() {
                    self.rows.remove(&oldest);
                }
            }
        }
    }
}

/// `RideStore` over one append-only JSON-lines file per table under
/// `data_dir`. Each table has its own lock, held until the write lands so
/// lines never go out of order.
pub struct JsonFileStore {
    base: PathBuf,
    drivers: Mutex<LogTable<DriverView>>,
    locations: Mutex<LogTable<DriverLocationRecord>>,
    rides: Mutex<LogTable<RideView>>,
    earnings: Mutex<LogTable<EarningsRecord>>,
    events: Mutex<LogTable<AuditEvent>>,
}

impl JsonFileStore {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        Self::with_limits(base, RetentionLimits::default())
    }

    pub fn with_limits(base: &str, limits: RetentionLimits) -> anyhow::Result<Self> {
        let path = PathBuf::from(base);
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Ok(Self {
            drivers: Mutex::new(open_table(&path, DRIVERS_FILE, None)?),
            locations: Mutex::new(open_table(&path, LOCATIONS_FILE, Some(limits.locations))?),
            rides: Mutex::new(open_table(&path, RIDES_FILE, None)?),
            earnings: Mutex::new(open_table(&path, EARNINGS_FILE, None)?),
            events: Mutex::new(open_table(&path, EVENTS_FILE, Some(limits.events))?),
            base: path,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    async fn upsert<T>(&self, table: &Mutex<LogTable<T>>, row: &T) -> anyhow::Result<()>
    where
        T: Keyed + Clone + PartialEq + Serialize + Send + 'static,
    {
        let mut table = table.lock().await;
        let flush = table.upsert(row.clone());
        let result = self.flush(table.file, flush).await;
        if result.is_err() {
            table.mark_dirty();
        }
        result
    }

    async fn flush<T>(&self, file: &'static str, flush: Flush<T>) -> anyhow::Result<()>
    where
        T: Serialize + Send + 'static,
    {
        let base = self.base.clone();
        match flush {
            Flush::Skip => {}
            Flush::Append(row) => {
                tokio::task::spawn_blocking(move || append_line(&base, file, &row)).await??;
            }
            Flush::Rewrite(rows) => {
                debug!(file, rows = rows.len(), "compacting table");
                tokio::task::spawn_blocking(move || rewrite_lines(&base, file, &rows)).await??;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RideStore for JsonFileStore {
    async fn upsert_driver(&self, driver: &DriverView) -> anyhow::Result<()> {
        self.upsert(&self.drivers, driver).await
    }

    async fn insert_driver_location(&self, record: &DriverLocationRecord) -> anyhow::Result<()> {
        self.upsert(&self.locations, record).await
    }

    async fn insert_ride(&self, ride: &RideView) -> anyhow::Result<()> {
        self.upsert(&self.rides, ride).await
    }

    async fn update_ride_status(&self, ride: &RideView) -> anyhow::Result<()> {
        self.upsert(&self.rides, ride).await
    }

    async fn insert_earnings(&self, record: &EarningsRecord) -> anyhow::Result<()> {
        self.upsert(&self.earnings, record).await
    }

    async fn insert_event(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.upsert(&self.events, event).await
    }

    async fn recent_events(&self, filter: &EventFilter) -> anyhow::Result<Vec<AuditEvent>> {
        let events = self.events.lock().await;
        Ok(filter.apply(events.rows()))
    }
}

fn open_table<T>(base: &Path, file: &'static str, limit: Option<usize>) -> anyhow::Result<LogTable<T>>
where
    T: Keyed + Clone + PartialEq + DeserializeOwned,
{
    let lines = load_lines(base, file)?;
    Ok(LogTable::replay(file, limit, lines))
}

/// Unparseable lines (a write torn by a crash) are skipped.
fn load_lines<T: DeserializeOwned>(base: &Path, file: &str) -> anyhow::Result<Vec<T>> {
    let path = base.join(file);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(row) => rows.push(row),
            Err(err) => warn!(file, line = number + 1, error = %err, "skipping unreadable row"),
        }
    }
    Ok(rows)
}

fn append_line<T: Serialize>(base: &Path, file: &str, row: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(row)?;
    line.push(b'\n');
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(base.join(file))?;
    out.write_all(&line)?;
    Ok(())
}

/// Writes through a temp file so a crash mid-write leaves the old table.
fn rewrite_lines<T: Serialize>(base: &Path, file: &str, rows: &[T]) -> anyhow::Result<()> {
    let path = base.join(file);
    let tmp = base.join(format!("{file}.tmp"));
    let mut content = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut content, row)?;
        content.push(b'\n');
    }
    fs::write(&tmp, content)?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn scratch_dir() -> String {
        std::env::temp_dir()
            .join(format!("taxi-store-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .into_owned()
    }

    fn line_count(store: &JsonFileStore, file: &str) -> usize {
        fs::read_to_string(store.base_path().join(file))
            .map(|content| content.lines().count())
            .unwrap_or(0)
    }

    fn earnings(ride_id: &str, amount: f64) -> EarningsRecord {
        EarningsRecord {
            driver_id: "d1".to_string(),
            ride_id: ride_id.to_string(),
            amount,
            commission: amount * 0.15,
            net_amount: amount * 0.85,
            payment_status: "pending".to_string(),
        }
    }

    fn event(id: &str, event_type: &str, minutes_ago: i64) -> AuditEvent {
        AuditEvent {
            id: id.to_string(),
            ride_id: Some("r1".to_string()),
            actor: "system".to_string(),
            event_type: event_type.to_string(),
            payload: serde_json::json!({}),
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn upserts_are_idempotent_and_survive_reopen() {
        let dir = scratch_dir();
        {
            let store = JsonFileStore::new(&dir).unwrap();
            store.insert_earnings(&earnings("r1", 10.0)).await.unwrap();
            store.insert_earnings(&earnings("r1", 10.0)).await.unwrap();
            store.insert_earnings(&earnings("r2", 20.0)).await.unwrap();
            store.insert_event(&event("e1", "ride:requested", 2)).await.unwrap();
            store.insert_event(&event("e1", "ride:requested", 2)).await.unwrap();
            assert_eq!(line_count(&store, EARNINGS_FILE), 2);
            assert_eq!(line_count(&store, EVENTS_FILE), 1);
        }

        let reopened = JsonFileStore::new(&dir).unwrap();
        assert_eq!(reopened.earnings.lock().await.len(), 2);
        assert_eq!(reopened.events.lock().await.len(), 1);
        let _ = fs::remove_dir_all(reopened.base_path());
    }

    #[tokio::test]
    async fn recent_events_filters_newest_first() {
        let dir = scratch_dir();
        let store = JsonFileStore::new(&dir).unwrap();
        store.insert_event(&event("e1", "ride:requested", 10)).await.unwrap();
        store.insert_event(&event("e2", "ride:accepted", 5)).await.unwrap();
        store.insert_event(&event("e3", "ride:timeout", 1)).await.unwrap();

        let all = store.recent_events(&EventFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e2", "e1"]);

        let filter = EventFilter {
            event_type: Some("ride:accepted".to_string()),
            ..Default::default()
        };
        let accepted = store.recent_events(&filter).await.unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].id, "e2");
        let _ = fs::remove_dir_all(store.base_path());
    }

    #[tokio::test]
    async fn duplicate_location_samples_are_ignored() {
        let dir = scratch_dir();
        let store = JsonFileStore::new(&dir).unwrap();
        let record = DriverLocationRecord {
            driver_id: "d1".to_string(),
            latitude: 1.0,
            longitude: 2.0,
            timestamp: Utc::now(),
        };
        store.insert_driver_location(&record).await.unwrap();
        store.insert_driver_location(&record).await.unwrap();

        let saved: Vec<DriverLocationRecord> = load_lines(store.base_path(), LOCATIONS_FILE).unwrap();
        assert_eq!(saved, vec![record]);
        let _ = fs::remove_dir_all(store.base_path());
    }

    #[tokio::test]
    async fn history_keeps_only_the_newest_rows() {
        let dir = scratch_dir();
        let limits = RetentionLimits {
            events: 3,
            locations: 2,
        };
        {
            let store = JsonFileStore::with_limits(&dir, limits).unwrap();
            for (i, id) in ["e1", "e2", "e3", "e4", "e5"].into_iter().enumerate() {
                store
                    .insert_event(&event(id, "driver:online", 10 - i as i64))
                    .await
                    .unwrap();
            }
            let start = Utc::now();
            for i in 0..4 {
                let record = DriverLocationRecord {
                    driver_id: "d1".to_string(),
                    latitude: f64::from(i),
                    longitude: 0.0,
                    timestamp: start + Duration::seconds(i64::from(i)),
                };
                store.insert_driver_location(&record).await.unwrap();
            }

            let events = store.recent_events(&EventFilter::default()).await.unwrap();
            let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
            assert_eq!(ids, vec!["e5", "e4", "e3"]);
        }

        let reopened = JsonFileStore::with_limits(&dir, limits).unwrap();
        let events = reopened.recent_events(&EventFilter::default()).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e5", "e4", "e3"]);
        let locations = reopened.locations.lock().await;
        let latitudes: Vec<f64> = locations.rows().map(|r| r.latitude).collect();
        assert_eq!(latitudes, vec![2.0, 3.0]);
        drop(locations);
        let _ = fs::remove_dir_all(reopened.base_path());
    }

    #[tokio::test]
    async fn repeated_updates_compact_instead_of_growing() {
        let dir = scratch_dir();
        {
            let store = JsonFileStore::new(&dir).unwrap();
            for i in 0..500 {
                store.insert_earnings(&earnings("r1", f64::from(i))).await.unwrap();
            }
            assert!(line_count(&store, EARNINGS_FILE) <= 2 * COMPACT_FLOOR);
        }

        let reopened = JsonFileStore::new(&dir).unwrap();
        let earnings = reopened.earnings.lock().await;
        let rows: Vec<_> = earnings.rows().cloned().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, 499.0);
        drop(earnings);
        let _ = fs::remove_dir_all(reopened.base_path());
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped_on_open() {
        let dir = scratch_dir();
        {
            let store = JsonFileStore::new(&dir).unwrap();
            store.insert_event(&event("e1", "ride:requested", 1)).await.unwrap();
        }
        let path = Path::new(&dir).join(EVENTS_FILE);
        let mut out = OpenOptions::new().append(true).open(&path).unwrap();
        out.write_all(b"{\"id\":\"e2\",\"ride_").unwrap();
        drop(out);

        let reopened = JsonFileStore::new(&dir).unwrap();
        let events = reopened.recent_events(&EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "e1");
        let _ = fs::remove_dir_all(reopened.base_path());
    }

    #[test]
    fn table_compacts_once_stale_lines_outnumber_rows() {
        let mut table: LogTable<EarningsRecord> = LogTable::new(EARNINGS_FILE, None);
        assert_eq!(table.upsert(earnings("r1", 1.0)), Flush::Append(earnings("r1", 1.0)));
        assert_eq!(table.upsert(earnings("r1", 1.0)), Flush::Skip);

        let mut rewrites = 0;
        for i in 0..(2 * COMPACT_FLOOR) {
            if let Flush::Rewrite(rows) = table.upsert(earnings("r1", i as f64 + 2.0)) {
                assert_eq!(rows.len(), 1);
                rewrites += 1;
            }
        }
        assert_eq!(rewrites, 1);
        assert_eq!(table.len(), 1);

        table.mark_dirty();
        assert!(matches!(table.upsert(earnings("r1", 0.5)), Flush::Rewrite(_)));
    }
}
