use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::model::{Booking, BookingId, BookingPatch, NewBooking, ScheduleEntry};

use super::{BlacklistStore, BookingStore, ChangeProbe, ScheduleStore, StoreError};

/// Rewrite the journal as a snapshot once this many records pile up on top of it.
const DEFAULT_COMPACT_THRESHOLD: u64 = 1_000;

/// Opening hours written into a fresh journal: every day, 09:00 to 21:00.
pub fn default_schedule() -> Vec<ScheduleEntry> {
    [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
    .into_iter()
    .map(|weekday| ScheduleEntry { weekday, opens: 9, closes: 21 })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Record {
    BookingAppended(Booking),
    BookingUpdated { id: BookingId, patch: BookingPatch },
    BookingDeleted { id: BookingId },
    ScheduleSet(Vec<ScheduleEntry>),
    BlacklistAdded(String),
    BlacklistRemoved(String),
    /// Written by compaction so ids are never reused after a snapshot.
    NextId(BookingId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    at: DateTime<Utc>,
    record: Record,
}

// ── On-disk format ───────────────────────────────────────────────

/// `[u32: len][bincode: Entry][u32: crc32]`. Returns the frame size.
fn encode_entry(writer: &mut impl Write, entry: &Entry) -> io::Result<u64> {
    let payload =
        bincode::serialize(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + payload.len() as u64)
}

/// Read back every intact entry, plus the byte length they occupy. A torn or
/// corrupt tail ends the replay.
fn replay(path: &Path) -> io::Result<(Vec<Entry>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_or_eof(&mut reader, &mut len_buf)? {
            break;
        }
        let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        if !read_or_eof(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_or_eof(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            break;
        }
        match bincode::deserialize::<Entry>(&payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        valid_len += 8 + payload.len() as u64;
    }

    Ok((entries, valid_len))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

// ── Materialized state ───────────────────────────────────────────

#[derive(Debug, Default)]
struct State {
    bookings: BTreeMap<BookingId, Booking>,
    next_id: BookingId,
    schedule: Option<Vec<ScheduleEntry>>,
    blacklist: Vec<String>,
    last_modified: Option<DateTime<Utc>>,
}

impl State {
    fn apply(&mut self, entry: &Entry) {
        match &entry.record {
            Record::BookingAppended(b) => {
                self.next_id = self.next_id.max(b.id + 1);
                self.bookings.insert(b.id, b.clone());
            }
            Record::BookingUpdated { id, patch } => {
                if let Some(b) = self.bookings.get_mut(id) {
                    patch.apply(b);
                }
            }
            Record::BookingDeleted { id } => {
                self.bookings.remove(id);
            }
            Record::ScheduleSet(entries) => self.schedule = Some(entries.clone()),
            Record::BlacklistAdded(identity) => self.blacklist.push(identity.clone()),
            Record::BlacklistRemoved(identity) => {
                if let Some(pos) = self.blacklist.iter().position(|e| e == identity) {
                    self.blacklist.remove(pos);
                }
            }
            Record::NextId(id) => self.next_id = self.next_id.max(*id),
        }
        self.last_modified = Some(entry.at);
    }

    /// Minimal record set that rebuilds this state.
    fn snapshot(&self) -> Vec<Entry> {
        let at = self.last_modified.unwrap_or_else(Utc::now);
        let mut records = vec![Record::NextId(self.next_id)];
        if let Some(ref schedule) = self.schedule {
            records.push(Record::ScheduleSet(schedule.clone()));
        }
        records.extend(self.blacklist.iter().cloned().map(Record::BlacklistAdded));
        records.extend(self.bookings.values().cloned().map(Record::BookingAppended));
        records.into_iter().map(|record| Entry { at, record }).collect()
    }
}

fn read(state: &RwLock<State>) -> RwLockReadGuard<'_, State> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(state: &RwLock<State>) -> RwLockWriteGuard<'_, State> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

// ── Writer ───────────────────────────────────────────────────────

/// Owns the file. Held for the whole of a write, including the fsync; the
/// materialized state has its own lock so readers never wait on disk.
struct Writer {
    path: PathBuf,
    file: BufWriter<File>,
    /// Bytes of committed records in the file.
    len: u64,
    appends_since_compact: u64,
    compact_threshold: u64,
    /// Set when the file could not be brought back to a known state.
    broken: bool,
}

impl Writer {
    /// Durably append, then apply to the state. On error nothing is applied
    /// and the file is cut back to its last committed length.
    fn commit(&mut self, state: &RwLock<State>, record: Record) -> Result<(), StoreError> {
        if self.broken {
            return Err(StoreError::Unavailable(format!(
                "journal {} must be reopened",
                self.path.display()
            )));
        }
        let entry = Entry { at: Utc::now(), record };
        let written = encode_entry(&mut self.file, &entry).and_then(|n| {
            self.file.flush()?;
            self.file.get_ref().sync_all()?;
            Ok(n)
        });
        match written {
            Ok(n) => self.len += n,
            Err(e) => {
                self.rollback()?;
                return Err(e.into());
            }
        }
        write(state).apply(&entry);

        self.appends_since_compact += 1;
        if self.appends_since_compact >= self.compact_threshold
            && let Err(e) = self.compact(state)
        {
            // the record above is durable; only the rewrite failed
            warn!("compaction of {} failed: {e}", self.path.display());
            self.appends_since_compact = 0;
        }
        Ok(())
    }

    /// Drop whatever a failed write left buffered or on disk.
    fn rollback(&mut self) -> Result<(), StoreError> {
        let reopened = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .and_then(|file| {
                file.set_len(self.len)?;
                file.sync_all()?;
                Ok(file)
            });
        match reopened {
            Ok(file) => {
                let stale = std::mem::replace(&mut self.file, BufWriter::new(file));
                // into_parts discards the buffer instead of flushing it
                let _ = stale.into_parts();
                Ok(())
            }
            Err(e) => {
                error!("journal {} could not be rolled back: {e}", self.path.display());
                self.broken = true;
                Err(StoreError::Indeterminate(format!(
                    "journal {} rollback failed: {e}",
                    self.path.display()
                )))
            }
        }
    }

    fn compact(&mut self, state: &RwLock<State>) -> io::Result<()> {
        let snapshot = read(state).snapshot();
        let tmp_path = self.path.with_extension("journal.tmp");
        let mut len = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for entry in &snapshot {
                len += encode_entry(&mut writer, entry)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        // the old handle now points at the replaced file
        match OpenOptions::new().append(true).open(&self.path) {
            Ok(file) => self.file = BufWriter::new(file),
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        }
        self.len = len;
        info!(
            "compacted journal {} ({} records folded)",
            self.path.display(),
            self.appends_since_compact
        );
        self.appends_since_compact = 0;
        Ok(())
    }
}

/// Durable single-file backend: an append-only, checksummed record journal
/// replayed into memory at open.
pub struct JournalStore {
    state: Arc<RwLock<State>>,
    writer: Arc<Mutex<Writer>>,
}

impl JournalStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_threshold(path, DEFAULT_COMPACT_THRESHOLD)
    }

    pub fn open_with_threshold(path: &Path, compact_threshold: u64) -> Result<Self, StoreError> {
        let (entries, valid_len) = replay(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            warn!(
                "journal {}: discarding {} bytes of torn tail",
                path.display(),
                meta.len() - valid_len
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        let mut state = State { next_id: 1, ..State::default() };
        for entry in &entries {
            state.apply(entry);
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = Writer {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            len: valid_len,
            appends_since_compact: entries.len() as u64,
            compact_threshold: compact_threshold.max(1),
            broken: false,
        };
        let state = RwLock::new(state);
        if read(&state).schedule.is_none() {
            writer.commit(&state, Record::ScheduleSet(default_schedule()))?;
        }
        {
            let state = read(&state);
            info!(
                "opened journal {}: {} bookings, {} blacklisted",
                path.display(),
                state.bookings.len(),
                state.blacklist.len()
            );
        }
        Ok(Self {
            state: Arc::new(state),
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn set_schedule(&self, schedule: Vec<ScheduleEntry>) -> Result<(), StoreError> {
        self.writer().commit(&self.state, Record::ScheduleSet(schedule))
    }

    fn writer(&self) -> MutexGuard<'_, Writer> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// File I/O runs on the blocking pool, one writer at a time.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Writer, &RwLock<State>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let writer = self.writer.clone();
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard, &state)
        })
        .await
        .map_err(|e| StoreError::Indeterminate(format!("journal task failed: {e}")))?
    }
}

#[async_trait]
impl BookingStore for JournalStore {
    async fn fetch_all(&self) -> Result<Vec<Booking>, StoreError> {
        Ok(read(&self.state).bookings.values().cloned().collect())
    }

    async fn append(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        self.blocking(move |writer, state| {
            let booking = booking.into_booking(read(state).next_id);
            writer.commit(state, Record::BookingAppended(booking.clone()))?;
            Ok(booking)
        })
        .await
    }

    async fn update(&self, id: BookingId, patch: &BookingPatch) -> Result<Option<Booking>, StoreError> {
        let patch = patch.clone();
        self.blocking(move |writer, state| {
            if !read(state).bookings.contains_key(&id) {
                return Ok(None);
            }
            writer.commit(state, Record::BookingUpdated { id, patch })?;
            Ok(read(state).bookings.get(&id).cloned())
        })
        .await
    }

    async fn delete(&self, id: BookingId) -> Result<bool, StoreError> {
        self.blocking(move |writer, state| {
            if !read(state).bookings.contains_key(&id) {
                return Ok(false);
            }
            writer.commit(state, Record::BookingDeleted { id })?;
            Ok(true)
        })
        .await
    }
}

#[async_trait]
impl ScheduleStore for JournalStore {
    async fn fetch_all(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        Ok(read(&self.state).schedule.clone().unwrap_or_default())
    }
}

#[async_trait]
impl BlacklistStore for JournalStore {
    async fn fetch_all(&self) -> Result<Vec<String>, StoreError> {
        Ok(read(&self.state).blacklist.clone())
    }

    async fn append(&self, identity: &str) -> Result<(), StoreError> {
        let identity = identity.to_string();
        self.blocking(move |writer, state| writer.commit(state, Record::BlacklistAdded(identity)))
            .await
    }

    async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        self.blocking(move |writer, state| {
            if !read(state).blacklist.contains(&identity) {
                return Ok(false);
            }
            writer.commit(state, Record::BlacklistRemoved(identity))?;
            Ok(true)
        })
        .await
    }
}

#[async_trait]
impl ChangeProbe for JournalStore {
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(read(&self.state).last_modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, Slot};
    use crate::store::{RetryPolicy, Retrying};
    use chrono::NaiveDate;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("washline_test_journal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn new_booking(hour: u8) -> NewBooking {
        NewBooking {
            requester_name: "Ann".into(),
            requester_link: "https://vk.com/id7".into(),
            requester_id: Some(7),
            date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            slot: Slot::from_hm(hour, 0).unwrap(),
            status: BookingStatus::Pending,
            created_at: Utc::now(),
            add_ons: BTreeSet::new(),
        }
    }

    fn ids(bookings: &[Booking]) -> Vec<BookingId> {
        bookings.iter().map(|b| b.id).collect()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = tmp_path("reopen.journal");
        {
            let store = JournalStore::open(&path).unwrap();
            let first = BookingStore::append(&store, new_booking(10)).await.unwrap();
            assert_eq!(first.id, 1);
            BookingStore::append(&store, new_booking(11)).await.unwrap();
            let patch = BookingPatch {
                status: Some(BookingStatus::Confirmed),
                confirmed_by: Some("Admin".into()),
                ..Default::default()
            };
            store.update(1, &patch).await.unwrap();
            store.delete(2).await.unwrap();
            BlacklistStore::append(&store, "spammer").await.unwrap();
        }

        let store = JournalStore::open(&path).unwrap();
        let bookings = BookingStore::fetch_all(&store).await.unwrap();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].status, BookingStatus::Confirmed);
        assert_eq!(bookings[0].confirmed_by.as_deref(), Some("Admin"));
        assert_eq!(BlacklistStore::fetch_all(&store).await.unwrap(), vec!["spammer"]);
        assert!(store.last_modified().await.unwrap().is_some());

        // id 2 was deleted but must not come back
        let third = BookingStore::append(&store, new_booking(12)).await.unwrap();
        assert_eq!(third.id, 3);
        assert_eq!(ids(&BookingStore::fetch_all(&store).await.unwrap()), vec![1, 3]);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn fresh_journal_gets_default_schedule() {
        let path = tmp_path("schedule.journal");
        let store = JournalStore::open(&path).unwrap();
        let schedule = ScheduleStore::fetch_all(&store).await.unwrap();
        assert_eq!(schedule.len(), 7);
        assert!(schedule.iter().all(|e| e.opens == 9 && e.closes == 21));

        store
            .set_schedule(vec![ScheduleEntry { weekday: Weekday::Mon, opens: 10, closes: 12 }])
            .unwrap();
        drop(store);
        let store = JournalStore::open(&path).unwrap();
        assert_eq!(ScheduleStore::fetch_all(&store).await.unwrap().len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let path = tmp_path("torn.journal");
        {
            let store = JournalStore::open(&path).unwrap();
            BookingStore::append(&store, new_booking(10)).await.unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }
        let store = JournalStore::open(&path).unwrap();
        assert_eq!(BookingStore::fetch_all(&store).await.unwrap().len(), 1);

        // writes after the repair must replay too
        BookingStore::append(&store, new_booking(11)).await.unwrap();
        drop(store);
        let store = JournalStore::open(&path).unwrap();
        assert_eq!(BookingStore::fetch_all(&store).await.unwrap().len(), 2);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn bad_checksum_stops_replay() {
        let path = tmp_path("crc.journal");
        let entry = Entry {
            at: Utc::now(),
            record: Record::BlacklistAdded("x".into()),
        };
        {
            let payload = bincode::serialize(&entry).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let (entries, valid_len) = replay(&path).unwrap();
        assert!(entries.is_empty());
        assert_eq!(valid_len, 0);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn compaction_shrinks_file_and_keeps_state() {
        let path = tmp_path("compact.journal");
        let store = JournalStore::open_with_threshold(&path, 10_000).unwrap();
        for hour in 9..21 {
            BookingStore::append(&store, new_booking(hour)).await.unwrap();
        }
        for id in 1..12 {
            store.delete(id).await.unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();
        store.writer().compact(&store.state).unwrap();
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");
        assert_eq!(store.writer().len, after);
        drop(store);

        let store = JournalStore::open(&path).unwrap();
        let bookings = BookingStore::fetch_all(&store).await.unwrap();
        assert_eq!(bookings.len(), 1);
        assert_eq!(bookings[0].id, 12);
        BookingStore::append(&store, new_booking(9)).await.unwrap();
        assert_eq!(BookingStore::fetch_all(&store).await.unwrap()[1].id, 13);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn failed_compaction_keeps_the_committed_record() {
        let path = tmp_path("compact_fail.journal");
        let blocker = path.with_extension("journal.tmp");
        let _ = fs::remove_dir_all(&blocker);
        // a directory where the snapshot file should go makes every compaction fail
        fs::create_dir_all(&blocker).unwrap();

        let store = Retrying::new(
            JournalStore::open_with_threshold(&path, 2).unwrap(),
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        );
        let first = BookingStore::append(&store, new_booking(10)).await.unwrap();
        let second = BookingStore::append(&store, new_booking(11)).await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(ids(&BookingStore::fetch_all(&store).await.unwrap()), vec![1, 2]);
        drop(store);

        fs::remove_dir_all(&blocker).unwrap();
        let store = JournalStore::open(&path).unwrap();
        assert_eq!(ids(&BookingStore::fetch_all(&store).await.unwrap()), vec![1, 2]);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_trace() {
        let path = tmp_path("rollback.journal");
        let store = JournalStore::open(&path).unwrap();
        BookingStore::append(&store, new_booking(10)).await.unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        // a read-only handle makes the next flush fail
        store.writer().file = BufWriter::new(File::open(&path).unwrap());
        let err = BookingStore::append(&store, new_booking(11)).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
        assert_eq!(ids(&BookingStore::fetch_all(&store).await.unwrap()), vec![1]);

        // the writer was reopened, so the next record lands with the unused id
        let next = BookingStore::append(&store, new_booking(12)).await.unwrap();
        assert_eq!(next.id, 2);
        drop(store);

        let store = JournalStore::open(&path).unwrap();
        let bookings = BookingStore::fetch_all(&store).await.unwrap();
        assert_eq!(ids(&bookings), vec![1, 2]);
        assert_eq!(bookings[1].slot, Slot::from_hm(12, 0).unwrap());

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reads_do_not_wait_for_the_writer() {
        let path = tmp_path("reads.journal");
        let store = JournalStore::open(&path).unwrap();
        BookingStore::append(&store, new_booking(10)).await.unwrap();

        // stands in for a commit stuck in fsync
        let held = store.writer();
        let bookings = tokio::time::timeout(
            Duration::from_secs(1),
            BookingStore::fetch_all(&store),
        )
        .await
        .expect("read blocked behind the writer")
        .unwrap();
        assert_eq!(bookings.len(), 1);
        assert!(ScheduleStore::fetch_all(&store).await.unwrap().len() == 7);
        assert!(store.last_modified().await.unwrap().is_some());
        drop(held);

        let _ = fs::remove_file(&path);
    }
}
