//! Entry Store
//!
//! Durable persistence for validated log entries. Two SQLite databases
//! mirror how the data is consumed: `logs` holds the entry rows (with the
//! entry text as the deduplication key) and `log_images` holds the composite
//! PNG of the line strips each entry was read from. Downstream consumers
//! poll the logs table by id cursor, so the store also exposes the read
//! queries they need.

use anyhow::{Context, Result};
use image::{ImageOutputFormat, RgbImage};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

use crate::assembler::LogHeader;

/// Emitted-cache size that triggers a rebuild from the database.
const EMITTED_HIGH_WATER: usize = 5000;
/// Rows reloaded into the emitted cache on compaction (last 6 hours).
const COMPACT_RELOAD_LIMIT: u32 = 2000;
/// Rows preloaded into the emitted cache on open (last 24 hours).
const WARM_START_LIMIT: u32 = 10_000;
/// Page size handed to downstream consumers polling for new entries.
const ENTRIES_AFTER_LIMIT: u32 = 10;

/// One persisted log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub day: u32,
    pub time: String,
    pub text: String,
    pub image_id: Option<String>,
}

/// A stored composite image: PNG bytes plus pixel dimensions.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub struct EntryStore {
    logs: Connection,
    images: Connection,
    /// Texts already written, kept in memory so each pass can skip
    /// re-emitting without a query per validated message. The database
    /// remains the source of truth; this set only bounds lookups.
    emitted: HashSet<String>,
    emitted_high_water: usize,
}

impl EntryStore {
    /// Opens (creating if needed) both databases and warm-starts the
    /// emitted cache from the most recent day of entries.
    pub fn open(log_db: &Path, images_db: &Path) -> Result<Self> {
        let logs = Connection::open(log_db)
            .with_context(|| format!("failed to open log database {:?}", log_db))?;
        logs.execute_batch(
            "CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                 day INTEGER,
                 time TEXT,
                 entry_text TEXT UNIQUE,
                 image_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_entry_text ON logs(entry_text);
             CREATE INDEX IF NOT EXISTS idx_day_time ON logs(day, time);",
        )
        .context("failed to initialize logs schema")?;

        let images = Connection::open(images_db)
            .with_context(|| format!("failed to open image database {:?}", images_db))?;
        images
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS log_images (
                     id TEXT PRIMARY KEY,
                     image_data BLOB,
                     width INTEGER,
                     height INTEGER
                 );",
            )
            .context("failed to initialize image schema")?;

        let mut store = Self {
            logs,
            images,
            emitted: HashSet::new(),
            emitted_high_water: EMITTED_HIGH_WATER,
        };
        store.warm_start()?;
        Ok(store)
    }

    /// Lowers the emitted-cache high-water mark so the compaction sweep is
    /// reachable without thousands of inserts.
    #[cfg(test)]
    fn set_emitted_high_water(&mut self, high_water: usize) {
        self.emitted_high_water = high_water;
    }

    fn warm_start(&mut self) -> Result<()> {
        let mut stmt = self.logs.prepare(
            "SELECT entry_text FROM logs
             WHERE timestamp > datetime('now', '-1 day')
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let texts = stmt
            .query_map(params![WARM_START_LIMIT], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        self.emitted.extend(texts);
        info!("Loaded {} recent entries from database", self.emitted.len());
        Ok(())
    }

    /// Persists one validated entry with its source strips, exactly once.
    ///
    /// The text must carry the `Day N, HH:MM:SS:` header; entries without
    /// one are logged and skipped. Returns the stored row if the entry was
    /// new, and `None` if it already existed or was skipped. This is the
    /// insert-if-absent contract, backed by the unique constraint on
    /// `entry_text`.
    pub fn save(&mut self, text: &str, images: &[RgbImage]) -> Result<Option<Entry>> {
        let Some(header) = LogHeader::parse(text) else {
            warn!("Could not parse day/time from: {text}");
            return Ok(None);
        };

        let image_id = if images.is_empty() {
            None
        } else {
            let composite = combine_images(images);
            let id = Uuid::new_v4().to_string();
            let mut png = Vec::new();
            composite
                .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
                .context("failed to encode composite image")?;
            self.images
                .execute(
                    "INSERT INTO log_images (id, image_data, width, height)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, png, composite.width(), composite.height()],
                )
                .context("failed to store composite image")?;
            Some(id)
        };

        let changed = self
            .logs
            .execute(
                "INSERT OR IGNORE INTO logs (day, time, entry_text, image_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![header.day, header.time, text, image_id],
            )
            .context("failed to insert log entry")?;

        self.emitted.insert(text.to_string());

        if changed == 0 {
            info!("Entry already exists: {text}");
            return Ok(None);
        }

        let id = self.logs.last_insert_rowid();
        info!("Saved to database: {text}");
        Ok(Some(Entry {
            id,
            day: header.day,
            time: header.time,
            text: text.to_string(),
            image_id,
        }))
    }

    /// Whether this text has already been written to the store.
    pub fn is_emitted(&self, text: &str) -> bool {
        self.emitted.contains(text)
    }

    /// Entries with an id greater than `after_id`, oldest first, capped to
    /// one notification batch. This is the poll query downstream runs.
    pub fn entries_after(&self, after_id: i64) -> Result<Vec<Entry>> {
        let mut stmt = self.logs.prepare(
            "SELECT id, day, time, entry_text, image_id FROM logs
             WHERE id > ?1
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![after_id, ENTRIES_AFTER_LIMIT], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// The chronologically newest entry by in-game day and time.
    pub fn latest_entry(&self) -> Result<Option<Entry>> {
        self.logs
            .query_row(
                "SELECT id, day, time, entry_text, image_id FROM logs
                 ORDER BY day DESC, time DESC
                 LIMIT 1",
                [],
                row_to_entry,
            )
            .optional()
            .context("failed to query latest entry")
    }

    /// Highest row id currently stored, 0 when the table is empty.
    pub fn max_entry_id(&self) -> Result<i64> {
        let id: Option<i64> = self
            .logs
            .query_row("SELECT MAX(id) FROM logs", [], |row| row.get(0))
            .context("failed to query max entry id")?;
        Ok(id.unwrap_or(0))
    }

    /// Fetches a stored composite image by its id.
    pub fn image(&self, image_id: &str) -> Result<Option<StoredImage>> {
        self.images
            .query_row(
                "SELECT image_data, width, height FROM log_images WHERE id = ?1",
                params![image_id],
                |row| {
                    Ok(StoredImage {
                        data: row.get(0)?,
                        width: row.get(1)?,
                        height: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("failed to query image")
    }

    /// Rebuilds the emitted cache from a recent time window once it grows
    /// past its high-water mark, bounding memory across long sessions.
    pub fn compact(&mut self) -> Result<()> {
        if self.emitted.len() <= self.emitted_high_water {
            return Ok(());
        }
        info!("Cleaning up emitted-entry cache ({} entries)...", self.emitted.len());

        let mut stmt = self.logs.prepare(
            "SELECT entry_text FROM logs
             WHERE timestamp > datetime('now', '-6 hours')
             ORDER BY id DESC
             LIMIT ?1",
        )?;
        let recent: HashSet<String> = stmt
            .query_map(params![COMPACT_RELOAD_LIMIT], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        self.emitted.retain(|text| recent.contains(text));
        info!("Cleaned up emitted cache to {} entries", self.emitted.len());
        Ok(())
    }

    #[cfg(test)]
    fn emitted_len(&self) -> usize {
        self.emitted.len()
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        day: row.get(1)?,
        time: row.get(2)?,
        text: row.get(3)?,
        image_id: row.get(4)?,
    })
}

/// Stacks the line strips of one message into a single composite image,
/// top to bottom, padded to the widest strip.
pub fn combine_images(images: &[RgbImage]) -> RgbImage {
    let total_height: u32 = images.iter().map(|img| img.height()).sum();
    let max_width: u32 = images.iter().map(|img| img.width()).max().unwrap_or(0);

    let mut combined = RgbImage::new(max_width, total_height);
    let mut y_offset: i64 = 0;
    for img in images {
        image::imageops::replace(&mut combined, img, 0, y_offset);
        y_offset += i64::from(img.height());
    }
    combined
}
