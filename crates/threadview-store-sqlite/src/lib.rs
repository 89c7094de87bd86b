use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use threadview_core::{
    uri_host, FeedRow, Label, ListInfo, PostInfo, PostRecord, ProfileInfo, ThreadgateInfo,
    ThreadgateRecord,
};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

/// Ids bound into one `IN (...)` list. SQLite caps a statement at 32766 variables.
const LOOKUP_CHUNK: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS post (
  uri TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  creator TEXT NOT NULL,
  reply_root TEXT,
  reply_parent TEXT,
  record_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  indexed_at TEXT NOT NULL,
  sort_at INTEGER NOT NULL,
  invalid_reply_root INTEGER NOT NULL DEFAULT 0 CHECK (invalid_reply_root IN (0, 1)),
  violates_thread_gate INTEGER NOT NULL DEFAULT 0 CHECK (violates_thread_gate IN (0, 1)),
  taken_down INTEGER NOT NULL DEFAULT 0 CHECK (taken_down IN (0, 1))
);

CREATE TABLE IF NOT EXISTS post_agg (
  uri TEXT PRIMARY KEY,
  like_count INTEGER NOT NULL DEFAULT 0 CHECK (like_count >= 0),
  reply_count INTEGER NOT NULL DEFAULT 0 CHECK (reply_count >= 0),
  repost_count INTEGER NOT NULL DEFAULT 0 CHECK (repost_count >= 0),
  FOREIGN KEY (uri) REFERENCES post(uri)
);

CREATE TABLE IF NOT EXISTS thread_gate (
  uri TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  creator TEXT NOT NULL,
  post_uri TEXT NOT NULL UNIQUE,
  record_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS post_embed_image (
  post_uri TEXT NOT NULL,
  position INTEGER NOT NULL,
  image_cid TEXT NOT NULL,
  alt TEXT NOT NULL,
  PRIMARY KEY (post_uri, position),
  FOREIGN KEY (post_uri) REFERENCES post(uri)
);

CREATE TABLE IF NOT EXISTS post_embed_external (
  post_uri TEXT PRIMARY KEY,
  uri TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  thumb_cid TEXT,
  FOREIGN KEY (post_uri) REFERENCES post(uri)
);

CREATE TABLE IF NOT EXISTS post_embed_record (
  post_uri TEXT PRIMARY KEY,
  embed_uri TEXT NOT NULL,
  embed_cid TEXT NOT NULL,
  FOREIGN KEY (post_uri) REFERENCES post(uri)
);

CREATE TABLE IF NOT EXISTS actor (
  did TEXT PRIMARY KEY,
  handle TEXT,
  display_name TEXT,
  avatar_cid TEXT,
  indexed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actor_block (
  uri TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  creator TEXT NOT NULL,
  subject_did TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mute (
  muted_by_did TEXT NOT NULL,
  subject_did TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (muted_by_did, subject_did)
);

CREATE TABLE IF NOT EXISTS follow (
  uri TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  creator TEXT NOT NULL,
  subject_did TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_post_reply_parent ON post(reply_parent);
CREATE INDEX IF NOT EXISTS idx_post_creator ON post(creator);
CREATE INDEX IF NOT EXISTS idx_actor_block_pair ON actor_block(creator, subject_did);
CREATE INDEX IF NOT EXISTS idx_follow_pair ON follow(creator, subject_did);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS list (
  uri TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  creator TEXT NOT NULL,
  name TEXT NOT NULL,
  purpose TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS list_item (
  uri TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  creator TEXT NOT NULL,
  list_uri TEXT NOT NULL,
  subject_did TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (list_uri, subject_did),
  FOREIGN KEY (list_uri) REFERENCES list(uri)
);

CREATE TABLE IF NOT EXISTS label (
  src TEXT NOT NULL,
  uri TEXT NOT NULL,
  cid TEXT NOT NULL DEFAULT '',
  val TEXT NOT NULL,
  neg INTEGER NOT NULL DEFAULT 0 CHECK (neg IN (0, 1)),
  cts TEXT NOT NULL,
  PRIMARY KEY (src, uri, cid, val)
);

CREATE TABLE IF NOT EXISTS repo_root (
  did TEXT PRIMARY KEY,
  cid TEXT NOT NULL,
  rev TEXT NOT NULL,
  indexed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_label_uri ON label(uri);
CREATE INDEX IF NOT EXISTS idx_list_item_subject ON list_item(subject_did);
";

const FEED_ROW_COLUMNS: &str = "p.uri, p.cid, p.creator, p.reply_root, p.reply_parent, p.sort_at,
     p.invalid_reply_root, p.violates_thread_gate";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Post to index. Reply refs and `createdAt` are read from `record`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPost {
    pub uri: String,
    pub cid: String,
    pub record: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub indexed_at: OffsetDateTime,
    pub invalid_reply_root: bool,
    pub violates_thread_gate: bool,
    pub embed: Option<StoredEmbed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredImage {
    pub cid: String,
    pub alt: String,
}

/// Embed rows as stored; blob references are still bare CIDs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredEmbed {
    Images { images: Vec<StoredImage> },
    External { uri: String, title: String, description: String, thumb_cid: Option<String> },
    Record { uri: String, cid: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewActor {
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub avatar_cid: Option<String>,
}

/// A graph record from `creator` pointing at `subject` (block, follow).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub uri: String,
    pub cid: String,
    pub creator: String,
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostCounts {
    pub likes: i64,
    pub reposts: i64,
    pub replies: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed post store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build supports.
    pub fn migrate(&mut self) -> Result<()> {
        let status = self.schema_status()?;
        if status.current_version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {}; expected {LATEST_SCHEMA_VERSION}",
                status.current_version
            ));
        }

        for version in status.pending_versions {
            let sql = match version {
                1 => MIGRATION_001_SQL,
                2 => MIGRATION_002_SQL,
                other => return Err(anyhow!("no migration registered for version {other}")),
            };
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{version}"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
            tx.execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()?],
            )
            .with_context(|| format!("failed to record migration version {version}"))?;
            tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        }

        Ok(())
    }

    /// Load the anchor and up to `max_height` reply-parent hops above it.
    /// Taken-down posts are left out, which breaks the chain at that point.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn fetch_ancestors(&self, uri: &str, max_height: u32) -> Result<Vec<FeedRow>> {
        let sql = format!(
            "WITH RECURSIVE ancestor(uri, height) AS (
                SELECT ?1, 0
                UNION ALL
                SELECT p.reply_parent, a.height + 1
                FROM ancestor a
                JOIN post p ON p.uri = a.uri
                WHERE a.height < ?2 AND p.reply_parent IS NOT NULL
             )
             SELECT {FEED_ROW_COLUMNS}
             FROM ancestor a
             JOIN post p ON p.uri = a.uri
             WHERE p.taken_down = 0
             ORDER BY a.height ASC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare ancestor query")?;
        let rows = stmt
            .query_map(params![uri, i64::from(max_height)], feed_row_from_sql)
            .context("failed to run ancestor query")?;
        collect_feed_rows(rows)
    }

    /// Load replies up to `max_depth` levels below `uri`, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn fetch_descendants(&self, uri: &str, max_depth: u32) -> Result<Vec<FeedRow>> {
        if max_depth == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "WITH RECURSIVE descendant(uri, depth) AS (
                SELECT p.uri, 1 FROM post p WHERE p.reply_parent = ?1
                UNION ALL
                SELECT p.uri, d.depth + 1
                FROM descendant d
                JOIN post p ON p.reply_parent = d.uri
                WHERE d.depth < ?2
             )
             SELECT {FEED_ROW_COLUMNS}
             FROM descendant d
             JOIN post p ON p.uri = d.uri
             WHERE p.taken_down = 0
             ORDER BY p.sort_at DESC, p.uri DESC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare descendant query")?;
        let rows = stmt
            .query_map(params![uri, i64::from(max_depth)], feed_row_from_sql)
            .context("failed to run descendant query")?;
        collect_feed_rows(rows)
    }

    /// Hydrate visible posts with their aggregate counters.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored record is not valid JSON.
    pub fn posts_by_uri(&self, uris: &[String]) -> Result<Vec<PostInfo>> {
        let mut posts = chunked(uris, |chunk| self.posts_chunk(chunk))?;
        posts.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(posts)
    }

    fn posts_chunk(&self, uris: &[String]) -> Result<Vec<PostInfo>> {
        let sql = format!(
            "SELECT p.uri, p.cid, p.creator, p.record_json, p.indexed_at,
                    p.reply_root, p.reply_parent, p.invalid_reply_root, p.violates_thread_gate,
                    COALESCE(a.reply_count, 0), COALESCE(a.repost_count, 0), COALESCE(a.like_count, 0)
             FROM post p
             LEFT JOIN post_agg a ON a.uri = p.uri
             WHERE p.taken_down = 0 AND p.uri IN ({})",
            placeholders(uris.len())
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare post lookup")?;
        let mut rows = stmt.query(params_from_iter(uris.iter())).context("failed to run post lookup")?;

        let mut posts = Vec::new();
        while let Some(row) = rows.next()? {
            let record_json: String = row.get(3)?;
            let indexed_at: String = row.get(4)?;
            posts.push(PostInfo {
                uri: row.get(0)?,
                cid: row.get(1)?,
                creator: row.get(2)?,
                record: serde_json::from_str(&record_json)
                    .context("failed to deserialize post record")?,
                indexed_at: parse_rfc3339(&indexed_at)?,
                reply_root: row.get(5)?,
                reply_parent: row.get(6)?,
                invalid_reply_root: row.get(7)?,
                violates_thread_gate: row.get(8)?,
                reply_count: row.get(9)?,
                repost_count: row.get(10)?,
                like_count: row.get(11)?,
            });
        }
        Ok(posts)
    }

    /// Thread-gates keyed by the URI of the post they gate.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored record is not valid JSON.
    pub fn threadgates_for_posts(&self, post_uris: &[String]) -> Result<BTreeMap<String, ThreadgateInfo>> {
        let mut gates = BTreeMap::new();
        for chunk in post_uris.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT post_uri, uri, cid, record_json FROM thread_gate WHERE post_uri IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql).context("failed to prepare thread-gate lookup")?;
            let mut rows = stmt
                .query(params_from_iter(chunk.iter()))
                .context("failed to run thread-gate lookup")?;
            while let Some(row) = rows.next()? {
                let record_json: String = row.get(3)?;
                gates.insert(
                    row.get::<_, String>(0)?,
                    ThreadgateInfo {
                        uri: row.get(1)?,
                        cid: row.get(2)?,
                        record: serde_json::from_str(&record_json)
                            .context("failed to deserialize thread-gate record")?,
                    },
                );
            }
        }
        Ok(gates)
    }

    /// Stored embeds keyed by embedding post URI.
    ///
    /// # Errors
    /// Returns an error when any embed query fails.
    pub fn embeds_for_posts(&self, post_uris: &[String]) -> Result<BTreeMap<String, StoredEmbed>> {
        let mut embeds = BTreeMap::new();
        for chunk in post_uris.chunks(LOOKUP_CHUNK) {
            self.embeds_chunk(chunk, &mut embeds)?;
        }
        Ok(embeds)
    }

    fn embeds_chunk(&self, post_uris: &[String], embeds: &mut BTreeMap<String, StoredEmbed>) -> Result<()> {
        let marks = placeholders(post_uris.len());

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT post_uri, image_cid, alt FROM post_embed_image
                 WHERE post_uri IN ({marks}) ORDER BY post_uri ASC, position ASC"
            ))
            .context("failed to prepare image embed lookup")?;
        let mut rows = stmt
            .query(params_from_iter(post_uris.iter()))
            .context("failed to run image embed lookup")?;
        let mut images: BTreeMap<String, Vec<StoredImage>> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            images
                .entry(row.get(0)?)
                .or_default()
                .push(StoredImage { cid: row.get(1)?, alt: row.get(2)? });
        }
        embeds.extend(
            images.into_iter().map(|(uri, images)| (uri, StoredEmbed::Images { images })),
        );

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT post_uri, uri, title, description, thumb_cid FROM post_embed_external
                 WHERE post_uri IN ({marks})"
            ))
            .context("failed to prepare external embed lookup")?;
        let mut rows = stmt
            .query(params_from_iter(post_uris.iter()))
            .context("failed to run external embed lookup")?;
        while let Some(row) = rows.next()? {
            embeds.insert(
                row.get(0)?,
                StoredEmbed::External {
                    uri: row.get(1)?,
                    title: row.get(2)?,
                    description: row.get(3)?,
                    thumb_cid: row.get(4)?,
                },
            );
        }

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT post_uri, embed_uri, embed_cid FROM post_embed_record
                 WHERE post_uri IN ({marks})"
            ))
            .context("failed to prepare record embed lookup")?;
        let mut rows = stmt
            .query(params_from_iter(post_uris.iter()))
            .context("failed to run record embed lookup")?;
        while let Some(row) = rows.next()? {
            embeds.insert(row.get(0)?, StoredEmbed::Record { uri: row.get(1)?, cid: row.get(2)? });
        }
        Ok(())
    }

    /// Actor profiles plus the viewer's mute/block relationship to each.
    /// Avatars come back as bare blob CIDs.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn actors_by_did(&self, dids: &[String], viewer: Option<&str>) -> Result<Vec<ProfileInfo>> {
        let viewer = viewer.unwrap_or_default();
        let mut actors = chunked(dids, |chunk| self.actors_chunk(chunk, viewer))?;
        actors.sort_by(|a, b| a.did.cmp(&b.did));
        Ok(actors)
    }

    fn actors_chunk(&self, dids: &[String], viewer: &str) -> Result<Vec<ProfileInfo>> {
        let sql = format!(
            "SELECT a.did, a.handle, a.display_name, a.avatar_cid,
                    EXISTS(SELECT 1 FROM mute m WHERE m.muted_by_did = ?1 AND m.subject_did = a.did),
                    (SELECT b.uri FROM actor_block b
                       WHERE b.creator = ?1 AND b.subject_did = a.did
                       ORDER BY b.uri ASC LIMIT 1),
                    EXISTS(SELECT 1 FROM actor_block b WHERE b.creator = a.did AND b.subject_did = ?1)
             FROM actor a
             WHERE a.did IN ({})",
            numbered_placeholders(2, dids.len())
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare actor lookup")?;
        let rows = stmt
            .query_map(params_from_iter(std::iter::once(viewer).chain(dids.iter().map(String::as_str))), |row| {
                Ok(ProfileInfo {
                    did: row.get(0)?,
                    handle: row.get(1)?,
                    display_name: row.get(2)?,
                    avatar: row.get(3)?,
                    viewer_muted: row.get(4)?,
                    viewer_blocking: row.get(5)?,
                    viewer_blocked_by: row.get(6)?,
                })
            })
            .context("failed to run actor lookup")?;

        let mut actors = Vec::new();
        for row in rows {
            actors.push(row.context("failed to decode actor row")?);
        }
        Ok(actors)
    }

    /// Block edges `(creator, subject)` where both ends are in `dids`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn blocks_among(&self, dids: &[String]) -> Result<Vec<(String, String)>> {
        let members = dids.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut edges = chunked(dids, |chunk| self.blocks_by_creators(chunk))?;
        edges.retain(|(_, subject)| members.contains(subject.as_str()));
        edges.sort();
        edges.dedup();
        Ok(edges)
    }

    fn blocks_by_creators(&self, creators: &[String]) -> Result<Vec<(String, String)>> {
        let sql = format!(
            "SELECT DISTINCT creator, subject_did FROM actor_block WHERE creator IN ({})",
            placeholders(creators.len())
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare block lookup")?;
        let rows = stmt
            .query_map(params_from_iter(creators.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to run block lookup")?;

        let mut edges = Vec::new();
        for row in rows {
            edges.push(row.context("failed to decode block row")?);
        }
        Ok(edges)
    }

    /// Labels applied to any of `subjects` (post URIs or DIDs).
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn labels_for_subjects(&self, subjects: &[String]) -> Result<Vec<Label>> {
        let mut labels = chunked(subjects, |chunk| self.labels_chunk(chunk))?;
        labels.sort_by(|a, b| (&a.uri, &a.cts, &a.val).cmp(&(&b.uri, &b.cts, &b.val)));
        Ok(labels)
    }

    fn labels_chunk(&self, subjects: &[String]) -> Result<Vec<Label>> {
        let sql = format!(
            "SELECT src, uri, cid, val, neg, cts FROM label
             WHERE uri IN ({}) ORDER BY uri ASC, cts ASC, val ASC",
            placeholders(subjects.len())
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare label lookup")?;
        let rows = stmt
            .query_map(params_from_iter(subjects.iter()), |row| {
                let cid: String = row.get(2)?;
                Ok(Label {
                    src: row.get(0)?,
                    uri: row.get(1)?,
                    cid: Some(cid).filter(|cid| !cid.is_empty()),
                    val: row.get(3)?,
                    neg: row.get(4)?,
                    cts: row.get(5)?,
                })
            })
            .context("failed to run label lookup")?;

        let mut labels = Vec::new();
        for row in rows {
            labels.push(row.context("failed to decode label row")?);
        }
        Ok(labels)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn lists_by_uri(&self, uris: &[String]) -> Result<Vec<ListInfo>> {
        let mut lists = chunked(uris, |chunk| self.lists_chunk(chunk))?;
        lists.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(lists)
    }

    fn lists_chunk(&self, uris: &[String]) -> Result<Vec<ListInfo>> {
        let sql = format!(
            "SELECT uri, cid, creator, name, purpose FROM list WHERE uri IN ({})",
            placeholders(uris.len())
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare list lookup")?;
        let rows = stmt
            .query_map(params_from_iter(uris.iter()), |row| {
                Ok(ListInfo {
                    uri: row.get(0)?,
                    cid: row.get(1)?,
                    creator: row.get(2)?,
                    name: row.get(3)?,
                    purpose: row.get(4)?,
                })
            })
            .context("failed to run list lookup")?;

        let mut lists = Vec::new();
        for row in rows {
            lists.push(row.context("failed to decode list row")?);
        }
        Ok(lists)
    }

    /// Whether `creator` follows `subject`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn is_following(&self, creator: &str, subject: &str) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM follow WHERE creator = ?1 AND subject_did = ?2)",
                params![creator, subject],
                |row| row.get::<_, bool>(0),
            )
            .context("failed to check follow")
    }

    /// Whether `subject` is a member of any of `list_uris`.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn in_any_list(&self, list_uris: &[String], subject: &str) -> Result<bool> {
        let subject = subject.to_string();
        for chunk in list_uris.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT EXISTS(SELECT 1 FROM list_item WHERE subject_did = ?1 AND list_uri IN ({}))",
                numbered_placeholders(2, chunk.len())
            );
            let member = self
                .conn
                .query_row(
                    &sql,
                    params_from_iter(std::iter::once(&subject).chain(chunk.iter())),
                    |row| row.get::<_, bool>(0),
                )
                .context("failed to check list membership")?;
            if member {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// # Errors
    /// Returns an error when the query fails.
    pub fn repo_revision(&self, did: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT rev FROM repo_root WHERE did = ?1", params![did], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .context("failed to read repo revision")
    }

    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn upsert_actor(&mut self, actor: &NewActor) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO actor(did, handle, display_name, avatar_cid, indexed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(did) DO UPDATE SET
                   handle = excluded.handle,
                   display_name = excluded.display_name,
                   avatar_cid = excluded.avatar_cid,
                   indexed_at = excluded.indexed_at",
                params![actor.did, actor.handle, actor.display_name, actor.avatar_cid, now_rfc3339()?],
            )
            .context("failed to upsert actor")?;
        Ok(())
    }

    /// Index a post with its counters row and optional embed, bumping the
    /// reply parent's reply count.
    ///
    /// # Errors
    /// Returns an error when the URI or record is malformed or any write fails.
    pub fn insert_post(&mut self, post: &NewPost) -> Result<()> {
        let creator = uri_host(&post.uri)
            .ok_or_else(|| anyhow!("post uri has no author: {}", post.uri))?
            .to_string();
        let record = PostRecord::from_value(&post.record)
            .ok_or_else(|| anyhow!("post record does not match the post schema: {}", post.uri))?;
        let created_at = record
            .created_at
            .as_deref()
            .and_then(|value| parse_rfc3339(value).ok())
            .unwrap_or(post.indexed_at);
        let sort_at = created_at.min(post.indexed_at);
        let reply_root = record.reply.as_ref().map(|reply| reply.root.uri.clone());
        let reply_parent = record.reply.as_ref().map(|reply| reply.parent.uri.clone());

        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO post(
                uri, cid, creator, reply_root, reply_parent, record_json,
                created_at, indexed_at, sort_at, invalid_reply_root, violates_thread_gate
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                post.uri,
                post.cid,
                creator,
                reply_root,
                reply_parent,
                serde_json::to_string(&post.record).context("failed to serialize post record")?,
                rfc3339(created_at)?,
                rfc3339(post.indexed_at)?,
                unix_millis(sort_at)?,
                post.invalid_reply_root,
                post.violates_thread_gate,
            ],
        )
        .context("failed to insert post")?;
        tx.execute("INSERT INTO post_agg(uri) VALUES (?1)", params![post.uri])
            .context("failed to insert post counters")?;
        if let Some(parent) = &reply_parent {
            tx.execute(
                "UPDATE post_agg SET reply_count = reply_count + 1 WHERE uri = ?1",
                params![parent],
            )
            .context("failed to bump parent reply count")?;
        }
        if let Some(embed) = &post.embed {
            insert_embed(&tx, &post.uri, embed)?;
        }
        tx.commit().context("failed to commit post write")?;
        Ok(())
    }

    /// Hide a post from every read. Returns `false` when the post is unknown.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn take_down_post(&mut self, uri: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("UPDATE post SET taken_down = 1 WHERE uri = ?1", params![uri])
            .context("failed to take down post")?;
        Ok(changed > 0)
    }

    /// Overwrite aggregate counters. Returns `false` when the post is unknown.
    ///
    /// # Errors
    /// Returns an error when the update fails or a count is negative.
    pub fn set_post_counts(&mut self, uri: &str, counts: &PostCounts) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE post_agg SET like_count = ?2, repost_count = ?3, reply_count = ?4 WHERE uri = ?1",
                params![uri, counts.likes, counts.reposts, counts.replies],
            )
            .context("failed to update post counters")?;
        Ok(changed > 0)
    }

    /// Store a thread-gate, keyed by the post named in its record.
    ///
    /// # Errors
    /// Returns an error when the record is malformed or the insert fails.
    pub fn insert_thread_gate(&mut self, uri: &str, cid: &str, record: &Value) -> Result<()> {
        let gate = ThreadgateRecord::from_value(record)
            .ok_or_else(|| anyhow!("thread-gate record is malformed: {uri}"))?;
        let creator = uri_host(uri).ok_or_else(|| anyhow!("thread-gate uri has no author: {uri}"))?;
        self.conn
            .execute(
                "INSERT INTO thread_gate(uri, cid, creator, post_uri, record_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uri,
                    cid,
                    creator,
                    gate.post,
                    serde_json::to_string(record).context("failed to serialize thread-gate")?,
                    now_rfc3339()?,
                ],
            )
            .context("failed to insert thread-gate")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_block(&mut self, edge: &GraphEdge) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO actor_block(uri, cid, creator, subject_did, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![edge.uri, edge.cid, edge.creator, edge.subject, now_rfc3339()?],
            )
            .context("failed to insert block")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_follow(&mut self, edge: &GraphEdge) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO follow(uri, cid, creator, subject_did, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![edge.uri, edge.cid, edge.creator, edge.subject, now_rfc3339()?],
            )
            .context("failed to insert follow")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_mute(&mut self, muted_by: &str, subject: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO mute(muted_by_did, subject_did, created_at) VALUES (?1, ?2, ?3)",
                params![muted_by, subject, now_rfc3339()?],
            )
            .context("failed to insert mute")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the list URI is malformed or the insert fails.
    pub fn insert_list(&mut self, list: &ListInfo) -> Result<()> {
        if uri_host(&list.uri) != Some(list.creator.as_str()) {
            return Err(anyhow!("list {} is not owned by {}", list.uri, list.creator));
        }
        self.conn
            .execute(
                "INSERT INTO list(uri, cid, creator, name, purpose, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![list.uri, list.cid, list.creator, list.name, list.purpose, now_rfc3339()?],
            )
            .context("failed to insert list")?;
        Ok(())
    }

    /// Add `edge.subject` to the list at `list_uri`.
    ///
    /// # Errors
    /// Returns an error when the list does not exist or the insert fails.
    pub fn insert_list_item(&mut self, list_uri: &str, edge: &GraphEdge) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO list_item(uri, cid, creator, list_uri, subject_did, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![edge.uri, edge.cid, edge.creator, list_uri, edge.subject, now_rfc3339()?],
            )
            .context("failed to insert list item")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_label(&mut self, label: &Label) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO label(src, uri, cid, val, neg, cts) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    label.src,
                    label.uri,
                    label.cid.clone().unwrap_or_default(),
                    label.val,
                    label.neg,
                    label.cts,
                ],
            )
            .context("failed to insert label")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn set_repo_revision(&mut self, did: &str, cid: &str, rev: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO repo_root(did, cid, rev, indexed_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(did) DO UPDATE SET
                   cid = excluded.cid, rev = excluded.rev, indexed_at = excluded.indexed_at",
                params![did, cid, rev, now_rfc3339()?],
            )
            .context("failed to set repo revision")?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn insert_embed(tx: &rusqlite::Transaction<'_>, post_uri: &str, embed: &StoredEmbed) -> Result<()> {
    match embed {
        StoredEmbed::Images { images } => {
            for (position, image) in images.iter().enumerate() {
                tx.execute(
                    "INSERT INTO post_embed_image(post_uri, position, image_cid, alt)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        post_uri,
                        i64::try_from(position).context("image position overflow")?,
                        image.cid,
                        image.alt,
                    ],
                )
                .context("failed to insert image embed")?;
            }
        }
        StoredEmbed::External { uri, title, description, thumb_cid } => {
            tx.execute(
                "INSERT INTO post_embed_external(post_uri, uri, title, description, thumb_cid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![post_uri, uri, title, description, thumb_cid],
            )
            .context("failed to insert external embed")?;
        }
        StoredEmbed::Record { uri, cid } => {
            tx.execute(
                "INSERT INTO post_embed_record(post_uri, embed_uri, embed_cid) VALUES (?1, ?2, ?3)",
                params![post_uri, uri, cid],
            )
            .context("failed to insert record embed")?;
        }
    }
    Ok(())
}

fn feed_row_from_sql(row: &Row<'_>) -> rusqlite::Result<(FeedRow, i64)> {
    Ok((
        FeedRow {
            uri: row.get(0)?,
            cid: row.get(1)?,
            author_did: row.get(2)?,
            reply_root: row.get(3)?,
            reply_parent: row.get(4)?,
            sort_at: OffsetDateTime::UNIX_EPOCH,
            invalid_reply_root: row.get(6)?,
            violates_thread_gate: row.get(7)?,
        },
        row.get(5)?,
    ))
}

fn collect_feed_rows(
    rows: impl Iterator<Item = rusqlite::Result<(FeedRow, i64)>>,
) -> Result<Vec<FeedRow>> {
    let mut out = Vec::new();
    for row in rows {
        let (mut feed_row, sort_millis) = row.context("failed to decode post row")?;
        feed_row.sort_at = from_unix_millis(sort_millis)?;
        out.push(feed_row);
    }
    Ok(out)
}

/// Run `lookup` over `ids` in batches of at most [`LOOKUP_CHUNK`] and
/// concatenate the results.
fn chunked<T>(ids: &[String], mut lookup: impl FnMut(&[String]) -> Result<Vec<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for chunk in ids.chunks(LOOKUP_CHUNK) {
        out.extend(lookup(chunk)?);
    }
    Ok(out)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// `?first, ?first+1, ...` for statements that also bind earlier numbered params.
fn numbered_placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn unix_millis(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).context("timestamp out of range")
}

fn from_unix_millis(millis: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .with_context(|| format!("invalid sort timestamp: {millis}"))
}
