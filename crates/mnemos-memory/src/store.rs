//! SQLite-backed `MemoryStore`.
//!
//! Every operation checks a handle out of the pool and runs its statements on
//! the blocking thread pool; the handle is returned when the closure ends,
//! whether it succeeded or not.

use crate::pool::ConnectionPool;
use async_trait::async_trait;
use chrono::Utc;
use mnemos_types::affect::AffectVector;
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::memory::{
    normalize_timestamp, LexicalHit, MemoryStore, StoredVector, TimeWindow, TurnId, TurnPayload,
    Vitality,
};
use mnemos_types::vector::{embedding_from_bytes, embedding_to_bytes};
use rusqlite::Connection;
use std::collections::HashMap;
use tracing::debug;

/// Reinforcement applied to every recalled turn.
const STRENGTH_BOOST: f64 = 0.1;
const DECAY_DAMPING: f64 = 0.9;
const MIN_DECAY_RATE: f64 = 0.001;

/// Store timestamps may be seconds or milliseconds; compare in milliseconds.
const TS_MS_SQL: &str =
    "(CASE WHEN n.timestamp < 4102444800 THEN n.timestamp * 1000 ELSE n.timestamp END)";

/// A layer of a turn, as written by the ingestion side.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub turn_id: TurnId,
    pub layer: String,
    pub text: String,
    pub summary: String,
    pub who: Option<String>,
    pub timestamp: i64,
    pub affect: Option<AffectVector>,
    pub embedding: Option<Vec<f32>>,
}

/// Memory store over a pool of SQLite handles.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    pool: ConnectionPool,
}

impl SqliteMemoryStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> MnemosResult<T>
    where
        F: FnOnce(&Connection) -> MnemosResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.acquire().await?;
        tokio::task::spawn_blocking(move || f(&*conn))
            .await
            .map_err(|e| MnemosError::Internal(e.to_string()))?
    }

    /// Insert one node. Used by ingestion tooling and tests.
    pub async fn insert_node(&self, node: NewNode) -> MnemosResult<i64> {
        self.with_conn(move |conn| insert_node(conn, &node)).await
    }

    /// Attach an embedding to an existing node.
    pub async fn set_embedding(&self, node_id: i64, embedding: Vec<f32>) -> MnemosResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE memory_nodes SET embedding = ?1 WHERE id = ?2",
                rusqlite::params![embedding_to_bytes(&embedding), node_id],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }

    /// Nodes that carry text but no embedding yet, newest first.
    pub async fn nodes_missing_embeddings(&self, limit: usize) -> MnemosResult<Vec<(i64, String)>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, CASE WHEN summary != '' THEN summary ELSE text END
                     FROM memory_nodes WHERE embedding IS NULL
                     ORDER BY timestamp DESC LIMIT ?1",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(store_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
        })
        .await
    }

    /// Record that the user dismissed a recalled turn.
    pub async fn record_dismissal(&self, turn_id: TurnId) -> MnemosResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE memory_nodes SET dismissal_count = dismissal_count + 1 WHERE turn_id = ?1",
                [&turn_id],
            )
            .map_err(store_err)?;
            Ok(())
        })
        .await
    }
}

fn store_err(e: rusqlite::Error) -> MnemosError {
    MnemosError::Store(e.to_string())
}

fn insert_node(conn: &Connection, node: &NewNode) -> MnemosResult<i64> {
    let affect_json = node
        .affect
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| MnemosError::Serialization(e.to_string()))?;
    let embedding = node.embedding.as_deref().map(embedding_to_bytes);
    conn.execute(
        "INSERT INTO memory_nodes (turn_id, layer, text, summary, who, timestamp, affect_json, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            node.turn_id,
            if node.layer.is_empty() { "input" } else { node.layer.as_str() },
            node.text,
            node.summary,
            node.who,
            node.timestamp,
            affect_json,
            embedding,
        ],
    )
    .map_err(store_err)?;
    Ok(conn.last_insert_rowid())
}

/// Quote each term for FTS5 and OR them together.
fn match_expression(terms: &[String]) -> String {
    terms
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

/// Parse a stored affect blob, keeping numeric dimensions only.
fn parse_affect(raw: &str) -> Option<AffectVector> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let map = value.as_object()?;
    let affect: AffectVector = map
        .iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f as f32)))
        .collect();
    if affect.is_empty() {
        None
    } else {
        Some(affect)
    }
}

fn search_keywords(
    conn: &Connection,
    terms: &[String],
    window: TimeWindow,
    limit: usize,
) -> MnemosResult<Vec<LexicalHit>> {
    let expr = match_expression(terms);
    if expr.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT n.turn_id, MAX(n.timestamp), MIN(memory_fts.rank) AS best,
                MAX(n.strength), MIN(n.decay_rate), MAX(n.last_accessed), MAX(n.dismissal_count)
         FROM memory_fts JOIN memory_nodes n ON n.id = memory_fts.rowid
         WHERE memory_fts MATCH ?1 AND {TS_MS_SQL} >= ?2
         GROUP BY n.turn_id
         ORDER BY best ASC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map(
            rusqlite::params![expr, window.since_ms, limit as i64],
            |row| {
                let rank: f64 = row.get(2)?;
                Ok(LexicalHit {
                    turn_id: row.get(0)?,
                    timestamp_ms: normalize_timestamp(row.get(1)?),
                    score: rank.abs() as f32,
                    vitality: Some(Vitality {
                        strength: row.get::<_, f64>(3)? as f32,
                        decay_rate: row.get::<_, f64>(4)? as f32,
                        last_accessed_ms: normalize_timestamp(row.get(5)?),
                        dismissal_count: row.get::<_, i64>(6)?.max(0) as u32,
                    }),
                })
            },
        )
        .map_err(store_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
}

fn fetch_vectors(conn: &Connection, window: TimeWindow) -> MnemosResult<Vec<StoredVector>> {
    let sql = format!(
        "SELECT n.id, n.turn_id, n.embedding, n.timestamp, n.who, n.layer
         FROM memory_nodes n
         WHERE n.embedding IS NOT NULL AND {TS_MS_SQL} >= ?1
         ORDER BY n.timestamp DESC"
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map([window.since_ms], |row| {
            let blob: Vec<u8> = row.get(2)?;
            Ok(StoredVector {
                node_id: row.get::<_, i64>(0)?.to_string(),
                turn_id: row.get(1)?,
                vector: embedding_from_bytes(&blob),
                timestamp_ms: normalize_timestamp(row.get(3)?),
                speaker: row.get(4)?,
                layer: row.get(5)?,
            })
        })
        .map_err(store_err)?;
    let vectors: Vec<StoredVector> = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(store_err)?
        .into_iter()
        .filter(|v| !v.vector.is_empty())
        .collect();
    debug!(count = vectors.len(), "Fetched stored vectors");
    Ok(vectors)
}

fn fetch_payload(
    conn: &Connection,
    turn_ids: &[TurnId],
) -> MnemosResult<HashMap<TurnId, TurnPayload>> {
    if turn_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT turn_id, layer, text, summary, who, affect_json
         FROM memory_nodes WHERE turn_id IN ({})
         ORDER BY turn_id, id",
        placeholders(turn_ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(turn_ids.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .map_err(store_err)?;

    let mut payloads: HashMap<TurnId, TurnPayload> = HashMap::new();
    for row in rows {
        let (turn_id, layer, text, summary, who, affect_json) = row.map_err(store_err)?;
        let payload = payloads.entry(turn_id).or_default();
        if payload.speaker.is_empty() {
            if let Some(who) = who.filter(|w| !w.is_empty()) {
                payload.speaker = who;
            }
        }
        if payload.summary.is_empty() && !summary.is_empty() {
            payload.summary = summary.clone();
        }
        if payload.text.is_empty() && !text.is_empty() {
            payload.text = text.clone();
        }
        if payload.affect.is_none() {
            payload.affect = affect_json.as_deref().and_then(parse_affect);
        }
        let layer_text = if summary.is_empty() { text } else { summary };
        if !layer_text.is_empty() {
            payload.layers.entry(layer).or_insert(layer_text);
        }
    }
    for payload in payloads.values_mut() {
        if payload.speaker.is_empty() {
            payload.speaker = "unknown".to_string();
        }
    }
    Ok(payloads)
}

fn update_reinforcement(conn: &Connection, turn_ids: &[TurnId]) -> MnemosResult<()> {
    if turn_ids.is_empty() {
        return Ok(());
    }
    let now = Utc::now().timestamp_millis();
    let sql = format!(
        "UPDATE memory_nodes
         SET strength = MIN(1.0, strength + {STRENGTH_BOOST}),
             decay_rate = MAX({MIN_DECAY_RATE}, decay_rate * {DECAY_DAMPING}),
             last_accessed = ?1
         WHERE turn_id IN ({})",
        (2..turn_ids.len() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(turn_ids.len() + 1);
    params.push(&now);
    for id in turn_ids {
        params.push(id);
    }
    let updated = conn
        .execute(&sql, params.as_slice())
        .map_err(store_err)?;
    debug!(turns = turn_ids.len(), rows = updated, "Reinforced recalled memories");
    Ok(())
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn search_keywords(
        &self,
        terms: &[String],
        window: TimeWindow,
        limit: usize,
    ) -> MnemosResult<Vec<LexicalHit>> {
        let terms = terms.to_vec();
        self.with_conn(move |conn| search_keywords(conn, &terms, window, limit))
            .await
    }

    async fn fetch_vectors(&self, window: TimeWindow) -> MnemosResult<Vec<StoredVector>> {
        self.with_conn(move |conn| fetch_vectors(conn, window)).await
    }

    async fn fetch_payload(
        &self,
        turn_ids: &[TurnId],
    ) -> MnemosResult<HashMap<TurnId, TurnPayload>> {
        let turn_ids = turn_ids.to_vec();
        self.with_conn(move |conn| fetch_payload(conn, &turn_ids))
            .await
    }

    async fn update_reinforcement(&self, turn_ids: &[TurnId]) -> MnemosResult<()> {
        let turn_ids = turn_ids.to_vec();
        self.with_conn(move |conn| update_reinforcement(conn, &turn_ids))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_store(dir: &tempfile::TempDir) -> SqliteMemoryStore {
        let pool = ConnectionPool::open(
            dir.path().join("graph.sqlite"),
            2,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        SqliteMemoryStore::new(pool)
    }

    fn node(turn: &str, layer: &str, text: &str, ts: i64) -> NewNode {
        NewNode {
            turn_id: turn.into(),
            layer: layer.into(),
            text: text.into(),
            who: Some("user".into()),
            timestamp: ts,
            ..Default::default()
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn test_search_groups_by_turn() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let ts = now_ms();
        store.insert_node(node("t1", "input", "the garden roses bloom", ts)).await.unwrap();
        store.insert_node(node("t1", "output", "roses need water", ts)).await.unwrap();
        store.insert_node(node("t2", "input", "a quiet afternoon", ts)).await.unwrap();

        let hits = store
            .search_keywords(&["roses".into()], TimeWindow::last_days(90), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].turn_id, "t1");
        assert!(hits[0].score > 0.0);
        assert!(hits[0].vitality.is_some());
    }

    #[tokio::test]
    async fn test_search_respects_window_and_seconds_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let recent_secs = now_ms() / 1000;
        let ancient_ms = now_ms() - 400 * 86_400_000;
        store.insert_node(node("recent", "input", "lighthouse keeper", recent_secs)).await.unwrap();
        store.insert_node(node("old", "input", "lighthouse storm", ancient_ms)).await.unwrap();

        let hits = store
            .search_keywords(&["lighthouse".into()], TimeWindow::last_days(90), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].turn_id, "recent");
        assert_eq!(hits[0].timestamp_ms, recent_secs * 1000);
    }

    #[tokio::test]
    async fn test_empty_terms_return_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let hits = store
            .search_keywords(&[], TimeWindow::unbounded(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_vectors_skips_unembedded() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let mut with = node("t1", "input", "embedded", now_ms());
        with.embedding = Some(vec![0.6, 0.8]);
        store.insert_node(with).await.unwrap();
        store.insert_node(node("t2", "input", "bare", now_ms())).await.unwrap();

        let vectors = store.fetch_vectors(TimeWindow::unbounded()).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].turn_id, "t1");
        assert_eq!(vectors[0].vector, vec![0.6, 0.8]);
        assert_eq!(vectors[0].speaker.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_fetch_payload_collects_layers() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let ts = now_ms();
        let mut input = node("t1", "input", "how do I prune roses", ts);
        let mut affect = AffectVector::new();
        affect.insert("CARE".into(), 0.7);
        input.affect = Some(affect);
        store.insert_node(input).await.unwrap();
        let mut output = node("t1", "output", "cut above the bud", ts);
        output.summary = "pruning advice".into();
        store.insert_node(output).await.unwrap();

        let payloads = store
            .fetch_payload(&["t1".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(payloads.len(), 1);
        let p = &payloads["t1"];
        assert_eq!(p.speaker, "user");
        assert_eq!(p.layers["input"], "how do I prune roses");
        assert_eq!(p.layers["output"], "pruning advice");
        assert_eq!(p.affect.as_ref().unwrap()["CARE"], 0.7);
    }

    #[tokio::test]
    async fn test_reinforcement_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        store.insert_node(node("t1", "input", "anchor", now_ms())).await.unwrap();

        store.update_reinforcement(&["t1".into()]).await.unwrap();
        store.update_reinforcement(&["t1".into()]).await.unwrap();

        let (strength, decay, accessed): (f64, f64, i64) = {
            let conn = store.pool().acquire().await.unwrap();
            conn.query_row(
                "SELECT strength, decay_rate, last_accessed FROM memory_nodes WHERE turn_id = 't1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap()
        };
        assert!((strength - 1.0).abs() < 1e-9);
        assert!((decay - 0.01 * 0.9 * 0.9).abs() < 1e-9);
        assert!(accessed > 0);
    }

    #[test]
    fn test_match_expression_quotes_terms() {
        let expr = match_expression(&["rose".into(), "say \"hi\"".into(), " ".into()]);
        assert_eq!(expr, "\"rose\" OR \"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_parse_affect_ignores_non_numeric() {
        let affect = parse_affect(r#"{"CARE": 0.5, "label": "warm"}"#).unwrap();
        assert_eq!(affect.len(), 1);
        assert!(parse_affect("not json").is_none());
    }
}
