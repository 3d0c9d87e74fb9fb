use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::models::{Citation, Folder, Node, NodeView, Reference};
use crate::error::{GraphError, Result};

/// Fields supplied by the caller when a turn is created. Id and timestamps are
/// assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub owner_id: String,
    pub parent_id: Option<String>,
    pub folder_id: Option<String>,
    pub user_prompt: String,
    pub model_metadata: serde_json::Value,
    pub citations: Vec<Citation>,
    pub references: Vec<Reference>,
}

pub struct Database {
    conn: Mutex<Connection>,
    path: String,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(&path)?;
        let db = Database { conn: Mutex::new(conn), path: path_str };
        db.init()?;
        Ok(db)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn: Mutex::new(conn), path: ":memory:".to_string() };
        db.init()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| GraphError::Poisoned)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT REFERENCES folders(id) DEFERRABLE INITIALLY DEFERRED,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                -- Deferred so a whole subtree can be removed inside one transaction
                parent_id TEXT REFERENCES nodes(id) DEFERRABLE INITIALLY DEFERRED,
                folder_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                user_prompt TEXT NOT NULL,
                ai_response TEXT,
                summary TEXT,
                model_metadata TEXT NOT NULL DEFAULT '{}',
                citations TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_owner ON nodes(owner_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_parent_id ON nodes(parent_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_folder_id ON nodes(folder_id);
            CREATE INDEX IF NOT EXISTS idx_folders_owner ON folders(owner_id);
            CREATE INDEX IF NOT EXISTS idx_folders_parent_id ON folders(parent_id);

            PRAGMA foreign_keys = ON;
            ",
        )?;

        // Migration: Add refs column if it doesn't exist (databases created before references)
        let has_refs: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('nodes') WHERE name = 'refs'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_refs {
            conn.execute("ALTER TABLE nodes ADD COLUMN refs TEXT NOT NULL DEFAULT '[]'", [])?;
            tracing::info!("Migration: added refs column to nodes");
        }

        Ok(())
    }

    /// Standard SELECT columns for nodes; every query aliases the table as `n`.
    const NODE_COLUMNS: &'static str = "n.id, n.owner_id, n.parent_id, n.folder_id, n.user_prompt, n.ai_response, n.summary, n.model_metadata, n.citations, n.refs, n.created_at, n.updated_at";

    /// Index of the first column after NODE_COLUMNS.
    const EXTRA_COLUMN: usize = 12;

    const FOLDER_COLUMNS: &'static str = "id, owner_id, name, parent_id, created_at, updated_at";

    /// Helper to convert a row to Node
    fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
        Ok(Node {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            parent_id: row.get(2)?,
            folder_id: row.get(3)?,
            user_prompt: row.get(4)?,
            ai_response: row.get(5)?,
            summary: row.get(6)?,
            model_metadata: json_column(row, 7)?,
            citations: json_column(row, 8)?,
            references: json_column(row, 9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn row_to_folder(row: &rusqlite::Row) -> rusqlite::Result<Folder> {
        Ok(Folder {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            parent_id: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    // ==================== Node operations ====================

    /// Insert a new turn with no response and no summary yet.
    ///
    /// The parent check and the insert are one statement, so a parent deleted
    /// between context assembly and creation is reported as `ParentNotFound`
    /// instead of leaving a dangling pointer.
    pub fn insert_node(&self, new: &NewNode) -> Result<Node> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_millis();
        let model_metadata = serde_json::to_string(&new.model_metadata)?;
        let citations = serde_json::to_string(&new.citations)?;
        let refs = serde_json::to_string(&new.references)?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO nodes (id, owner_id, parent_id, folder_id, user_prompt, ai_response, summary, model_metadata, citations, refs, created_at, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, NULL, NULL, ?6, ?7, ?8, ?9, ?9
             WHERE ?3 IS NULL OR EXISTS (SELECT 1 FROM nodes WHERE id = ?3 AND owner_id = ?2)",
            params![
                id,
                new.owner_id,
                new.parent_id,
                new.folder_id,
                new.user_prompt,
                model_metadata,
                citations,
                refs,
                now,
            ],
        )?;

        if inserted == 0 {
            let parent = new.parent_id.clone().unwrap_or_default();
            return Err(GraphError::ParentNotFound(parent));
        }

        Ok(Node {
            id,
            owner_id: new.owner_id.clone(),
            parent_id: new.parent_id.clone(),
            folder_id: new.folder_id.clone(),
            user_prompt: new.user_prompt.clone(),
            ai_response: None,
            summary: None,
            model_metadata: new.model_metadata.clone(),
            citations: new.citations.clone(),
            references: new.references.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_node(&self, owner_id: &str, id: &str) -> Result<Option<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes n WHERE n.id = ?1 AND n.owner_id = ?2",
            Self::NODE_COLUMNS
        ))?;

        let node = stmt.query_row(params![id, owner_id], Self::row_to_node).optional()?;
        Ok(node)
    }

    /// Write the generated response and derived summary in one update.
    pub fn finalize_node(
        &self,
        owner_id: &str,
        id: &str,
        ai_response: &str,
        summary: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE nodes SET ai_response = ?3, summary = ?4, updated_at = ?5 WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id, ai_response, summary, now_millis()],
        )?;
        if updated == 0 {
            return Err(GraphError::node_not_found(id));
        }
        Ok(())
    }

    pub fn count_nodes(&self, owner_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Get stats for health reporting: (nodes, roots, folders)
    pub fn get_stats(&self, owner_id: &str) -> Result<(i64, i64, i64)> {
        let conn = self.conn()?;
        let nodes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE owner_id = ?1",
            params![owner_id],
            |r| r.get(0),
        )?;
        let roots: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE owner_id = ?1 AND parent_id IS NULL",
            params![owner_id],
            |r| r.get(0),
        )?;
        let folders: i64 = conn.query_row(
            "SELECT COUNT(*) FROM folders WHERE owner_id = ?1",
            params![owner_id],
            |r| r.get(0),
        )?;
        Ok((nodes, roots, folders))
    }

    /// List nodes newest first, optionally filtered by folder and to roots only.
    pub fn list_nodes(
        &self,
        owner_id: &str,
        folder_id: Option<&str>,
        roots_only: bool,
        limit: u32,
    ) -> Result<Vec<Node>> {
        let mut sql = format!("SELECT {} FROM nodes n WHERE n.owner_id = ?1", Self::NODE_COLUMNS);
        let mut values: Vec<&dyn ToSql> = vec![&owner_id];

        if let Some(folder_id) = folder_id.as_ref() {
            sql.push_str(" AND n.folder_id = ?2");
            values.push(folder_id);
        }
        if roots_only {
            sql.push_str(" AND n.parent_id IS NULL");
        }
        sql.push_str(&format!(" ORDER BY n.created_at DESC, n.rowid DESC LIMIT {}", limit));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let nodes = stmt
            .query_map(values.as_slice(), Self::row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    // ==================== Recursive Hierarchy Operations ====================

    /// Walk parent pointers upward from `id`. Rows come back oldest first, each
    /// paired with its distance from `id`. The walk stops after `depth_limit`
    /// steps, so a corrupted cycle yields repeated ids instead of looping.
    pub fn ancestor_rows(&self, owner_id: &str, id: &str, depth_limit: i64) -> Result<Vec<(i64, Node)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE chain(id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM nodes WHERE id = ?1 AND owner_id = ?2
                UNION ALL
                SELECT p.id, p.parent_id, c.depth + 1
                FROM nodes p JOIN chain c ON p.id = c.parent_id
                WHERE p.owner_id = ?2 AND c.depth < ?3
            )
            SELECT {}, chain.depth FROM chain JOIN nodes n ON n.id = chain.id
            ORDER BY chain.depth DESC",
            Self::NODE_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![id, owner_id, depth_limit], |row| {
                Ok((row.get::<_, i64>(Self::EXTRA_COLUMN)?, Self::row_to_node(row)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Collect `id` and every transitive child, oldest first. With
    /// `with_children_count` each row also carries its number of direct children,
    /// computed as a correlated aggregate in the same query.
    pub fn descendant_rows(&self, owner_id: &str, id: &str, with_children_count: bool) -> Result<Vec<NodeView>> {
        let count_column = if with_children_count {
            ", (SELECT COUNT(*) FROM nodes k WHERE k.parent_id = n.id AND k.owner_id = ?2)"
        } else {
            ""
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE tree(id) AS (
                SELECT id FROM nodes WHERE id = ?1 AND owner_id = ?2
                UNION
                SELECT c.id FROM nodes c JOIN tree t ON c.parent_id = t.id
                WHERE c.owner_id = ?2
            )
            SELECT {}{} FROM nodes n WHERE n.id IN (SELECT id FROM tree)
            ORDER BY n.created_at ASC, n.rowid ASC",
            Self::NODE_COLUMNS, count_column
        ))?;

        let rows = stmt
            .query_map(params![id, owner_id], |row| {
                let children_count = if with_children_count {
                    Some(row.get::<_, i64>(Self::EXTRA_COLUMN)?)
                } else {
                    None
                };
                Ok(NodeView { node: Self::row_to_node(row)?, children_count })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Direct children in creation order.
    pub fn children_of(&self, owner_id: &str, id: &str) -> Result<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes n WHERE n.parent_id = ?1 AND n.owner_id = ?2
             ORDER BY n.created_at ASC, n.rowid ASC",
            Self::NODE_COLUMNS
        ))?;

        let nodes = stmt
            .query_map(params![id, owner_id], Self::row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Check if `candidate_id` is `root_id` or one of its descendants
    pub fn is_in_subtree(&self, owner_id: &str, root_id: &str, candidate_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found = conn.query_row(
            "WITH RECURSIVE subtree(id) AS (
                SELECT ?1
                UNION
                SELECT c.id FROM nodes c JOIN subtree s ON c.parent_id = s.id
                WHERE c.owner_id = ?2
            )
            SELECT EXISTS (SELECT 1 FROM subtree WHERE id = ?3)",
            params![root_id, owner_id, candidate_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    /// Root nodes filed in any of `folder_ids`, oldest first.
    pub fn roots_in_folders(&self, owner_id: &str, folder_ids: &[String]) -> Result<Vec<Node>> {
        if folder_ids.is_empty() {
            return Ok(Vec::new());
        }

        // ?1 is the owner; folder ids follow
        let placeholders: Vec<String> = folder_ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect();

        let sql = format!(
            "SELECT {} FROM nodes n
             WHERE n.owner_id = ?1 AND n.parent_id IS NULL AND n.folder_id IN ({})
             ORDER BY n.created_at ASC, n.rowid ASC",
            Self::NODE_COLUMNS,
            placeholders.join(", ")
        );

        let mut values: Vec<&dyn ToSql> = vec![&owner_id];
        values.extend(folder_ids.iter().map(|s| s as &dyn ToSql));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let nodes = stmt
            .query_map(values.as_slice(), Self::row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    // ==================== Structural edits ====================

    /// Update where a node hangs: its parent and its folder, in one statement.
    pub fn set_node_placement(
        &self,
        owner_id: &str,
        id: &str,
        parent_id: Option<&str>,
        folder_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE nodes SET parent_id = ?3, folder_id = ?4, updated_at = ?5 WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id, parent_id, folder_id, now_millis()],
        )?;
        if updated == 0 {
            return Err(GraphError::node_not_found(id));
        }
        Ok(())
    }

    /// Remove one node, moving its direct children up to its parent.
    /// Returns the ids of the reparented children in creation order.
    pub fn delete_single(&self, owner_id: &str, id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let parent_id: Option<Option<String>> = tx
            .query_row(
                "SELECT parent_id FROM nodes WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(parent_id) = parent_id else {
            return Err(GraphError::node_not_found(id));
        };

        let children: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM nodes WHERE parent_id = ?1 AND owner_id = ?2 ORDER BY created_at ASC, rowid ASC",
            )?;
            let ids = stmt
                .query_map(params![id, owner_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        tx.execute(
            "UPDATE nodes SET parent_id = ?3, updated_at = ?4 WHERE parent_id = ?1 AND owner_id = ?2",
            params![id, owner_id, parent_id, now_millis()],
        )?;
        tx.execute("DELETE FROM nodes WHERE id = ?1 AND owner_id = ?2", params![id, owner_id])?;
        tx.commit()?;

        Ok(children)
    }

    /// Remove a node and every descendant in one transaction.
    /// Returns the deleted ids.
    pub fn delete_subtree(&self, owner_id: &str, id: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM nodes WHERE id = ?1 AND owner_id = ?2)",
            params![id, owner_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(GraphError::node_not_found(id));
        }

        let mut doomed: Vec<String> = {
            let mut stmt = tx.prepare(
                "WITH RECURSIVE subtree(id) AS (
                    SELECT id FROM nodes WHERE id = ?1 AND owner_id = ?2
                    UNION
                    SELECT c.id FROM nodes c JOIN subtree s ON c.parent_id = s.id
                    WHERE c.owner_id = ?2
                )
                SELECT id FROM subtree",
            )?;
            let ids = stmt
                .query_map(params![id, owner_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        if doomed.is_empty() {
            tracing::warn!(node_id = %id, "subtree query returned no rows, deleting the node alone");
            doomed.push(id.to_string());
        }

        {
            let mut stmt = tx.prepare("DELETE FROM nodes WHERE id = ?1 AND owner_id = ?2")?;
            for node_id in &doomed {
                stmt.execute(params![node_id, owner_id])?;
            }
        }
        tx.commit()?;

        Ok(doomed)
    }

    // ==================== Folder operations ====================

    pub fn insert_folder(&self, owner_id: &str, name: &str, parent_id: Option<&str>) -> Result<Folder> {
        let folder = Folder {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            created_at: now_millis(),
            updated_at: now_millis(),
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO folders (id, owner_id, name, parent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                folder.id,
                folder.owner_id,
                folder.name,
                folder.parent_id,
                folder.created_at,
                folder.updated_at,
            ],
        )?;
        Ok(folder)
    }

    pub fn get_folder(&self, owner_id: &str, id: &str) -> Result<Option<Folder>> {
        let conn = self.conn()?;
        let folder = conn
            .query_row(
                &format!("SELECT {} FROM folders WHERE id = ?1 AND owner_id = ?2", Self::FOLDER_COLUMNS),
                params![id, owner_id],
                Self::row_to_folder,
            )
            .optional()?;
        Ok(folder)
    }

    /// All folders of an owner as a flat list sorted by name.
    pub fn list_folders(&self, owner_id: &str) -> Result<Vec<Folder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM folders WHERE owner_id = ?1 ORDER BY name ASC",
            Self::FOLDER_COLUMNS
        ))?;
        let folders = stmt
            .query_map(params![owner_id], Self::row_to_folder)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    pub fn set_folder_parent(&self, owner_id: &str, id: &str, parent_id: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE folders SET parent_id = ?3, updated_at = ?4 WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id, parent_id, now_millis()],
        )?;
        if updated == 0 {
            return Err(GraphError::folder_not_found(id));
        }
        Ok(())
    }

    /// A folder id plus the ids of all its transitive sub-folders.
    /// Empty when the folder does not exist for this owner.
    pub fn folder_subtree_ids(&self, owner_id: &str, folder_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "WITH RECURSIVE folder_tree(id) AS (
                SELECT id FROM folders WHERE id = ?1 AND owner_id = ?2
                UNION
                SELECT f.id FROM folders f JOIN folder_tree t ON f.parent_id = t.id
                WHERE f.owner_id = ?2
            )
            SELECT id FROM folder_tree",
        )?;
        let ids = stmt
            .query_map(params![folder_id, owner_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Run raw SQL against the connection, for tests that need to corrupt the forest.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str, values: &[&dyn ToSql]) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(sql, values)?)
    }
}

/// Decode a JSON text column, reporting malformed JSON as a conversion failure.
fn json_column<T: serde::de::DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CitationSource, ReferenceType};

    const OWNER: &str = "user-1";

    fn turn(db: &Database, parent: Option<&str>, prompt: &str) -> Node {
        db.insert_node(&NewNode {
            owner_id: OWNER.to_string(),
            parent_id: parent.map(str::to_string),
            user_prompt: prompt.to_string(),
            model_metadata: serde_json::json!({}),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn insert_and_get_round_trips_json_columns() {
        let db = Database::in_memory().unwrap();
        let node = db
            .insert_node(&NewNode {
                owner_id: OWNER.into(),
                user_prompt: "Hi".into(),
                model_metadata: serde_json::json!({"model": "gemini-2.5-flash"}),
                citations: vec![Citation {
                    text: "quote".into(),
                    source_node_id: "x".into(),
                    source: CitationSource::User,
                }],
                references: vec![Reference { id: "f".into(), ref_type: ReferenceType::Folder, name: None }],
                ..Default::default()
            })
            .unwrap();

        let loaded = db.get_node(OWNER, &node.id).unwrap().unwrap();
        assert_eq!(loaded, node);
        assert!(loaded.ai_response.is_none());
        assert_eq!(loaded.model_name(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn insert_with_missing_parent_creates_nothing() {
        let db = Database::in_memory().unwrap();
        let err = db
            .insert_node(&NewNode {
                owner_id: OWNER.into(),
                parent_id: Some("ghost".into()),
                user_prompt: "Hi".into(),
                model_metadata: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, GraphError::ParentNotFound(ref id) if id == "ghost"));
        assert_eq!(db.count_nodes(OWNER).unwrap(), 0);
    }

    #[test]
    fn other_owners_cannot_see_or_extend_nodes() {
        let db = Database::in_memory().unwrap();
        let a = turn(&db, None, "Hi");
        assert!(db.get_node("someone-else", &a.id).unwrap().is_none());

        let err = db
            .insert_node(&NewNode {
                owner_id: "someone-else".into(),
                parent_id: Some(a.id.clone()),
                user_prompt: "sneaky".into(),
                model_metadata: serde_json::json!({}),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn ancestor_rows_are_oldest_first() {
        let db = Database::in_memory().unwrap();
        let a = turn(&db, None, "a");
        let b = turn(&db, Some(&a.id), "b");
        let c = turn(&db, Some(&b.id), "c");

        let rows = db.ancestor_rows(OWNER, &c.id, 10).unwrap();
        let ids: Vec<&str> = rows.iter().map(|(_, n)| n.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);
        assert_eq!(rows[0].0, 2);
    }

    #[test]
    fn descendant_rows_carry_children_count() {
        let db = Database::in_memory().unwrap();
        let a = turn(&db, None, "a");
        let b = turn(&db, Some(&a.id), "b");
        turn(&db, Some(&a.id), "b2");
        turn(&db, Some(&b.id), "c");

        let rows = db.descendant_rows(OWNER, &a.id, true).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].node.id, a.id);
        assert_eq!(rows[0].children_count, Some(2));

        let plain = db.descendant_rows(OWNER, &a.id, false).unwrap();
        assert!(plain.iter().all(|v| v.children_count.is_none()));
    }

    #[test]
    fn delete_single_moves_children_up() {
        let db = Database::in_memory().unwrap();
        let a = turn(&db, None, "Hi");
        let b = turn(&db, Some(&a.id), "More");
        let c1 = turn(&db, Some(&b.id), "c1");
        let c2 = turn(&db, Some(&b.id), "c2");

        let moved = db.delete_single(OWNER, &b.id).unwrap();
        assert_eq!(moved, vec![c1.id.clone(), c2.id.clone()]);
        assert!(db.get_node(OWNER, &b.id).unwrap().is_none());
        let c1 = db.get_node(OWNER, &c1.id).unwrap().unwrap();
        assert_eq!(c1.parent_id.as_deref(), Some(a.id.as_str()));
    }

    #[test]
    fn delete_single_of_root_makes_children_roots() {
        let db = Database::in_memory().unwrap();
        let a = turn(&db, None, "Hi");
        let b = turn(&db, Some(&a.id), "More");

        db.delete_single(OWNER, &a.id).unwrap();
        let b = db.get_node(OWNER, &b.id).unwrap().unwrap();
        assert!(b.is_root());
    }

    #[test]
    fn delete_subtree_removes_all_descendants() {
        let db = Database::in_memory().unwrap();
        let a = turn(&db, None, "Hi");
        let b = turn(&db, Some(&a.id), "More");
        let c = turn(&db, Some(&b.id), "Even more");

        let mut deleted = db.delete_subtree(OWNER, &b.id).unwrap();
        deleted.sort();
        let mut expected = vec![b.id.clone(), c.id.clone()];
        expected.sort();
        assert_eq!(deleted, expected);
        assert!(db.get_node(OWNER, &a.id).unwrap().is_some());
        assert_eq!(db.count_nodes(OWNER).unwrap(), 1);
    }

    #[test]
    fn deleting_missing_node_is_not_found() {
        let db = Database::in_memory().unwrap();
        assert!(db.delete_single(OWNER, "nope").unwrap_err().is_not_found());
        assert!(db.delete_subtree(OWNER, "nope").unwrap_err().is_not_found());
    }

    #[test]
    fn roots_in_folders_spans_nested_folders() {
        let db = Database::in_memory().unwrap();
        let top = db.insert_folder(OWNER, "Work", None).unwrap();
        let nested = db.insert_folder(OWNER, "Project", Some(&top.id)).unwrap();
        let other = db.insert_folder(OWNER, "Home", None).unwrap();

        let mut in_nested = turn(&db, None, "nested root");
        db.set_node_placement(OWNER, &in_nested.id, None, Some(&nested.id)).unwrap();
        in_nested.folder_id = Some(nested.id.clone());
        let child = turn(&db, Some(&in_nested.id), "child");
        db.set_node_placement(OWNER, &child.id, Some(&in_nested.id), Some(&nested.id)).unwrap();
        let elsewhere = turn(&db, None, "elsewhere");
        db.set_node_placement(OWNER, &elsewhere.id, None, Some(&other.id)).unwrap();

        let ids = db.folder_subtree_ids(OWNER, &top.id).unwrap();
        assert_eq!(ids.len(), 2);
        let roots = db.roots_in_folders(OWNER, &ids).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, in_nested.id);
    }

    #[test]
    fn list_nodes_filters_roots_and_folder() {
        let db = Database::in_memory().unwrap();
        let folder = db.insert_folder(OWNER, "Inbox", None).unwrap();
        let a = turn(&db, None, "a");
        turn(&db, Some(&a.id), "b");
        let c = turn(&db, None, "c");
        db.set_node_placement(OWNER, &c.id, None, Some(&folder.id)).unwrap();

        assert_eq!(db.list_nodes(OWNER, None, false, 100).unwrap().len(), 3);
        assert_eq!(db.list_nodes(OWNER, None, true, 100).unwrap().len(), 2);
        let filed = db.list_nodes(OWNER, Some(&folder.id), true, 100).unwrap();
        assert_eq!(filed.len(), 1);
        assert_eq!(filed[0].id, c.id);
        assert_eq!(db.list_nodes(OWNER, None, false, 1).unwrap().len(), 1);
    }

    #[test]
    fn reopening_a_file_database_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest.db");
        let id = {
            let db = Database::new(&path).unwrap();
            turn(&db, None, "persisted").id
        };

        let db = Database::new(&path).unwrap();
        assert_eq!(db.get_node(OWNER, &id).unwrap().unwrap().user_prompt, "persisted");
    }
}
