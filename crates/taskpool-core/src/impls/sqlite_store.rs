//! SQLite task store (feature `sqlite`).
//!
//! Every compound operation runs in one transaction that starts by writing
//! the item row (`UPDATE workflow_item SET id = id`). That write takes the
//! database write lock before anything is read, so two claims on the same item
//! never evaluate the same snapshot, and it doubles as the existence check.
//! The unique index on `claimed_task (item, step, action, owner)` is a second
//! line against duplicate claims.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::domain::ids::{Id, IdMarker};
use crate::domain::{
    ActionId, ActorId, ClaimDecision, ClaimedTask, CollectionId, CollectionRole, InProgressUser,
    ItemFlags, ItemId, Party, PoolTask, RoleId, StepId, TaskKey, WorkflowItem, WorkflowItemRole,
    decide_claim,
};
use crate::ports::{
    ClaimOutcome, ClaimRequest, Cleanup, PoolCounts, ProgressCount, StoreError, StoreResult,
    TaskStore,
};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ITEM_COLUMNS: &str =
    "id, collection, submitter, multiple_titles, multiple_files, published_before, created_at";
const POOL_COLUMNS: &str = "id, item, workflow, step, action, party_kind, party_id, created_at";
const CLAIMED_COLUMNS: &str = "id, item, workflow, step, action, owner, created_at";
const PROGRESS_COLUMNS: &str = "p.item AS item, p.workflow AS workflow, p.step AS step,
    p.actor AS actor, p.finished AS finished, p.updated_at AS updated_at,
    (SELECT json_group_array(e.action) FROM engaged_action e
     WHERE e.item = p.item AND e.step = p.step AND e.actor = p.actor) AS actions";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflow_item (
        id TEXT PRIMARY KEY,
        collection TEXT NOT NULL,
        submitter TEXT NOT NULL,
        multiple_titles INTEGER NOT NULL DEFAULT 0,
        multiple_files INTEGER NOT NULL DEFAULT 0,
        published_before INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS collection_role (
        collection TEXT NOT NULL,
        role TEXT NOT NULL,
        grp TEXT NOT NULL,
        PRIMARY KEY (collection, role)
    )",
    "CREATE TABLE IF NOT EXISTS workflow_item_role (
        item TEXT NOT NULL REFERENCES workflow_item(id),
        role TEXT NOT NULL,
        party_kind TEXT CHECK( party_kind IN ('actor','group') ) NOT NULL,
        party_id TEXT NOT NULL,
        UNIQUE (item, role, party_kind, party_id)
    )",
    "CREATE TABLE IF NOT EXISTS pool_task (
        id TEXT PRIMARY KEY,
        item TEXT NOT NULL REFERENCES workflow_item(id),
        workflow TEXT NOT NULL,
        step TEXT NOT NULL,
        action TEXT NOT NULL,
        party_kind TEXT CHECK( party_kind IN ('actor','group') ) NOT NULL,
        party_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (item, step, action, party_kind, party_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_pool_task_party ON pool_task(party_kind, party_id)",
    "CREATE TABLE IF NOT EXISTS claimed_task (
        id TEXT PRIMARY KEY,
        item TEXT NOT NULL REFERENCES workflow_item(id),
        workflow TEXT NOT NULL,
        step TEXT NOT NULL,
        action TEXT NOT NULL,
        owner TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (item, step, action, owner)
    )",
    "CREATE INDEX IF NOT EXISTS idx_claimed_task_owner ON claimed_task(owner)",
    "CREATE TABLE IF NOT EXISTS in_progress_user (
        item TEXT NOT NULL REFERENCES workflow_item(id),
        workflow TEXT NOT NULL,
        step TEXT NOT NULL,
        actor TEXT NOT NULL,
        finished INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (item, step, actor)
    )",
    "CREATE INDEX IF NOT EXISTS idx_in_progress_actor ON in_progress_user(actor)",
    "CREATE TABLE IF NOT EXISTS engaged_action (
        item TEXT NOT NULL REFERENCES workflow_item(id),
        step TEXT NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        PRIMARY KEY (item, step, actor, action)
    )",
];

/// [`TaskStore`] backed by a SQLite database through a sqlx pool.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Connect to `url` (for example `sqlite://taskpool.db`) and create the schema.
    ///
    /// `sqlite::memory:` is routed to [`SqliteTaskStore::in_memory`].
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        debug!(url, max_connections, "sqlite task store ready");
        Ok(store)
    }

    pub async fn open(url: &str) -> StoreResult<Self> {
        Self::connect(url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Private in-memory database.
    ///
    /// Uses one connection that never idles out; a second connection would
    /// see a different, empty database.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(SqliteJournalMode::Memory)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

// ---- row mapping ----

fn id_text<T: IdMarker>(id: Id<T>) -> String {
    id.as_ulid().to_string()
}

fn parse_id<T: IdMarker>(raw: &str) -> StoreResult<Id<T>> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("bad id '{raw}': {e}")))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn party_columns(party: &Party) -> (&'static str, String) {
    match party {
        Party::Actor(actor) => ("actor", id_text(*actor)),
        Party::Group(group) => ("group", id_text(*group)),
    }
}

fn party_from_row(row: &SqliteRow) -> StoreResult<Party> {
    let kind: String = row.try_get("party_kind")?;
    let id: String = row.try_get("party_id")?;
    match kind.as_str() {
        "actor" => Ok(Party::Actor(parse_id(&id)?)),
        "group" => Ok(Party::Group(parse_id(&id)?)),
        other => Err(StoreError::Corrupt(format!("unknown party kind '{other}'"))),
    }
}

fn row_to_item(row: &SqliteRow) -> StoreResult<WorkflowItem> {
    Ok(WorkflowItem {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        collection: parse_id(&row.try_get::<String, _>("collection")?)?,
        submitter: parse_id(&row.try_get::<String, _>("submitter")?)?,
        flags: ItemFlags {
            multiple_titles: row.try_get("multiple_titles")?,
            multiple_files: row.try_get("multiple_files")?,
            published_before: row.try_get("published_before")?,
        },
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn row_to_pool_task(row: &SqliteRow) -> StoreResult<PoolTask> {
    Ok(PoolTask {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        item: parse_id(&row.try_get::<String, _>("item")?)?,
        workflow: row.try_get::<String, _>("workflow")?.into(),
        step: row.try_get::<String, _>("step")?.into(),
        action: row.try_get::<String, _>("action")?.into(),
        party: party_from_row(row)?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn row_to_claimed(row: &SqliteRow) -> StoreResult<ClaimedTask> {
    Ok(ClaimedTask {
        id: parse_id(&row.try_get::<String, _>("id")?)?,
        item: parse_id(&row.try_get::<String, _>("item")?)?,
        workflow: row.try_get::<String, _>("workflow")?.into(),
        step: row.try_get::<String, _>("step")?.into(),
        action: row.try_get::<String, _>("action")?.into(),
        owner: parse_id(&row.try_get::<String, _>("owner")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
    })
}

fn row_to_progress(row: &SqliteRow) -> StoreResult<InProgressUser> {
    let raw: String = row.try_get("actions")?;
    let actions: Vec<String> = serde_json::from_str(&raw)
        .map_err(|e| StoreError::Corrupt(format!("bad engaged actions '{raw}': {e}")))?;
    Ok(InProgressUser {
        item: parse_id(&row.try_get::<String, _>("item")?)?,
        workflow: row.try_get::<String, _>("workflow")?.into(),
        step: row.try_get::<String, _>("step")?.into(),
        actions: actions.into_iter().map(ActionId::from).collect(),
        actor: parse_id(&row.try_get::<String, _>("actor")?)?,
        finished: row.try_get("finished")?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn row_to_collection_role(row: &SqliteRow) -> StoreResult<CollectionRole> {
    Ok(CollectionRole {
        collection: parse_id(&row.try_get::<String, _>("collection")?)?,
        role: row.try_get::<String, _>("role")?.into(),
        group: parse_id(&row.try_get::<String, _>("grp")?)?,
    })
}

fn row_to_item_role(row: &SqliteRow) -> StoreResult<WorkflowItemRole> {
    Ok(WorkflowItemRole {
        item: parse_id(&row.try_get::<String, _>("item")?)?,
        role: row.try_get::<String, _>("role")?.into(),
        party: party_from_row(row)?,
    })
}

fn collect<T>(
    rows: &[SqliteRow],
    map: impl Fn(&SqliteRow) -> StoreResult<T>,
) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

// ---- statements shared by transactions ----

/// Take the write lock for `item` and confirm it exists.
async fn lock_item(conn: &mut SqliteConnection, item: ItemId) -> StoreResult<()> {
    let result = sqlx::query("UPDATE workflow_item SET id = id WHERE id = ?")
        .bind(id_text(item))
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::ItemMissing(item));
    }
    Ok(())
}

async fn pool_for_key(conn: &mut SqliteConnection, key: &TaskKey) -> StoreResult<Vec<PoolTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {POOL_COLUMNS} FROM pool_task
         WHERE item = ? AND step = ? AND action = ?
         ORDER BY created_at, id"
    ))
    .bind(id_text(key.item))
    .bind(key.step.as_str())
    .bind(key.action.as_str())
    .fetch_all(&mut *conn)
    .await?;
    collect(&rows, row_to_pool_task)
}

async fn claimed_for_key(
    conn: &mut SqliteConnection,
    key: &TaskKey,
) -> StoreResult<Vec<ClaimedTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {CLAIMED_COLUMNS} FROM claimed_task
         WHERE item = ? AND step = ? AND action = ?
         ORDER BY created_at, id"
    ))
    .bind(id_text(key.item))
    .bind(key.step.as_str())
    .bind(key.action.as_str())
    .fetch_all(&mut *conn)
    .await?;
    collect(&rows, row_to_claimed)
}

async fn progress_of_actor(
    conn: &mut SqliteConnection,
    actor: ActorId,
) -> StoreResult<Vec<InProgressUser>> {
    let rows = sqlx::query(&format!(
        "SELECT {PROGRESS_COLUMNS} FROM in_progress_user p WHERE p.actor = ? ORDER BY item, step"
    ))
    .bind(id_text(actor))
    .fetch_all(&mut *conn)
    .await?;
    collect(&rows, row_to_progress)
}

async fn insert_claimed(conn: &mut SqliteConnection, task: &ClaimedTask) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO claimed_task (id, item, workflow, step, action, owner, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id_text(task.id))
    .bind(id_text(task.item))
    .bind(task.workflow.as_str())
    .bind(task.step.as_str())
    .bind(task.action.as_str())
    .bind(id_text(task.owner))
    .bind(millis(task.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Upsert the (item, step, actor) row with finished = false and record the
/// task's action as engaged.
async fn engage(
    conn: &mut SqliteConnection,
    task: &ClaimedTask,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO in_progress_user (item, workflow, step, actor, finished, updated_at)
         VALUES (?, ?, ?, ?, 0, ?)
         ON CONFLICT(item, step, actor)
         DO UPDATE SET workflow = excluded.workflow,
                       finished = 0, updated_at = excluded.updated_at",
    )
    .bind(id_text(task.item))
    .bind(task.workflow.as_str())
    .bind(task.step.as_str())
    .bind(id_text(task.owner))
    .bind(millis(now))
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "INSERT OR IGNORE INTO engaged_action (item, step, actor, action) VALUES (?, ?, ?, ?)",
    )
    .bind(id_text(task.item))
    .bind(task.step.as_str())
    .bind(id_text(task.owner))
    .bind(task.action.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn count(pool: &SqlitePool, sql: &str) -> StoreResult<usize> {
    let n: i64 = sqlx::query(sql).fetch_one(pool).await?.try_get(0)?;
    Ok(n as usize)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert_item(&self, item: WorkflowItem) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO workflow_item
             (id, collection, submitter, multiple_titles, multiple_files, published_before, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id_text(item.id))
        .bind(id_text(item.collection))
        .bind(id_text(item.submitter))
        .bind(item.flags.multiple_titles)
        .bind(item.flags.multiple_files)
        .bind(item.flags.published_before)
        .bind(millis(item.created_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateItem(item.id));
        }
        debug!(item = %item.id, "inserted workflow item");
        Ok(())
    }

    async fn get_item(&self, item: ItemId) -> StoreResult<Option<WorkflowItem>> {
        sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM workflow_item WHERE id = ?"
        ))
        .bind(id_text(item))
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_item(&row))
        .transpose()
    }

    async fn put_collection_role(
        &self,
        role: CollectionRole,
    ) -> StoreResult<Option<CollectionRole>> {
        let mut tx = self.pool.begin().await?;
        let previous = sqlx::query(
            "SELECT collection, role, grp FROM collection_role WHERE collection = ? AND role = ?",
        )
        .bind(id_text(role.collection))
        .bind(role.role.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row_to_collection_role(&row))
        .transpose()?;

        sqlx::query(
            "INSERT INTO collection_role (collection, role, grp) VALUES (?, ?, ?)
             ON CONFLICT(collection, role) DO UPDATE SET grp = excluded.grp",
        )
        .bind(id_text(role.collection))
        .bind(role.role.as_str())
        .bind(id_text(role.group))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(previous)
    }

    async fn delete_collection_role(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM collection_role WHERE collection = ? AND role = ?")
            .bind(id_text(collection))
            .bind(role.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn collection_role(
        &self,
        collection: CollectionId,
        role: &RoleId,
    ) -> StoreResult<Option<CollectionRole>> {
        sqlx::query(
            "SELECT collection, role, grp FROM collection_role WHERE collection = ? AND role = ?",
        )
        .bind(id_text(collection))
        .bind(role.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row_to_collection_role(&row))
        .transpose()
    }

    async fn collection_roles(&self, collection: CollectionId) -> StoreResult<Vec<CollectionRole>> {
        let rows = sqlx::query(
            "SELECT collection, role, grp FROM collection_role WHERE collection = ? ORDER BY role",
        )
        .bind(id_text(collection))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, row_to_collection_role)
    }

    async fn add_item_role(&self, role: WorkflowItemRole) -> StoreResult<bool> {
        let (kind, party_id) = party_columns(&role.party);
        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, role.item).await?;
        let result = sqlx::query(
            "INSERT INTO workflow_item_role (item, role, party_kind, party_id) VALUES (?, ?, ?, ?)
             ON CONFLICT(item, role, party_kind, party_id) DO NOTHING",
        )
        .bind(id_text(role.item))
        .bind(role.role.as_str())
        .bind(kind)
        .bind(party_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn item_roles(&self, item: ItemId) -> StoreResult<Vec<WorkflowItemRole>> {
        let rows = sqlx::query(
            "SELECT item, role, party_kind, party_id FROM workflow_item_role
             WHERE item = ? ORDER BY rowid",
        )
        .bind(id_text(item))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, row_to_item_role)
    }

    async fn open_pool_task(&self, task: PoolTask) -> StoreResult<PoolTask> {
        let (kind, party_id) = party_columns(&task.party);
        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, task.item).await?;

        let existing = sqlx::query(&format!(
            "SELECT {POOL_COLUMNS} FROM pool_task
             WHERE item = ? AND step = ? AND action = ? AND party_kind = ? AND party_id = ?"
        ))
        .bind(id_text(task.item))
        .bind(task.step.as_str())
        .bind(task.action.as_str())
        .bind(kind)
        .bind(&party_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            tx.rollback().await?;
            return row_to_pool_task(&row);
        }

        sqlx::query(
            "INSERT INTO pool_task (id, item, workflow, step, action, party_kind, party_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id_text(task.id))
        .bind(id_text(task.item))
        .bind(task.workflow.as_str())
        .bind(task.step.as_str())
        .bind(task.action.as_str())
        .bind(kind)
        .bind(&party_id)
        .bind(millis(task.created_at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(task = %task.id, key = %task.key(), party = %task.party, "opened pool task");
        Ok(task)
    }

    async fn pool_by_parties(&self, parties: &[Party]) -> StoreResult<Vec<PoolTask>> {
        if parties.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {POOL_COLUMNS} FROM pool_task WHERE "));
        let mut clauses = builder.separated(" OR ");
        for party in parties {
            let (kind, party_id) = party_columns(party);
            clauses.push("(party_kind = ");
            clauses.push_bind_unseparated(kind);
            clauses.push_unseparated(" AND party_id = ");
            clauses.push_bind_unseparated(party_id);
            clauses.push_unseparated(")");
        }
        builder.push(" ORDER BY created_at, id");

        let rows = builder.build().fetch_all(&self.pool).await?;
        collect(&rows, row_to_pool_task)
    }

    async fn pool_by_item(&self, item: ItemId) -> StoreResult<Vec<PoolTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {POOL_COLUMNS} FROM pool_task WHERE item = ? ORDER BY created_at, id"
        ))
        .bind(id_text(item))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, row_to_pool_task)
    }

    async fn progress_by_actor(&self, actor: ActorId) -> StoreResult<Vec<InProgressUser>> {
        let mut conn = self.pool.acquire().await?;
        progress_of_actor(&mut conn, actor).await
    }

    async fn progress_by_item(&self, item: ItemId) -> StoreResult<Vec<InProgressUser>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM in_progress_user p WHERE p.item = ? ORDER BY step, actor"
        ))
        .bind(id_text(item))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, row_to_progress)
    }

    async fn claim(&self, request: ClaimRequest) -> StoreResult<ClaimOutcome> {
        let ClaimRequest {
            actor,
            key,
            closure,
            claim_id,
            now,
        } = request;

        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, key.item).await?;

        let pool = pool_for_key(&mut tx, &key).await?;
        let claimed = claimed_for_key(&mut tx, &key).await?;
        let progress = progress_of_actor(&mut tx, actor).await?;

        let granted = match decide_claim(actor, &key, &closure, &pool, &claimed, &progress) {
            ClaimDecision::Grant(task) => task,
            decision => {
                tx.rollback().await?;
                return Ok(match decision {
                    ClaimDecision::AlreadyHeld(task) => ClaimOutcome::AlreadyHeld(task),
                    ClaimDecision::Lost { holder } => ClaimOutcome::Lost { holder },
                    _ => ClaimOutcome::NotEligible,
                });
            }
        };

        let task = ClaimedTask {
            id: claim_id,
            item: granted.item,
            workflow: granted.workflow,
            step: granted.step,
            action: granted.action,
            owner: actor,
            created_at: now,
        };
        insert_claimed(&mut tx, &task).await?;
        let released = sqlx::query("DELETE FROM pool_task WHERE item = ? AND step = ? AND action = ?")
            .bind(id_text(key.item))
            .bind(key.step.as_str())
            .bind(key.action.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        engage(&mut tx, &task, now).await?;
        tx.commit().await?;

        debug!(key = %key, actor = %actor, released, "claim committed");
        Ok(ClaimOutcome::Claimed { task, released })
    }

    async fn create_owned(&self, task: ClaimedTask) -> StoreResult<ClaimedTask> {
        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, task.item).await?;

        let key = task.key();
        let held = claimed_for_key(&mut tx, &key)
            .await?
            .into_iter()
            .find(|c| c.owner == task.owner);
        if let Some(existing) = held {
            tx.rollback().await?;
            return Ok(existing);
        }

        insert_claimed(&mut tx, &task).await?;
        engage(&mut tx, &task, task.created_at).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn finish(
        &self,
        actor: ActorId,
        item: ItemId,
        step: &StepId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, item).await?;

        let rows = sqlx::query(&format!(
            "SELECT {CLAIMED_COLUMNS} FROM claimed_task WHERE owner = ? AND item = ? AND step = ?"
        ))
        .bind(id_text(actor))
        .bind(id_text(item))
        .bind(step.as_str())
        .fetch_all(&mut *tx)
        .await?;
        let released = collect(&rows, row_to_claimed)?;
        if released.is_empty() {
            tx.rollback().await?;
            return Ok(released);
        }

        sqlx::query("DELETE FROM claimed_task WHERE owner = ? AND item = ? AND step = ?")
            .bind(id_text(actor))
            .bind(id_text(item))
            .bind(step.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE in_progress_user SET finished = 1, updated_at = ?
             WHERE item = ? AND step = ? AND actor = ?",
        )
        .bind(millis(now))
        .bind(id_text(item))
        .bind(step.as_str())
        .bind(id_text(actor))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(released)
    }

    async fn count_progress(&self, item: ItemId, step: &StepId) -> StoreResult<ProgressCount> {
        let rows = sqlx::query(
            "SELECT finished, COUNT(*) AS n FROM in_progress_user
             WHERE item = ? AND step = ? GROUP BY finished",
        )
        .bind(id_text(item))
        .bind(step.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut count = ProgressCount::default();
        for row in rows {
            let finished: bool = row.try_get("finished")?;
            let n: i64 = row.try_get("n")?;
            if finished {
                count.finished = n as usize;
            } else {
                count.in_progress = n as usize;
            }
        }
        Ok(count)
    }

    async fn close_step(&self, item: ItemId, step: &StepId) -> StoreResult<Cleanup> {
        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, item).await?;

        let pool = sqlx::query("DELETE FROM pool_task WHERE item = ? AND step = ?")
            .bind(id_text(item))
            .bind(step.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        let claimed = sqlx::query("DELETE FROM claimed_task WHERE item = ? AND step = ?")
            .bind(id_text(item))
            .bind(step.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        let in_progress = sqlx::query("DELETE FROM in_progress_user WHERE item = ?")
            .bind(id_text(item))
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        sqlx::query("DELETE FROM engaged_action WHERE item = ?")
            .bind(id_text(item))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Cleanup {
            roles: 0,
            pool,
            claimed,
            in_progress,
        })
    }

    async fn unwrap_item(&self, item: ItemId) -> StoreResult<(WorkflowItem, Cleanup)> {
        let mut tx = self.pool.begin().await?;
        lock_item(&mut tx, item).await?;

        let record = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM workflow_item WHERE id = ?"
        ))
        .bind(id_text(item))
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row_to_item(&row))
        .transpose()?
        .ok_or(StoreError::ItemMissing(item))?;

        let mut cleanup = Cleanup::default();
        for (table, removed) in [
            ("workflow_item_role", &mut cleanup.roles),
            ("pool_task", &mut cleanup.pool),
            ("claimed_task", &mut cleanup.claimed),
            ("in_progress_user", &mut cleanup.in_progress),
        ] {
            *removed = sqlx::query(&format!("DELETE FROM {table} WHERE item = ?"))
                .bind(id_text(item))
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        sqlx::query("DELETE FROM engaged_action WHERE item = ?")
            .bind(id_text(item))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_item WHERE id = ?")
            .bind(id_text(item))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((record, cleanup))
    }

    async fn claimed_by_actor(&self, actor: ActorId) -> StoreResult<Vec<ClaimedTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {CLAIMED_COLUMNS} FROM claimed_task WHERE owner = ? ORDER BY created_at, id"
        ))
        .bind(id_text(actor))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, row_to_claimed)
    }

    async fn claimed_by_item(&self, item: ItemId) -> StoreResult<Vec<ClaimedTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {CLAIMED_COLUMNS} FROM claimed_task WHERE item = ? ORDER BY created_at, id"
        ))
        .bind(id_text(item))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, row_to_claimed)
    }

    async fn totals(&self) -> StoreResult<PoolCounts> {
        Ok(PoolCounts {
            items: count(&self.pool, "SELECT COUNT(*) FROM workflow_item").await?,
            pool_tasks: count(&self.pool, "SELECT COUNT(*) FROM pool_task").await?,
            claimed_tasks: count(&self.pool, "SELECT COUNT(*) FROM claimed_task").await?,
            in_progress: count(
                &self.pool,
                "SELECT COUNT(*) FROM in_progress_user WHERE finished = 0",
            )
            .await?,
            finished: count(
                &self.pool,
                "SELECT COUNT(*) FROM in_progress_user WHERE finished = 1",
            )
            .await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimedTaskId, GroupId, PoolTaskId, WorkflowId};
    use std::collections::BTreeSet;

    async fn store_with_item() -> (SqliteTaskStore, WorkflowItem) {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let item = WorkflowItem::new(
            ItemId::random(),
            CollectionId::random(),
            ActorId::random(),
            ItemFlags {
                multiple_titles: true,
                ..ItemFlags::default()
            },
            Utc::now(),
        );
        store.insert_item(item.clone()).await.unwrap();
        (store, item)
    }

    fn pool_task(key: &TaskKey, party: Party) -> PoolTask {
        PoolTask {
            id: PoolTaskId::random(),
            item: key.item,
            workflow: WorkflowId::new("wf1"),
            step: key.step.clone(),
            action: key.action.clone(),
            party,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn item_round_trips_through_the_table() {
        let (store, item) = store_with_item().await;
        let loaded = store.get_item(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, item.id);
        assert!(loaded.flags.multiple_titles);
        assert_eq!(loaded.created_at.timestamp_millis(), item.created_at.timestamp_millis());

        assert!(matches!(
            store.insert_item(item.clone()).await,
            Err(StoreError::DuplicateItem(_))
        ));
    }

    #[tokio::test]
    async fn claim_consumes_the_key_for_every_party() {
        let (store, item) = store_with_item().await;
        let key = TaskKey::new(item.id, "review", "approve");
        let (g1, g2) = (GroupId::random(), GroupId::random());
        let (alice, bob) = (ActorId::random(), ActorId::random());

        store.open_pool_task(pool_task(&key, g1.into())).await.unwrap();
        store.open_pool_task(pool_task(&key, g2.into())).await.unwrap();

        let won = store
            .claim(ClaimRequest {
                actor: alice,
                key: key.clone(),
                closure: BTreeSet::from([g1]),
                claim_id: ClaimedTaskId::random(),
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert!(matches!(won, ClaimOutcome::Claimed { released: 2, .. }));

        let lost = store
            .claim(ClaimRequest {
                actor: bob,
                key: key.clone(),
                closure: BTreeSet::from([g2]),
                claim_id: ClaimedTaskId::random(),
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(lost, ClaimOutcome::Lost { holder: Some(alice) });
        assert!(store.pool_by_parties(&[g2.into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_and_close_step_clean_up() {
        let (store, item) = store_with_item().await;
        let key = TaskKey::new(item.id, "review", "approve");
        let alice = ActorId::random();
        store.open_pool_task(pool_task(&key, alice.into())).await.unwrap();
        store
            .claim(ClaimRequest {
                actor: alice,
                key: key.clone(),
                closure: BTreeSet::new(),
                claim_id: ClaimedTaskId::random(),
                now: Utc::now(),
            })
            .await
            .unwrap();

        let released = store.finish(alice, item.id, &key.step, Utc::now()).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(
            store.count_progress(item.id, &key.step).await.unwrap(),
            ProgressCount { in_progress: 0, finished: 1 }
        );

        let cleanup = store.close_step(item.id, &key.step).await.unwrap();
        assert_eq!(cleanup.in_progress, 1);
        let totals = store.totals().await.unwrap();
        assert_eq!((totals.in_progress, totals.finished, totals.items), (0, 0, 1));
    }

    #[tokio::test]
    async fn engaged_actions_accumulate_on_one_row() {
        let (store, item) = store_with_item().await;
        let approve = TaskKey::new(item.id, "review", "approve");
        let comment = TaskKey::new(item.id, "review", "comment");
        let (alice, group) = (ActorId::random(), GroupId::random());
        for key in [&approve, &comment] {
            store.open_pool_task(pool_task(key, group.into())).await.unwrap();
            store
                .claim(ClaimRequest {
                    actor: alice,
                    key: key.clone(),
                    closure: BTreeSet::from([group]),
                    claim_id: ClaimedTaskId::random(),
                    now: Utc::now(),
                })
                .await
                .unwrap();
        }

        let rows = store.progress_by_actor(alice).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].actions,
            BTreeSet::from([ActionId::new("approve"), ActionId::new("comment")])
        );

        store.open_pool_task(pool_task(&approve, group.into())).await.unwrap();
        let pool = store.pool_by_parties(&[group.into()]).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert!(!crate::domain::is_offered(&pool[0], alice, &BTreeSet::from([group]), &rows));

        let cleanup = store.unwrap_item(item.id).await.unwrap().1;
        assert_eq!(cleanup.in_progress, 1);
        assert!(store.progress_by_actor(alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_against_missing_item_fail() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let key = TaskKey::new(ItemId::random(), "review", "approve");
        let err = store
            .open_pool_task(pool_task(&key, ActorId::random().into()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ItemMissing(_)));
    }
}
