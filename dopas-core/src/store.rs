//! Session store and turn repository over PostgreSQL.
//!
//! The one hard transactional boundary of the system lives here: a turn and
//! all of its tool rows commit atomically or not at all. History loading
//! fans out per turn (N+1); the ordering guarantee matters more than the
//! query count at this scale.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::agent::{HistorySource, TurnSink};
use crate::error::DopasError;
use crate::models::{
    NewTurn, SessionRow, ToolInvocationRow, ToolResultRow, TurnRecord, TurnRow,
};

#[derive(Debug, Clone)]
pub struct PgTurnStore {
    pool: PgPool,
}

impl PgTurnStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Look up a session by its opaque client key, creating it on first use.
    pub async fn get_or_create_session(
        &self,
        session_key: &str,
    ) -> Result<SessionRow, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let session = get_or_create_session_tx(&mut tx, session_key).await?;
        tx.commit().await?;
        Ok(session)
    }

    /// Persist one turn with its tool invocations and results atomically.
    pub async fn persist_turn(
        &self,
        turn: NewTurn,
        session_key: Option<&str>,
    ) -> Result<TurnRow, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let session_db_id = match session_key {
            Some(key) => Some(get_or_create_session_tx(&mut tx, key).await?.id),
            None => None,
        };

        let turn_row: TurnRow = sqlx::query_as(
            r#"
            INSERT INTO model_outputs (session_id, role, answer)
            VALUES ($1, $2, $3)
            RETURNING id, session_id, role, answer, created_at, updated_at
            "#,
        )
        .bind(session_db_id)
        .bind(&turn.role)
        .bind(&turn.answer)
        .fetch_one(&mut *tx)
        .await?;

        for invocation in &turn.invocations {
            sqlx::query(
                r#"
                INSERT INTO tool_responses (model_output_id, name, args, tool_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(turn_row.id)
            .bind(&invocation.name)
            .bind(&invocation.args)
            .bind(&invocation.tool_id)
            .execute(&mut *tx)
            .await?;
        }

        for result in &turn.results {
            sqlx::query(
                r#"
                INSERT INTO tool_call_results (model_output_id, tool_id, tool, content)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(turn_row.id)
            .bind(&result.tool_id)
            .bind(&result.tool)
            .bind(&result.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            turn_id = turn_row.id,
            invocations = turn.invocations.len(),
            results = turn.results.len(),
            "Persisted turn"
        );

        Ok(turn_row)
    }

    /// Load the ordered history of a session, each turn enriched with its
    /// tool rows. An unknown session key is an empty history, not an error.
    pub async fn load_history(&self, session_key: &str) -> Result<Vec<TurnRecord>, sqlx::Error> {
        let session: Option<SessionRow> = sqlx::query_as(
            "SELECT id, session_id, created_at, updated_at FROM sessions WHERE session_id = $1",
        )
        .bind(session_key)
        .fetch_optional(&self.pool)
        .await?;

        let session = match session {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };

        let turns: Vec<TurnRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, role, answer, created_at, updated_at
            FROM model_outputs
            WHERE session_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(session.id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(turns.len());
        for turn in turns {
            records.push(self.enrich_turn(turn).await?);
        }
        Ok(records)
    }

    /// Fetch one turn with its tool rows.
    pub async fn get_turn(&self, id: i32) -> Result<Option<TurnRecord>, sqlx::Error> {
        let turn: Option<TurnRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, role, answer, created_at, updated_at
            FROM model_outputs WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match turn {
            Some(t) => Ok(Some(self.enrich_turn(t).await?)),
            None => Ok(None),
        }
    }

    /// Update the mutable fields of a turn (explicit path; the core flow
    /// only creates).
    pub async fn update_turn(
        &self,
        id: i32,
        role: Option<&str>,
        answer: Option<&str>,
    ) -> Result<Option<TurnRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            UPDATE model_outputs
            SET role = $2, answer = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, session_id, role, answer, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(role)
        .bind(answer)
        .fetch_optional(&self.pool)
        .await
    }

    /// Delete a turn; child tool rows go with it (cascade).
    pub async fn delete_turn(&self, id: i32) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM model_outputs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All turns across all sessions, ordered by creation time.
    pub async fn list_turns(&self) -> Result<Vec<TurnRow>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT id, session_id, role, answer, created_at, updated_at
            FROM model_outputs
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    async fn enrich_turn(&self, turn: TurnRow) -> Result<TurnRecord, sqlx::Error> {
        let invocations: Vec<ToolInvocationRow> = sqlx::query_as(
            r#"
            SELECT id, model_output_id, name, args, tool_id, created_at
            FROM tool_responses
            WHERE model_output_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(turn.id)
        .fetch_all(&self.pool)
        .await?;

        let results: Vec<ToolResultRow> = sqlx::query_as(
            r#"
            SELECT id, model_output_id, tool_id, tool, content, created_at
            FROM tool_call_results
            WHERE model_output_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(turn.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(TurnRecord {
            turn,
            invocations,
            results,
        })
    }
}

async fn get_or_create_session_tx(
    tx: &mut Transaction<'_, Postgres>,
    session_key: &str,
) -> Result<SessionRow, sqlx::Error> {
    let existing: Option<SessionRow> = sqlx::query_as(
        "SELECT id, session_id, created_at, updated_at FROM sessions WHERE session_id = $1",
    )
    .bind(session_key)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(session) = existing {
        return Ok(session);
    }

    sqlx::query_as(
        r#"
        INSERT INTO sessions (session_id)
        VALUES ($1)
        RETURNING id, session_id, created_at, updated_at
        "#,
    )
    .bind(session_key)
    .fetch_one(&mut **tx)
    .await
}

// The store is the production implementation of both orchestrator ports.

#[async_trait]
impl HistorySource for PgTurnStore {
    async fn load_history(&self, session_key: &str) -> Result<Vec<TurnRecord>, DopasError> {
        Ok(PgTurnStore::load_history(self, session_key).await?)
    }
}

#[async_trait]
impl TurnSink for PgTurnStore {
    async fn persist_turn(
        &self,
        turn: NewTurn,
        session_key: Option<&str>,
    ) -> Result<TurnRow, DopasError> {
        Ok(PgTurnStore::persist_turn(self, turn, session_key).await?)
    }
}
