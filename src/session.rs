//! Per-session pipeline: schema → generate → execute → narrate.
//!
//! A [`Session`] is built fresh for each connection and owns everything that
//! changes across turns (the schema snapshot and the transcript). It is not
//! shared between users and needs no locking; callers must not start a new
//! turn while one is in flight, which `&mut self` already enforces.

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::db::{ConnectionProfile, Database, PgDatabase, QueryResult, SchemaSnapshot};
use crate::error::{ConnectionError, IntrospectionError, PipelineError};
use crate::export;
use crate::format::format_schema;
use crate::generator::{self, Generation};
use crate::guard;
use crate::llm::LanguageModel;
use crate::narrator;
use crate::transcript::{ConversationTurn, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// No schema fetched yet.
    Idle,
    SchemaReady,
    Generating,
    Executing,
    Narrating,
    Complete,
    Errored,
}

impl TurnState {
    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, SchemaReady)
                | (SchemaReady, SchemaReady)
                | (SchemaReady, Generating)
                | (Generating, Executing)
                | (Generating, Errored)
                | (Generating, Complete)
                | (Executing, Narrating)
                | (Executing, Errored)
                | (Narrating, Complete)
                | (Narrating, Errored)
                | (Complete, SchemaReady)
                | (Errored, SchemaReady)
        )
    }
}

/// How a turn ended. Both variants have already been appended to the transcript.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Answered {
        turn: ConversationTurn,
        /// Rows behind the answer; absent for clarifications.
        result: Option<QueryResult>,
    },
    Errored {
        turn: ConversationTurn,
        error: PipelineError,
        /// Rows that were fetched before narration failed.
        result: Option<QueryResult>,
    },
}

impl TurnOutcome {
    pub fn turn(&self) -> &ConversationTurn {
        match self {
            TurnOutcome::Answered { turn, .. } | TurnOutcome::Errored { turn, .. } => turn,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            TurnOutcome::Answered { .. } => None,
            TurnOutcome::Errored { error, .. } => Some(error),
        }
    }

    pub fn result(&self) -> Option<&QueryResult> {
        match self {
            TurnOutcome::Answered { result, .. } | TurnOutcome::Errored { result, .. } => {
                result.as_ref()
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TurnOutcome::Errored { .. })
    }
}

pub struct Session<D, M> {
    db: D,
    model: M,
    options: PipelineConfig,
    schema: Option<SchemaSnapshot>,
    schema_text: String,
    transcript: Transcript,
    state: TurnState,
    trace: Vec<TurnState>,
}

impl<M: LanguageModel> Session<PgDatabase, M> {
    /// Open a PostgreSQL connection and start a session on it.
    pub async fn connect(
        profile: ConnectionProfile,
        model: M,
        options: PipelineConfig,
    ) -> Result<Self, ConnectionError> {
        let db = PgDatabase::connect(profile).await?;
        Ok(Self::new(db, model, options))
    }
}

impl<D: Database, M: LanguageModel> Session<D, M> {
    pub fn new(db: D, model: M, options: PipelineConfig) -> Self {
        Self {
            db,
            model,
            options,
            schema: None,
            schema_text: String::new(),
            transcript: Transcript::new(),
            state: TurnState::Idle,
            trace: vec![TurnState::Idle],
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// States visited by the most recent turn, starting with the state it began in.
    pub fn last_turn_trace(&self) -> &[TurnState] {
        &self.trace
    }

    pub fn schema(&self) -> Option<&SchemaSnapshot> {
        self.schema.as_ref()
    }

    /// The schema as the model sees it.
    pub fn schema_text(&self) -> &str {
        &self.schema_text
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Reinstate a transcript the caller persisted earlier.
    pub fn restore_transcript(&mut self, transcript: Transcript) {
        self.transcript = transcript;
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    fn advance(&mut self, next: TurnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "turn state");
        self.state = next;
        self.trace.push(next);
    }

    /// Re-read the schema from the catalog, replacing the cached snapshot.
    ///
    /// On failure the previous snapshot, if any, stays in place.
    pub async fn fetch_schema(&mut self) -> Result<&SchemaSnapshot, IntrospectionError> {
        let snapshot = self.db.fetch_schema(&self.options.namespace).await?;
        self.schema_text = format_schema(&snapshot);
        info!(tables = snapshot.tables.len(), "schema ready");
        self.state = TurnState::SchemaReady;
        self.trace.push(TurnState::SchemaReady);
        Ok(self.schema.insert(snapshot))
    }

    fn finish_errored(
        &mut self,
        error: PipelineError,
        sql: Option<String>,
        result: Option<QueryResult>,
    ) -> TurnOutcome {
        self.advance(TurnState::Errored);
        warn!(kind = ?error.kind(), "turn failed: {}", error);
        let rows = result.as_ref().map(export::to_json);
        let turn = self.transcript.push_error(&error, sql, rows).clone();
        self.advance(TurnState::SchemaReady);
        TurnOutcome::Errored {
            turn,
            error,
            result,
        }
    }

    fn finish_answered(
        &mut self,
        text: String,
        sql: Option<String>,
        result: Option<QueryResult>,
    ) -> TurnOutcome {
        self.advance(TurnState::Complete);
        let turn = self.transcript.push_answer(text, sql).clone();
        self.advance(TurnState::SchemaReady);
        TurnOutcome::Answered { turn, result }
    }

    /// Run one turn for `request`.
    ///
    /// Every failure inside the turn is reported as [`TurnOutcome::Errored`]
    /// and recorded in the transcript; `Err` only means the request was blank
    /// and no turn was started.
    pub async fn ask(&mut self, request: &str) -> Result<TurnOutcome, PipelineError> {
        let request = request.trim();
        if request.is_empty() {
            return Err(PipelineError::EmptyRequest);
        }

        self.trace = vec![self.state];
        self.transcript.push_user(request);

        if self.schema.is_none() {
            if let Err(e) = self.fetch_schema().await {
                let error = PipelineError::from(e);
                warn!("schema unavailable: {}", error);
                let turn = self.transcript.push_error(&error, None, None).clone();
                return Ok(TurnOutcome::Errored {
                    turn,
                    error,
                    result: None,
                });
            }
        }

        self.advance(TurnState::Generating);
        let query = match generator::generate_query(&self.model, &self.schema_text, request).await
        {
            Ok(Generation::Query(query)) => query,
            Ok(Generation::Clarification(text)) => {
                return Ok(self.finish_answered(text, None, None));
            }
            Err(e) => return Ok(self.finish_errored(e.into(), None, None)),
        };

        let verdict = match &self.schema {
            Some(schema) if self.options.verify_identifiers => {
                guard::verify_statement(&query.sql, schema)
            }
            _ => Ok(()),
        };
        if let Err(e) = verdict {
            return Ok(self.finish_errored(e.into(), Some(query.sql), None));
        }

        self.advance(TurnState::Executing);
        let result = match self.db.execute(&query.sql).await.into_outcome() {
            Ok(result) => result,
            Err(e) => return Ok(self.finish_errored(e.into(), Some(query.sql), None)),
        };
        info!(
            rows = result.row_count,
            affected = ?result.affected_rows,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "query executed"
        );

        self.advance(TurnState::Narrating);
        match narrator::narrate(
            &self.model,
            &query.sql,
            &result,
            self.options.max_narration_rows,
        )
        .await
        {
            Ok(text) => Ok(self.finish_answered(text, Some(query.sql), Some(result))),
            Err(e) => Ok(self.finish_errored(e.into(), Some(query.sql), Some(result))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CellValue, ColumnDescriptor, ExecutionError, TableDescriptor};
    use crate::error::{ErrorKind, GenerationError, LlmError};
    use crate::llm::{CompletionRequest, ResponseFormat};
    use crate::transcript::Speaker;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use TurnState::*;

    struct FakeDb {
        schema: Result<SchemaSnapshot, IntrospectionError>,
        results: Mutex<VecDeque<QueryResult>>,
        executed: Mutex<Vec<String>>,
        fetches: AtomicUsize,
    }

    impl FakeDb {
        fn new(schema: SchemaSnapshot, results: Vec<QueryResult>) -> Self {
            Self {
                schema: Ok(schema),
                results: Mutex::new(results.into()),
                executed: Mutex::new(vec![]),
                fetches: AtomicUsize::new(0),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Database for FakeDb {
        async fn fetch_schema(&self, _namespace: &str) -> Result<SchemaSnapshot, IntrospectionError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.schema.clone()
        }

        async fn execute(&self, sql: &str) -> QueryResult {
            self.executed.lock().unwrap().push(sql.to_string());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(QueryResult::empty)
        }
    }

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<&str, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                requests: Mutex::new(vec![]),
            }
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    fn orders_schema() -> SchemaSnapshot {
        SchemaSnapshot {
            namespace: "public".to_string(),
            tables: vec![TableDescriptor {
                table_name: "orders".to_string(),
                columns: vec![
                    ColumnDescriptor {
                        name: "id".to_string(),
                        data_type: "integer".to_string(),
                        nullable: false,
                        foreign_key: None,
                    },
                    ColumnDescriptor {
                        name: "total".to_string(),
                        data_type: "numeric".to_string(),
                        nullable: true,
                        foreign_key: None,
                    },
                ],
            }],
        }
    }

    fn count_42() -> QueryResult {
        QueryResult::from_rows(&["count"], vec![vec![CellValue::Int64(42)]])
    }

    const COUNT_ORDERS: &str = r#"{"query":"select count(*) from \"orders\""}"#;

    fn session(
        db: FakeDb,
        model: ScriptedModel,
        options: PipelineConfig,
    ) -> Session<FakeDb, ScriptedModel> {
        Session::new(db, model, options)
    }

    #[test]
    fn test_transition_table() {
        assert!(Idle.can_transition_to(SchemaReady));
        assert!(Executing.can_transition_to(Errored));
        assert!(Narrating.can_transition_to(Errored));
        assert!(Errored.can_transition_to(SchemaReady));
        assert!(!Executing.can_transition_to(Complete));
        assert!(!Idle.can_transition_to(Generating));
        assert!(!SchemaReady.can_transition_to(Errored));
        assert!(!Complete.can_transition_to(Idle));
    }

    #[tokio::test]
    async fn test_count_orders_end_to_end() {
        let db = FakeDb::new(orders_schema(), vec![count_42()]);
        let model = ScriptedModel::new(vec![
            Ok(COUNT_ORDERS),
            Ok("There are 42 orders in the database."),
        ]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("how many orders are there").await.unwrap();
        assert!(!outcome.is_error());
        let turn = outcome.turn();
        assert!(turn.text.contains("42"));
        assert_eq!(turn.role, Speaker::Assistant);
        assert_eq!(turn.sql.as_deref(), Some("select count(*) from \"orders\""));
        assert_eq!(outcome.result().unwrap().row_count, 1);

        assert_eq!(
            s.last_turn_trace(),
            &[Idle, SchemaReady, Generating, Executing, Narrating, Complete, SchemaReady]
        );
        assert_eq!(s.state(), SchemaReady);
        assert_eq!(s.database().executed(), vec!["select count(*) from \"orders\""]);

        let requests = s.model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].format, ResponseFormat::Json);
        assert!(requests[0].messages[1]
            .content
            .contains("Table: orders\nColumns: id (integer), total (numeric)"));
        assert_eq!(requests[1].format, ResponseFormat::Text);
        assert!(requests[1].messages[0].content.contains(r#"[{"count":42}]"#));

        let turns = s.transcript().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Speaker::User);
        assert_eq!(turns[0].text, "how many orders are there");
    }

    #[tokio::test]
    async fn test_unknown_relation_skips_narration() {
        let failure = QueryResult::error(
            ExecutionError::from_message("relation \"customers\" does not exist"),
            std::time::Duration::from_millis(2),
        );
        let db = FakeDb::new(orders_schema(), vec![failure]);
        let model = ScriptedModel::new(vec![Ok(r#"{"query":"select * from \"customers\""}"#)]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("list customers").await.unwrap();
        let error = outcome.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::UnknownRelation);
        assert_eq!(error.to_string(), "relation \"customers\" does not exist");

        let turn = outcome.turn();
        assert!(turn.text.contains("relation \"customers\" does not exist"));
        assert_eq!(turn.sql.as_deref(), Some("select * from \"customers\""));
        assert!(turn.rows.is_none());

        // only the generation call reached the model
        assert_eq!(s.model.requests().len(), 1);
        assert!(!s.last_turn_trace().contains(&Narrating));
        assert_eq!(
            s.last_turn_trace(),
            &[Idle, SchemaReady, Generating, Executing, Errored, SchemaReady]
        );
    }

    #[tokio::test]
    async fn test_syntax_error_is_classified() {
        let failure = QueryResult::error(
            ExecutionError::from_message("syntax error at or near \"form\""),
            std::time::Duration::ZERO,
        );
        let db = FakeDb::new(orders_schema(), vec![failure]);
        let model = ScriptedModel::new(vec![Ok(r#"{"query":"select * form \"orders\""}"#)]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("all orders").await.unwrap();
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::Syntax);
        assert_eq!(s.state(), SchemaReady);
    }

    #[tokio::test]
    async fn test_empty_schema_still_generates() {
        let db = FakeDb::new(SchemaSnapshot::default(), vec![]);
        let model = ScriptedModel::new(vec![Ok("There are no tables to query.")]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("how many orders are there").await.unwrap();
        assert!(s.schema().unwrap().is_empty());
        assert_eq!(s.schema_text(), "");
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::Generation);
        assert_eq!(s.model.requests().len(), 1);
        assert!(s.database().executed().is_empty());
        assert_eq!(s.state(), SchemaReady);
    }

    #[tokio::test]
    async fn test_clarification_completes_without_execution() {
        let db = FakeDb::new(SchemaSnapshot::default(), vec![]);
        let model = ScriptedModel::new(vec![Ok(
            r#"{"query": "", "clarification": "This database has no tables yet."}"#,
        )]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("how many orders are there").await.unwrap();
        assert!(!outcome.is_error());
        assert_eq!(outcome.turn().text, "This database has no tables yet.");
        assert!(outcome.turn().sql.is_none());
        assert!(outcome.result().is_none());
        assert!(s.database().executed().is_empty());
        assert_eq!(
            s.last_turn_trace(),
            &[Idle, SchemaReady, Generating, Complete, SchemaReady]
        );
    }

    #[tokio::test]
    async fn test_narration_failure_keeps_sql_and_rows() {
        let db = FakeDb::new(orders_schema(), vec![count_42()]);
        let model = ScriptedModel::new(vec![
            Ok(COUNT_ORDERS),
            Err(LlmError::Request("rate limited".into())),
        ]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("how many orders are there").await.unwrap();
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::Narration);
        let turn = outcome.turn();
        assert_eq!(turn.sql.as_deref(), Some("select count(*) from \"orders\""));
        assert_eq!(turn.rows, Some(serde_json::json!([{ "count": 42 }])));
        assert_eq!(outcome.result().unwrap().row_count, 1);
        assert_eq!(
            s.last_turn_trace(),
            &[Idle, SchemaReady, Generating, Executing, Narrating, Errored, SchemaReady]
        );
    }

    #[tokio::test]
    async fn test_generation_failure_is_not_retried() {
        let db = FakeDb::new(orders_schema(), vec![]);
        let model = ScriptedModel::new(vec![Ok("sure! select count(*) from orders")]);
        let mut s = session(db, model, PipelineConfig::default());

        let outcome = s.ask("how many orders").await.unwrap();
        assert!(matches!(
            outcome.error(),
            Some(PipelineError::Generation(GenerationError::Malformed { .. }))
        ));
        assert!(outcome.turn().sql.is_none());
        assert_eq!(s.model.requests().len(), 1);
        assert_eq!(
            s.last_turn_trace(),
            &[Idle, SchemaReady, Generating, Errored, SchemaReady]
        );
    }

    #[tokio::test]
    async fn test_schema_is_reused_across_turns() {
        let db = FakeDb::new(orders_schema(), vec![count_42(), count_42()]);
        let model = ScriptedModel::new(vec![
            Ok(COUNT_ORDERS),
            Ok("42 orders."),
            Ok(COUNT_ORDERS),
            Ok("Still 42."),
        ]);
        let mut s = session(db, model, PipelineConfig::default());

        s.ask("how many orders").await.unwrap();
        s.ask("and now?").await.unwrap();
        assert_eq!(s.database().fetches.load(Ordering::SeqCst), 1);
        assert_eq!(s.last_turn_trace()[0], SchemaReady);
        assert_eq!(s.transcript().len(), 4);

        s.fetch_schema().await.unwrap();
        assert_eq!(s.database().fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_schema_is_repeatable() {
        let db = FakeDb::new(orders_schema(), vec![]);
        let mut s = session(db, ScriptedModel::new(vec![]), PipelineConfig::default());

        let first = s.fetch_schema().await.unwrap().clone();
        let first_text = s.schema_text().to_string();
        let second = s.fetch_schema().await.unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(first_text, s.schema_text());
        assert_eq!(s.state(), SchemaReady);
    }

    #[tokio::test]
    async fn test_introspection_failure_yields_error_turn() {
        let mut db = FakeDb::new(SchemaSnapshot::default(), vec![]);
        db.schema = Err(IntrospectionError {
            namespace: "public".to_string(),
            message: "permission denied for schema public".to_string(),
        });
        let mut s = session(db, ScriptedModel::new(vec![]), PipelineConfig::default());

        let outcome = s.ask("how many orders").await.unwrap();
        assert_eq!(outcome.error().unwrap().kind(), ErrorKind::Introspection);
        assert!(outcome.turn().text.contains("permission denied"));
        assert_eq!(s.state(), Idle);
        assert!(s.model.requests().is_empty());

        // the next turn tries the catalog again
        s.ask("how many orders").await.unwrap();
        assert_eq!(s.database().fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_blank_request_starts_no_turn() {
        let db = FakeDb::new(orders_schema(), vec![]);
        let mut s = session(db, ScriptedModel::new(vec![]), PipelineConfig::default());

        assert_eq!(s.ask("   ").await.unwrap_err(), PipelineError::EmptyRequest);
        assert!(s.transcript().is_empty());
        assert_eq!(s.database().fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identifier_check_blocks_unknown_table() {
        let db = FakeDb::new(orders_schema(), vec![]);
        let model = ScriptedModel::new(vec![Ok(r#"{"query":"select * from \"customers\""}"#)]);
        let options = PipelineConfig {
            verify_identifiers: true,
            ..PipelineConfig::default()
        };
        let mut s = session(db, model, options);

        let outcome = s.ask("list customers").await.unwrap();
        assert_eq!(
            outcome.error(),
            Some(&PipelineError::Generation(GenerationError::UnknownIdentifier(
                "customers".to_string()
            )))
        );
        assert_eq!(outcome.turn().sql.as_deref(), Some("select * from \"customers\""));
        assert!(s.database().executed().is_empty());
    }

    #[tokio::test]
    async fn test_identifier_check_allows_known_table() {
        let db = FakeDb::new(orders_schema(), vec![count_42()]);
        let model = ScriptedModel::new(vec![Ok(COUNT_ORDERS), Ok("42.")]);
        let options = PipelineConfig {
            verify_identifiers: true,
            ..PipelineConfig::default()
        };
        let mut s = session(db, model, options);

        let outcome = s.ask("how many orders").await.unwrap();
        assert!(!outcome.is_error());
        assert_eq!(s.database().executed().len(), 1);
    }

    #[tokio::test]
    async fn test_restored_transcript_is_appended_to() {
        let mut earlier = Transcript::new();
        earlier.push_user("hello");
        earlier.push_answer("hi".to_string(), None);

        let db = FakeDb::new(orders_schema(), vec![count_42()]);
        let model = ScriptedModel::new(vec![Ok(COUNT_ORDERS), Ok("42 orders.")]);
        let mut s = session(db, model, PipelineConfig::default());
        s.restore_transcript(earlier);

        let outcome = s.ask("how many orders").await.unwrap();
        assert_eq!(outcome.turn().id, 4);
        assert_eq!(s.transcript().len(), 4);
    }
}
