//! Catalog and result directives against a canned backend.

use async_trait::async_trait;
use pgshell::catalog;
use pgshell::prelude::*;
use pgshell_pg::CancelToken;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn output(columns: &[&str], rows: &[&[Option<&str>]]) -> QueryOutput {
    QueryOutput {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: rows
            .iter()
            .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
            .collect(),
        command_tag: Some(format!("SELECT {}", rows.len())),
        notices: vec![],
    }
}

struct Wakeup(Arc<Notify>);

#[async_trait]
impl CancelChannel for Wakeup {
    async fn send_cancel(&self, _token: CancelToken) -> Result<(), SessionError> {
        self.0.notify_one();
        Ok(())
    }
}

/// Answers known SQL from a table; `blocking` runs until cancelled.
struct CannedBackend {
    answers: HashMap<String, QueryOutput>,
    blocking: Option<String>,
    cancelled: Arc<Notify>,
}

impl CannedBackend {
    fn new() -> Self {
        let orders = TableRef::parse("sales.orders").unwrap();
        let mut answers = HashMap::new();
        answers.insert(
            catalog::LIST_TABLES.to_string(),
            output(
                &["nspname", "relname", "case", "greatest"],
                &[
                    &[Some("public"), Some("users"), Some("table"), Some("3")],
                    &[Some("sales"), Some("orders"), Some("table"), Some("120")],
                ],
            ),
        );
        answers.insert(
            catalog::table_query(&orders),
            output(&["table_type", "obj_description"], &[&[Some("BASE TABLE"), Some("orders placed")]]),
        );
        answers.insert(
            catalog::columns_query(&orders),
            output(
                &["column_name", "data_type", "is_nullable", "column_default", "exists"],
                &[
                    &[Some("id"), Some("integer"), Some("NO"), None, Some("t")],
                    &[Some("user_id"), Some("integer"), Some("YES"), None, Some("f")],
                ],
            ),
        );
        answers.insert(
            catalog::foreign_keys_query(&orders),
            output(
                &["column_name", "table_schema", "table_name", "column_name"],
                &[&[Some("user_id"), Some("public"), Some("users"), Some("id")]],
            ),
        );
        answers.insert(
            catalog::table_query(&TableRef::parse("ghost").unwrap()),
            output(&["table_type", "obj_description"], &[]),
        );
        answers.insert(
            "SELECT id, note FROM notes;".to_string(),
            output(
                &["id", "note"],
                &[&[Some("1"), Some("hello, world")], &[Some("2"), None]],
            ),
        );
        answers.insert("SELECT 1 WHERE false;".to_string(), output(&["?column?"], &[]));

        Self {
            answers,
            blocking: None,
            cancelled: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl ConnectionHandle for CannedBackend {
    async fn execute(&mut self, sql: &str) -> SessionResult<QueryOutput> {
        if self.blocking.as_deref() == Some(sql) {
            self.cancelled.notified().await;
            return Err(SessionError::Cancelled(
                "canceling statement due to user request".to_string(),
            ));
        }
        self.answers
            .get(sql)
            .cloned()
            .ok_or_else(|| SessionError::Query(format!("unexpected statement {:?}", sql)))
    }

    fn canceller(&self) -> Canceller {
        Canceller::new(CancelToken::new(1, 2), Arc::new(Wakeup(Arc::clone(&self.cancelled))))
    }

    async fn close(&mut self) -> SessionResult<()> {
        Ok(())
    }
}

struct Script(VecDeque<String>);

#[async_trait]
impl CommandSource for Script {
    async fn next_command(&mut self) -> SessionResult<Option<String>> {
        Ok(self.0.pop_front())
    }
}

#[derive(Default)]
struct Recorder(Vec<Outcome>);

#[async_trait]
impl ResultSink for Recorder {
    async fn report(&mut self, outcome: &Outcome) {
        self.0.push(outcome.clone());
    }
}

async fn run(backend: CannedBackend, lines: &[&str]) -> Vec<Outcome> {
    let session = Session::new(backend);
    let mut source = Script(lines.iter().map(|l| l.to_string()).collect());
    let mut sink = Recorder::default();
    session.run(&mut source, &mut sink).await.unwrap();
    sink.0
}

#[tokio::test]
async fn tables_and_schema_list_catalog_rows() {
    let outcomes = run(CannedBackend::new(), &["/t", "/schema", "/quit"]).await;

    let Outcome::Tables(tables) = &outcomes[0] else {
        panic!("expected tables, got {:?}", outcomes[0]);
    };
    assert_eq!(
        tables.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
        vec!["users", "orders"]
    );
    assert_eq!(tables[1].estimated_rows, 120);
    assert!(matches!(&outcomes[1], Outcome::Schema(t) if t == tables));
}

#[tokio::test]
async fn describe_reports_columns_and_foreign_keys() {
    let outcomes = run(
        CannedBackend::new(),
        &["/describe sales.orders", "/d ghost", "/d", "/quit"],
    )
    .await;

    let Outcome::Described(desc) = &outcomes[0] else {
        panic!("expected a description, got {:?}", outcomes[0]);
    };
    assert_eq!(desc.table.to_string(), "sales.orders");
    assert_eq!(desc.kind, "table");
    assert_eq!(desc.comment.as_deref(), Some("orders placed"));
    assert_eq!(desc.columns.len(), 2);
    assert!(desc.columns[0].primary_key);
    assert_eq!(desc.foreign_keys[0].foreign_table, "users");

    assert_eq!(
        outcomes[1],
        Outcome::QueryFailed {
            message: "table public.ghost not found".to_string()
        }
    );
    assert_eq!(
        outcomes[2],
        Outcome::Rejected {
            message: "usage: /describe <table>".to_string()
        }
    );
}

#[tokio::test]
async fn save_and_browse_use_the_last_result_set() {
    let path = std::env::temp_dir().join(format!("pgshell_notes_{}.csv", std::process::id()));
    let target = path.to_string_lossy().to_string();
    let save = format!("/save {}", target);

    let outcomes = run(
        CannedBackend::new(),
        &[
            "/save",
            "SELECT id, note FROM notes;",
            "/t",
            save.as_str(),
            "/b",
            "SELECT 1 WHERE false;",
            "/browse",
            "/quit",
        ],
    )
    .await;

    assert!(matches!(&outcomes[0], Outcome::Rejected { message } if message.contains("run a query first")));
    assert_eq!(
        outcomes[3],
        Outcome::Saved {
            path: path.clone(),
            rows: 2,
            columns: 2
        }
    );
    let written = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(written, "id,note\n1,\"hello, world\"\n2,\n");

    // Catalog listings in between do not replace the last result.
    match &outcomes[4] {
        Outcome::Browse { sql, output } => {
            assert_eq!(sql, "SELECT id, note FROM notes;");
            assert_eq!(output.rows.len(), 2);
        }
        other => panic!("expected browse, got {:?}", other),
    }
    assert!(matches!(&outcomes[6], Outcome::Rejected { message } if message.contains("no rows")));
}

#[tokio::test]
async fn save_refuses_parent_directory() {
    let outcomes = run(
        CannedBackend::new(),
        &["SELECT id, note FROM notes;", "/save ../notes", "/quit"],
    )
    .await;
    assert!(matches!(&outcomes[1], Outcome::Rejected { message } if message.contains("path traversal")));
}

#[tokio::test]
async fn interrupt_cancels_catalog_listing() {
    let mut backend = CannedBackend::new();
    backend.blocking = Some(catalog::LIST_TABLES.to_string());
    let session = Session::new(backend);
    let machine = session.machine();
    let relay = session.relay();

    let interrupter = tokio::spawn(async move {
        while machine.state() != SessionState::Executing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        relay.on_interrupt()
    });

    let mut source = Script(["/tables", "SELECT id, note FROM notes;", "/quit"]
        .iter()
        .map(|l| l.to_string())
        .collect());
    let mut sink = Recorder::default();
    tokio::time::timeout(Duration::from_secs(5), session.run(&mut source, &mut sink))
        .await
        .expect("listing was not cancelled")
        .unwrap();

    assert_eq!(interrupter.await.unwrap(), CancelDecision::Requested);
    assert!(matches!(sink.0[0], Outcome::Cancelled { .. }));
    assert!(matches!(sink.0[1], Outcome::Rows { .. }));
}
