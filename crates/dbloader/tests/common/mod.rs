#![allow(dead_code)]

mod mock;

pub use mock::{MockConnection, RecordedStatement, StatementKind, rows, rows_matching};

use asupersync::runtime::RuntimeBuilder;
use dbloader::{
    Cx, Dialect, Error, Loader, ManualScheduler, Outcome, Relation, Result, Row, Table, ToOne,
    UniqueKey, Value,
};
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

impl Table for Company {
    type Key = i64;
    const TABLE_NAME: &'static str = "companies";
    const COLUMNS: &'static [&'static str] = &["id", "name", "parent_id"];
    const KEY_COLUMNS: &'static [&'static str] = &["id"];

    fn key(&self) -> i64 {
        self.id
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            parent_id: row.get_named("parent_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub company_id: i64,
    pub sku: String,
    pub name: String,
}

impl Table for Item {
    type Key = (i64, String);
    const TABLE_NAME: &'static str = "items";
    const COLUMNS: &'static [&'static str] = &["company_id", "sku", "name"];
    const KEY_COLUMNS: &'static [&'static str] = &["company_id", "sku"];

    fn key(&self) -> (i64, String) {
        (self.company_id, self.sku.clone())
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            company_id: row.get_named("company_id")?,
            sku: row.get_named("sku")?,
            name: row.get_named("name")?,
        })
    }
}

/// Companies by their unique name.
pub struct CompanyByName;

impl UniqueKey for CompanyByName {
    type Table = Company;
    type Key = String;
    const NAME: &'static str = "companies_by_name";
    const KEY_COLUMNS: &'static [&'static str] = &["name"];

    fn unique_key(entity: &Company) -> String {
        entity.name.clone()
    }
}

/// Company -> its items.
pub struct CompanyItems;

impl Relation for CompanyItems {
    type Source = Company;
    type Target = Item;
    type SourceKey = i64;
    const NAME: &'static str = "company_items";
    const TARGET_COLUMNS: &'static [&'static str] = &["company_id"];

    fn source_key(source: &Company) -> i64 {
        source.id
    }

    fn reverse_key(target: &Item) -> i64 {
        target.company_id
    }
}

/// Item -> owning company.
pub struct ItemCompany;

impl ToOne for ItemCompany {
    type Source = Item;
    type Target = Company;
    const NAME: &'static str = "item_company";

    fn target_key(source: &Item) -> Option<i64> {
        Some(source.company_id)
    }
}

/// Company -> parent company, when it has one.
pub struct ParentCompany;

impl ToOne for ParentCompany {
    type Source = Company;
    type Target = Company;
    const NAME: &'static str = "parent_company";

    fn target_key(source: &Company) -> Option<i64> {
        source.parent_id
    }
}

pub fn item_key(company_id: i64, sku: &str) -> (i64, String) {
    (company_id, sku.to_string())
}

pub fn company_rows() -> Vec<Row> {
    rows(
        Company::COLUMNS,
        vec![
            vec![Value::BigInt(1), Value::Text("Acme".into()), Value::Null],
            vec![Value::BigInt(2), Value::Text("Globex".into()), Value::BigInt(1)],
            vec![Value::BigInt(3), Value::Text("Initech".into()), Value::Null],
        ],
    )
}

pub fn item_rows() -> Vec<Row> {
    rows(
        Item::COLUMNS,
        vec![
            vec![Value::BigInt(1), Value::Text("abc".into()), Value::Text("Widget".into())],
            vec![Value::BigInt(1), Value::Text("def".into()), Value::Text("Gadget".into())],
            vec![Value::BigInt(2), Value::Text("ghi".into()), Value::Text("Sprocket".into())],
        ],
    )
}

/// Answers generated batch queries from the fixture tables.
///
/// Ad-hoc item queries (unquoted `FROM items`) return every item row.
pub fn answer(stmt: &dbloader::Statement) -> Result<Vec<Row>> {
    let sql = stmt.sql.as_str();
    if sql.contains(r#"FROM "companies" WHERE "name""#) {
        return Ok(rows_matching(stmt, &company_rows(), &["name"]));
    }
    if sql.contains(r#"FROM "companies""#) {
        return Ok(rows_matching(stmt, &company_rows(), &["id"]));
    }
    if sql.contains(r#"FROM "items" WHERE ("company_id", "sku")"#) {
        return Ok(rows_matching(stmt, &item_rows(), &["company_id", "sku"]));
    }
    if sql.contains(r#"FROM "items" WHERE "company_id""#) {
        return Ok(rows_matching(stmt, &item_rows(), &["company_id"]));
    }
    if sql.contains("FROM items") {
        return Ok(item_rows());
    }
    Ok(Vec::new())
}

pub fn fixture_connection() -> MockConnection {
    MockConnection::new(Dialect::Postgres).on_query(answer)
}

/// Drive `fut` to completion on a fresh current-thread runtime.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(fut)
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(err) => err,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub struct Harness {
    pub conn: MockConnection,
    pub scheduler: ManualScheduler,
    pub loader: Loader<MockConnection>,
}

impl Harness {
    pub fn new(conn: MockConnection) -> Self {
        let scheduler = ManualScheduler::new();
        let loader = Loader::new(Cx::for_testing(), conn.clone(), Arc::new(scheduler.clone()));
        Self {
            conn,
            scheduler,
            loader,
        }
    }

    pub fn fixture() -> Self {
        Self::new(fixture_connection())
    }

    /// Run the dispatch loop until the scheduler queue is empty.
    pub async fn drain(&self) -> usize {
        self.scheduler.run_pending().await
    }
}
