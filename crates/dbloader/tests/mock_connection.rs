mod common;

use common::{MockConnection, rows, rows_matching};
use dbloader::{Connection, Cx, Dialect, Error, Outcome, Row, Statement, UpdateResult, Value};

fn items() -> Vec<Row> {
    rows(
        &["company_id", "sku"],
        vec![
            vec![Value::BigInt(1), Value::Text("a".into())],
            vec![Value::BigInt(1), Value::Text("b".into())],
            vec![Value::BigInt(2), Value::Text("a".into())],
        ],
    )
}

#[test]
fn rows_matching_filters_by_composite_key() {
    let stmt = Statement::new(
        "SELECT ...",
        vec![
            Value::BigInt(1),
            Value::Text("b".into()),
            Value::BigInt(2),
            Value::Text("a".into()),
        ],
    );
    let found = rows_matching(&stmt, &items(), &["company_id", "sku"]);
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].get("sku"), Some(&Value::Text("b".into())));
    assert_eq!(found[1].get("company_id"), Some(&Value::BigInt(2)));
}

#[test]
fn rows_matching_single_column() {
    let stmt = Statement::new("SELECT ...", vec![Value::BigInt(1)]);
    assert_eq!(rows_matching(&stmt, &items(), &["company_id"]).len(), 2);
}

#[test]
fn records_and_fails_on_request() {
    let conn = MockConnection::new(Dialect::Sqlite);
    conn.fail_next_queries(1);
    let cx = Cx::for_testing();

    let first = futures::executor::block_on(conn.query(&cx, "SELECT 1", &[]));
    assert!(matches!(first, Outcome::Err(Error::Query(_))));
    let second = futures::executor::block_on(conn.query(&cx, "SELECT 2", &[]));
    assert!(matches!(second, Outcome::Ok(ref rows) if rows.is_empty()));
    let write = futures::executor::block_on(conn.execute(&cx, "DELETE FROM t", &[]));
    assert!(matches!(
        write,
        Outcome::Ok(UpdateResult {
            rows_affected: 1,
            ..
        })
    ));

    assert_eq!(conn.sql_log(), vec!["SELECT 1", "SELECT 2", "DELETE FROM t"]);
    assert_eq!(conn.queries().len(), 2);
    conn.clear();
    assert!(conn.statements().is_empty());
}
