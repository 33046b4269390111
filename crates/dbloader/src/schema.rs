//! What the loader needs to know about tables and relations.
//!
//! Entity types implement [`Table`]; marker types implement [`Relation`]
//! (one source row to many target rows), [`ToOne`] (a source row pointing
//! at one target row) or [`UniqueKey`] (a secondary lookup key).
//! Caller-defined batch sources implement [`BatchLoader`].

use dbloader_core::{Connection, Cx, Dialect, Error, Outcome, Result, Row, SqlKey, Statement};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::{Hash, Hasher};

/// A table whose rows are cached by primary key.
pub trait Table: Sized + Send + Sync + 'static {
    /// Primary key; a tuple for composite keys.
    type Key: SqlKey;

    const TABLE_NAME: &'static str;

    /// Columns selected by generated queries, in `from_row` order.
    const COLUMNS: &'static [&'static str];

    /// Primary key columns, one per element of `Key`.
    const KEY_COLUMNS: &'static [&'static str];

    fn key(&self) -> Self::Key;

    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Query fetching every row whose key is in `keys`.
    fn build_in_query(dialect: Dialect, keys: &[Self::Key]) -> Statement {
        select_in(
            dialect,
            Self::TABLE_NAME,
            Self::COLUMNS,
            Self::KEY_COLUMNS,
            keys,
        )
    }
}

/// A unique key of a table other than its primary key.
///
/// Lookups by a unique key batch like primary-key lookups and hand out the
/// same instances: every row loaded for the table, by any index, is also
/// entered into each of its registered unique-key indices.
pub trait UniqueKey: Send + Sync + 'static {
    type Table: Table;
    type Key: SqlKey;

    const NAME: &'static str;

    /// Columns of the key, one per element of `Key`.
    const KEY_COLUMNS: &'static [&'static str];

    fn unique_key(entity: &Self::Table) -> Self::Key;

    /// Query fetching every row whose unique key is in `keys`.
    fn build_in_query(dialect: Dialect, keys: &[Self::Key]) -> Statement {
        select_in(
            dialect,
            <Self::Table as Table>::TABLE_NAME,
            <Self::Table as Table>::COLUMNS,
            Self::KEY_COLUMNS,
            keys,
        )
    }
}

/// A to-many relation from `Source` rows to the `Target` rows that
/// reference them.
pub trait Relation: Send + Sync + 'static {
    type Source: Table;
    type Target: Table;

    /// The value target rows share with their source row.
    type SourceKey: SqlKey;

    const NAME: &'static str;

    /// Target columns holding the source key.
    const TARGET_COLUMNS: &'static [&'static str];

    fn source_key(source: &Self::Source) -> Self::SourceKey;

    /// Which source a target row belongs to.
    fn reverse_key(target: &Self::Target) -> Self::SourceKey;

    /// Query fetching every target row of the given sources.
    fn build_in_query(dialect: Dialect, keys: &[Self::SourceKey]) -> Statement {
        select_in(
            dialect,
            <Self::Target as Table>::TABLE_NAME,
            <Self::Target as Table>::COLUMNS,
            Self::TARGET_COLUMNS,
            keys,
        )
    }
}

/// A to-one relation: a source row holding the key of a target row.
///
/// Resolved through the target's entity cache, so parent lookups batch
/// together with plain `find`s on the same table.
pub trait ToOne: Send + Sync + 'static {
    type Source: Table;
    type Target: Table;

    const NAME: &'static str;

    /// The referenced key, or `None` when the reference is NULL.
    fn target_key(source: &Self::Source) -> Option<<Self::Target as Table>::Key>;
}

/// A caller-defined batch source.
///
/// Requests for keys of one loader type are collected like entity
/// requests; each batch round hands every pending key to
/// [`load_now`](Self::load_now) at once.
pub trait BatchLoader<C: Connection>: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Name used in logs and in [`Error::Flushed`].
    const NAME: &'static str;

    /// Fetch values for `keys`. Keys missing from the returned map
    /// resolve to [`null_value`](Self::null_value).
    fn load_now(
        &self,
        cx: &Cx,
        conn: &C,
        keys: &[Self::Key],
    ) -> impl Future<Output = Outcome<HashMap<Self::Key, Self::Value>, Error>> + Send;

    fn null_value(&self) -> Self::Value;

    /// Whether a write to `table` invalidates this loader's cache.
    fn is_related(&self, table: TableId) -> bool {
        let _ = table;
        true
    }
}

/// Identity of a [`Table`] type.
#[derive(Clone, Copy)]
pub struct TableId {
    type_id: TypeId,
    name: &'static str,
}

impl TableId {
    pub fn of<T: Table>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::TABLE_NAME,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: Table>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for TableId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for TableId {}

impl Hash for TableId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl Debug for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableId({})", self.name)
    }
}

/// Render `SELECT <columns> FROM <table> WHERE <key_columns> IN (...)`.
///
/// Multi-column keys use a row-value comparison:
/// `(a, b) IN ((?, ?), (?, ?))`. Parameters follow the order of `keys`.
/// An empty key list renders a query that matches nothing.
pub fn select_in<K: SqlKey>(
    dialect: Dialect,
    table: &str,
    columns: &[&str],
    key_columns: &[&str],
    keys: &[K],
) -> Statement {
    debug_assert_eq!(
        K::ARITY,
        key_columns.len(),
        "key arity does not match key columns of {table}"
    );

    let quoted_columns = quote_list(dialect, columns);
    let mut sql = format!(
        "SELECT {} FROM {}",
        quoted_columns,
        dialect.quote_identifier(table)
    );

    if keys.is_empty() {
        sql.push_str(" WHERE 1 = 0");
        return Statement::new(sql, Vec::new());
    }

    let target = if key_columns.len() == 1 {
        dialect.quote_identifier(key_columns[0])
    } else {
        format!("({})", quote_list(dialect, key_columns))
    };

    let mut params = Vec::with_capacity(keys.len() * K::ARITY);
    let mut tuples = Vec::with_capacity(keys.len());
    for key in keys {
        let start = params.len();
        key.push_values(&mut params);
        let slots: Vec<String> = (start..params.len())
            .map(|i| dialect.placeholder(i + 1))
            .collect();
        if slots.len() == 1 {
            tuples.push(slots.join(""));
        } else {
            tuples.push(format!("({})", slots.join(", ")));
        }
    }

    sql.push_str(&format!(" WHERE {} IN ({})", target, tuples.join(", ")));
    Statement::new(sql, params)
}

fn quote_list(dialect: Dialect, names: &[&str]) -> String {
    names
        .iter()
        .map(|name| dialect.quote_identifier(name))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbloader_core::Value;

    #[test]
    fn single_column_in_query() {
        let stmt = select_in(
            Dialect::Postgres,
            "companies",
            &["id", "name"],
            &["id"],
            &[3_i64, 1, 2],
        );
        assert_eq!(
            stmt.sql,
            r#"SELECT "id", "name" FROM "companies" WHERE "id" IN ($1, $2, $3)"#
        );
        assert_eq!(
            stmt.params,
            vec![Value::BigInt(3), Value::BigInt(1), Value::BigInt(2)]
        );
    }

    #[test]
    fn composite_key_uses_row_values() {
        let keys = vec![(1_i64, "abc".to_string()), (2_i64, "ghi".to_string())];
        let stmt = select_in(
            Dialect::Mysql,
            "items",
            &["company_id", "sku", "name"],
            &["company_id", "sku"],
            &keys,
        );
        assert_eq!(
            stmt.sql,
            "SELECT `company_id`, `sku`, `name` FROM `items` \
             WHERE (`company_id`, `sku`) IN ((?, ?), (?, ?))"
        );
        assert_eq!(
            stmt.params,
            vec![
                Value::BigInt(1),
                Value::Text("abc".into()),
                Value::BigInt(2),
                Value::Text("ghi".into()),
            ]
        );
    }

    #[test]
    fn sqlite_placeholders_are_numbered_across_tuples() {
        let keys = vec![(1_i32, 2_i32), (3, 4)];
        let stmt = select_in(Dialect::Sqlite, "t", &["a", "b"], &["a", "b"], &keys);
        assert!(stmt.sql.ends_with(r#"IN ((?1, ?2), (?3, ?4))"#));
    }

    #[test]
    fn empty_key_list_matches_nothing() {
        let stmt = select_in::<i64>(Dialect::Postgres, "t", &["id"], &["id"], &[]);
        assert_eq!(stmt.sql, r#"SELECT "id" FROM "t" WHERE 1 = 0"#);
        assert!(stmt.params.is_empty());
    }
}
