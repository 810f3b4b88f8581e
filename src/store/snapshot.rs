//! Snapshot and overlay of the tasks database.
//!
//! A step runs against a private copy of the tasks store. The copy is a
//! structured table-by-table clone through SQLite's `ATTACH` (schema read
//! from `sqlite_master`, `INSERT INTO ... SELECT`, index re-creation),
//! never a raw file copy, which is unsafe with an in-flight writer. On
//! step success the mutated copy is overlaid back onto the canonical
//! database inside a single transaction.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};

use crate::error::{CoreError, CoreResult};

/// A user table name plus its `CREATE` statement.
struct TableDef {
    name: String,
    sql: String,
}

/// Clone the database at `source_db` into a fresh database at `dest_db`.
///
/// The destination must not already contain user tables. The clone is
/// transactionally consistent even while another connection writes to the
/// source.
///
/// # Errors
///
/// Returns `Host` when either database cannot be opened or the copy fails.
pub async fn snapshot_to(source_db: &Path, dest_db: &Path) -> CoreResult<()> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", dest_db.display()))
        .map_err(|e| CoreError::Host(format!("invalid snapshot path: {e}")))?
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await?;

    attach(&mut conn, source_db, "src").await?;
    let copy = async {
        sqlx::query("BEGIN").execute(&mut conn).await?;

        let tables = schema_objects(&mut conn, "src", "table").await?;
        for table in &tables {
            sqlx::raw_sql(&table.sql).execute(&mut conn).await?;
            let name = quote_ident(&table.name);
            sqlx::raw_sql(&format!("INSERT INTO main.{name} SELECT * FROM src.{name}"))
                .execute(&mut conn)
                .await?;
        }
        for index in schema_objects(&mut conn, "src", "index").await? {
            sqlx::raw_sql(&index.sql).execute(&mut conn).await?;
        }

        sqlx::query("COMMIT").execute(&mut conn).await?;
        Ok::<(), CoreError>(())
    }
    .await;

    let _ = sqlx::query("DETACH DATABASE src").execute(&mut conn).await;
    conn.close().await?;
    copy
}

/// Overlay the contents of `snapshot_db` onto the canonical database
/// behind `canonical`, table by table, in one transaction.
///
/// The snapshot must have the same table set as the canonical database;
/// a divergent schema aborts with no change.
///
/// # Errors
///
/// Returns `Host` on schema divergence or storage failure; the canonical
/// database is untouched on error.
pub async fn overlay_from(canonical: &SqlitePool, snapshot_db: &Path) -> CoreResult<()> {
    let mut conn = canonical.acquire().await?;

    attach(&mut *conn, snapshot_db, "snap").await?;
    let copy = async {
        let canonical_tables = schema_objects(&mut *conn, "main", "table").await?;
        let snapshot_tables = schema_objects(&mut *conn, "snap", "table").await?;
        for snap_table in &snapshot_tables {
            if !canonical_tables.iter().any(|t| t.name == snap_table.name) {
                return Err(CoreError::Host(format!(
                    "snapshot has unknown table {:?}; refusing overlay",
                    snap_table.name
                )));
            }
        }

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        // Deletes and re-inserts happen in arbitrary table order.
        sqlx::query("PRAGMA defer_foreign_keys = ON")
            .execute(&mut *conn)
            .await?;
        for table in &snapshot_tables {
            let name = quote_ident(&table.name);
            sqlx::raw_sql(&format!("DELETE FROM main.{name}"))
                .execute(&mut *conn)
                .await?;
            sqlx::raw_sql(&format!("INSERT INTO main.{name} SELECT * FROM snap.{name}"))
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query("COMMIT").execute(&mut *conn).await?;
        Ok::<(), CoreError>(())
    }
    .await;

    if copy.is_err() {
        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
    }
    let _ = sqlx::query("DETACH DATABASE snap").execute(&mut *conn).await;
    copy
}

async fn attach(conn: &mut SqliteConnection, db: &Path, alias: &str) -> CoreResult<()> {
    // ATTACH cannot run inside a transaction, so it brackets the copy.
    sqlx::query(&format!("ATTACH DATABASE ?1 AS {alias}"))
        .bind(db.display().to_string())
        .execute(conn)
        .await?;
    Ok(())
}

async fn schema_objects(
    conn: &mut SqliteConnection,
    schema: &str,
    kind: &str,
) -> CoreResult<Vec<TableDef>> {
    let rows = sqlx::query(&format!(
        "SELECT name, sql FROM {schema}.sqlite_master \
         WHERE type = ?1 AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL \
         ORDER BY name",
    ))
    .bind(kind)
    .fetch_all(conn)
    .await?;
    rows.into_iter()
        .map(|row| {
            Ok(TableDef {
                name: row.try_get("name")?,
                sql: row.try_get("sql")?,
            })
        })
        .collect()
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
