//! MySQL driver on top of `sqlx-mysql`.
//!
//! Only single connections are used from sqlx; pooling, retry and health
//! checks live in this crate.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde_json::{Value, json};
use sqlx_core::Either;
use sqlx_core::column::Column;
use sqlx_core::connection::{ConnectOptions, Connection};
use sqlx_core::error::Error as SqlxError;
use sqlx_core::executor::{Execute, Executor};
use sqlx_core::query::query;
use sqlx_core::row::Row as _;
use sqlx_core::type_info::TypeInfo;
use sqlx_core::value::ValueRef;
use sqlx_mysql::{MySql, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};

use crate::config::DbConfig;
use crate::connection::{Connector, DbConnection};
use crate::error::{DbError, QueryErrorKind, Result};
use crate::types::{Row, RowSet, SqlParam};

/// Opens MySQL connections from a [`DbConfig`].
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    target: String,
}

impl MySqlConnector {
    pub fn new(config: &DbConfig) -> Self {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .charset(&config.charset);
        if !config.user.is_empty() {
            options = options.username(&config.user);
        }
        if !config.password.is_empty() {
            options = options.password(&config.password);
        }
        if !config.database.is_empty() {
            options = options.database(&config.database);
        }

        Self {
            options,
            target: config.display_url(),
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>> {
        let conn = self.options.connect().await?;
        Ok(Box::new(MySqlDbConnection { conn }))
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// A single live MySQL connection.
#[derive(Debug)]
pub struct MySqlDbConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl DbConnection for MySqlDbConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<RowSet> {
        if params.is_empty() {
            // Plain text protocol: no server-side prepare for parameterless
            // statements.
            return run(&mut self.conn, sql).await;
        }

        let mut statement = query::<MySql>(sql);
        for param in params {
            statement = match param {
                SqlParam::Null => statement.bind(None::<i64>),
                SqlParam::Bool(v) => statement.bind(*v),
                SqlParam::Int(v) => statement.bind(*v),
                SqlParam::UInt(v) => statement.bind(*v),
                SqlParam::Float(v) => statement.bind(*v),
                SqlParam::Text(v) => statement.bind(v.clone()),
            };
        }
        run(&mut self.conn, statement).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

async fn run<'q, E>(conn: &mut MySqlConnection, statement: E) -> Result<RowSet>
where
    E: 'q + Execute<'q, MySql>,
{
    let mut set = RowSet::default();
    let mut results = conn.fetch_many(statement);

    while let Some(step) = results.try_next().await? {
        match step {
            Either::Left(done) => {
                set.affected_rows += done.rows_affected();
                let id = done.last_insert_id();
                if id != 0 {
                    set.last_insert_id = Some(id);
                }
            }
            Either::Right(row) => set.rows.push(row_to_json(&row)?),
        }
    }

    Ok(set)
}

fn row_to_json(row: &MySqlRow) -> Result<Row> {
    let mut out = Row::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = decode_column(row, column.ordinal(), column.type_info().name())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn decode_column(row: &MySqlRow, index: usize, type_name: &str) -> Result<Value> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOLEAN" => json!(row.try_get_unchecked::<i64, _>(index)? != 0),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            json!(row.try_get_unchecked::<i64, _>(index)?)
        }
        name if name.ends_with("UNSIGNED") || name == "YEAR" || name == "BIT" => {
            json!(row.try_get_unchecked::<u64, _>(index)?)
        }
        "FLOAT" => json!(row.try_get_unchecked::<f32, _>(index)?),
        "DOUBLE" => json!(row.try_get_unchecked::<f64, _>(index)?),
        // Exact decimals stay strings so no precision is lost.
        "DECIMAL" => json!(row.try_get_unchecked::<String, _>(index)?),
        "JSON" => {
            let text = row.try_get_unchecked::<String, _>(index)?;
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        "DATETIME" | "TIMESTAMP" => json!(
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)?
                .format("%Y-%m-%d %H:%M:%S%.f")
                .to_string()
        ),
        "DATE" => json!(row.try_get_unchecked::<chrono::NaiveDate, _>(index)?.to_string()),
        "TIME" => match row.try_get_unchecked::<chrono::NaiveTime, _>(index) {
            Ok(time) => json!(time.to_string()),
            // Durations outside a clock day.
            Err(_) => lossy_text(row, index)?,
        },
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            json!(hex::encode(row.try_get_unchecked::<Vec<u8>, _>(index)?))
        }
        _ => match row.try_get_unchecked::<String, _>(index) {
            Ok(text) => json!(text),
            Err(_) => lossy_text(row, index)?,
        },
    };

    Ok(value)
}

fn lossy_text(row: &MySqlRow, index: usize) -> Result<Value> {
    let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
    Ok(json!(String::from_utf8_lossy(&bytes)))
}

/// Maps a MySQL server error number onto the error taxonomy.
pub fn classify_server_error(number: u16, message: impl Into<String>) -> DbError {
    match number {
        // ER_PARSE_ERROR, ER_SYNTAX_ERROR
        1064 | 1149 => DbError::query(QueryErrorKind::Syntax, message),
        // ER_DUP_ENTRY, ER_DUP_ENTRY_WITH_KEY_NAME, ER_DUP_UNIQUE
        1062 | 1586 | 1169 => DbError::query(QueryErrorKind::DuplicateKey, message),
        // ER_ROW_IS_REFERENCED(_2), ER_NO_REFERENCED_ROW(_2)
        1451 | 1452 | 1216 | 1217 => DbError::query(QueryErrorKind::ForeignKey, message),
        // Server gone away, lost during query, disconnect notices, shutdown,
        // aborted or broken packets, too many connections.
        2006 | 2013 | 4031 | 1053 | 1927 | 1159 | 1161 | 1040 => {
            DbError::connection_lost(message)
        }
        _ => DbError::query(QueryErrorKind::Other, message),
    }
}

impl From<SqlxError> for DbError {
    fn from(err: SqlxError) -> Self {
        match err {
            SqlxError::Database(db_err) => match db_err.try_downcast_ref::<MySqlDatabaseError>() {
                Some(mysql) => classify_server_error(mysql.number(), mysql.message()),
                None => DbError::query(QueryErrorKind::Other, db_err.message()),
            },
            SqlxError::Io(e) => DbError::connection_lost(e.to_string()),
            SqlxError::Tls(e) => DbError::connection_lost(format!("TLS error: {e}")),
            SqlxError::Protocol(msg) => DbError::connection_lost(format!("protocol error: {msg}")),
            SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::WorkerCrashed => {
                DbError::connection_lost(err.to_string())
            }
            SqlxError::Configuration(e) => DbError::config(e.to_string()),
            other => DbError::query(QueryErrorKind::Other, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_classification() {
        let kind = |number| match classify_server_error(number, "x") {
            DbError::Query { kind, .. } => Some(kind),
            _ => None,
        };

        assert_eq!(kind(1064), Some(QueryErrorKind::Syntax));
        assert_eq!(kind(1062), Some(QueryErrorKind::DuplicateKey));
        assert_eq!(kind(1452), Some(QueryErrorKind::ForeignKey));
        assert_eq!(kind(1213), Some(QueryErrorKind::Other));

        assert!(matches!(
            classify_server_error(2013, "Lost connection to MySQL server during query"),
            DbError::ConnectionLost { .. }
        ));
        assert!(classify_server_error(1205, "Lock wait timeout exceeded").is_retryable());
        assert!(!classify_server_error(1064, "You have an error in your SQL syntax").is_retryable());
    }

    #[test]
    fn test_transport_errors_are_connection_losses() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: DbError = SqlxError::Io(io).into();
        assert!(matches!(err, DbError::ConnectionLost { .. }));
        assert!(err.discards_connection());

        let err: DbError = SqlxError::Protocol("unexpected packet".into()).into();
        assert!(matches!(err, DbError::ConnectionLost { .. }));
    }

    #[test]
    fn test_connector_describe_masks_password() {
        let config = DbConfig::new("db.internal", "stamps").with_credentials("app", "s3cret");
        let connector = MySqlConnector::new(&config);
        let target = connector.describe();
        assert!(target.contains("db.internal"));
        assert!(!target.contains("s3cret"));
    }
}
