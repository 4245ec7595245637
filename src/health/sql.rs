//! Statements used to detect schema drift against the `_vt.schemacopy`
//! shadow table

/// Statements creating the shadow copy, run once per pool lifetime
pub const SCHEMA_COPY_INIT: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS _vt",
    CREATE_SCHEMA_COPY_TABLE,
];

pub const CREATE_SCHEMA_COPY_TABLE: &str = "CREATE TABLE IF NOT EXISTS _vt.schemacopy (
	table_schema varchar(64) NOT NULL,
	table_name varchar(64) NOT NULL,
	column_name varchar(64) NOT NULL,
	ordinal_position bigint(21) unsigned NOT NULL,
	character_set_name varchar(32) DEFAULT NULL,
	collation_name varchar(32) DEFAULT NULL,
	data_type varchar(64) NOT NULL,
	column_key varchar(3) NOT NULL,
	PRIMARY KEY (table_schema, table_name, ordinal_position)) ENGINE=InnoDB";

/// Tables whose column definitions differ between the live schema and the
/// shadow copy. Yields one `table_name` column.
pub const DETECT_SCHEMA_CHANGE: &str = "SELECT DISTINCT table_name
FROM (
	SELECT table_name, column_name, ordinal_position, character_set_name, collation_name, data_type, column_key
	FROM information_schema.columns
	WHERE table_schema = database()

	UNION ALL

	SELECT table_name, column_name, ordinal_position, character_set_name, collation_name, data_type, column_key
	FROM _vt.schemacopy
	WHERE table_schema = database()
) _inner
GROUP BY table_name, column_name, ordinal_position, character_set_name, collation_name, data_type, column_key
HAVING COUNT(*) = 1";

/// Prefix of the delete half of a resync; callers append `AND <predicate>`
pub const CLEAR_SCHEMA_COPY: &str =
    "delete from _vt.schemacopy where table_schema = database()";

/// Prefix of the insert half of a resync; callers append `AND <predicate>`
pub const INSERT_INTO_SCHEMA_COPY: &str = "insert _vt.schemacopy
select table_schema, table_name, column_name, ordinal_position, character_set_name, collation_name, data_type, column_key
from information_schema.columns
where table_schema = database()";
