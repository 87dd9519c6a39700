//! Database module: connection setup and schema creation via SeaORM.
//!
//! MySQL is the reference engine; tests run against in-memory SQLite. The
//! only dialect differences live in the DDL below (auto-increment ids and
//! prefix lengths on wide unique keys).

pub mod entities;

use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr,
    Statement,
};

use crate::config::DbConfig;

/// Connect and make sure the schema exists.
pub async fn init_database(cfg: &DbConfig) -> Result<DatabaseConnection, DbErr> {
    let mut opts = ConnectOptions::new(cfg.url.clone());
    opts.max_connections(cfg.max_conn)
        .min_connections(cfg.max_idle_conn)
        .sqlx_logging(false);
    let db = Database::connect(opts).await?;
    create_tables(&db).await?;
    Ok(db)
}

fn id_column(backend: DatabaseBackend, wide: bool) -> &'static str {
    match backend {
        DatabaseBackend::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        _ => {
            if wide {
                "id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"
            } else {
                "id INT NOT NULL AUTO_INCREMENT PRIMARY KEY"
            }
        }
    }
}

async fn exec(db: &DatabaseConnection, sql: String) -> Result<(), DbErr> {
    db.execute(Statement::from_string(db.get_database_backend(), sql))
        .await?;
    Ok(())
}

/// Create all tables if they don't exist.
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let sqlite = backend == DatabaseBackend::Sqlite;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS speed_node (
            {},
            instance_id VARCHAR(128) NOT NULL,
            host VARCHAR(255) NOT NULL,
            port INT NOT NULL,
            online BOOLEAN NOT NULL,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            UNIQUE (instance_id, online)
        )
        "#,
            id_column(backend, false)
        ),
    )
    .await?;

    // The identity key is wide; MySQL needs a prefix on `name` to stay under
    // the index size limit.
    let record_unique = if sqlite {
        "UNIQUE (datatype, org, repo, name, etag)"
    } else {
        "UNIQUE KEY uk_file_record (datatype, org, repo, name(191), etag)"
    };
    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS file_record (
            {},
            datatype VARCHAR(16) NOT NULL,
            org VARCHAR(128) NOT NULL,
            repo VARCHAR(128) NOT NULL,
            name VARCHAR(512) NOT NULL,
            etag VARCHAR(64) NOT NULL,
            file_size BIGINT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            {}
        )
        "#,
            id_column(backend, true),
            record_unique
        ),
    )
    .await?;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS file_progress (
            {},
            record_id BIGINT NOT NULL,
            instance_id VARCHAR(128) NOT NULL,
            offset_num BIGINT NOT NULL,
            status INT NOT NULL,
            master_instance_id VARCHAR(128) NOT NULL DEFAULT '',
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            UNIQUE (record_id, instance_id)
        )
        "#,
            id_column(backend, true)
        ),
    )
    .await?;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS cache_job (
            {},
            type INT NOT NULL,
            instance_id VARCHAR(128) NOT NULL,
            datatype VARCHAR(16) NOT NULL,
            org VARCHAR(128) NOT NULL,
            repo VARCHAR(128) NOT NULL,
            used_storage BIGINT NOT NULL DEFAULT 0,
            status INT NOT NULL DEFAULT 0,
            error_msg TEXT NOT NULL,
            process DOUBLE NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )
        "#,
            id_column(backend, true)
        ),
    )
    .await?;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS repository (
            {},
            instance_id VARCHAR(128) NOT NULL,
            datatype VARCHAR(16) NOT NULL,
            org VARCHAR(128) NOT NULL,
            repo VARCHAR(128) NOT NULL,
            org_repo VARCHAR(255) NOT NULL,
            like_num INT NOT NULL DEFAULT 0,
            download_num INT NOT NULL DEFAULT 0,
            pipeline_tag_id VARCHAR(128) NOT NULL DEFAULT '',
            pipeline_tag VARCHAR(128) NOT NULL DEFAULT '',
            last_modified VARCHAR(64) NOT NULL DEFAULT '',
            used_storage BIGINT NOT NULL DEFAULT 0,
            sha VARCHAR(64) NOT NULL DEFAULT '',
            status INT NOT NULL DEFAULT 0,
            error_msg TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            UNIQUE (instance_id, datatype, org, repo)
        )
        "#,
            id_column(backend, true)
        ),
    )
    .await?;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS repository_tag (
            {},
            repo_id BIGINT NOT NULL,
            tag_id VARCHAR(128) NOT NULL
        )
        "#,
            id_column(backend, true)
        ),
    )
    .await?;

    exec(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS tag (
            id VARCHAR(128) PRIMARY KEY,
            label VARCHAR(255) NOT NULL,
            type VARCHAR(64) NOT NULL,
            sub_type VARCHAR(64) NOT NULL DEFAULT ''
        )
        "#
        .to_string(),
    )
    .await?;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS organization (
            {},
            name VARCHAR(128) NOT NULL,
            icon VARCHAR(255) NOT NULL DEFAULT '',
            UNIQUE (name)
        )
        "#,
            id_column(backend, true)
        ),
    )
    .await?;

    exec(
        db,
        format!(
            r#"
        CREATE TABLE IF NOT EXISTS hub_token (
            {},
            token VARCHAR(255) NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
            id_column(backend, true)
        ),
    )
    .await?;

    // Non-unique lookup indexes. MySQL lacks IF NOT EXISTS here, so they are
    // declared only for SQLite; production schemas carry them via migration.
    if sqlite {
        for sql in [
            "CREATE INDEX IF NOT EXISTS idx_progress_record ON file_progress(record_id)",
            "CREATE INDEX IF NOT EXISTS idx_progress_instance ON file_progress(instance_id)",
            "CREATE INDEX IF NOT EXISTS idx_repo_tag_repo ON repository_tag(repo_id)",
            "CREATE INDEX IF NOT EXISTS idx_job_instance ON cache_job(instance_id)",
        ] {
            exec(db, sql.to_string()).await?;
        }
    }

    tracing::info!("database schema ready");
    Ok(())
}

#[cfg(test)]
pub async fn test_db() -> DatabaseConnection {
    // One pooled connection: every pooled handle to `sqlite::memory:` would
    // otherwise see its own empty database.
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.expect("connect in-memory sqlite");
    create_tables(&db).await.expect("create tables");
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::EntityTrait;

    #[tokio::test]
    async fn test_schema_creates_and_is_idempotent() {
        let db = test_db().await;
        create_tables(&db).await.unwrap();
        let nodes = entities::speed_node::Entity::find().all(&db).await.unwrap();
        assert!(nodes.is_empty());
    }
}
