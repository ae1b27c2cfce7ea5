use sqlx::PgPool;

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS acl_sid (
            id      BIGSERIAL PRIMARY KEY,
            kind    TEXT NOT NULL CHECK (kind IN ('principal', 'authority')),
            name    TEXT NOT NULL,
            UNIQUE (kind, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS acl_object_identity (
            id                  BIGSERIAL PRIMARY KEY,
            object_type         TEXT NOT NULL,
            identifier          BIGINT NOT NULL,
            owner_sid_id        BIGINT NOT NULL REFERENCES acl_sid(id),
            parent_id           BIGINT REFERENCES acl_object_identity(id),
            entries_inheriting  BOOLEAN NOT NULL DEFAULT TRUE,
            UNIQUE (object_type, identifier),
            CHECK (parent_id IS NULL OR parent_id <> id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_acl_object_identity_parent
        ON acl_object_identity (parent_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_acl_object_identity_owner
        ON acl_object_identity (owner_sid_id)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS acl_entry (
            id          BIGSERIAL PRIMARY KEY,
            acl_id      BIGINT NOT NULL REFERENCES acl_object_identity(id) ON DELETE CASCADE,
            sid_id      BIGINT NOT NULL REFERENCES acl_sid(id),
            mask        INTEGER NOT NULL,
            granting    BOOLEAN NOT NULL,
            ace_order   INTEGER NOT NULL,
            UNIQUE (acl_id, ace_order)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_acl_entry_sid
        ON acl_entry (sid_id)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
