use std::collections::HashMap;

use hieracl_core::{AclId, EntryId, ObjectIdentity, Sid, SidId};

use crate::traits::{AclRow, EntryRow, IdentityRow, NewEntry, StorageError};

const PRINCIPAL: &str = "principal";
const AUTHORITY: &str = "authority";

pub(crate) fn to_storage_error(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return StorageError::Duplicate(db_err.message().to_string());
    }
    StorageError::Internal(e.to_string())
}

fn sid_kind(sid: &Sid) -> &'static str {
    match sid {
        Sid::Principal(_) => PRINCIPAL,
        Sid::Authority(_) => AUTHORITY,
    }
}

fn decode_sid(kind: &str, name: String) -> Result<Sid, StorageError> {
    let decoded = match kind {
        PRINCIPAL => Sid::principal(name),
        AUTHORITY => Sid::authority(name),
        other => return Err(StorageError::Internal(format!("unknown sid kind '{other}'"))),
    };
    decoded.map_err(|e| StorageError::Internal(e.to_string()))
}

fn decode_identity(object_type: String, identifier: i64) -> Result<ObjectIdentity, StorageError> {
    ObjectIdentity::new(object_type, identifier).map_err(|e| StorageError::Internal(e.to_string()))
}

// o.id, o.object_type, o.identifier, o.parent_id, o.entries_inheriting,
// owner kind, owner name, e.id, e.mask, e.granting, e.ace_order, sid kind, sid name
type JoinedRow = (
    i64,
    String,
    i64,
    Option<i64>,
    bool,
    String,
    String,
    Option<i64>,
    Option<i32>,
    Option<bool>,
    Option<i32>,
    Option<String>,
    Option<String>,
);

const SELECT_ACL_ROWS: &str = r#"
    SELECT o.id, o.object_type, o.identifier, o.parent_id, o.entries_inheriting,
           os.kind, os.name,
           e.id, e.mask, e.granting, e.ace_order,
           es.kind, es.name
    FROM acl_object_identity o
    JOIN acl_sid os ON os.id = o.owner_sid_id
    LEFT JOIN acl_entry e ON e.acl_id = o.id
    LEFT JOIN acl_sid es ON es.id = e.sid_id
"#;

/// Folds the identity/entry join back into one row per ACL. Relies on the
/// query ordering rows of the same ACL contiguously and by `ace_order`.
fn group_rows(joined: Vec<JoinedRow>) -> Result<Vec<AclRow>, StorageError> {
    let mut rows: Vec<AclRow> = Vec::new();

    for (
        id,
        object_type,
        identifier,
        parent_id,
        entries_inheriting,
        owner_kind,
        owner_name,
        entry_id,
        mask,
        granting,
        ace_order,
        sid_kind,
        sid_name,
    ) in joined
    {
        let id = AclId::new(id);
        if rows.last().is_none_or(|r| r.id != id) {
            rows.push(AclRow {
                id,
                object_identity: decode_identity(object_type, identifier)?,
                owner: decode_sid(&owner_kind, owner_name)?,
                parent_id: parent_id.map(AclId::new),
                entries_inheriting,
                entries: Vec::new(),
            });
        }

        if let (Some(entry_id), Some(mask), Some(granting), Some(order), Some(kind), Some(name)) =
            (entry_id, mask, granting, ace_order, sid_kind, sid_name)
            && let Some(row) = rows.last_mut()
        {
            row.entries.push(EntryRow {
                id: EntryId::new(entry_id),
                sid: decode_sid(&kind, name)?,
                mask,
                granting,
                order,
            });
        }
    }

    Ok(rows)
}

pub async fn fetch_acl_rows<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    identities: &[ObjectIdentity],
) -> Result<Vec<AclRow>, StorageError> {
    let types: Vec<&str> = identities.iter().map(|i| i.object_type()).collect();
    let identifiers: Vec<i64> = identities.iter().map(|i| i.identifier()).collect();

    let query = format!(
        r#"{SELECT_ACL_ROWS}
           JOIN (SELECT DISTINCT * FROM UNNEST($1::text[], $2::bigint[])) AS req(object_type, identifier)
             ON req.object_type = o.object_type AND req.identifier = o.identifier
           ORDER BY o.identifier ASC, o.id ASC, e.ace_order ASC"#
    );

    let joined: Vec<JoinedRow> = sqlx::query_as(&query)
        .bind(&types)
        .bind(&identifiers)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    group_rows(joined)
}

pub async fn fetch_acl_rows_by_id<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    ids: &[AclId],
) -> Result<Vec<AclRow>, StorageError> {
    let ids: Vec<i64> = ids.iter().map(|id| id.value()).collect();

    let query = format!(
        r#"{SELECT_ACL_ROWS}
           WHERE o.id = ANY($1)
           ORDER BY o.id ASC, e.ace_order ASC"#
    );

    let joined: Vec<JoinedRow> = sqlx::query_as(&query)
        .bind(&ids)
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;

    group_rows(joined)
}

pub async fn insert_missing_sids<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    sids: &[Sid],
) -> Result<(), StorageError> {
    let kinds: Vec<&str> = sids.iter().map(sid_kind).collect();
    let names: Vec<&str> = sids.iter().map(|s| s.name()).collect();

    sqlx::query(
        r#"
        INSERT INTO acl_sid (kind, name)
        SELECT * FROM UNNEST($1::text[], $2::text[])
        ON CONFLICT (kind, name) DO NOTHING
        "#,
    )
    .bind(&kinds)
    .bind(&names)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(())
}

pub async fn select_sid_ids<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    sids: &[Sid],
) -> Result<HashMap<Sid, SidId>, StorageError> {
    let kinds: Vec<&str> = sids.iter().map(sid_kind).collect();
    let names: Vec<&str> = sids.iter().map(|s| s.name()).collect();

    let rows: Vec<(i64, String, String)> = sqlx::query_as(
        r#"
        SELECT s.id, s.kind, s.name
        FROM acl_sid s
        JOIN UNNEST($1::text[], $2::text[]) AS req(kind, name)
          ON req.kind = s.kind AND req.name = s.name
        "#,
    )
    .bind(&kinds)
    .bind(&names)
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    rows.into_iter()
        .map(|(id, kind, name)| Ok((decode_sid(&kind, name)?, SidId::new(id))))
        .collect()
}

pub async fn find_sid<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    sid: &Sid,
) -> Result<Option<SidId>, StorageError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM acl_sid WHERE kind = $1 AND name = $2")
        .bind(sid_kind(sid))
        .bind(sid.name())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(row.map(|(id,)| SidId::new(id)))
}

type IdentityTuple = (i64, String, i64, i64, Option<i64>, bool);

const SELECT_IDENTITY: &str = r#"
    SELECT id, object_type, identifier, owner_sid_id, parent_id, entries_inheriting
    FROM acl_object_identity
"#;

fn to_identity_row(
    (id, object_type, identifier, owner, parent, entries_inheriting): IdentityTuple,
) -> Result<IdentityRow, StorageError> {
    Ok(IdentityRow {
        id: AclId::new(id),
        object_identity: decode_identity(object_type, identifier)?,
        owner_sid_id: SidId::new(owner),
        parent_id: parent.map(AclId::new),
        entries_inheriting,
    })
}

pub async fn find_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    identity: &ObjectIdentity,
) -> Result<Option<IdentityRow>, StorageError> {
    let query = format!("{SELECT_IDENTITY} WHERE object_type = $1 AND identifier = $2");
    let row: Option<IdentityTuple> = sqlx::query_as(&query)
        .bind(identity.object_type())
        .bind(identity.identifier())
        .fetch_optional(executor)
        .await
        .map_err(to_storage_error)?;
    row.map(to_identity_row).transpose()
}

pub async fn find_children<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    parent: AclId,
) -> Result<Vec<IdentityRow>, StorageError> {
    let query = format!("{SELECT_IDENTITY} WHERE parent_id = $1 ORDER BY id");
    let rows: Vec<IdentityTuple> = sqlx::query_as(&query)
        .bind(parent.value())
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    rows.into_iter().map(to_identity_row).collect()
}

pub async fn find_owned_by<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    owner: SidId,
) -> Result<Vec<IdentityRow>, StorageError> {
    let query = format!("{SELECT_IDENTITY} WHERE owner_sid_id = $1 ORDER BY id");
    let rows: Vec<IdentityTuple> = sqlx::query_as(&query)
        .bind(owner.value())
        .fetch_all(executor)
        .await
        .map_err(to_storage_error)?;
    rows.into_iter().map(to_identity_row).collect()
}

pub async fn list_identities<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    object_type: &str,
) -> Result<Vec<ObjectIdentity>, StorageError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT object_type, identifier FROM acl_object_identity WHERE object_type = $1 ORDER BY identifier",
    )
    .bind(object_type)
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;
    rows.into_iter()
        .map(|(object_type, identifier)| decode_identity(object_type, identifier))
        .collect()
}

pub async fn insert_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    identity: &ObjectIdentity,
    owner: SidId,
    parent: Option<AclId>,
    entries_inheriting: bool,
) -> Result<AclId, StorageError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO acl_object_identity (object_type, identifier, owner_sid_id, parent_id, entries_inheriting)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(identity.object_type())
    .bind(identity.identifier())
    .bind(owner.value())
    .bind(parent.map(|p| p.value()))
    .bind(entries_inheriting)
    .fetch_one(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(AclId::new(row.0))
}

pub async fn update_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: AclId,
    owner: SidId,
    parent: Option<AclId>,
    entries_inheriting: bool,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        r#"
        UPDATE acl_object_identity
        SET owner_sid_id = $2, parent_id = $3, entries_inheriting = $4
        WHERE id = $1
        "#,
    )
    .bind(id.value())
    .bind(owner.value())
    .bind(parent.map(|p| p.value()))
    .bind(entries_inheriting)
    .execute(executor)
    .await
    .map_err(to_storage_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound(format!("acl {id}")));
    }
    Ok(())
}

/// Upserts entries keyed by `(acl_id, ace_order)`. Existing rows keep their
/// ids; nothing is deleted here.
pub async fn upsert_entries<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: AclId,
    entries: &[NewEntry],
) -> Result<Vec<EntryRow>, StorageError> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let sid_ids: Vec<i64> = entries.iter().map(|e| e.sid_id.value()).collect();
    let masks: Vec<i32> = entries.iter().map(|e| e.mask).collect();
    let granting: Vec<bool> = entries.iter().map(|e| e.granting).collect();
    let orders: Vec<i32> = (0..entries.len() as i32).collect();

    let returned: Vec<(i64, i32)> = sqlx::query_as(
        r#"
        INSERT INTO acl_entry (acl_id, sid_id, mask, granting, ace_order)
        SELECT $1, u.sid_id, u.mask, u.granting, u.ace_order
        FROM UNNEST($2::bigint[], $3::int[], $4::bool[], $5::int[])
             AS u(sid_id, mask, granting, ace_order)
        ON CONFLICT (acl_id, ace_order) DO UPDATE
        SET sid_id = EXCLUDED.sid_id, mask = EXCLUDED.mask, granting = EXCLUDED.granting
        RETURNING id, ace_order
        "#,
    )
    .bind(id.value())
    .bind(&sid_ids)
    .bind(&masks)
    .bind(&granting)
    .bind(&orders)
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;

    let ids_by_order: HashMap<i32, i64> = returned.into_iter().map(|(id, o)| (o, id)).collect();

    entries
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            let order = position as i32;
            let entry_id = ids_by_order.get(&order).copied().ok_or_else(|| {
                StorageError::Internal(format!("entry at order {order} was not written"))
            })?;
            Ok(EntryRow {
                id: EntryId::new(entry_id),
                sid: entry.sid.clone(),
                mask: entry.mask,
                granting: entry.granting,
                order,
            })
        })
        .collect()
}

pub async fn trim_entries<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: AclId,
    keep: usize,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM acl_entry WHERE acl_id = $1 AND ace_order >= $2")
        .bind(id.value())
        .bind(keep as i32)
        .execute(executor)
        .await
        .map_err(to_storage_error)?;
    Ok(())
}

pub async fn delete_identity<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: AclId,
) -> Result<(), StorageError> {
    let result = sqlx::query("DELETE FROM acl_object_identity WHERE id = $1")
        .bind(id.value())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound(format!("acl {id}")));
    }
    Ok(())
}

pub async fn delete_entries_for_sid<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    sid: SidId,
) -> Result<Vec<AclId>, StorageError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        WITH removed AS (
            DELETE FROM acl_entry WHERE sid_id = $1 RETURNING acl_id
        )
        SELECT DISTINCT acl_id FROM removed ORDER BY acl_id
        "#,
    )
    .bind(sid.value())
    .fetch_all(executor)
    .await
    .map_err(to_storage_error)?;
    Ok(rows.into_iter().map(|(id,)| AclId::new(id)).collect())
}

pub async fn delete_sid<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    sid: SidId,
) -> Result<(), StorageError> {
    let result = sqlx::query("DELETE FROM acl_sid WHERE id = $1")
        .bind(sid.value())
        .execute(executor)
        .await
        .map_err(to_storage_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound(format!("sid {}", sid.value())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::too_many_arguments)]
    fn joined(
        id: i64,
        identifier: i64,
        parent: Option<i64>,
        entry: Option<(i64, i32, &str)>,
    ) -> JoinedRow {
        let (entry_id, order, name) = match entry {
            Some((entry_id, order, name)) => (Some(entry_id), Some(order), Some(name.to_string())),
            None => (None, None, None),
        };
        (
            id,
            "Dataset".to_string(),
            identifier,
            parent,
            true,
            PRINCIPAL.to_string(),
            "alice".to_string(),
            entry_id,
            entry_id.map(|_| 1),
            entry_id.map(|_| true),
            order,
            entry_id.map(|_| PRINCIPAL.to_string()),
            name,
        )
    }

    #[test]
    fn group_rows_folds_entries_per_acl() {
        let rows = group_rows(vec![
            joined(1, 10, None, Some((100, 0, "bob"))),
            joined(1, 10, None, Some((101, 1, "carol"))),
            joined(2, 20, Some(1), None),
        ])
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entries.len(), 2);
        assert_eq!(rows[0].entries[1].sid, Sid::principal("carol").unwrap());
        assert!(rows[1].entries.is_empty());
        assert_eq!(rows[1].parent_id, Some(AclId::new(1)));
    }

    #[test]
    fn decode_sid_rejects_unknown_kind() {
        assert!(decode_sid("group", "x".to_string()).is_err());
        assert_eq!(
            decode_sid(AUTHORITY, "GROUP_ADMIN".to_string()).unwrap(),
            Sid::authority("GROUP_ADMIN").unwrap()
        );
    }

    #[test]
    fn decode_sid_rejects_blank_name() {
        let result = decode_sid(PRINCIPAL, "  ".to_string());

        assert!(matches!(result, Err(StorageError::Internal(_))));
    }
}
