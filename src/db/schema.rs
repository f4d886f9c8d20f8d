//! Schema creation for the tables named in the persisted-state layout:
//! `fs_entry`, `files`, `files_trashed`, `directories`, `vault`, `s3`,
//! `vault_keys`, `vault_keys_trashed`, `api_keys`, `cache_index`,
//! `refresh_tokens`, `sync`, `sync_event`, `sync_throughput`,
//! `sync_conflicts`, `sync_conflict_artifacts`.
//!
//! DDL migration tooling itself is out of scope; this module only
//! creates tables idempotently on pool open, mirroring the teacher's
//! `Database::new`.

use crate::error::VaultResult;

pub fn create_all(conn: &rusqlite::Connection) -> VaultResult<()> {
    conn.execute_batch(
        "
        create table if not exists fs_entry (
            id integer primary key,
            alias text not null unique,
            parent_id integer references fs_entry(id),
            name text not null,
            path text not null,
            vault_id integer,
            owner_uid integer not null,
            group_gid integer not null,
            mode integer not null,
            kind integer not null,
            created_by integer,
            last_modified_by integer,
            created_at integer not null,
            updated_at integer not null,
            unique (parent_id, name)
        );
        create index if not exists fs_entry_vault_path on fs_entry(vault_id, path);
        create index if not exists fs_entry_parent on fs_entry(parent_id);

        create table if not exists files (
            entry_id integer primary key references fs_entry(id) on delete cascade,
            size_bytes integer not null default 0,
            mime_type text,
            content_hash text,
            encryption_iv text,
            encrypted_with_key_version integer
        );

        create table if not exists files_trashed (
            id integer primary key,
            vault_id integer not null,
            alias text not null,
            size_bytes integer not null,
            trashed_by integer,
            trashed_at integer not null,
            backing_path text not null,
            deleted_at integer
        );
        create index if not exists files_trashed_pending on files_trashed(deleted_at);

        create table if not exists directories (
            entry_id integer primary key references fs_entry(id) on delete cascade,
            size_bytes integer not null default 0,
            file_count integer not null default 0,
            subdirectory_count integer not null default 0
        );

        create table if not exists vault (
            id integer primary key,
            name text not null unique,
            owner_id integer not null,
            vault_type integer not null,
            mount_point text not null,
            quota_bytes integer not null default 0,
            is_active integer not null default 1,
            sync_policy integer not null default 0,
            sync_enabled integer not null default 1
        );

        create table if not exists s3 (
            vault_id integer primary key references vault(id) on delete cascade,
            api_key_id integer not null,
            bucket text not null,
            encrypt_upstream integer not null default 1
        );

        create table if not exists vault_keys (
            vault_id integer primary key references vault(id) on delete cascade,
            version integer not null,
            wrapped_key blob not null,
            wrap_iv text not null,
            created_at integer not null
        );

        create table if not exists vault_keys_trashed (
            vault_id integer not null,
            version integer not null,
            wrapped_key blob not null,
            wrap_iv text not null,
            trashed_at integer not null,
            rotation_completed_at integer,
            primary key (vault_id, version)
        );

        create table if not exists api_keys (
            id integer primary key,
            user_id integer not null,
            provider integer not null,
            access_key text not null,
            region text not null,
            endpoint text not null,
            encrypted_secret_access_key blob not null,
            iv text not null
        );

        create table if not exists cache_index (
            id integer primary key,
            vault_id integer not null,
            file_id integer not null,
            path text not null,
            entry_type integer not null,
            size integer not null,
            last_accessed integer not null
        );
        create index if not exists cache_index_vault_size on cache_index(vault_id, size);

        create table if not exists refresh_tokens (
            id integer primary key,
            user_id integer not null,
            token_hash text not null,
            expires_at integer not null
        );

        create table if not exists sync (
            vault_id integer primary key references vault(id) on delete cascade,
            last_success_at integer,
            last_sync_at integer,
            in_flight integer not null default 0
        );

        create table if not exists sync_event (
            id integer primary key,
            vault_id integer not null,
            run_uuid text not null unique,
            status integer not null,
            trigger integer not null,
            timestamp_begin integer not null,
            timestamp_end integer,
            heartbeat_at integer not null,
            retry_attempt integer not null default 0,
            num_ops_total integer not null default 0,
            bytes_up integer not null default 0,
            bytes_down integer not null default 0,
            local_state_hash text,
            remote_state_hash text,
            config_hash text,
            stall_reason text,
            error_code text,
            error_message text
        );
        create index if not exists sync_event_vault on sync_event(vault_id, timestamp_begin);

        create table if not exists sync_throughput (
            id integer primary key,
            sync_event_id integer not null references sync_event(id) on delete cascade,
            metric integer not null,
            count integer not null,
            bytes integer not null,
            duration_ms integer not null,
            failed integer not null default 0
        );

        create table if not exists sync_conflicts (
            id integer primary key,
            sync_event_id integer not null references sync_event(id) on delete cascade,
            path text not null,
            reason_code text not null
        );

        create table if not exists sync_conflict_artifacts (
            id integer primary key,
            conflict_id integer not null references sync_conflicts(id) on delete cascade,
            side integer not null,
            size integer,
            hash text,
            mtime integer,
            iv text,
            key_version integer
        );

        insert or ignore into fs_entry
            (id, alias, parent_id, name, path, vault_id, owner_uid, group_gid, mode, kind,
             created_by, last_modified_by, created_at, updated_at)
        values (1, 'ROOT', null, '', '/', null, 0, 0, 493, 1, null, null, 0, 0);
        ",
    )
    .map_err(Into::into)
}
