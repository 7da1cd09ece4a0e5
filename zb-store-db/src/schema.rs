// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Database schema definitions for the zb store.
//!
//! `paths` interns every store path string ever seen; `objects` rows exist
//! exactly for objects present on disk (the row ⇔ file invariant), while
//! realization rows survive object deletion so prior build decisions stay
//! queryable.

/// Core schema SQL (paths, objects, refs)
pub const SCHEMA_SQL: &str = r#"
create table if not exists paths (
    id   integer primary key autoincrement not null,
    path text unique not null
);

create table if not exists objects (
    path_id  integer primary key not null,
    nar_size integer not null,
    nar_hash text not null,
    ca       text not null,
    foreign key (path_id) references paths(id)
);

create table if not exists refs (
    referrer_id  integer not null,
    reference_id integer not null,
    primary key (referrer_id, reference_id),
    foreign key (referrer_id) references objects(path_id) on delete cascade,
    foreign key (reference_id) references objects(path_id)
);

create index if not exists index_refs_reference on refs(reference_id);
"#;

/// Realization schema SQL (drv_hashes, realizations, reference_classes)
pub const REALIZATION_SCHEMA_SQL: &str = r#"
create table if not exists drv_hashes (
    id   integer primary key autoincrement not null,
    algo text not null,
    bits blob not null,
    unique (algo, bits)
);

create table if not exists realizations (
    drv_hash_id    integer not null,
    output_name    text not null,
    output_path_id integer not null,
    unique (drv_hash_id, output_name, output_path_id),
    foreign key (drv_hash_id) references drv_hashes(id),
    foreign key (output_path_id) references paths(id)
);

create table if not exists reference_classes (
    referrer_path_id      integer not null,
    referrer_output_name  text not null,
    reference_path_id     integer not null,
    reference_drv_hash_id integer,
    reference_output_name text,
    unique (referrer_path_id, referrer_output_name, reference_path_id,
            reference_drv_hash_id, reference_output_name),
    foreign key (referrer_path_id) references paths(id),
    foreign key (reference_path_id) references paths(id),
    foreign key (reference_drv_hash_id) references drv_hashes(id)
);

create index if not exists index_reference_classes_referrer
    on reference_classes(referrer_path_id, referrer_output_name);
"#;

/// Build bookkeeping schema SQL (builds, build_results)
pub const BUILD_SCHEMA_SQL: &str = r#"
create table if not exists builds (
    id         text primary key not null,
    started_at integer not null,
    ended_at   integer,
    status     text not null
);

create table if not exists build_results (
    build_id     text not null,
    drv_path     text not null,
    status       text not null,
    output_paths text,
    error        text,
    primary key (build_id, drv_path),
    foreign key (build_id) references builds(id)
);
"#;

/// Schema version, recorded via `pragma user_version`.
pub const SCHEMA_VERSION: i32 = 1;
