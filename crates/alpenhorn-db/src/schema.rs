//! Diesel table definitions, hand-kept in sync with `migrations/`.

diesel::table! {
    acq (id) {
        id -> Int4,
        name -> Varchar,
        comment -> Nullable<Text>,
    }
}

diesel::table! {
    file (id) {
        id -> Int4,
        acq_id -> Int4,
        name -> Varchar,
        size_b -> Int8,
        md5sum -> Varchar,
        registered -> Timestamptz,
    }
}

diesel::table! {
    storagegroup (id) {
        id -> Int4,
        name -> Varchar,
        notes -> Nullable<Text>,
        io_class -> Nullable<Varchar>,
        io_config -> Nullable<Jsonb>,
    }
}

diesel::table! {
    storagenode (id) {
        id -> Int4,
        name -> Varchar,
        group_id -> Int4,
        host -> Varchar,
        root -> Varchar,
        username -> Nullable<Varchar>,
        address -> Nullable<Varchar>,
        active -> Bool,
        auto_import -> Bool,
        auto_verify -> Int4,
        storage_type -> Varchar,
        max_total_gb -> Nullable<Float8>,
        min_avail_gb -> Nullable<Float8>,
        avail_gb -> Nullable<Float8>,
        avail_gb_last_checked -> Nullable<Timestamptz>,
        io_class -> Nullable<Varchar>,
        io_config -> Nullable<Jsonb>,
        notes -> Nullable<Text>,
    }
}

diesel::table! {
    filecopy (id) {
        id -> Int4,
        file_id -> Int4,
        node_id -> Int4,
        has_file -> Text,
        wants_file -> Text,
        ready -> Bool,
        size_b -> Nullable<Int8>,
        last_update -> Timestamptz,
    }
}

diesel::table! {
    filecopyrequest (id) {
        id -> Int4,
        file_id -> Int4,
        node_from_id -> Int4,
        group_to_id -> Int4,
        completed -> Bool,
        cancelled -> Bool,
        timestamp -> Timestamptz,
        transfer_started -> Nullable<Timestamptz>,
        transfer_completed -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    fileimportrequest (id) {
        id -> Int4,
        node_id -> Int4,
        path -> Varchar,
        recurse -> Bool,
        register -> Bool,
        completed -> Bool,
        timestamp -> Timestamptz,
    }
}

diesel::table! {
    storagetransferaction (id) {
        id -> Int4,
        node_from_id -> Int4,
        group_to_id -> Int4,
        autosync -> Bool,
        autoclean -> Bool,
    }
}

diesel::table! {
    dataindexversion (component) {
        component -> Varchar,
        version -> Int4,
    }
}

diesel::joinable!(file -> acq (acq_id));
diesel::joinable!(filecopy -> file (file_id));
diesel::joinable!(filecopy -> storagenode (node_id));
diesel::joinable!(storagenode -> storagegroup (group_id));
diesel::joinable!(filecopyrequest -> file (file_id));
diesel::joinable!(fileimportrequest -> storagenode (node_id));
diesel::joinable!(storagetransferaction -> storagenode (node_from_id));
diesel::joinable!(storagetransferaction -> storagegroup (group_to_id));

diesel::allow_tables_to_appear_in_same_query!(acq, file, storagegroup, storagenode, filecopy,
    filecopyrequest, fileimportrequest, storagetransferaction, dataindexversion,);
