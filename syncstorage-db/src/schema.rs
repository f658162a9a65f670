//! Diesel table definitions for a single user's database file.
//!
//! Unlike the shared-table MySQL/Spanner schemas this is descended from,
//! there is no `user_id` column anywhere here: the file itself *is* the
//! user, so every row already belongs to exactly one tenant.

table! {
    collections (id) {
        id -> Integer,
        name -> Text,
        modified -> BigInt,
    }
}

table! {
    bso (collection_id, id) {
        collection_id -> Integer,
        id -> Text,
        sortindex -> Nullable<Integer>,
        payload -> Text,
        payload_size -> BigInt,
        modified -> BigInt,
        expiry -> BigInt,
    }
}

table! {
    batches (id) {
        id -> BigInt,
        collection_id -> Integer,
        bsos -> Text,
        expiry -> BigInt,
    }
}

table! {
    keyvalues (key) {
        key -> Text,
        value -> Text,
    }
}

allow_tables_to_appear_in_same_query!(collections, bso, batches, keyvalues,);
